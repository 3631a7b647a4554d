use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use shared::{
    domain::UserId,
    error::ApiError,
    protocol::{
        AuthResponse, ChatMessage, FriendSummary, LoginRequest, RegisterRequest,
        SendMessageRequest,
    },
};
use tracing::{debug, warn};
use url::Url;

use crate::{
    config::parse_url,
    error::{ClientError, Result},
    session::Session,
};

/// REST calls the realtime layer depends on. The backend owns all of this state;
/// the client only reads it and requests mutations.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn get_messages(&self, peer: &UserId) -> Result<Vec<ChatMessage>>;
    async fn send_message(&self, receiver: &UserId, content: &str) -> Result<ChatMessage>;
    async fn mark_read(&self, peer: &UserId) -> Result<()>;
    async fn get_friends(&self) -> Result<Vec<FriendSummary>>;
}

#[derive(Clone)]
pub struct HttpChatApi {
    http: Client,
    base_url: Url,
    token: String,
}

impl HttpChatApi {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self> {
        Ok(Self {
            http: Client::new(),
            base_url: base_url_for(base_url)?,
            token: token.into(),
        })
    }

    pub fn for_session(base_url: &str, session: &Session) -> Result<Self> {
        if !session.has_credentials() {
            return Err(ClientError::NotSignedIn);
        }
        Self::new(base_url, session.token.clone())
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.bearer_auth(&self.token)
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn get_messages(&self, peer: &UserId) -> Result<Vec<ChatMessage>> {
        let url = endpoint(&self.base_url, &["messages", peer.as_str()])?;
        let response = self.authorized(self.http.get(url)).send().await?;
        let messages: Vec<ChatMessage> = check(response).await?.json().await?;
        debug!(peer = %peer, count = messages.len(), "api: fetched conversation");
        Ok(messages)
    }

    async fn send_message(&self, receiver: &UserId, content: &str) -> Result<ChatMessage> {
        let url = endpoint(&self.base_url, &["messages"])?;
        let response = self
            .authorized(self.http.post(url))
            .json(&SendMessageRequest {
                receiver_id: receiver.clone(),
                content: content.to_string(),
            })
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn mark_read(&self, peer: &UserId) -> Result<()> {
        let url = endpoint(&self.base_url, &["messages", "read", peer.as_str()])?;
        let response = self.authorized(self.http.put(url)).send().await?;
        check(response).await?;
        Ok(())
    }

    async fn get_friends(&self) -> Result<Vec<FriendSummary>> {
        let url = endpoint(&self.base_url, &["friends"])?;
        let response = self.authorized(self.http.get(url)).send().await?;
        Ok(check(response).await?.json().await?)
    }
}

/// Unauthenticated calls that produce a [`Session`].
#[derive(Clone)]
pub struct AuthApi {
    http: Client,
    base_url: Url,
}

impl AuthApi {
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            http: Client::new(),
            base_url: base_url_for(base_url)?,
        })
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<Session> {
        let url = endpoint(&self.base_url, &["auth", "login"])?;
        let response = self
            .http
            .post(url)
            .json(&LoginRequest {
                email: email.to_string(),
                password: password.to_string(),
            })
            .send()
            .await?;
        let body: AuthResponse = check(response).await?.json().await?;
        let (user, token) = body.into_parts();
        Ok(Session::new(user, token))
    }

    pub async fn register(&self, username: &str, email: &str, password: &str) -> Result<Session> {
        let url = endpoint(&self.base_url, &["auth", "register"])?;
        let response = self
            .http
            .post(url)
            .json(&RegisterRequest {
                username: username.to_string(),
                email: email.to_string(),
                password: password.to_string(),
            })
            .send()
            .await?;
        let body: AuthResponse = check(response).await?.json().await?;
        let (user, token) = body.into_parts();
        Ok(Session::new(user, token))
    }
}

fn base_url_for(raw: &str) -> Result<Url> {
    let normalized = parse_url("api_url", raw)?;
    Url::parse(&normalized).map_err(|err| ClientError::Config(format!("api_url: {err}")))
}

pub(crate) fn endpoint(base_url: &Url, segments: &[&str]) -> Result<Url> {
    let mut url = base_url.clone();
    url.path_segments_mut()
        .map_err(|()| ClientError::Config(format!("'{base_url}' cannot be used as a base url")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().clone();
    let body = response.text().await.unwrap_or_default();
    let message = ApiError::from_body(&body).message;
    warn!(%url, status = status.as_u16(), %message, "api: request rejected");
    Err(ClientError::Api {
        status: status.as_u16(),
        message,
    })
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
