use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::Client;
use shared::protocol::{ClientFrame, PollResponse, ServerFrame};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
};
use tracing::{debug, info, warn};

use crate::{config::ClientSettings, error::ClientError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    WebSocket,
    Polling,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WebSocket => f.write_str("websocket"),
            Self::Polling => f.write_str("polling"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "websocket" | "ws" => Ok(Self::WebSocket),
            "polling" | "poll" => Ok(Self::Polling),
            other => Err(ClientError::Config(format!("unknown transport '{other}'"))),
        }
    }
}

/// An open realtime link. Dropping `outbound` asks the transport to close; the
/// transport closes `inbound` once the remote side is gone.
pub struct TransportLink {
    pub kind: TransportKind,
    pub outbound: mpsc::UnboundedSender<ClientFrame>,
    pub inbound: mpsc::UnboundedReceiver<ServerFrame>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, token: &str) -> anyhow::Result<TransportLink>;
}

/// Tries each transport in preference order and returns the first that opens.
pub struct TransportChain {
    transports: Vec<(TransportKind, Arc<dyn Connector>)>,
}

impl TransportChain {
    pub fn new(transports: Vec<(TransportKind, Arc<dyn Connector>)>) -> Self {
        Self { transports }
    }

    pub fn from_settings(settings: &ClientSettings) -> Self {
        let endpoint = format!("{}{}", settings.realtime_url, settings.realtime_path);
        let transports = settings
            .transports
            .iter()
            .map(|kind| {
                let connector: Arc<dyn Connector> = match kind {
                    TransportKind::WebSocket => Arc::new(WebSocketConnector::new(endpoint.clone())),
                    TransportKind::Polling => Arc::new(PollingConnector::new(endpoint.clone())),
                };
                (*kind, connector)
            })
            .collect();
        Self::new(transports)
    }
}

#[async_trait]
impl Connector for TransportChain {
    async fn open(&self, token: &str) -> anyhow::Result<TransportLink> {
        let mut last_err = anyhow!("no realtime transports configured");
        for (kind, connector) in &self.transports {
            match connector.open(token).await {
                Ok(link) => return Ok(link),
                Err(err) => {
                    warn!(transport = %kind, error = %err, "realtime: transport unavailable");
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }
}

pub struct WebSocketConnector {
    endpoint: String,
}

impl WebSocketConnector {
    /// `endpoint` is the http(s) url of the realtime path, e.g. `http://host/socket.io`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    fn ws_url(&self) -> anyhow::Result<String> {
        let ws_url = if self.endpoint.starts_with("https://") {
            self.endpoint.replacen("https://", "wss://", 1)
        } else if self.endpoint.starts_with("http://") {
            self.endpoint.replacen("http://", "ws://", 1)
        } else {
            return Err(anyhow!("realtime url must start with http:// or https://"));
        };
        Ok(format!("{}/", ws_url.trim_end_matches('/')))
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, token: &str) -> anyhow::Result<TransportLink> {
        let ws_url = self.ws_url()?;
        let mut request = ws_url
            .as_str()
            .into_client_request()
            .with_context(|| format!("invalid websocket url: {ws_url}"))?;
        request.headers_mut().insert(
            "authorization",
            HeaderValue::from_str(&format!("Bearer {token}"))
                .context("token is not a valid header value")?,
        );

        let (ws_stream, _) = connect_async(request)
            .await
            .with_context(|| format!("failed to connect websocket: {ws_url}"))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel::<ServerFrame>();

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(event = frame.event_name(), error = %err, "websocket: failed to encode frame");
                        continue;
                    }
                };
                if let Err(err) = ws_writer.send(Message::Text(text)).await {
                    warn!(error = %err, "websocket: send failed");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerFrame::decode(&text) {
                        Ok(Some(frame)) => {
                            if inbound_tx.send(frame).is_err() {
                                break;
                            }
                        }
                        Ok(None) => debug!("websocket: ignoring unhandled event"),
                        Err(err) => warn!(error = %err, "websocket: invalid server frame"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "websocket: receive failed");
                        break;
                    }
                }
            }
        });

        info!(url = %ws_url, "websocket: opened");
        Ok(TransportLink {
            kind: TransportKind::WebSocket,
            outbound,
            inbound,
        })
    }
}

/// Long-polling fallback: `GET <endpoint>/poll?cursor=n` returns the next batch
/// of server frames, `POST <endpoint>/emit` sends one client frame.
pub struct PollingConnector {
    http: Client,
    endpoint: String,
    retry_delay: Duration,
}

impl PollingConnector {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            retry_delay: Duration::from_millis(250),
        }
    }

    async fn poll(
        http: &Client,
        endpoint: &str,
        token: &str,
        cursor: u64,
    ) -> anyhow::Result<PollResponse> {
        let response = http
            .get(format!("{endpoint}/poll"))
            .bearer_auth(token)
            .query(&[("cursor", cursor)])
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl Connector for PollingConnector {
    async fn open(&self, token: &str) -> anyhow::Result<TransportLink> {
        let first = Self::poll(&self.http, &self.endpoint, token, 0)
            .await
            .with_context(|| format!("failed to open polling transport: {}", self.endpoint))?;

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel::<ServerFrame>();

        let http = self.http.clone();
        let endpoint = self.endpoint.clone();
        let token_owned = token.to_string();
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let result = http
                    .post(format!("{endpoint}/emit"))
                    .bearer_auth(&token_owned)
                    .json(&frame)
                    .send()
                    .await
                    .and_then(reqwest::Response::error_for_status);
                if let Err(err) = result {
                    warn!(event = frame.event_name(), error = %err, "polling: emit failed");
                    break;
                }
            }
        });

        let http = self.http.clone();
        let endpoint = self.endpoint.clone();
        let token_owned = token.to_string();
        let retry_delay = self.retry_delay;
        tokio::spawn(async move {
            let mut batch = first;
            loop {
                for raw in batch.frames.drain(..) {
                    match ServerFrame::from_raw(raw) {
                        Ok(Some(frame)) => {
                            if inbound_tx.send(frame).is_err() {
                                return;
                            }
                        }
                        Ok(None) => debug!("polling: ignoring unhandled event"),
                        Err(err) => warn!(error = %err, "polling: invalid server frame"),
                    }
                }
                let cursor = batch.cursor;
                batch = tokio::select! {
                    () = inbound_tx.closed() => return,
                    next = Self::poll(&http, &endpoint, &token_owned, cursor) => match next {
                        Ok(next) => next,
                        Err(err) => {
                            warn!(error = %err, "polling: poll failed");
                            return;
                        }
                    },
                };
                if batch.frames.is_empty() {
                    tokio::time::sleep(retry_delay).await;
                }
            }
        });

        info!(url = %self.endpoint, "polling: opened");
        Ok(TransportLink {
            kind: TransportKind::Polling,
            outbound,
            inbound,
        })
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
