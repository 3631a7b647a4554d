use super::*;

fn sample_session() -> Session {
    Session::new(
        UserProfile {
            id: UserId::from("u-1"),
            username: "alice".into(),
            email: "alice@example.com".into(),
        },
        "token-123",
    )
}

#[test]
fn round_trips_through_the_store_without_connection_status() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SessionStore::new(dir.path().join("nested").join("session.json"));

    let mut session = sample_session();
    session.status = ConnectionStatus::Connected;
    store.save(&session).expect("save");

    let loaded = store.load().expect("load").expect("session present");
    assert_eq!(loaded.user, session.user);
    assert_eq!(loaded.token, "token-123");
    assert_eq!(loaded.status, ConnectionStatus::Disconnected);
}

#[test]
fn missing_file_means_signed_out() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SessionStore::new(dir.path().join("session.json"));
    assert_eq!(store.load().expect("load"), None);
}

#[test]
fn corrupt_file_means_signed_out() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("session.json");
    fs::write(&path, "{not json").expect("write");
    let store = SessionStore::new(&path);
    assert_eq!(store.load().expect("load"), None);
}

#[test]
fn blank_token_is_not_restored() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SessionStore::new(dir.path().join("session.json"));
    let mut session = sample_session();
    session.token = "  ".into();
    store.save(&session).expect("save");
    assert_eq!(store.load().expect("load"), None);
}

#[test]
fn clear_removes_the_file_and_is_idempotent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SessionStore::new(dir.path().join("session.json"));
    store.save(&sample_session()).expect("save");
    store.clear().expect("clear");
    assert!(!store.path().exists());
    store.clear().expect("second clear");
}

#[test]
fn identity_checks() {
    let session = sample_session();
    assert!(session.has_credentials());
    assert!(session.is_self(&UserId::from("u-1")));
    assert!(!session.is_self(&UserId::from("u-2")));
}
