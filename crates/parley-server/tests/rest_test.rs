//! REST surface: registration, login, search and the pull endpoints.

mod common;

use parley_client::{ClientError, RestClient};
use parley_types::models::{ConversationId, UserId};

use common::{PASSWORD, signup, spawn_server};

#[tokio::test]
async fn register_then_login_issues_a_token() {
    let base = spawn_server().await;
    let mut rest = RestClient::new(&base);

    let user = rest.register("alice", PASSWORD).await.unwrap();
    assert_eq!(user.username, "alice");

    let login = rest.login("alice", PASSWORD).await.unwrap();
    assert_eq!(login.user, user);
    assert!(!login.access_token.is_empty());

    // The token is kept for later calls.
    let conversations = rest.list_conversations(user.id).await.unwrap();
    assert!(conversations.is_empty());
}

#[tokio::test]
async fn registration_rejects_duplicates_and_bad_input() {
    let base = spawn_server().await;
    let rest = RestClient::new(&base);
    rest.register("alice", PASSWORD).await.unwrap();

    let err = rest.register("alice", PASSWORD).await.unwrap_err();
    assert_eq!(err.status(), Some(409));

    let err = rest.register("al", PASSWORD).await.unwrap_err();
    assert_eq!(err.status(), Some(400));

    let err = rest.register("bobby", "short").await.unwrap_err();
    assert_eq!(err.status(), Some(400));
}

#[tokio::test]
async fn login_with_wrong_password_is_unauthorized() {
    let base = spawn_server().await;
    signup(&base, "alice").await;

    let mut rest = RestClient::new(&base);
    let err = rest.login("alice", "not the password").await.unwrap_err();
    assert!(matches!(err, ClientError::Api { status: 401, .. }));

    let alice = rest.search_users("alice").await;
    assert_eq!(alice.unwrap_err().status(), Some(401));
}

#[tokio::test]
async fn protected_routes_require_a_token() {
    let base = spawn_server().await;
    let alice = signup(&base, "alice").await;

    let anonymous = RestClient::new(&base);
    let err = anonymous.list_conversations(alice.id).await.unwrap_err();
    assert_eq!(err.status(), Some(401));

    let forged = RestClient::new(&base).with_token("not-a-jwt");
    assert_eq!(forged.search_users("a").await.unwrap_err().status(), Some(401));
}

#[tokio::test]
async fn search_excludes_the_caller() {
    let base = spawn_server().await;
    let alice = signup(&base, "alice").await;
    signup(&base, "alicia").await;
    signup(&base, "bob").await;

    let found = alice.rest.search_users("ali").await.unwrap();
    let names: Vec<_> = found.iter().map(|u| u.username.as_str()).collect();
    assert_eq!(names, ["alicia"]);
}

#[tokio::test]
async fn users_cannot_list_someone_elses_conversations() {
    let base = spawn_server().await;
    let alice = signup(&base, "alice").await;
    let bob = signup(&base, "bob").await;

    assert!(alice.rest.list_conversations(alice.id).await.unwrap().is_empty());
    assert_eq!(alice.rest.list_conversations(bob.id).await.unwrap_err().status(), Some(403));
}

#[tokio::test]
async fn unknown_conversation_is_not_found() {
    let base = spawn_server().await;
    let alice = signup(&base, "alice").await;

    assert!(alice.rest.list_messages(ConversationId(999)).await.unwrap_err().is_not_found());
    assert!(alice.rest.delete_conversation(ConversationId(999)).await.unwrap_err().is_not_found());
    assert_eq!(
        alice.rest.list_conversations(UserId(999)).await.unwrap_err().status(),
        Some(403)
    );
}
