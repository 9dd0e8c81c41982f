//! Client session manager against a live server.

mod common;

use std::time::Duration;

use parley_client::backoff::BackoffPolicy;
use parley_client::machine::ConnectionState;
use parley_client::{ClientConfig, SessionEvent, SessionHandle, SessionManager, Slot};
use parley_types::events::ServerEnvelope;
use parley_types::models::{ConversationId, UserId};

use common::{Proxy, Ws, eventually, next_envelope, open_ws, send, signup, spawn_server};

fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy {
        base: Duration::from_millis(20),
        max: Duration::from_millis(200),
        cap_exponent: 3,
    }
}

fn contents(session: &SessionHandle, slot: Slot) -> Vec<String> {
    session.transcript(slot).into_iter().map(|m| m.content).collect()
}

/// Conversation id carried by the next push on `ws`.
async fn pushed_conversation(ws: &mut Ws) -> ConversationId {
    match next_envelope(ws).await {
        ServerEnvelope::Message(push) => push.conversation_id,
        other => panic!("expected a message push, got {:?}", other),
    }
}

/// Start a session for `user` that reaches the server through `proxy` and
/// give the gateway a moment to register it after the handshake.
async fn start_behind(proxy: &Proxy, token: &str, user: UserId) -> SessionHandle {
    let config = ClientConfig::new(&proxy.base, token, user)
        .with_backoff(fast_backoff())
        .with_heartbeat_interval(Duration::from_millis(100));
    let (session, _events) = SessionManager::start(config);
    session.wait_for_state(ConnectionState::Open).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    session
}

#[tokio::test]
async fn sessions_exchange_messages_and_reconcile() {
    let base = spawn_server().await;
    let alice = signup(&base, "alice").await;
    let bob = signup(&base, "bob").await;

    let (alice_session, _alice_events) = SessionManager::start(ClientConfig::new(&base, &alice.token, alice.id));
    let (bob_session, _bob_events) = SessionManager::start(ClientConfig::new(&base, &bob.token, bob.id));
    alice_session.wait_for_state(ConnectionState::Open).await.unwrap();
    bob_session.wait_for_state(ConnectionState::Open).await.unwrap();

    let draft = alice_session.send_message(bob.id, "hello bob").unwrap();
    assert_eq!(draft, Slot::Draft(bob.id));

    eventually(|| alice_session.conversations().len() == 1).await;
    let conversation = Slot::Conversation(alice_session.conversations()[0].id);
    alice_session.select(Some(conversation)).unwrap();

    eventually(|| {
        let transcript = alice_session.transcript(conversation);
        transcript.len() == 1 && !transcript[0].is_pending()
    })
    .await;
    assert!(alice_session.transcript(draft).is_empty());

    eventually(|| bob_session.transcript(conversation).len() == 1).await;
    assert_eq!(bob_session.transcript(conversation)[0].content, "hello bob");

    let slot = bob_session.send_message(alice.id, "hi alice").unwrap();
    assert_eq!(slot, conversation);
    eventually(|| {
        let transcript = alice_session.transcript(conversation);
        transcript.len() == 2 && transcript.iter().all(|m| !m.is_pending())
    })
    .await;

    let contents: Vec<_> = alice_session
        .transcript(conversation)
        .into_iter()
        .map(|m| m.content)
        .collect();
    assert_eq!(contents, ["hello bob", "hi alice"]);

    alice_session.shutdown().await;
    bob_session.shutdown().await;
}

#[tokio::test]
async fn blank_messages_are_rejected_locally() {
    let base = spawn_server().await;
    let alice = signup(&base, "alice").await;
    let (session, _events) = SessionManager::start(ClientConfig::new(&base, &alice.token, alice.id));

    assert!(session.send_message(alice.id, "   ").is_err());
    assert!(session.transcript(Slot::Draft(alice.id)).is_empty());
    session.shutdown().await;
}

#[tokio::test]
async fn deleting_a_conversation_clears_it_locally() {
    let base = spawn_server().await;
    let alice = signup(&base, "alice").await;
    let bob = signup(&base, "bob").await;
    let (session, _events) = SessionManager::start(ClientConfig::new(&base, &alice.token, alice.id));
    session.wait_for_state(ConnectionState::Open).await.unwrap();

    session.send_message(bob.id, "short lived").unwrap();
    eventually(|| session.conversations().len() == 1).await;
    let id = session.conversations()[0].id;

    session.delete_conversation(id).unwrap();
    eventually(|| session.conversations().is_empty()).await;
    assert!(session.transcript(Slot::Conversation(id)).is_empty());
    assert!(bob.rest.list_messages(id).await.unwrap_err().is_not_found());

    session.shutdown().await;
}

#[tokio::test]
async fn unreachable_server_backs_off_until_shutdown() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config = ClientConfig::new(format!("http://{addr}"), "token", UserId(1))
        .with_backoff(fast_backoff())
        .with_connect_timeout(Duration::from_millis(500));
    let (session, mut events) = SessionManager::start(config);

    session.wait_for_state(ConnectionState::Reconnecting).await.unwrap();
    assert!(session.send_message(UserId(2), "queued?").is_ok());

    session.shutdown().await;

    // Drain what was emitted before teardown; the stream then ends.
    let mut saw_notice = false;
    while let Some(event) = events.recv().await {
        if matches!(event, SessionEvent::Notice(_)) {
            saw_notice = true;
        }
    }
    assert!(saw_notice);
}

#[tokio::test]
async fn reconnect_recovers_messages_sent_while_offline() {
    let base = spawn_server().await;
    let proxy = Proxy::start(&base).await;
    let alice = signup(&base, "alice").await;
    let bob = signup(&base, "bob").await;
    let session = start_behind(&proxy, &alice.token, alice.id).await;

    let mut bob_ws = open_ws(&base, &bob.token).await;
    send(&mut bob_ws, alice.id, None, "one").await;
    let id = pushed_conversation(&mut bob_ws).await;
    let slot = Slot::Conversation(id);
    eventually(|| contents(&session, slot) == ["one"]).await;
    session.select(Some(slot)).unwrap();

    proxy.cut();
    session.wait_for_state(ConnectionState::Reconnecting).await.unwrap();
    send(&mut bob_ws, alice.id, Some(id), "two").await;
    // Bob's own copy means the message is stored before the link returns.
    assert_eq!(pushed_conversation(&mut bob_ws).await, id);
    assert_eq!(contents(&session, slot), ["one"]);

    proxy.restore();
    session.wait_for_state(ConnectionState::Open).await.unwrap();
    eventually(|| contents(&session, slot) == ["one", "two"]).await;

    // Heartbeats run again on the new link and it stays up.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(session.state(), ConnectionState::Open);

    // A second outage recovers the same way.
    proxy.cut();
    session.wait_for_state(ConnectionState::Reconnecting).await.unwrap();
    send(&mut bob_ws, alice.id, Some(id), "three").await;
    pushed_conversation(&mut bob_ws).await;
    proxy.restore();
    session.wait_for_state(ConnectionState::Open).await.unwrap();
    eventually(|| contents(&session, slot) == ["one", "two", "three"]).await;

    session.shutdown().await;
}

#[tokio::test]
async fn peer_push_settles_unsent_message_in_unselected_conversation() {
    let base = spawn_server().await;
    let proxy = Proxy::start(&base).await;
    let alice = signup(&base, "alice").await;
    let bob = signup(&base, "bob").await;
    let session = start_behind(&proxy, &alice.token, alice.id).await;

    let mut bob_ws = open_ws(&base, &bob.token).await;
    send(&mut bob_ws, alice.id, None, "one").await;
    let id = pushed_conversation(&mut bob_ws).await;
    let slot = Slot::Conversation(id);
    eventually(|| contents(&session, slot) == ["one"]).await;

    proxy.cut();
    session.wait_for_state(ConnectionState::Reconnecting).await.unwrap();
    assert_eq!(session.send_message(bob.id, "lost").unwrap(), slot);
    assert!(session.transcript(slot).iter().any(|m| m.is_pending()));

    proxy.restore();
    session.wait_for_state(ConnectionState::Open).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Never selected, so only the push can trigger the pull.
    send(&mut bob_ws, alice.id, Some(id), "reply").await;
    eventually(|| {
        let transcript = session.transcript(slot);
        contents(&session, slot) == ["one", "reply"] && transcript.iter().all(|m| !m.is_pending())
    })
    .await;

    session.shutdown().await;
}
