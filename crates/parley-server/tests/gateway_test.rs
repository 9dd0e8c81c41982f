//! End-to-end gateway behavior over real WebSocket connections.

mod common;

use tokio_tungstenite::tungstenite;

use parley_types::events::{Control, ErrorKind, MessagePush, PING_FRAME, ServerEnvelope};

use common::{Ws, next_envelope, open_ws, send, send_raw, signup, spawn_server};

async fn next_push(ws: &mut Ws) -> MessagePush {
    match next_envelope(ws).await {
        ServerEnvelope::Message(push) => push,
        other => panic!("expected a message push, got {:?}", other),
    }
}

async fn next_error(ws: &mut Ws) -> ErrorKind {
    match next_envelope(ws).await {
        ServerEnvelope::Error(notice) => notice.error,
        other => panic!("expected an error notice, got {:?}", other),
    }
}

#[tokio::test]
async fn bad_token_is_rejected_before_upgrade() {
    let base = spawn_server().await;
    let url = format!("{}/ws/garbage", base.replacen("http://", "ws://", 1));

    match tokio_tungstenite::connect_async(url).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 401),
        other => panic!("expected an HTTP 401, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn first_contact_reaches_both_participants() {
    let base = spawn_server().await;
    let alice = signup(&base, "alice").await;
    let bob = signup(&base, "bob").await;
    let mut alice_ws = open_ws(&base, &alice.token).await;
    let mut bob_ws = open_ws(&base, &bob.token).await;

    send(&mut alice_ws, bob.id, None, "Hi").await;
    let echoed = next_push(&mut alice_ws).await;
    let received = next_push(&mut bob_ws).await;
    assert_eq!(echoed, received);
    assert_eq!(received.sender_id, alice.id);
    assert_eq!(received.recipient_id, bob.id);
    assert_eq!(received.content, "Hi");

    send(&mut bob_ws, alice.id, Some(received.conversation_id), "Hey").await;
    let reply = next_push(&mut alice_ws).await;
    assert_eq!(reply.conversation_id, received.conversation_id);
    assert!(reply.id > received.id);
    assert!(reply.timestamp >= received.timestamp);
    assert_eq!(next_push(&mut bob_ws).await, reply);

    let conversations = bob.rest.list_conversations(bob.id).await.unwrap();
    assert_eq!(conversations.len(), 1);
    assert_eq!(conversations[0].id, received.conversation_id);
}

#[tokio::test]
async fn every_connection_of_a_user_gets_the_push() {
    let base = spawn_server().await;
    let alice = signup(&base, "alice").await;
    let bob = signup(&base, "bob").await;
    let mut alice_ws = open_ws(&base, &alice.token).await;
    let mut bob_laptop = open_ws(&base, &bob.token).await;
    let mut bob_phone = open_ws(&base, &bob.token).await;

    send(&mut alice_ws, bob.id, None, "both tabs").await;
    let push = next_push(&mut alice_ws).await;
    assert_eq!(next_push(&mut bob_laptop).await, push);
    assert_eq!(next_push(&mut bob_phone).await, push);
}

#[tokio::test]
async fn offline_recipient_pulls_messages_in_order() {
    let base = spawn_server().await;
    let alice = signup(&base, "alice").await;
    let bob = signup(&base, "bob").await;
    let mut alice_ws = open_ws(&base, &alice.token).await;

    let mut conversation = None;
    for content in ["one", "two", "three"] {
        send(&mut alice_ws, bob.id, conversation, content).await;
        conversation = Some(next_push(&mut alice_ws).await.conversation_id);
    }

    let conversation = conversation.unwrap();
    let messages = bob.rest.list_messages(conversation).await.unwrap();
    let contents: Vec<_> = messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, ["one", "two", "three"]);
    assert!(messages.windows(2).all(|w| (w[0].timestamp, w[0].id) < (w[1].timestamp, w[1].id)));
}

#[tokio::test]
async fn simultaneous_first_contact_converges_on_one_conversation() {
    let base = spawn_server().await;
    let alice = signup(&base, "alice").await;
    let bob = signup(&base, "bob").await;
    let mut alice_ws = open_ws(&base, &alice.token).await;
    let mut bob_ws = open_ws(&base, &bob.token).await;

    tokio::join!(
        send(&mut alice_ws, bob.id, None, "from alice"),
        send(&mut bob_ws, alice.id, None, "from bob"),
    );

    let mut conversations = Vec::new();
    for _ in 0..2 {
        conversations.push(next_push(&mut alice_ws).await.conversation_id);
        conversations.push(next_push(&mut bob_ws).await.conversation_id);
    }
    assert!(conversations.iter().all(|id| *id == conversations[0]));
    assert_eq!(alice.rest.list_conversations(alice.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn bad_envelopes_are_reported_and_the_connection_survives() {
    let base = spawn_server().await;
    let alice = signup(&base, "alice").await;
    let mut ws = open_ws(&base, &alice.token).await;

    send_raw(&mut ws, "definitely not json").await;
    assert_eq!(next_error(&mut ws).await, ErrorKind::MalformedEnvelope);

    send_raw(&mut ws, r#"{"type":"typing"}"#).await;
    assert_eq!(next_error(&mut ws).await, ErrorKind::MalformedEnvelope);

    send(&mut ws, alice.id, None, "talking to myself").await;
    assert_eq!(next_error(&mut ws).await, ErrorKind::MalformedEnvelope);

    send_raw(&mut ws, PING_FRAME).await;
    assert_eq!(next_envelope(&mut ws).await, ServerEnvelope::Control(Control::Pong));
}

#[tokio::test]
async fn outsiders_cannot_post_into_a_conversation() {
    let base = spawn_server().await;
    let alice = signup(&base, "alice").await;
    let bob = signup(&base, "bob").await;
    let mallory = signup(&base, "mallory").await;
    let mut alice_ws = open_ws(&base, &alice.token).await;
    let mut mallory_ws = open_ws(&base, &mallory.token).await;

    send(&mut alice_ws, bob.id, None, "private").await;
    let conversation = next_push(&mut alice_ws).await.conversation_id;

    send(&mut mallory_ws, bob.id, Some(conversation), "let me in").await;
    assert_eq!(next_error(&mut mallory_ws).await, ErrorKind::UnauthorizedParticipant);
    assert_eq!(mallory.rest.list_messages(conversation).await.unwrap_err().status(), Some(403));
}

#[tokio::test]
async fn deleted_conversation_is_gone_for_pull_and_send() {
    let base = spawn_server().await;
    let alice = signup(&base, "alice").await;
    let bob = signup(&base, "bob").await;
    let mut alice_ws = open_ws(&base, &alice.token).await;
    let mut bob_ws = open_ws(&base, &bob.token).await;

    send(&mut alice_ws, bob.id, None, "soon gone").await;
    let conversation = next_push(&mut alice_ws).await.conversation_id;
    next_push(&mut bob_ws).await;

    alice.rest.delete_conversation(conversation).await.unwrap();
    assert!(bob.rest.list_messages(conversation).await.unwrap_err().is_not_found());
    assert!(bob.rest.list_conversations(bob.id).await.unwrap().is_empty());

    send(&mut bob_ws, alice.id, Some(conversation), "too late").await;
    assert_eq!(next_error(&mut bob_ws).await, ErrorKind::UnauthorizedParticipant);

    send(&mut bob_ws, alice.id, None, "starting over").await;
    let fresh = next_push(&mut bob_ws).await;
    assert_ne!(fresh.conversation_id, conversation);
}

#[tokio::test]
async fn logout_closes_only_that_connection() {
    let base = spawn_server().await;
    let alice = signup(&base, "alice").await;
    let bob = signup(&base, "bob").await;
    let mut leaving = open_ws(&base, &alice.token).await;
    let mut staying = open_ws(&base, &alice.token).await;
    let mut bob_ws = open_ws(&base, &bob.token).await;

    send_raw(&mut leaving, r#"{"type":"logout"}"#).await;
    send_raw(&mut staying, PING_FRAME).await;
    assert_eq!(next_envelope(&mut staying).await, ServerEnvelope::Control(Control::Pong));

    send(&mut bob_ws, alice.id, None, "still there?").await;
    let push = next_push(&mut bob_ws).await;
    assert_eq!(next_push(&mut staying).await, push);
}
