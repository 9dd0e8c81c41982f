#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use parley_client::RestClient;
use parley_db::Database;
use parley_server::config::ServerConfig;
use parley_server::{ServerState, app};
use parley_types::events::{SendEnvelope, ServerEnvelope};
use parley_types::models::{ConversationId, UserId};

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const PASSWORD: &str = "correct horse";

/// Boot the full app on an ephemeral port against an in-memory store.
/// Returns the HTTP base URL.
pub async fn spawn_server() -> String {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let config = ServerConfig {
        jwt_secret: "integration-test-secret".into(),
        ..ServerConfig::default()
    };
    let state = ServerState::new(db, &config);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app(state)).await.unwrap();
    });
    format!("http://{addr}")
}

/// TCP forwarder in front of a server. Cutting it drops every forwarded
/// connection and refuses new ones until it is restored.
pub struct Proxy {
    pub base: String,
    up: watch::Sender<bool>,
}

impl Proxy {
    pub async fn start(target: &str) -> Proxy {
        let upstream = target.trim_start_matches("http://").to_string();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (up, rx) = watch::channel(true);

        tokio::spawn(async move {
            while let Ok((mut inbound, _)) = listener.accept().await {
                let open = *rx.borrow();
                if !open {
                    continue;
                }
                let rx = rx.clone();
                let upstream = upstream.clone();
                tokio::spawn(async move {
                    let Ok(mut outbound) = TcpStream::connect(&upstream).await else {
                        return;
                    };
                    tokio::select! {
                        _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound) => {}
                        _ = until_cut(rx) => {}
                    }
                });
            }
        });

        Proxy {
            base: format!("http://{addr}"),
            up,
        }
    }

    pub fn cut(&self) {
        self.up.send_replace(false);
    }

    pub fn restore(&self) {
        self.up.send_replace(true);
    }
}

async fn until_cut(mut rx: watch::Receiver<bool>) {
    loop {
        let open = *rx.borrow_and_update();
        if !open || rx.changed().await.is_err() {
            return;
        }
    }
}

pub struct TestUser {
    pub id: UserId,
    pub token: String,
    pub rest: RestClient,
}

pub async fn signup(base: &str, username: &str) -> TestUser {
    let mut rest = RestClient::new(base);
    rest.register(username, PASSWORD).await.unwrap();
    let login = rest.login(username, PASSWORD).await.unwrap();
    TestUser {
        id: login.user.id,
        token: login.access_token,
        rest,
    }
}

pub async fn open_ws(base: &str, token: &str) -> Ws {
    let url = format!("{}/ws/{}", base.replacen("http://", "ws://", 1), token);
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

pub async fn send(ws: &mut Ws, to: UserId, conversation_id: Option<ConversationId>, content: &str) {
    let envelope = SendEnvelope {
        to,
        conversation_id,
        content: content.into(),
    };
    send_raw(ws, &serde_json::to_string(&envelope).unwrap()).await;
}

pub async fn send_raw(ws: &mut Ws, text: &str) {
    ws.send(Message::Text(text.to_string().into())).await.unwrap();
}

/// Next server envelope, skipping transport-level control frames.
pub async fn next_envelope(ws: &mut Ws) -> ServerEnvelope {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(text.as_str()).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("connection ended: {:?}", other),
            }
        }
    })
    .await
    .expect("timed out waiting for an envelope")
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
