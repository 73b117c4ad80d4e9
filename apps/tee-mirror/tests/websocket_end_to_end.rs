use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tee_mirror::input::{InputError, InputSender, SocketInputSender};
use tee_mirror::transport::WebSocketConnector;
use tee_mirror::{InMemoryLogStore, Mirror, MirrorConfig, MirrorHandle, RegistrySnapshot};
use tee_protocol::{ClientMessage, ServerMessage};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use url::Url;

#[derive(Clone, Default)]
struct Relay {
    tokens: Arc<Mutex<Vec<String>>>,
    clients: Arc<Mutex<Vec<mpsc::UnboundedSender<Message>>>>,
    received: Arc<Mutex<Vec<ClientMessage>>>,
}

impl Relay {
    fn broadcast(&self, message: &ServerMessage) {
        let frame = serde_json::to_string(message).unwrap();
        self.send(Message::Text(frame));
    }

    fn send(&self, message: Message) {
        self.clients
            .lock()
            .retain(|client| client.send(message.clone()).is_ok());
    }

    fn hang_up(&self) {
        self.clients.lock().clear();
    }
}

async fn upgrade(
    ws: WebSocketUpgrade,
    State(relay): State<Relay>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    relay
        .tokens
        .lock()
        .push(params.get("token").cloned().unwrap_or_default());
    ws.on_upgrade(move |socket| handle_socket(socket, relay))
}

async fn handle_socket(socket: WebSocket, relay: Relay) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    relay.clients.lock().push(tx);

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                return;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(Ok(message)) = stream.next().await {
        if let Message::Text(text) = message {
            if let Ok(decoded) = serde_json::from_str::<ClientMessage>(&text) {
                relay.received.lock().push(decoded);
            }
        }
    }
    writer.abort();
}

async fn serve(relay: Relay) -> Url {
    let router = Router::new()
        .route("/ws/ui", get(upgrade))
        .with_state(relay);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    Url::parse(&format!("ws://{addr}/")).unwrap()
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition before timeout");
}

async fn wait_for(
    mirror: &MirrorHandle,
    predicate: impl FnMut(&RegistrySnapshot) -> bool,
) -> RegistrySnapshot {
    let mut sessions = mirror.sessions();
    let snapshot = timeout(Duration::from_secs(10), sessions.wait_for(predicate))
        .await
        .expect("registry change before timeout")
        .expect("engine alive")
        .clone();
    snapshot
}

async fn wait_transcript(mirror: &MirrorHandle, session_id: &str, expected: &str) {
    timeout(Duration::from_secs(10), async {
        loop {
            let transcript = mirror.transcript(session_id).await.expect("engine alive");
            if transcript.as_deref() == Some(expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("transcript before timeout");
}

#[tokio::test]
async fn mirrors_over_a_socket_and_follows_reconnects() {
    let relay = Relay::default();
    let base = serve(relay.clone()).await;
    let connector = WebSocketConnector::new(base);
    let input = Arc::new(SocketInputSender::new(connector.outbound()));
    let config = MirrorConfig {
        reconnect_delay: Duration::from_millis(200),
        flush_interval: Duration::from_secs(3600),
        ..MirrorConfig::default()
    };
    let mirror = Mirror::start(
        config,
        "tok-ws",
        Arc::new(InMemoryLogStore::new()),
        Arc::new(connector),
        input.clone(),
    )
    .await;

    wait_for(&mirror, |s| s.connected).await;
    eventually(|| relay.clients.lock().len() == 1).await;
    assert_eq!(relay.tokens.lock().as_slice(), &["tok-ws".to_string()]);

    relay.broadcast(&ServerMessage::session_start("s1", None));
    relay.broadcast(&ServerMessage::output("s1", "one "));
    let binary = serde_json::to_vec(&ServerMessage::output("s1", "two")).unwrap();
    relay.send(Message::Binary(binary));
    wait_transcript(&mirror, "s1", "one two").await;

    mirror.send_input("s1", "q").await.unwrap();
    eventually(|| !relay.received.lock().is_empty()).await;
    assert_eq!(
        relay.received.lock().as_slice(),
        &[ClientMessage::input("s1", "q")]
    );

    relay.hang_up();
    wait_for(&mirror, |s| !s.connected).await;
    assert!(matches!(
        input.send("tok-ws", "s1", "lost").await,
        Err(InputError::NotConnected)
    ));

    wait_for(&mirror, |s| s.connected).await;
    eventually(|| relay.clients.lock().len() == 1).await;
    assert_eq!(relay.tokens.lock().len(), 2);

    mirror.send_input("s1", "again").await.unwrap();
    eventually(|| relay.received.lock().len() == 2).await;
    assert_eq!(
        relay.received.lock().last(),
        Some(&ClientMessage::input("s1", "again"))
    );

    mirror.shutdown().await.unwrap();
}
