#![allow(dead_code)]

use duo_common::types::PROTOCOL_VERSION;
use duo_common::{ClientEvent, ServerEvent, SessionId};
use duos::config::{Policy, ServerConfig};
use duos::matchmaker::Matchmaker;
use duos::server::ServerState;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

type ClientStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub fn test_config(listen: SocketAddr) -> ServerConfig {
    ServerConfig {
        listen,
        admin_addr: "127.0.0.1:0".parse().unwrap(),
        max_conns: 1000,
        max_conns_ip: 100,
        max_payload: 65_536,
        ping_interval: 30,
        outbound_queue: 256,
        policy: Policy::default(),
    }
}

pub struct TestClient {
    pub ws_tx: futures_util::stream::SplitSink<ClientStream, Message>,
    pub ws_rx: futures_util::stream::SplitStream<ClientStream>,
    pub id: SessionId,
}

impl TestClient {
    pub async fn connect(addr: &SocketAddr) -> Self {
        let url = format!("ws://{addr}");
        let mut req = url.into_client_request().unwrap();
        req.headers_mut()
            .insert("Sec-WebSocket-Protocol", PROTOCOL_VERSION.parse().unwrap());
        let (ws, resp) = tokio_tungstenite::connect_async(req).await.unwrap();
        assert_eq!(
            resp.headers()
                .get("sec-websocket-protocol")
                .and_then(|v| v.to_str().ok()),
            Some(PROTOCOL_VERSION)
        );
        let (ws_tx, ws_rx) = ws.split();

        let mut client = Self {
            ws_tx,
            ws_rx,
            id: SessionId::from(""),
        };
        match client.recv().await {
            ServerEvent::Welcome { session_id } => client.id = session_id,
            other => panic!("expected welcome, got {other:?}"),
        }
        client
    }

    pub async fn send(&mut self, event: &ClientEvent) {
        self.send_raw(&event.to_json().unwrap()).await;
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.ws_tx
            .send(Message::Text(text.to_string()))
            .await
            .unwrap();
    }

    pub async fn recv(&mut self) -> ServerEvent {
        ServerEvent::parse(&self.recv_text().await).unwrap()
    }

    /// Next text frame exactly as the server wrote it.
    pub async fn recv_text(&mut self) -> String {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.ws_rx.next())
                .await
                .expect("timeout waiting for event")
                .expect("stream ended")
                .expect("websocket error");
            match msg {
                Message::Text(text) => return text,
                Message::Ping(_) | Message::Pong(_) => {}
                other => panic!("expected text frame, got {other:?}"),
            }
        }
    }

    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<ServerEvent> {
        tokio::time::timeout(timeout, self.recv()).await.ok()
    }

    /// Wait until the server closes the socket. Returns `false` on timeout.
    pub async fn closed_within(&mut self, timeout: Duration) -> bool {
        let result = tokio::time::timeout(timeout, async {
            while let Some(msg) = self.ws_rx.next().await {
                match msg {
                    Ok(Message::Close(_)) | Err(_) => return,
                    _ => {}
                }
            }
        })
        .await;
        result.is_ok()
    }
}

/// Poll the engine until `check` holds, panicking after two seconds.
pub async fn wait_until(state: &ServerState, check: impl Fn(&Matchmaker) -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !state.hub.inspect(&check) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "engine never reached expected state"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Wait until `id` occupies the waiting slot.
pub async fn wait_for_waiting(state: &ServerState, id: &SessionId) {
    wait_until(state, |engine| engine.waiting() == Some(id)).await;
}

pub async fn start_server_with_config(
    configure: impl FnOnce(&mut ServerConfig),
) -> (SocketAddr, Arc<ServerState>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut config = test_config(addr);
    configure(&mut config);
    let state = Arc::new(ServerState::new(config));

    let state_clone = state.clone();
    tokio::spawn(async move {
        if let Err(e) = duos::run(listener, state_clone).await {
            eprintln!("server error in test: {e}");
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    (addr, state)
}

pub async fn start_server() -> (SocketAddr, Arc<ServerState>) {
    start_server_with_config(|_| {}).await
}

pub async fn start_server_with_policy(policy: Policy) -> (SocketAddr, Arc<ServerState>) {
    start_server_with_config(|config| config.policy = policy).await
}

/// Connect two clients and pair them. Returns `(waiter, initiator)`.
pub async fn paired_clients(
    addr: &SocketAddr,
    state: &ServerState,
) -> (TestClient, TestClient) {
    let mut a = TestClient::connect(addr).await;
    let mut b = TestClient::connect(addr).await;

    a.send(&ClientEvent::FindPartner).await;
    wait_for_waiting(state, &a.id).await;
    b.send(&ClientEvent::FindPartner).await;

    assert_eq!(
        b.recv().await,
        ServerEvent::Match {
            initiator: true,
            partner_id: a.id.clone()
        }
    );
    assert_eq!(
        a.recv().await,
        ServerEvent::Match {
            initiator: false,
            partner_id: b.id.clone()
        }
    );
    (a, b)
}
