use crate::error::DuoError;
use crate::metrics::{counters, gauges};
use crate::server::ServerState;
use duo_common::types::PROTOCOL_VERSION;
use duo_common::{ClientEvent, ServerEvent, SessionId};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_tungstenite::tungstenite::http::{HeaderValue, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsRecv = SplitStream<WebSocketStream<TcpStream>>;

/// Holds one slot of the per-IP connection count.
struct IpGuard {
    state: Arc<ServerState>,
    ip: IpAddr,
}

impl IpGuard {
    /// Take a slot for `ip`, or `None` if it is at its limit.
    fn acquire(state: &Arc<ServerState>, ip: IpAddr) -> Option<Self> {
        match state.ip_connections.entry(ip) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if *entry.get() >= state.config.max_conns_ip {
                    return None;
                }
                *entry.get_mut() += 1;
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(1);
            }
        }
        Some(Self {
            state: state.clone(),
            ip,
        })
    }
}

impl Drop for IpGuard {
    fn drop(&mut self) {
        let mut remove = false;
        if let Some(mut entry) = self.state.ip_connections.get_mut(&self.ip) {
            *entry = entry.saturating_sub(1);
            if *entry == 0 {
                remove = true;
            }
        }
        if remove {
            self.state
                .ip_connections
                .remove_if(&self.ip, |_, v| *v == 0);
        }
    }
}

/// Holds one slot of the global connection count.
struct ActiveGuard {
    state: Arc<ServerState>,
}

impl ActiveGuard {
    fn acquire(state: &Arc<ServerState>) -> Option<Self> {
        let previous = state.active_connections.fetch_add(1, Ordering::AcqRel);
        if previous >= state.config.max_conns {
            state.active_connections.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        gauges::inc_connections_active();
        Some(Self {
            state: state.clone(),
        })
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.state.active_connections.fetch_sub(1, Ordering::AcqRel);
        gauges::dec_connections_active();
    }
}

/// Serve one client socket from handshake to close.
///
/// # Errors
///
/// Returns an error if a connection cap is hit, the WebSocket handshake
/// fails, or the socket errors mid-session (including oversize frames).
pub async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ServerState>,
) -> Result<(), DuoError> {
    let Some(_active) = ActiveGuard::acquire(&state) else {
        tracing::warn!(peer = %peer_addr, limit = state.config.max_conns, "global connection limit exceeded");
        return Err(DuoError::ConnectionLimit("global"));
    };
    let Some(_ip_guard) = IpGuard::acquire(&state, peer_addr.ip()) else {
        tracing::debug!(ip = %peer_addr.ip(), limit = state.config.max_conns_ip, "per-IP connection limit exceeded");
        return Err(DuoError::ConnectionLimit("per_ip"));
    };

    let ws_config = WebSocketConfig {
        max_message_size: Some(state.config.max_payload),
        max_frame_size: Some(state.config.max_payload),
        ..WebSocketConfig::default()
    };

    let ws_stream = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        |req: &Request<()>, mut resp: Response<()>| {
            let offered = req
                .headers()
                .get("sec-websocket-protocol")
                .and_then(|v| v.to_str().ok())
                .is_some_and(|protocols| {
                    protocols.split(',').map(str::trim).any(|p| p == PROTOCOL_VERSION)
                });
            if offered {
                resp.headers_mut().insert(
                    "sec-websocket-protocol",
                    HeaderValue::from_static(PROTOCOL_VERSION),
                );
            }
            Ok(resp)
        },
        Some(ws_config),
    )
    .await?;

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let session_id = SessionId::random();
    let (events_tx, mut events_rx) = mpsc::channel(state.config.outbound_queue);
    state.hub.connect(session_id.clone(), events_tx);
    tracing::info!(session = %session_id, peer = %peer_addr, "client connected");

    let result = run_event_loop(&mut ws_tx, &mut ws_rx, &mut events_rx, &session_id, &state).await;

    state.hub.disconnect(&session_id);
    let _ = ws_tx.close().await;
    tracing::info!(session = %session_id, "client disconnected");

    result
}

/// Pump inbound frames into the hub and queued events out to the socket
/// until either side closes.
async fn run_event_loop(
    ws_tx: &mut WsSink,
    ws_rx: &mut WsRecv,
    events_rx: &mut mpsc::Receiver<ServerEvent>,
    session_id: &SessionId,
    state: &ServerState,
) -> Result<(), DuoError> {
    let mut ping_interval = interval(Duration::from_secs(state.config.ping_interval));
    ping_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping_interval.tick().await;

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => handle_text(&text, session_id, state),
                    Some(Ok(Message::Binary(data))) => {
                        counters::events_dropped_total("malformed");
                        tracing::debug!(session = %session_id, len = data.len(), "ignoring binary frame");
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws_tx.send(Message::Pong(data)).await {
                            tracing::debug!("failed to send pong: {}", e);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => return Err(DuoError::WebSocket(e)),
                    Some(Ok(_)) => {}
                }
            }
            event = events_rx.recv() => {
                // The hub dropped our sender: the session was reaped
                let Some(event) = event else {
                    tracing::debug!(session = %session_id, "session reaped, closing");
                    return Ok(());
                };
                let text = match event.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!(session = %session_id, event = event.name(), "failed to encode event: {}", e);
                        continue;
                    }
                };
                ws_tx.send(Message::Text(text)).await?;
            }
            _ = ping_interval.tick() => {
                if let Err(e) = ws_tx.send(Message::Ping(Vec::new())).await {
                    tracing::debug!("failed to send ping: {}", e);
                }
            }
        }
    }
}

fn handle_text(text: &str, session_id: &SessionId, state: &ServerState) {
    match ClientEvent::parse(text) {
        Ok(event) => state.hub.handle(session_id, event),
        Err(e) => {
            counters::events_dropped_total("malformed");
            tracing::debug!(session = %session_id, "ignoring malformed frame: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Policy, ServerConfig};

    fn test_state(max_conns: usize, max_conns_ip: usize) -> Arc<ServerState> {
        let config = ServerConfig {
            listen: "127.0.0.1:8080".parse().unwrap(),
            admin_addr: "127.0.0.1:9090".parse().unwrap(),
            max_conns,
            max_conns_ip,
            max_payload: 65_536,
            ping_interval: 30,
            outbound_queue: 256,
            policy: Policy::default(),
        };
        Arc::new(ServerState::new(config))
    }

    #[test]
    fn ip_guard_decrements_on_drop() {
        let state = test_state(100, 10);
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        state.ip_connections.insert(ip, 2);

        {
            let _guard = IpGuard {
                state: state.clone(),
                ip,
            };
        }

        assert_eq!(*state.ip_connections.get(&ip).unwrap(), 1);
    }

    #[test]
    fn ip_guard_removes_entry_at_zero() {
        let state = test_state(100, 10);
        let ip: IpAddr = "1.2.3.4".parse().unwrap();

        let guard = IpGuard::acquire(&state, ip).unwrap();
        assert_eq!(*state.ip_connections.get(&ip).unwrap(), 1);
        drop(guard);

        assert!(state.ip_connections.get(&ip).is_none());
    }

    #[test]
    fn ip_guard_refuses_past_limit() {
        let state = test_state(100, 2);
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        let other: IpAddr = "5.6.7.8".parse().unwrap();

        let first = IpGuard::acquire(&state, ip).unwrap();
        let _second = IpGuard::acquire(&state, ip).unwrap();
        assert!(IpGuard::acquire(&state, ip).is_none());
        assert!(IpGuard::acquire(&state, other).is_some());

        drop(first);
        assert!(IpGuard::acquire(&state, ip).is_some());
    }

    #[test]
    fn active_guard_enforces_global_cap() {
        let state = test_state(1, 1);
        let held = ActiveGuard::acquire(&state).unwrap();
        assert!(ActiveGuard::acquire(&state).is_none());
        assert_eq!(state.active_connections.load(Ordering::Acquire), 1);

        drop(held);
        assert_eq!(state.active_connections.load(Ordering::Acquire), 0);
        assert!(ActiveGuard::acquire(&state).is_some());
    }

    #[test]
    fn malformed_text_is_ignored() {
        let state = test_state(10, 10);
        let (tx, mut rx) = mpsc::channel(8);
        let id = SessionId::from("a");
        state.hub.connect(id.clone(), tx);
        rx.try_recv().unwrap();

        handle_text("not json", &id, &state);
        handle_text(r#"{"type":"warpDrive"}"#, &id, &state);
        assert!(rx.try_recv().is_err());
        assert_eq!(state.hub.stats().sessions, 1);

        handle_text(r#"{"type":"findPartner"}"#, &id, &state);
        assert_eq!(state.hub.inspect(|e| e.waiting().cloned()), Some(id));
    }
}
