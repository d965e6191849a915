use thiserror::Error;

/// Errors that can occur in the transport shell around the pairing engine.
///
/// Engine operations themselves never fail; these cover sockets only.
#[derive(Error, Debug)]
pub enum DuoError {
    /// WebSocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// A connection cap was hit before the session was registered.
    #[error("connection limit reached: {0}")]
    ConnectionLimit(&'static str),
}
