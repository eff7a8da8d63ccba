//! The socket handle contract and its channel-backed implementation.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Send failures reported by a [`Transport`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The transport has been closed locally or the peer went away.
    #[error("transport closed")]
    Closed,
    /// Any other I/O failure.
    #[error("transport i/o: {0}")]
    Io(String),
}

/// A live, writable socket as seen by the pool.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Cheap, synchronous connected check.
    fn is_connected(&self) -> bool;

    /// Liveness probe. Defaults to [`Transport::is_connected`].
    async fn probe(&self) -> bool {
        self.is_connected()
    }

    /// Send one text frame.
    async fn send_text(&self, text: Arc<str>) -> Result<(), TransportError>;

    /// Close the transport. Idempotent.
    async fn close(&self);
}

/// A [`Transport`] that forwards frames into a bounded channel.
///
/// The receiving half belongs to whoever owns the physical socket (the
/// gateway's writer task, or a test). `send_text` waits while the channel is
/// full, so callers bound it with their own timeout.
#[derive(Debug)]
pub struct ChannelTransport {
    tx: mpsc::Sender<Arc<str>>,
    closed: CancellationToken,
}

impl ChannelTransport {
    /// Create a transport and the receiver its frames arrive on.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::from_sender(tx), rx)
    }

    /// Wrap an existing sender.
    pub fn from_sender(tx: mpsc::Sender<Arc<str>>) -> Self {
        Self {
            tx,
            closed: CancellationToken::new(),
        }
    }

    /// Token cancelled when [`Transport::close`] is called.
    ///
    /// The socket writer selects on it to tear down the physical connection.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn is_connected(&self) -> bool {
        !self.closed.is_cancelled() && !self.tx.is_closed()
    }

    async fn send_text(&self, text: Arc<str>) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.tx.send(text).await.map_err(|_| TransportError::Closed)
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_reaches_receiver() {
        let (transport, mut rx) = ChannelTransport::new(4);
        transport.send_text(Arc::from("hello")).await.unwrap();
        assert_eq!(&*rx.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn dropped_receiver_means_disconnected() {
        let (transport, rx) = ChannelTransport::new(4);
        assert!(transport.is_connected());
        drop(rx);
        assert!(!transport.is_connected());
        assert!(!transport.probe().await);
        assert_eq!(
            transport.send_text(Arc::from("x")).await,
            Err(TransportError::Closed)
        );
    }

    #[tokio::test]
    async fn close_cancels_token_and_rejects_sends() {
        let (transport, _rx) = ChannelTransport::new(4);
        let token = transport.closed_token();
        transport.close().await;
        assert!(token.is_cancelled());
        assert!(!transport.is_connected());
        assert_eq!(
            transport.send_text(Arc::from("x")).await,
            Err(TransportError::Closed)
        );
        // idempotent
        transport.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn full_channel_waits() {
        let (transport, mut rx) = ChannelTransport::new(1);
        transport.send_text(Arc::from("a")).await.unwrap();
        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            transport.send_text(Arc::from("b")),
        )
        .await;
        assert!(blocked.is_err());
        assert_eq!(&*rx.recv().await.unwrap(), "a");
    }
}
