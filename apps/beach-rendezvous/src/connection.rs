use std::{
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
};

use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Lifecycle of a relayed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Open,
            1 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Open => 0,
            ConnectionState::Closing => 1,
            ConnectionState::Closed => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frames queued for the connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    /// Normal closure; the writer stops after sending it.
    Close,
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("connection {0} is not open")]
    NotOpen(Uuid),
    #[error("writer for connection {0} has shut down")]
    WriterGone(Uuid),
}

/// Cheap, cloneable handle to one live peer channel.
///
/// All writes go through a single-consumer queue so concurrent forwarders
/// never interleave frames on the same socket.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: Uuid,
    remote_addr: Option<SocketAddr>,
    state: AtomicU8,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl Connection {
    /// Create an Open connection together with the receiving end of its
    /// outbound queue, which the caller hands to exactly one writer.
    pub fn open(remote_addr: Option<SocketAddr>) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Self {
            inner: Arc::new(ConnectionInner {
                id: Uuid::new_v4(),
                remote_addr,
                state: AtomicU8::new(ConnectionState::Open.as_u8()),
                outbound: tx,
            }),
        };
        (connection, rx)
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open && !self.inner.outbound.is_closed()
    }

    /// Open -> Closing. Returns false if the connection already left Open.
    pub fn begin_close(&self) -> bool {
        self.inner
            .state
            .compare_exchange(
                ConnectionState::Open.as_u8(),
                ConnectionState::Closing.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn mark_closed(&self) {
        self.inner
            .state
            .store(ConnectionState::Closed.as_u8(), Ordering::Release);
    }

    /// Queue a text frame for delivery.
    pub fn send(&self, text: String) -> Result<(), SendError> {
        if self.state() != ConnectionState::Open {
            return Err(SendError::NotOpen(self.inner.id));
        }
        self.inner
            .outbound
            .send(Outbound::Text(text))
            .map_err(|_| SendError::WriterGone(self.inner.id))
    }

    /// Queue a normal-closure frame. Bypasses the state check because the
    /// gateway sends it while the connection is already Closing.
    pub fn send_close(&self) -> Result<(), SendError> {
        self.inner
            .outbound
            .send(Outbound::Close)
            .map_err(|_| SendError::WriterGone(self.inner.id))
    }

    pub fn same_as(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("remote_addr", &self.inner.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn new_connection_is_open() {
        let (connection, _rx) = Connection::open(None);
        assert_eq!(connection.state(), ConnectionState::Open);
        assert!(connection.is_open());
    }

    #[test_timeout::timeout]
    fn send_enqueues_in_order() {
        let (connection, mut rx) = Connection::open(None);
        connection.send("one".into()).expect("send one");
        connection.send("two".into()).expect("send two");

        assert_eq!(rx.try_recv().ok(), Some(Outbound::Text("one".into())));
        assert_eq!(rx.try_recv().ok(), Some(Outbound::Text("two".into())));
        assert!(rx.try_recv().is_err());
    }

    #[test_timeout::timeout]
    fn begin_close_only_succeeds_once() {
        let (connection, _rx) = Connection::open(None);
        assert!(connection.begin_close());
        assert!(!connection.begin_close());
        assert_eq!(connection.state(), ConnectionState::Closing);

        connection.mark_closed();
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(!connection.begin_close());
    }

    #[test_timeout::timeout]
    fn send_rejected_once_closing() {
        let (connection, mut rx) = Connection::open(None);
        connection.begin_close();

        assert!(matches!(
            connection.send("late".into()),
            Err(SendError::NotOpen(_))
        ));
        connection.send_close().expect("close frame still allowed");
        assert_eq!(rx.try_recv().ok(), Some(Outbound::Close));
    }

    #[test_timeout::timeout]
    fn dropped_writer_makes_connection_unusable() {
        let (connection, rx) = Connection::open(None);
        drop(rx);

        assert!(!connection.is_open());
        assert!(matches!(
            connection.send("lost".into()),
            Err(SendError::WriterGone(_))
        ));
    }

    #[test_timeout::timeout]
    fn clones_share_identity() {
        let (a, _rx_a) = Connection::open(None);
        let (b, _rx_b) = Connection::open(None);
        let a2 = a.clone();

        assert!(a.same_as(&a2));
        assert!(!a.same_as(&b));
        a2.begin_close();
        assert_eq!(a.state(), ConnectionState::Closing);
    }
}
