//! A registered client's control-channel session (spec §3 "Client session").

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::{RelayError, Result};
use crate::wire::Frame;

/// Boxed half of the control-channel stream this session writes to. Boxed
/// so the same session type works whether or not the control channel is
/// TLS-wrapped (§6, `TUNNEL_CTRL_TLS`).
pub type WriteHalf = Box<dyn AsyncWrite + Send + Unpin>;

pub struct ClientSession {
    pub token: String,
    pub target_port: u16,
    pub remote_addr: SocketAddr,
    pub connected_at: Instant,
    write_half: Mutex<WriteHalf>,
    destroyed: AtomicBool,
}

impl ClientSession {
    pub fn new(token: String, target_port: u16, remote_addr: SocketAddr, write_half: WriteHalf) -> Self {
        Self {
            token,
            target_port,
            remote_addr,
            connected_at: Instant::now(),
            write_half: Mutex::new(write_half),
            destroyed: AtomicBool::new(false),
        }
    }

    /// A session is alive while its stream has not been marked destroyed.
    /// Combined with registry membership, this is the "writable" liveness
    /// check in spec §4.D.
    pub fn is_alive(&self) -> bool {
        !self.destroyed.load(Ordering::Acquire)
    }

    pub fn mark_destroyed(&self) {
        self.destroyed.store(true, Ordering::Release);
    }

    /// Serializes and writes `frame` under the session's write lock,
    /// appending the newline delimiter. Marks the session destroyed on
    /// any write failure so the registry and janitor can evict it.
    pub async fn send(&self, frame: &Frame) -> Result<()> {
        if !self.is_alive() {
            return Err(RelayError::MalformedFrame("session already destroyed".into()));
        }
        let mut line = frame.to_line()?;
        line.push('\n');
        let mut guard = self.write_half.lock().await;
        match guard.write_all(line.as_bytes()).await {
            Ok(()) => Ok(()),
            Err(e) => {
                drop(guard);
                self.mark_destroyed();
                Err(RelayError::Io(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    struct FailingWriter;
    impl AsyncWrite for FailingWriter {
        fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &[u8]) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed")))
        }
        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn send_marks_session_destroyed_on_write_failure() {
        let session = ClientSession::new(
            "abc12345".to_string(),
            3000,
            "127.0.0.1:1234".parse().unwrap(),
            Box::new(FailingWriter),
        );
        assert!(session.is_alive());
        let result = session.send(&Frame::Registered).await;
        assert!(result.is_err());
        assert!(!session.is_alive());
    }

    #[tokio::test]
    async fn send_on_destroyed_session_is_a_noop_error() {
        let session = ClientSession::new(
            "abc12345".to_string(),
            3000,
            "127.0.0.1:1234".parse().unwrap(),
            Box::new(FailingWriter),
        );
        session.mark_destroyed();
        assert!(session.send(&Frame::Registered).await.is_err());
    }
}
