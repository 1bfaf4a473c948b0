use std::time::Duration;

use relay_agent_common::constants::CLOSE_TIMEOUT_MS;
use relay_agent_common::{AgentError, Cancelled, Result};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Splice two duplex byte streams together
///
/// Copies in both directions until either direction hits end-of-stream or an
/// error, or until `cancel` fires. Both streams are then shut down (each
/// bounded by a short timeout) and dropped, so every connection handed to a
/// bridge is closed exactly once. The returned error, if any, is the one that
/// ended the session.
pub async fn bridge<A, B>(a: A, b: B, cancel: &CancellationToken) -> Result<()>
where
    A: AsyncRead + AsyncWrite + Send,
    B: AsyncRead + AsyncWrite + Send,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let result = tokio::select! {
        _ = cancel.cancelled() => {
            Err(AgentError::recoverable_with("bridge", Cancelled))
        }
        copied = tokio::io::copy(&mut a_read, &mut b_write) => {
            copied
                .map(|n| debug!(bytes = n, "Bridge ended by first stream"))
                .map_err(|e| AgentError::recoverable_with("copy to second stream", e))
        }
        copied = tokio::io::copy(&mut b_read, &mut a_write) => {
            copied
                .map(|n| debug!(bytes = n, "Bridge ended by second stream"))
                .map_err(|e| AgentError::recoverable_with("copy to first stream", e))
        }
    };

    tokio::join!(close(&mut a_write), close(&mut b_write));
    result
}

/// Bounded shutdown; the peer may already be gone, so errors are ignored
async fn close<T: AsyncWrite>(half: &mut WriteHalf<T>) {
    let timeout = Duration::from_millis(CLOSE_TIMEOUT_MS);
    match tokio::time::timeout(timeout, half.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Shutdown failed: {}", e),
        Err(_) => debug!("Shutdown timed out after {:?}", timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, duplex};

    #[tokio::test]
    async fn test_bridge_completeness() {
        let (a_inner, mut a) = duplex(1024);
        let (b_inner, mut b) = duplex(1024);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(async move { bridge(a_inner, b_inner, &cancel).await });

        a.write_all(b"hello").await.unwrap();
        b.write_all(b"world").await.unwrap();

        let mut buf = [0u8; 5];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        // Ending one direction closes both sides
        a.shutdown().await.unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(b.read(&mut buf).await.unwrap(), 0);
        assert_eq!(a.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bridge_peer_dropped() {
        let (a_inner, a) = duplex(1024);
        let (b_inner, mut b) = duplex(1024);
        let cancel = CancellationToken::new();

        drop(a);
        bridge(a_inner, b_inner, &cancel).await.unwrap();

        let mut buf = [0u8; 1];
        assert_eq!(b.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bridge_cancellation() {
        let (a_inner, mut a) = duplex(1024);
        let (b_inner, mut b) = duplex(1024);
        let cancel = CancellationToken::new();

        let token = cancel.clone();
        let handle = tokio::spawn(async move { bridge(a_inner, b_inner, &token).await });

        // Both sides idle: only cancellation can end the bridge
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        let started = Instant::now();
        cancel.cancel();
        let err = handle.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_millis(CLOSE_TIMEOUT_MS * 2));

        let mut buf = [0u8; 1];
        assert_eq!(a.read(&mut buf).await.unwrap(), 0);
        assert_eq!(b.read(&mut buf).await.unwrap(), 0);
    }
}
