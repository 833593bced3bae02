//! Bidirectional byte pump with an in-band detach byte.
//!
//! The same loop serves both ends of an attachment: the daemon pumps
//! between the client socket and the PTY master, the client pumps between
//! its own terminal and the socket. Only bytes travelling from side A are
//! scanned for the detach byte.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Read buffer size for each direction.
const BUFFER_SIZE: usize = 4096;

/// Why forwarding stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// Either side reached EOF or failed.
    Closed,
    /// The detach byte arrived from side A.
    Detached,
}

/// Pump bytes A → B and B → A until EOF, an I/O error, or `detach_byte`
/// shows up in the A → B direction.
///
/// Bytes preceding the detach byte in the same chunk are delivered; the
/// detach byte and everything after it are discarded. Neither side is
/// shut down on return, so the caller decides what happens to them.
pub async fn forward<AR, AW, BR, BW>(
    a_rx: &mut AR,
    a_tx: &mut AW,
    b_rx: &mut BR,
    b_tx: &mut BW,
    detach_byte: u8,
) -> ForwardOutcome
where
    AR: AsyncRead + Unpin + ?Sized,
    AW: AsyncWrite + Unpin + ?Sized,
    BR: AsyncRead + Unpin + ?Sized,
    BW: AsyncWrite + Unpin + ?Sized,
{
    let mut a_buf = vec![0u8; BUFFER_SIZE];
    let mut b_buf = vec![0u8; BUFFER_SIZE];

    loop {
        // Both reads are cancel-safe: the losing branch has consumed nothing.
        tokio::select! {
            read = a_rx.read(&mut a_buf) => {
                let n = match read {
                    Ok(0) => {
                        debug!("Forward: side A reached EOF");
                        return ForwardOutcome::Closed;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        debug!("Forward: side A read error: {}", e);
                        return ForwardOutcome::Closed;
                    }
                };

                let chunk = &a_buf[..n];
                let detach_at = chunk.iter().position(|&b| b == detach_byte);
                let payload = match detach_at {
                    Some(i) => &chunk[..i],
                    None => chunk,
                };

                if !payload.is_empty() {
                    if let Err(e) = write_flush(b_tx, payload).await {
                        debug!("Forward: side B write error: {}", e);
                        return ForwardOutcome::Closed;
                    }
                }

                if detach_at.is_some() {
                    debug!("Forward: detach byte received");
                    return ForwardOutcome::Detached;
                }
            }
            read = b_rx.read(&mut b_buf) => {
                let n = match read {
                    Ok(0) => {
                        debug!("Forward: side B reached EOF");
                        return ForwardOutcome::Closed;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        debug!("Forward: side B read error: {}", e);
                        return ForwardOutcome::Closed;
                    }
                };

                if let Err(e) = write_flush(a_tx, &b_buf[..n]).await {
                    debug!("Forward: side A write error: {}", e);
                    return ForwardOutcome::Closed;
                }
            }
        }
    }
}

async fn write_flush<W>(writer: &mut W, data: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(data).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{duplex, split, DuplexStream};
    use tokio::time::timeout;

    const DETACH: u8 = 0x1D;

    /// Run `forward` between two in-memory pipes and hand back the far ends.
    ///
    /// `a_far` plays the user (writes what A reads, reads what A receives),
    /// `b_far` plays the PTY.
    fn harness() -> (
        DuplexStream,
        DuplexStream,
        tokio::task::JoinHandle<ForwardOutcome>,
    ) {
        let (a_near, a_far) = duplex(1024);
        let (b_near, b_far) = duplex(1024);
        let handle = tokio::spawn(async move {
            let (mut a_rx, mut a_tx) = split(a_near);
            let (mut b_rx, mut b_tx) = split(b_near);
            forward(&mut a_rx, &mut a_tx, &mut b_rx, &mut b_tx, DETACH).await
        });
        (a_far, b_far, handle)
    }

    #[tokio::test]
    async fn test_detach_delivers_prefix_and_drops_rest() {
        let (mut user, mut pty, handle) = harness();

        user.write_all(b"ls -l\nabc\x1dnever-sent").await.unwrap();

        let outcome = timeout(Duration::from_secs(2), handle)
            .await
            .expect("forward should stop on detach")
            .unwrap();
        assert_eq!(outcome, ForwardOutcome::Detached);

        let mut received = vec![0u8; 64];
        let n = timeout(Duration::from_secs(1), pty.read(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&received[..n], b"ls -l\nabc");

        // Nothing after the detach byte may ever arrive; the forwarder has
        // dropped its ends, so the next read is EOF.
        let n = pty.read(&mut received).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_detach_as_first_byte_forwards_nothing() {
        let (mut user, mut pty, handle) = harness();

        user.write_all(&[DETACH, b'x']).await.unwrap();

        let outcome = timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert_eq!(outcome, ForwardOutcome::Detached);

        let mut received = Vec::new();
        pty.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn test_output_side_is_never_scanned() {
        let (mut user, mut pty, handle) = harness();

        pty.write_all(&[b'a', DETACH, b'b']).await.unwrap();

        let mut received = [0u8; 3];
        timeout(Duration::from_secs(1), user.read_exact(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, [b'a', DETACH, b'b']);
        assert!(!handle.is_finished());

        drop(user);
        let outcome = timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert_eq!(outcome, ForwardOutcome::Closed);
    }

    #[tokio::test]
    async fn test_chunks_keep_their_order() {
        let (mut user, mut pty, handle) = harness();

        for chunk in [&b"one "[..], b"two ", b"three"] {
            user.write_all(chunk).await.unwrap();
        }

        let mut received = [0u8; 13];
        timeout(Duration::from_secs(1), pty.read_exact(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&received, b"one two three");

        drop(pty);
        let outcome = timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert_eq!(outcome, ForwardOutcome::Closed);
    }

    #[tokio::test]
    async fn test_eof_from_either_side_closes() {
        let (user, _pty, handle) = harness();
        drop(user);
        let outcome = timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert_eq!(outcome, ForwardOutcome::Closed);

        let (_user, pty, handle) = harness();
        drop(pty);
        let outcome = timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert_eq!(outcome, ForwardOutcome::Closed);
    }
}
