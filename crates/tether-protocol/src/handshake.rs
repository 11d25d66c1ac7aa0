//! Frame sync handshake
//!
//! A serial line (or a reused TCP stream) may hold stale bytes in either
//! direction. Before the session protocol starts, both ends purge what is
//! pending and run a short lock-step exchange:
//!
//! ```text
//! client -> server   SYN a
//! server -> client   ACK a+1 b
//! client -> server   ACK b+1          (DEBUG_ACK b+1 requests a lossiness check)
//! ```
//!
//! Any mismatch makes the detecting side write `NAK` and fail with a
//! retriable [`HandshakeError`]; callers purge and go again.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::error::HandshakeError;

/// Handshake byte constants, revision 1
pub const SYN: u8 = 0x16;
pub const ACK: u8 = 0x06;
pub const DEBUG_ACK: u8 = 0x07;
pub const NAK: u8 = 0x15;

/// Revision of the byte constants above
pub const HANDSHAKE_REVISION: u32 = 1;

/// How long purge waits for more stale bytes before declaring the line quiet
pub const PURGE_WINDOW: Duration = Duration::from_millis(10);

/// Pattern echoed by the agent when the controller requests a lossiness check
pub const LOSSINESS_PATTERN: &[u8; 23] = b"\x1b[32mhello world\x1b[39m!\n";

/// Discard whatever is immediately readable
///
/// Returns once a full [`PURGE_WINDOW`] passes without data, or
/// [`HandshakeError::Eof`] if the stream ends.
pub async fn purge<S>(stream: &mut S) -> Result<usize, HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; 255];
    let mut discarded = 0;

    loop {
        match tokio::time::timeout(PURGE_WINDOW, stream.read(&mut buf)).await {
            Err(_) => break,
            Ok(Ok(0)) => return Err(HandshakeError::Eof),
            Ok(Ok(n)) => {
                debug!("Discarding {} stale bytes: {:02x?}", n, &buf[..n]);
                discarded += n;
            }
            Ok(Err(e)) => return Err(e.into()),
        }
    }

    Ok(discarded)
}

/// Controller side of the exchange
///
/// Not time-bounded; wrap in `tokio::time::timeout` and treat an elapsed
/// window like [`HandshakeError::Timeout`].
pub async fn client<S>(stream: &mut S, debug_mode: bool) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let a: u8 = rand::random();
    stream.write_all(&[SYN, a]).await?;
    stream.flush().await?;

    let mut synack = [0u8; 3];
    read_exact(stream, &mut synack).await?;

    if synack[0] != ACK || synack[1] != a.wrapping_add(1) {
        debug!(
            "Client did not receive synack: expected {:#04x} {:#04x}, got {:02x?}",
            ACK,
            a.wrapping_add(1),
            &synack[..2]
        );
        stream.write_all(&[NAK]).await?;
        return Err(HandshakeError::Retry(format!(
            "unexpected synack {:02x?}",
            synack
        )));
    }

    let flag = if debug_mode { DEBUG_ACK } else { ACK };
    stream.write_all(&[flag, synack[2].wrapping_add(1)]).await?;
    stream.flush().await?;
    info!("Client handshake complete");

    if debug_mode {
        stream.write_all(LOSSINESS_PATTERN).await?;
        stream.flush().await?;

        let mut echo = [0u8; LOSSINESS_PATTERN.len()];
        read_exact(stream, &mut echo).await?;

        if &echo != LOSSINESS_PATTERN {
            stream.write_all(&[NAK]).await?;
            warn!("Lossiness check failed: {:02x?}", echo);
            return Err(HandshakeError::Lossy(format!("echo mismatch {:02x?}", echo)));
        }

        stream.write_all(&[ACK]).await?;
        stream.flush().await?;
        info!("Lossiness check passed");
    }

    Ok(())
}

/// Agent side of the exchange
pub async fn server<S>(stream: &mut S) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Three bytes of room so an offset stream shows up as a short or long read
    let mut syn = [0u8; 3];
    let n = read_some(stream, &mut syn).await?;
    if n != 2 || syn[0] != SYN {
        debug!("Server did not receive SYN: {:02x?}", &syn[..n]);
        if syn[0] != SYN {
            stream.write_all(&[NAK]).await?;
        }
        return Err(HandshakeError::Retry(format!(
            "expected SYN, read {:02x?}",
            &syn[..n]
        )));
    }

    let b: u8 = rand::random();
    stream.write_all(&[ACK, syn[1].wrapping_add(1), b]).await?;
    stream.flush().await?;

    let mut ack = [0u8; 2];
    let n = read_some(stream, &mut ack).await?;
    if n != 2 || (ack[0] != ACK && ack[0] != DEBUG_ACK) || ack[1] != b.wrapping_add(1) {
        debug!("Server did not receive ack: {:02x?}", &ack[..n]);
        stream.write_all(&[NAK]).await?;
        return Err(HandshakeError::Retry(format!(
            "expected ack, read {:02x?}",
            &ack[..n]
        )));
    }
    info!("Server handshake complete");

    if ack[0] == DEBUG_ACK {
        let mut pattern = [0u8; LOSSINESS_PATTERN.len()];
        read_exact(stream, &mut pattern).await?;
        stream.write_all(&pattern).await?;
        stream.flush().await?;

        let mut verdict = [0u8; 1];
        read_exact(stream, &mut verdict).await?;
        if verdict[0] != ACK {
            warn!("Lossiness check failed");
            return Err(HandshakeError::Lossy("controller rejected echo".into()));
        }
        info!("Lossiness check passed");
    }

    Ok(())
}

async fn read_exact<S>(stream: &mut S, buf: &mut [u8]) -> Result<(), HandshakeError>
where
    S: AsyncRead + Unpin,
{
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(HandshakeError::Eof),
        Err(e) => Err(e.into()),
    }
}

/// One read, plus a second if only a single byte arrived
async fn read_some<S>(stream: &mut S, buf: &mut [u8]) -> Result<usize, HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let n = stream.read(buf).await?;
    if n == 0 {
        return Err(HandshakeError::Eof);
    }
    if n == 1 && buf.len() > 1 {
        let m = stream.read(&mut buf[1..]).await?;
        if m == 0 {
            return Err(HandshakeError::Eof);
        }
        return Ok(n + m);
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_client_server_sync() {
        let (mut a, mut b) = duplex(1024);

        let (c, s) = tokio::join!(client(&mut a, false), server(&mut b));
        c.unwrap();
        s.unwrap();
    }

    #[tokio::test]
    async fn test_debug_lossiness_check() {
        let (mut a, mut b) = duplex(1024);

        let (c, s) = tokio::join!(client(&mut a, true), server(&mut b));
        c.unwrap();
        s.unwrap();
    }

    #[tokio::test]
    async fn test_server_rejects_trash() {
        let (mut a, mut b) = duplex(1024);
        a.write_all(b"ls\n").await.unwrap();

        let err = server(&mut b).await.unwrap_err();
        assert!(err.is_retriable());

        let mut nak = [0u8; 1];
        a.read_exact(&mut nak).await.unwrap();
        assert_eq!(nak[0], NAK);
    }

    #[tokio::test]
    async fn test_client_rejects_bad_synack() {
        let (mut a, mut b) = duplex(1024);

        let peer = tokio::spawn(async move {
            let mut syn = [0u8; 2];
            b.read_exact(&mut syn).await.unwrap();
            // Wrong increment
            b.write_all(&[ACK, syn[1].wrapping_add(2), 9]).await.unwrap();
            let mut nak = [0u8; 1];
            b.read_exact(&mut nak).await.unwrap();
            nak[0]
        });

        let err = client(&mut a, false).await.unwrap_err();
        assert!(matches!(err, HandshakeError::Retry(_)));
        assert_eq!(peer.await.unwrap(), NAK);
    }

    #[tokio::test]
    async fn test_client_eof() {
        let (mut a, b) = duplex(64);
        drop(b);
        assert!(matches!(
            client(&mut a, false).await,
            Err(HandshakeError::Eof) | Err(HandshakeError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_purge_discards_stale_bytes() {
        let (mut a, mut b) = duplex(1024);
        a.write_all(b"stale noise from a previous boot").await.unwrap();

        let n = purge(&mut b).await.unwrap();
        assert_eq!(n, 32);

        // The line is quiet now and sync still works
        let (c, s) = tokio::join!(client(&mut a, false), server(&mut b));
        c.unwrap();
        s.unwrap();
    }

    #[tokio::test]
    async fn test_purge_reports_eof() {
        let (a, mut b) = duplex(64);
        drop(a);
        assert!(matches!(purge(&mut b).await, Err(HandshakeError::Eof)));
    }

    #[tokio::test]
    async fn test_retry_after_noise() {
        let (mut a, mut b) = duplex(1024);

        let agent = tokio::spawn(async move {
            loop {
                if server(&mut b).await.is_ok() {
                    return b;
                }
            }
        });

        // Noise first; the agent answers it with NAK
        a.write_all(&[0x41, 0x42, 0x43]).await.unwrap();
        loop {
            purge(&mut a).await.unwrap();
            match tokio::time::timeout(Duration::from_secs(1), client(&mut a, false)).await {
                Ok(Ok(())) => break,
                Ok(Err(e)) if e.is_retriable() => continue,
                Ok(Err(e)) => panic!("unexpected error: {e}"),
                Err(_) => continue,
            }
        }
        agent.await.unwrap();
    }
}
