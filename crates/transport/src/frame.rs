//! Reading one frame per connection, and the single-line replies to sync frames.
//!
//! Senders may write the metadata line and the payload as two writes with a
//! gap in between, and not every sender half-closes. A frame therefore ends
//! at whichever comes first: end of stream, or `silence` with no new bytes
//! after at least one byte arrived. A read that completes always beats the
//! silence timer.

use std::time::Duration;

use bytes::BytesMut;
use hookbridge_protocol::SyncReply;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::TransportError;

/// Upper bound for a single reply line.
const MAX_REPLY_BYTES: u64 = 64 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct SettleConfig {
    /// How long to wait for the first byte before calling it a probe.
    pub initial_wait: Duration,
    /// Quiet period that ends a frame once bytes have arrived.
    pub silence: Duration,
    pub max_bytes: usize,
}

impl Default for SettleConfig {
    fn default() -> Self {
        SettleConfig {
            initial_wait: Duration::from_secs(2),
            silence: Duration::from_millis(150),
            max_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleReason {
    EndOfStream,
    Silence,
    /// Nothing arrived within `initial_wait`.
    Idle,
    Capped,
}

pub async fn collect_frame<R>(
    reader: &mut R,
    config: &SettleConfig,
) -> Result<(BytesMut, SettleReason), TransportError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        let wait = if buf.is_empty() {
            config.initial_wait
        } else {
            config.silence
        };
        buf.reserve(4096);

        match tokio::time::timeout(wait, reader.read_buf(&mut buf)).await {
            Ok(Ok(0)) => return Ok((buf, SettleReason::EndOfStream)),
            Ok(Ok(_)) if buf.len() >= config.max_bytes => {
                buf.truncate(config.max_bytes);
                return Ok((buf, SettleReason::Capped));
            }
            Ok(Ok(_)) => continue,
            // A reset after data arrived still leaves a usable frame.
            Ok(Err(_)) if !buf.is_empty() => return Ok((buf, SettleReason::EndOfStream)),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) if buf.is_empty() => return Ok((buf, SettleReason::Idle)),
            Err(_) => return Ok((buf, SettleReason::Silence)),
        }
    }
}

/// Read one newline-terminated reply within `timeout`.
///
/// A clean close before any byte is `Ok(None)`.
pub async fn read_reply_line<R>(
    reader: &mut R,
    timeout: Duration,
) -> Result<Option<String>, TransportError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut reader = BufReader::new(reader.take(MAX_REPLY_BYTES));
    let mut line = String::new();
    match tokio::time::timeout(timeout, reader.read_line(&mut line)).await {
        Ok(Ok(0)) => Ok(None),
        Ok(Ok(_)) => Ok(Some(line)),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(TransportError::Timeout(timeout)),
    }
}

/// Resolves once the peer closes its side (or the read fails).
pub async fn peer_closed<R>(reader: &mut R)
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut scratch = [0u8; 256];
    loop {
        match reader.read(&mut scratch).await {
            Ok(0) | Err(_) => return,
            Ok(_) => continue,
        }
    }
}

pub async fn write_reply<W>(writer: &mut W, reply: &SyncReply) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(reply.to_line().as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
