//! Framing and setup-handshake helpers for the control channel.
//!
//! Setup messages (session id, JSON `RunConfig`) are length-delimited with
//! a `u32` big-endian prefix. Fixed literal sentinels (`setup complete`,
//! `" start "`) are exact byte sequences read without framing. During the
//! run, records are appended byte-for-byte and recovered by scanning for
//! their trailing sentinel.

use anyhow::{bail, Context, Result};
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;

pub const SETUP_COMPLETE: &str = "setup complete";
pub const START_SIGNAL: &str = " start ";
pub const UDP_STOP_SIGNAL: &str = "stop";

const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

pub async fn write_frame(writer: &mut (impl AsyncWrite + Unpin), payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len()).context("frame too large")?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    Ok(())
}

pub async fn read_frame(reader: &mut (impl AsyncRead + Unpin)) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        bail!("control frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit");
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

pub async fn write_literal(writer: &mut (impl AsyncWrite + Unpin), text: &str) -> Result<()> {
    writer.write_all(text.as_bytes()).await?;
    Ok(())
}

/// Reads exactly `expected.len()` bytes and verifies they match.
pub async fn expect_literal(reader: &mut (impl AsyncRead + Unpin), expected: &str) -> Result<()> {
    let mut buf = vec![0u8; expected.len()];
    reader.read_exact(&mut buf).await?;
    if buf != expected.as_bytes() {
        bail!(
            "expected literal {expected:?} on control channel, got {:?}",
            String::from_utf8_lossy(&buf)
        );
    }
    Ok(())
}

/// Accumulates bytes from the control channel's read half and slices out
/// complete records as they arrive, delimited by a caller-supplied
/// terminator (` c ` for feedback records, `\n` for relayed display
/// lines). Mirrors the data receiver's sentinel-scanning style.
pub struct RecordReader {
    read_half: OwnedReadHalf,
    buf: BytesMut,
}

impl RecordReader {
    pub fn new(read_half: OwnedReadHalf) -> Self {
        Self {
            read_half,
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Returns the next complete record (terminator included), or `None`
    /// on clean peer close with no partial record pending.
    pub async fn next_record(&mut self, terminator: &[u8]) -> Result<Option<BytesMut>> {
        loop {
            if let Some(idx) = find(&self.buf, terminator) {
                let record = self.buf.split_to(idx + terminator.len());
                return Ok(Some(record));
            }

            let mut chunk = [0u8; 4096];
            let n = self.read_half.read(&mut chunk).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                bail!("control channel closed mid-record");
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    pub fn into_read_half(self) -> OwnedReadHalf {
        self.read_half
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trips_over_a_pipe() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let payload = b"hello control channel".to_vec();
        write_frame(&mut client, &payload).await.unwrap();
        let received = read_frame(&mut server).await.unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn literal_mismatch_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_literal(&mut client, "nope").await.unwrap();
        let err = expect_literal(&mut server, SETUP_COMPLETE).await;
        assert!(err.is_err());
    }
}
