//! Wire record codec for the netbloat measurement protocol.
//!
//! Records are ASCII, space-delimited, and bracketed by sentinel tokens
//! so that a receiver can recover them even after UDP loss or arbitrary
//! TCP chunking. See `SenderRecord` and `IntervalFeedback`.

use std::fmt;
use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};

pub const SENTINEL_A: &[u8] = b" a ";
pub const SENTINEL_B: &[u8] = b" b ";
pub const SENTINEL_C: &[u8] = b" c ";

#[derive(Debug)]
pub enum Error {
    MissingSentinel,
    MalformedFields,
    InvalidKind,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingSentinel => write!(f, "sentinel block not found in payload"),
            Self::MalformedFields => write!(f, "record fields could not be parsed"),
            Self::InvalidKind => write!(f, "unknown record kind"),
        }
    }
}

impl std::error::Error for Error {}

/// Which phase produced a `SenderRecord`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Cal,
    Run,
}

impl RecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cal => "cal",
            Self::Run => "run",
        }
    }
}

impl FromStr for RecordKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cal" => Ok(Self::Cal),
            "run" => Ok(Self::Run),
            _ => Err(Error::InvalidKind),
        }
    }
}

/// The sender-side metadata embedded in every data-channel packet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SenderRecord {
    pub kind: RecordKind,
    pub send_time: f64,
    pub interval_duration: f64,
    pub interval_send_count: u64,
    pub interval_bytes_sent: u64,
    pub send_counter: u64,
}

impl SenderRecord {
    /// Appends the `a...b` block and `payload_len` bytes of padding.
    pub fn encode(&self, payload_len: usize, buf: &mut BytesMut) {
        buf.put_slice(SENTINEL_A);
        buf.put_slice(self.kind.as_str().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(self.send_time.to_string().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(self.interval_duration.to_string().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(self.interval_send_count.to_string().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(self.interval_bytes_sent.to_string().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(self.send_counter.to_string().as_bytes());
        buf.put_slice(SENTINEL_B);
        buf.resize(buf.len() + payload_len, b'a');
    }

    /// Locates the `a...b` block (sentinels inclusive) in a received buffer.
    pub fn find_block(bytes: &[u8]) -> Option<&[u8]> {
        let idx_a = find(bytes, SENTINEL_A)?;
        let idx_b = find(&bytes[idx_a..], SENTINEL_B)? + idx_a;
        Some(&bytes[idx_a..idx_b + SENTINEL_B.len()])
    }

    /// Parses a block previously returned by [`Self::find_block`].
    pub fn decode(block: &[u8]) -> Result<Self, Error> {
        let inner = block
            .strip_prefix(SENTINEL_A)
            .and_then(|b| b.strip_suffix(SENTINEL_B))
            .ok_or(Error::MissingSentinel)?;

        let text = std::str::from_utf8(inner).map_err(|_| Error::MalformedFields)?;
        let mut fields = text.split_ascii_whitespace();

        let kind: RecordKind = fields.next().ok_or(Error::MalformedFields)?.parse()?;
        let send_time = parse_f64(fields.next())?;
        let interval_duration = parse_f64(fields.next())?;
        let interval_send_count = parse_u64(fields.next())?;
        let interval_bytes_sent = parse_u64(fields.next())?;
        let send_counter = parse_u64(fields.next())?;

        Ok(Self {
            kind,
            send_time,
            interval_duration,
            interval_send_count,
            interval_bytes_sent,
            send_counter,
        })
    }
}

/// The receiver-side enrichment of an echoed `SenderRecord`, as carried on
/// the control channel. `echoed_block` is kept as the exact bytes found on
/// the data channel, so the round trip is byte-for-byte verifiable.
#[derive(Debug, Clone)]
pub struct IntervalFeedback {
    pub echoed_block: Bytes,
    pub receiver_interval_duration: f64,
    pub receiver_interval_packets: u64,
    pub receiver_interval_bytes: u64,
    pub receiver_total_packets: u64,
}

impl IntervalFeedback {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.echoed_block);
        buf.put_slice(self.receiver_interval_duration.to_string().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(self.receiver_interval_packets.to_string().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(self.receiver_interval_bytes.to_string().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(self.receiver_total_packets.to_string().as_bytes());
        buf.put_slice(SENTINEL_C);
    }

    /// Parses a full feedback record, returning the echoed sender fields
    /// alongside the receiver fields.
    pub fn decode(bytes: &[u8]) -> Result<(SenderRecord, Self), Error> {
        let idx_a = find(bytes, SENTINEL_A).ok_or(Error::MissingSentinel)?;
        let idx_b = find(&bytes[idx_a..], SENTINEL_B).ok_or(Error::MissingSentinel)? + idx_a;
        let block_end = idx_b + SENTINEL_B.len();
        let echoed_block = &bytes[idx_a..block_end];
        let sender = SenderRecord::decode(echoed_block)?;

        let rest = &bytes[block_end..];
        let idx_c = find(rest, SENTINEL_C).ok_or(Error::MissingSentinel)?;
        let text = std::str::from_utf8(&rest[..idx_c]).map_err(|_| Error::MalformedFields)?;
        let mut fields = text.split_ascii_whitespace();

        let receiver_interval_duration = parse_f64(fields.next())?;
        let receiver_interval_packets = parse_u64(fields.next())?;
        let receiver_interval_bytes = parse_u64(fields.next())?;
        let receiver_total_packets = parse_u64(fields.next())?;

        Ok((
            sender,
            Self {
                echoed_block: Bytes::copy_from_slice(echoed_block),
                receiver_interval_duration,
                receiver_interval_packets,
                receiver_interval_bytes,
                receiver_total_packets,
            },
        ))
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn parse_f64(field: Option<&str>) -> Result<f64, Error> {
    field
        .ok_or(Error::MalformedFields)?
        .parse()
        .map_err(|_| Error::MalformedFields)
}

fn parse_u64(field: Option<&str>) -> Result<u64, Error> {
    field
        .ok_or(Error::MalformedFields)?
        .parse()
        .map_err(|_| Error::MalformedFields)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SenderRecord {
        SenderRecord {
            kind: RecordKind::Run,
            send_time: 1234.5,
            interval_duration: 0.1,
            interval_send_count: 7,
            interval_bytes_sent: 28672,
            send_counter: 42,
        }
    }

    #[test]
    fn encodes_and_decodes_sender_record() {
        let record = sample();
        let mut buf = BytesMut::new();
        record.encode(1024, &mut buf);

        let block = SenderRecord::find_block(&buf).expect("block present");
        let decoded = SenderRecord::decode(block).expect("decodes");
        assert_eq!(decoded, record);

        // payload padding follows the b sentinel.
        assert_eq!(buf.len() - block.len(), 1024);
    }

    #[test]
    fn missing_b_sentinel_is_not_found() {
        let mut buf = BytesMut::new();
        buf.put_slice(b" a cal 1.0 0.1 1 1 1 not closed");
        assert!(SenderRecord::find_block(&buf).is_none());
    }

    #[test]
    fn missing_a_sentinel_is_not_found() {
        let buf = BytesMut::from(&b"no sentinels here at all"[..]);
        assert!(SenderRecord::find_block(&buf).is_none());
    }

    #[test]
    fn feedback_round_trips_with_echoed_block_verbatim() {
        let record = sample();
        let mut sender_buf = BytesMut::new();
        record.encode(64, &mut sender_buf);
        let block = SenderRecord::find_block(&sender_buf).unwrap().to_vec();

        let feedback = IntervalFeedback {
            echoed_block: Bytes::copy_from_slice(&block),
            receiver_interval_duration: 0.0998,
            receiver_interval_packets: 6,
            receiver_interval_bytes: 24576,
            receiver_total_packets: 600,
        };

        let mut out = BytesMut::new();
        feedback.encode(&mut out);

        let (decoded_sender, decoded_feedback) = IntervalFeedback::decode(&out).expect("decodes");
        assert_eq!(decoded_sender, record);
        assert_eq!(&decoded_feedback.echoed_block[..], &block[..]);
        assert_eq!(decoded_feedback.receiver_total_packets, 600);
    }

    #[test]
    fn feedback_decode_rejects_missing_c_sentinel() {
        let record = sample();
        let mut sender_buf = BytesMut::new();
        record.encode(8, &mut sender_buf);
        let block = SenderRecord::find_block(&sender_buf).unwrap();

        let mut out = BytesMut::new();
        out.put_slice(block);
        out.put_slice(b"0.1 1 1 1");
        assert!(IntervalFeedback::decode(&out).is_err());
    }
}
