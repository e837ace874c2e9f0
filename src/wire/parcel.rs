//! # Parcel Framing Module
//!
//! The parcel is the atomic wire unit. Layout, all numerics big-endian:
//!
//! ```text
//! marker[8] | channel u8 | priority u8 | object_id u64 | sequence u32 | length u32 | payload[length]
//! ```
//!
//! When `sequence == 0` and the channel is not SIGNAL, the payload starts
//! with a self-delimited object-header block describing the whole
//! transmission. Reading is resync-capable: on a marker mismatch the reader
//! scans forward for the marker byte-for-byte and reports how much it
//! skipped; an oversized length field is unrecoverable and terminates the
//! connection as a protocol error.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

/// Fixed framing marker opening every parcel, chosen for fast scan-resync
pub const MARKER: [u8; 8] = [0x8F, 0x64, 0x2B, 0xD1, 0x3A, 0xC7, 0x59, 0xE6];

/// Fixed wire bytes per parcel before the payload
pub const FRAME_OVERHEAD: usize = 8 + 1 + 1 + 8 + 4 + 4;

/// Allowance for the header block riding in front of the first data chunk
pub const HEADER_SLACK: usize = 1024;

/// Coarse traffic class; also ordered: signals preempt objects preempt files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Channel {
    Signal = 1,
    Object = 2,
    File = 3,
}

impl Channel {
    pub fn from_wire(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Signal),
            2 => Some(Self::Object),
            3 => Some(Self::File),
            _ => None,
        }
    }

    /// Scheduling rank, lower drains first
    pub fn rank(self) -> u8 {
        match self {
            Self::Signal => 0,
            Self::Object => 1,
            Self::File => 2,
        }
    }
}

/// Priority class attached to every send order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Priority {
    Bottom = 0,
    Low = 1,
    Normal = 2,
    High = 3,
    Top = 4,
}

impl Priority {
    pub fn from_wire(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Bottom),
            1 => Some(Self::Low),
            2 => Some(Self::Normal),
            3 => Some(Self::High),
            4 => Some(Self::Top),
            _ => None,
        }
    }

    /// Scheduling rank, lower drains first (TOP wins)
    pub fn rank(self) -> u8 {
        4 - self as u8
    }
}

/// Description of a whole transmission, carried in the first parcel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHeader {
    /// Serialization method code (objects) or 0 (files)
    pub method: u8,
    /// Total payload bytes across all parcels of the transmission
    pub expected_size: u64,
    /// Number of parcels the transmission is split into
    pub expected_parcels: u32,
    /// Destination path relative to the receiver's file root (files only)
    pub path: Option<String>,
    /// CRC-32 over the full payload (files only)
    pub crc32: Option<u32>,
}

const FLAG_PATH: u8 = 0b0000_0001;
const FLAG_CRC: u8 = 0b0000_0010;

impl ObjectHeader {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.method);
        out.extend_from_slice(&self.expected_size.to_be_bytes());
        out.extend_from_slice(&self.expected_parcels.to_be_bytes());
        let mut flags = 0u8;
        if self.path.is_some() {
            flags |= FLAG_PATH;
        }
        if self.crc32.is_some() {
            flags |= FLAG_CRC;
        }
        out.push(flags);
        if let Some(path) = &self.path {
            out.extend_from_slice(&(path.len() as u16).to_be_bytes());
            out.extend_from_slice(path.as_bytes());
        }
        if let Some(crc) = self.crc32 {
            out.extend_from_slice(&crc.to_be_bytes());
        }
    }

    /// Parse the header block off the front of a first parcel's payload,
    /// returning the header and the number of bytes it occupied.
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), WireError> {
        let mut pos = 0usize;
        let method = *buf.first().ok_or_else(truncated)?;
        pos += 1;
        let expected_size = u64::from_be_bytes(slice8(buf, pos)?);
        pos += 8;
        let expected_parcels = u32::from_be_bytes(slice4(buf, pos)?);
        pos += 4;
        let flags = *buf.get(pos).ok_or_else(truncated)?;
        pos += 1;

        let path = if flags & FLAG_PATH != 0 {
            let len = u16::from_be_bytes(slice2(buf, pos)?) as usize;
            pos += 2;
            let raw = buf.get(pos..pos + len).ok_or_else(truncated)?;
            pos += len;
            let text = std::str::from_utf8(raw)
                .map_err(|_| WireError::Protocol("header path is not valid UTF-8".into()))?;
            Some(text.to_owned())
        } else {
            None
        };
        let crc32 = if flags & FLAG_CRC != 0 {
            let crc = u32::from_be_bytes(slice4(buf, pos)?);
            pos += 4;
            Some(crc)
        } else {
            None
        };

        Ok((
            Self {
                method,
                expected_size,
                expected_parcels,
                path,
                crc32,
            },
            pos,
        ))
    }
}

fn truncated() -> WireError {
    WireError::Protocol("truncated object header".into())
}

fn slice2(buf: &[u8], pos: usize) -> Result<[u8; 2], WireError> {
    Ok(buf
        .get(pos..pos + 2)
        .ok_or_else(truncated)?
        .try_into()
        .unwrap())
}

fn slice4(buf: &[u8], pos: usize) -> Result<[u8; 4], WireError> {
    Ok(buf
        .get(pos..pos + 4)
        .ok_or_else(truncated)?
        .try_into()
        .unwrap())
}

fn slice8(buf: &[u8], pos: usize) -> Result<[u8; 8], WireError> {
    Ok(buf
        .get(pos..pos + 8)
        .ok_or_else(truncated)?
        .try_into()
        .unwrap())
}

/// One framed wire unit
#[derive(Debug, Clone)]
pub struct Parcel {
    pub channel: Channel,
    pub priority: Priority,
    pub object_id: u64,
    pub sequence: u32,
    /// Present iff `sequence == 0` and the channel is not SIGNAL
    pub header: Option<ObjectHeader>,
    /// Data bytes, excluding the header block
    pub payload: Vec<u8>,
}

/// Errors raised by the wire layer
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl Parcel {
    /// Wire bytes of the payload section (header block plus data)
    pub fn wire_payload_len(&self) -> usize {
        let header_len = self.header.as_ref().map_or(0, |h| {
            let mut probe = Vec::with_capacity(64);
            h.encode_into(&mut probe);
            probe.len()
        });
        header_len + self.payload.len()
    }

    /// Total bytes this parcel occupies on the wire
    pub fn wire_len(&self) -> usize {
        FRAME_OVERHEAD + self.wire_payload_len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(64 + self.payload.len());
        if let Some(header) = &self.header {
            header.encode_into(&mut body);
        }
        body.extend_from_slice(&self.payload);

        let mut out = Vec::with_capacity(FRAME_OVERHEAD + body.len());
        out.extend_from_slice(&MARKER);
        out.push(self.channel as u8);
        out.push(self.priority as u8);
        out.extend_from_slice(&self.object_id.to_be_bytes());
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
        out
    }
}

/// Write one parcel to the stream
pub async fn write_parcel<W>(writer: &mut W, parcel: &Parcel) -> Result<(), std::io::Error>
where
    W: AsyncWrite + Unpin,
{
    let bytes = parcel.encode();
    writer.write_all(&bytes).await?;
    writer.flush().await
}

/// Read one parcel, scanning forward to the next marker if the stream has
/// desynchronized. `max_payload` is the configured parcel size; the header
/// slack covers the header block riding in front of the first chunk.
pub async fn read_parcel<R>(reader: &mut R, max_payload: usize) -> Result<Parcel, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut window = [0u8; 8];
    reader.read_exact(&mut window).await?;
    let mut skipped = 0u64;
    while window != MARKER {
        let mut next = [0u8; 1];
        reader.read_exact(&mut next).await?;
        window.rotate_left(1);
        window[7] = next[0];
        skipped += 1;
    }
    if skipped > 0 {
        warn!("parcel stream desynchronized, skipped {} bytes to next marker", skipped);
    }

    let mut fixed = [0u8; 18];
    reader.read_exact(&mut fixed).await?;
    let channel = Channel::from_wire(fixed[0])
        .ok_or_else(|| WireError::Protocol(format!("unknown channel code {}", fixed[0])))?;
    let priority = Priority::from_wire(fixed[1])
        .ok_or_else(|| WireError::Protocol(format!("unknown priority code {}", fixed[1])))?;
    let object_id = u64::from_be_bytes(fixed[2..10].try_into().unwrap());
    let sequence = u32::from_be_bytes(fixed[10..14].try_into().unwrap());
    let length = u32::from_be_bytes(fixed[14..18].try_into().unwrap()) as usize;

    if length > max_payload + HEADER_SLACK {
        return Err(WireError::Protocol(format!(
            "parcel payload of {} bytes exceeds the {} byte limit",
            length,
            max_payload + HEADER_SLACK
        )));
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;

    let (header, payload) = if sequence == 0 && channel != Channel::Signal {
        let (header, used) = ObjectHeader::decode_from(&body)?;
        (Some(header), body.split_off(used))
    } else {
        (None, body)
    };

    Ok(Parcel {
        channel,
        priority,
        object_id,
        sequence,
        header,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_header() -> ObjectHeader {
        ObjectHeader {
            method: 0,
            expected_size: 4096,
            expected_parcels: 3,
            path: Some("incoming/report.bin".into()),
            crc32: Some(0xDEAD_BEEF),
        }
    }

    #[tokio::test]
    async fn first_parcel_round_trips_with_header() {
        let parcel = Parcel {
            channel: Channel::File,
            priority: Priority::Normal,
            object_id: 42,
            sequence: 0,
            header: Some(sample_header()),
            payload: vec![1, 2, 3, 4, 5],
        };

        let bytes = parcel.encode();
        let mut cursor = Cursor::new(bytes);
        let back = read_parcel(&mut cursor, 64 * 1024).await.unwrap();

        assert_eq!(back.channel, Channel::File);
        assert_eq!(back.priority, Priority::Normal);
        assert_eq!(back.object_id, 42);
        assert_eq!(back.sequence, 0);
        assert_eq!(back.header, Some(sample_header()));
        assert_eq!(back.payload, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn continuation_parcel_has_no_header() {
        let parcel = Parcel {
            channel: Channel::Object,
            priority: Priority::Top,
            object_id: 7,
            sequence: 3,
            header: None,
            payload: vec![9; 100],
        };

        let mut cursor = Cursor::new(parcel.encode());
        let back = read_parcel(&mut cursor, 64 * 1024).await.unwrap();
        assert!(back.header.is_none());
        assert_eq!(back.sequence, 3);
        assert_eq!(back.payload.len(), 100);
    }

    #[tokio::test]
    async fn reader_resyncs_past_garbage() {
        let parcel = Parcel {
            channel: Channel::Object,
            priority: Priority::Normal,
            object_id: 1,
            sequence: 1,
            header: None,
            payload: vec![0xAA; 16],
        };

        let mut stream = vec![0x00, 0x11, 0x22, 0x33, 0x44];
        stream.extend_from_slice(&parcel.encode());
        let mut cursor = Cursor::new(stream);
        let back = read_parcel(&mut cursor, 64 * 1024).await.unwrap();
        assert_eq!(back.object_id, 1);
        assert_eq!(back.payload, vec![0xAA; 16]);
    }

    #[tokio::test]
    async fn oversized_length_is_fatal() {
        let parcel = Parcel {
            channel: Channel::Object,
            priority: Priority::Normal,
            object_id: 1,
            sequence: 1,
            header: None,
            payload: vec![0; 8192],
        };

        let mut cursor = Cursor::new(parcel.encode());
        let err = read_parcel(&mut cursor, 1024).await.unwrap_err();
        assert!(matches!(err, WireError::Protocol(_)));
    }

    #[tokio::test]
    async fn unknown_channel_code_is_rejected() {
        let parcel = Parcel {
            channel: Channel::Object,
            priority: Priority::Normal,
            object_id: 1,
            sequence: 1,
            header: None,
            payload: vec![],
        };
        let mut bytes = parcel.encode();
        bytes[8] = 0x7F; // channel byte sits right after the marker
        let mut cursor = Cursor::new(bytes);
        assert!(matches!(
            read_parcel(&mut cursor, 1024).await,
            Err(WireError::Protocol(_))
        ));
    }

    #[test]
    fn ranks_order_channels_and_priorities() {
        assert!(Channel::Signal.rank() < Channel::Object.rank());
        assert!(Channel::Object.rank() < Channel::File.rank());
        assert!(Priority::Top.rank() < Priority::High.rank());
        assert!(Priority::High.rank() < Priority::Normal.rank());
        assert!(Priority::Normal.rank() < Priority::Low.rank());
        assert!(Priority::Low.rank() < Priority::Bottom.rank());
    }
}
