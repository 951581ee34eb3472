//! Transaction frame encoding
//!
//! A frame is the unit of the replication log: the set of pages one
//! committed write transaction changed, checksummed and strictly ordered
//! by position. The same encoding is used on disk and on the wire:
//!
//! ```text
//! u32 LE   magic ("FRM1")
//! u32 LE   body length
//! body:
//!   u64 LE   position
//!   i64 LE   commit timestamp, unix milliseconds
//!   u32 LE   page count
//!   repeated per page:
//!     u64 LE   file offset
//!     u32 LE   data length
//!     ...      data bytes
//! u32 LE   CRC32 of body
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, TimeZone, Utc};

use crate::error::{Error, Result};
use crate::types::common::PageRange;

/// Magic bytes "FRM1" at the start of every encoded frame
pub const FRAME_MAGIC: u32 = 0x314d_5246;

/// Bytes before the body: magic plus body length
pub const FRAME_HEADER_LEN: usize = 8;

/// Bytes after the body: the CRC32 trailer
pub const FRAME_TRAILER_LEN: usize = 4;

/// Per-page prefix: offset plus data length
const PAGE_HEADER_LEN: usize = 12;

/// Fixed body fields: position, timestamp, page count
const BODY_FIXED_LEN: usize = 20;

/// One changed page inside a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramePage {
    /// Byte offset within the database file
    pub offset: u64,
    pub data: Bytes,
}

impl FramePage {
    pub fn new(offset: u64, data: impl Into<Bytes>) -> Self {
        Self {
            offset,
            data: data.into(),
        }
    }

    pub fn range(&self) -> PageRange {
        PageRange::new(self.offset, self.data.len() as u64)
    }
}

/// A committed write transaction as it travels through the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionFrame {
    /// Gap-free sequence number, starting at 1
    pub position: u64,
    /// Commit time on the primary, millisecond precision
    pub timestamp: DateTime<Utc>,
    pub pages: Vec<FramePage>,
    /// CRC32 over the encoded body
    pub checksum: u32,
}

impl TransactionFrame {
    pub fn new(position: u64, pages: Vec<FramePage>) -> Self {
        let timestamp = now_millis();
        let checksum = crc32fast::hash(&encode_body(position, &timestamp, &pages));
        Self {
            position,
            timestamp,
            pages,
            checksum,
        }
    }

    /// Byte ranges this frame touches, in page order
    pub fn ranges(&self) -> Vec<PageRange> {
        self.pages.iter().map(FramePage::range).collect()
    }

    /// Total page payload in bytes
    pub fn payload_len(&self) -> usize {
        self.pages.iter().map(|p| p.data.len()).sum()
    }

    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_LEN + self.body_len() + FRAME_TRAILER_LEN
    }

    fn body_len(&self) -> usize {
        BODY_FIXED_LEN + self.pages.len() * PAGE_HEADER_LEN + self.payload_len()
    }

    /// Serialize the frame. The stored checksum is written verbatim, so
    /// a tampered frame round-trips to a `ChecksumMismatch` on decode.
    pub fn encode(&self) -> Bytes {
        let body = encode_body(self.position, &self.timestamp, &self.pages);
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u32_le(FRAME_MAGIC);
        buf.put_u32_le(body.len() as u32);
        buf.put_slice(&body);
        buf.put_u32_le(self.checksum);
        buf.freeze()
    }

    /// Deserialize one frame from the front of `buf`, verifying the
    /// checksum. Returns the frame and the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < FRAME_HEADER_LEN + FRAME_TRAILER_LEN {
            return Err(Error::InvalidFrame("truncated header".to_string()));
        }
        let mut cursor = buf;
        let magic = cursor.get_u32_le();
        if magic != FRAME_MAGIC {
            return Err(Error::InvalidFrame(format!("bad magic {magic:#010x}")));
        }
        let body_len = cursor.get_u32_le() as usize;
        let total = FRAME_HEADER_LEN + body_len + FRAME_TRAILER_LEN;
        if buf.len() < total {
            return Err(Error::InvalidFrame(format!(
                "truncated body: need {total} bytes, have {}",
                buf.len()
            )));
        }
        let body = &buf[FRAME_HEADER_LEN..FRAME_HEADER_LEN + body_len];
        let stored = u32::from_le_bytes([
            buf[total - 4],
            buf[total - 3],
            buf[total - 2],
            buf[total - 1],
        ]);
        let computed = crc32fast::hash(body);
        if stored != computed {
            return Err(Error::ChecksumMismatch {
                expected: format!("{stored:08x}"),
                got: format!("{computed:08x}"),
            });
        }

        let mut b = body;
        if b.remaining() < BODY_FIXED_LEN {
            return Err(Error::InvalidFrame("truncated body fields".to_string()));
        }
        let position = b.get_u64_le();
        let ts_millis = b.get_i64_le();
        let timestamp = Utc
            .timestamp_millis_opt(ts_millis)
            .single()
            .ok_or_else(|| Error::InvalidFrame(format!("bad timestamp {ts_millis}")))?;
        let page_count = b.get_u32_le() as usize;
        let mut pages = Vec::with_capacity(page_count.min(1024));
        for _ in 0..page_count {
            if b.remaining() < PAGE_HEADER_LEN {
                return Err(Error::InvalidFrame("truncated page header".to_string()));
            }
            let offset = b.get_u64_le();
            let len = b.get_u32_le() as usize;
            if b.remaining() < len {
                return Err(Error::InvalidFrame("truncated page data".to_string()));
            }
            pages.push(FramePage::new(offset, Bytes::copy_from_slice(&b[..len])));
            b.advance(len);
        }
        if b.has_remaining() {
            return Err(Error::InvalidFrame(format!(
                "{} trailing bytes in body",
                b.remaining()
            )));
        }

        Ok((
            Self {
                position,
                timestamp,
                pages,
                checksum: stored,
            },
            total,
        ))
    }

    /// Recompute the body checksum and compare with the stored one
    pub fn verify(&self) -> Result<()> {
        let computed = crc32fast::hash(&encode_body(self.position, &self.timestamp, &self.pages));
        if computed != self.checksum {
            return Err(Error::ChecksumMismatch {
                expected: format!("{:08x}", self.checksum),
                got: format!("{computed:08x}"),
            });
        }
        Ok(())
    }
}

fn encode_body(position: u64, timestamp: &DateTime<Utc>, pages: &[FramePage]) -> BytesMut {
    let payload: usize = pages.iter().map(|p| p.data.len()).sum();
    let mut buf = BytesMut::with_capacity(BODY_FIXED_LEN + pages.len() * PAGE_HEADER_LEN + payload);
    buf.put_u64_le(position);
    buf.put_i64_le(timestamp.timestamp_millis());
    buf.put_u32_le(pages.len() as u32);
    for page in pages {
        buf.put_u64_le(page.offset);
        buf.put_u32_le(page.data.len() as u32);
        buf.put_slice(&page.data);
    }
    buf
}

/// Current time truncated to the precision the encoding carries
fn now_millis() -> DateTime<Utc> {
    let ms = Utc::now().timestamp_millis();
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}
