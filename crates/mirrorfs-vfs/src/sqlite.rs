//! On-disk conventions of the SQLite file format.
//!
//! Only the handful of structures the intercept needs: the journal
//! header that opens and closes rollback transactions, and the WAL
//! header and frame layout that carry pages in WAL mode. Page content
//! is never interpreted.

use mirrorfs_core::MAX_PAGE_SIZE;

/// First bytes of a well-formed main database file
pub const DB_HEADER_MAGIC: &[u8; 16] = b"SQLite format 3\0";

/// Magic prefix of a live rollback journal header
pub const JOURNAL_MAGIC: [u8; 8] = [0xd9, 0xd5, 0x05, 0xf9, 0x20, 0xa1, 0x63, 0xd7];

/// Size of the journal header fields. The engine pads the header out to
/// a full sector but only these bytes matter for state tracking.
pub const JOURNAL_HEADER_LEN: usize = 28;

pub const WAL_HEADER_LEN: usize = 32;
pub const WAL_FRAME_HEADER_LEN: usize = 24;

/// Big-endian WAL magic, low bit selects the checksum byte order
const WAL_MAGIC_LE: u32 = 0x377f_0682;
const WAL_MAGIC_BE: u32 = 0x377f_0683;

/// True when `data` begins with a live journal header. The engine
/// writes one as the first bytes of every rollback transaction,
/// including on a journal file retained from an earlier transaction.
pub fn is_journal_header(data: &[u8]) -> bool {
    data.len() >= JOURNAL_MAGIC.len() && data[..JOURNAL_MAGIC.len()] == JOURNAL_MAGIC
}

/// True when `data` is the header-invalidation write that commits a
/// persistent-journal transaction: zeros over the header bytes.
pub fn is_journal_header_zeroed(data: &[u8]) -> bool {
    if data.len() < JOURNAL_MAGIC.len() {
        return false;
    }
    data[..data.len().min(JOURNAL_HEADER_LEN)].iter().all(|&b| b == 0)
}

/// Page size declared by a main database header: big-endian u16 at
/// offset 16, where the value 1 stands for 65536. Returns `None` for a
/// short buffer, a bad magic, or an out-of-range page size.
pub fn page_size_from_db_header(header: &[u8]) -> Option<u32> {
    if header.len() < 18 || &header[..DB_HEADER_MAGIC.len()] != DB_HEADER_MAGIC {
        return None;
    }
    let raw = u16::from_be_bytes([header[16], header[17]]);
    let page_size = if raw == 1 { 65536 } else { u32::from(raw) };
    valid_page_size(page_size).then_some(page_size)
}

/// Page size declared by a WAL header, validated. Returns `None` for a
/// short buffer, a bad magic, or an out-of-range page size.
pub fn page_size_from_wal_header(header: &[u8]) -> Option<u32> {
    if header.len() < WAL_HEADER_LEN {
        return None;
    }
    let magic = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    if magic != WAL_MAGIC_LE && magic != WAL_MAGIC_BE {
        return None;
    }
    let page_size = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);
    valid_page_size(page_size).then_some(page_size)
}

pub fn valid_page_size(page_size: u32) -> bool {
    (512..=MAX_PAGE_SIZE).contains(&page_size) && page_size.is_power_of_two()
}

/// The fixed header preceding each page in the WAL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalFrameHeader {
    /// Page number within the main database, 1-based
    pub page_number: u32,
    /// Database size in pages after this frame; nonzero only on the
    /// final frame of a committed transaction
    pub db_size: u32,
}

impl WalFrameHeader {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < WAL_FRAME_HEADER_LEN {
            return None;
        }
        Some(Self {
            page_number: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            db_size: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        })
    }

    pub fn is_commit(&self) -> bool {
        self.db_size != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_journal_header_detection() {
        let mut header = vec![0u8; 512];
        header[..8].copy_from_slice(&JOURNAL_MAGIC);
        assert!(is_journal_header(&header));
        assert!(!is_journal_header_zeroed(&header));

        let zeroed = vec![0u8; 28];
        assert!(!is_journal_header(&zeroed));
        assert!(is_journal_header_zeroed(&zeroed));

        // zeros past the header do not matter
        let mut sector = vec![1u8; 512];
        sector[..28].iter_mut().for_each(|b| *b = 0);
        assert!(is_journal_header_zeroed(&sector[..28]));
        assert!(!is_journal_header_zeroed(&[0u8; 4]));
    }

    #[test]
    fn test_db_header_page_size() {
        let mut header = vec![0u8; 100];
        header[..16].copy_from_slice(DB_HEADER_MAGIC);
        header[16..18].copy_from_slice(&4096u16.to_be_bytes());
        assert_eq!(page_size_from_db_header(&header), Some(4096));

        // the value 1 stands for the maximum page size
        header[16..18].copy_from_slice(&1u16.to_be_bytes());
        assert_eq!(page_size_from_db_header(&header), Some(65536));

        header[16..18].copy_from_slice(&100u16.to_be_bytes());
        assert_eq!(page_size_from_db_header(&header), None);

        header[0] = b'X';
        assert_eq!(page_size_from_db_header(&header), None);
        assert_eq!(page_size_from_db_header(&header[..17]), None);
    }

    #[test]
    fn test_wal_header_page_size() {
        let mut header = vec![0u8; WAL_HEADER_LEN];
        header[..4].copy_from_slice(&0x377f_0682u32.to_be_bytes());
        header[8..12].copy_from_slice(&4096u32.to_be_bytes());
        assert_eq!(page_size_from_wal_header(&header), Some(4096));

        header[..4].copy_from_slice(&0x377f_0683u32.to_be_bytes());
        assert_eq!(page_size_from_wal_header(&header), Some(4096));

        header[8..12].copy_from_slice(&4095u32.to_be_bytes());
        assert_eq!(page_size_from_wal_header(&header), None);

        header[..4].copy_from_slice(&0xdeadbeefu32.to_be_bytes());
        assert_eq!(page_size_from_wal_header(&header), None);
        assert_eq!(page_size_from_wal_header(&header[..10]), None);
    }

    #[test]
    fn test_wal_frame_header() {
        let mut data = vec![0u8; WAL_FRAME_HEADER_LEN];
        data[..4].copy_from_slice(&7u32.to_be_bytes());
        let frame = WalFrameHeader::parse(&data).unwrap();
        assert_eq!(frame.page_number, 7);
        assert!(!frame.is_commit());

        data[4..8].copy_from_slice(&12u32.to_be_bytes());
        let frame = WalFrameHeader::parse(&data).unwrap();
        assert_eq!(frame.db_size, 12);
        assert!(frame.is_commit());

        assert_eq!(WalFrameHeader::parse(&data[..10]), None);
    }

    #[test]
    fn test_valid_page_sizes() {
        assert!(valid_page_size(512));
        assert!(valid_page_size(4096));
        assert!(valid_page_size(65536));
        assert!(!valid_page_size(256));
        assert!(!valid_page_size(131072));
        assert!(!valid_page_size(4097));
    }
}
