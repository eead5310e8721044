//! Meta page (page 0): magic/version stamp, root pointer and level-index
//! hints.
//!
//! Fixed-width fields followed by the `level[]` array, read and written as
//! explicit big-endian fields the same way `page.rs` does for node headers.

use crate::config::{PageId, TransactionId, CHECKSUM_SIZE, LEVEL_HINTS, PAGE_SIZE};
use crate::error::{Error, Result};

/// FNV64("ingens").
pub const MAGIC: u64 = 0xF143_4F74_0C53_863D;

/// Lowest meta-page version this build understands.
pub const MIN_SUPPORTED_VERSION: u64 = 1;
/// Version this build writes.
pub const CURRENT_VERSION: u64 = 1;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 8;
const OFF_STATUS: usize = 16;
const OFF_TID: usize = 24;
const OFF_ROOT: usize = 32;
const OFF_PAGE_NUM: usize = 40;
const OFF_LEVELS: usize = 48;

/// `status` value while the database is open; a clean close leaves `0`.
/// Nothing currently reads this back at open time — it exists so the field
/// has a defined meaning if crash recovery grows beyond the magic/version
/// check.
pub const STATUS_OPEN: u64 = 1;
pub const STATUS_CLOSED: u64 = 0;

#[derive(Clone, Debug)]
pub struct MetaPage {
    pub status: u64,
    pub tid: TransactionId,
    pub root: PageId,
    pub page_num: PageId,
    pub levels: [PageId; LEVEL_HINTS],
}

impl MetaPage {
    /// Meta for a brand-new database: root and first leaf both live at
    /// page 1, the next page to allocate is 2.
    pub fn fresh() -> Self {
        let mut levels = [0u64; LEVEL_HINTS];
        levels[0] = 1;
        MetaPage { status: STATUS_OPEN, tid: 0, root: 1, page_num: 2, levels }
    }

    pub fn write_to(&self, buf: &mut [u8; PAGE_SIZE]) {
        buf[OFF_MAGIC..OFF_MAGIC + 8].copy_from_slice(&MAGIC.to_be_bytes());
        buf[OFF_VERSION..OFF_VERSION + 8].copy_from_slice(&CURRENT_VERSION.to_be_bytes());
        buf[OFF_STATUS..OFF_STATUS + 8].copy_from_slice(&self.status.to_be_bytes());
        buf[OFF_TID..OFF_TID + 8].copy_from_slice(&self.tid.to_be_bytes());
        buf[OFF_ROOT..OFF_ROOT + 8].copy_from_slice(&self.root.to_be_bytes());
        buf[OFF_PAGE_NUM..OFF_PAGE_NUM + 8].copy_from_slice(&self.page_num.to_be_bytes());
        for (i, lvl) in self.levels.iter().enumerate() {
            let at = OFF_LEVELS + i * 8;
            buf[at..at + 8].copy_from_slice(&lvl.to_be_bytes());
        }
        let sum = crc32c::crc32c(&buf[..PAGE_SIZE - CHECKSUM_SIZE]);
        let start = PAGE_SIZE - CHECKSUM_SIZE;
        buf[start..].copy_from_slice(&(sum as u64).to_be_bytes());
    }

    pub fn read_from(buf: &[u8; PAGE_SIZE]) -> Result<Self> {
        let start = PAGE_SIZE - CHECKSUM_SIZE;
        let stored = u64::from_be_bytes(buf[start..].try_into().unwrap());
        let computed = crc32c::crc32c(&buf[..start]) as u64;
        if stored != computed {
            return Err(Error::Checksum { page_id: 0 });
        }

        let magic = u64::from_be_bytes(buf[OFF_MAGIC..OFF_MAGIC + 8].try_into().unwrap());
        if magic != MAGIC {
            return Err(Error::Magic);
        }
        let version = u64::from_be_bytes(buf[OFF_VERSION..OFF_VERSION + 8].try_into().unwrap());
        if version < MIN_SUPPORTED_VERSION {
            return Err(Error::Version { found: version, min: MIN_SUPPORTED_VERSION });
        }

        let status = u64::from_be_bytes(buf[OFF_STATUS..OFF_STATUS + 8].try_into().unwrap());
        let tid = TransactionId::from_be_bytes(buf[OFF_TID..OFF_TID + 8].try_into().unwrap());
        let root = PageId::from_be_bytes(buf[OFF_ROOT..OFF_ROOT + 8].try_into().unwrap());
        let page_num =
            PageId::from_be_bytes(buf[OFF_PAGE_NUM..OFF_PAGE_NUM + 8].try_into().unwrap());
        let mut levels = [0u64; LEVEL_HINTS];
        for (i, lvl) in levels.iter_mut().enumerate() {
            let at = OFF_LEVELS + i * 8;
            *lvl = PageId::from_be_bytes(buf[at..at + 8].try_into().unwrap());
        }

        Ok(MetaPage { status, tid, root, page_num, levels })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_meta_round_trips() {
        let meta = MetaPage::fresh();
        let mut buf = [0u8; PAGE_SIZE];
        meta.write_to(&mut buf);
        let back = MetaPage::read_from(&buf).unwrap();
        assert_eq!(back.root, 1);
        assert_eq!(back.page_num, 2);
        assert_eq!(back.levels[0], 1);
    }

    #[test]
    fn corrupted_byte_is_rejected() {
        let meta = MetaPage::fresh();
        let mut buf = [0u8; PAGE_SIZE];
        meta.write_to(&mut buf);
        buf[0] ^= 0xFF;
        assert!(matches!(MetaPage::read_from(&buf), Err(Error::Checksum { .. })));
    }

    #[test]
    fn bad_magic_with_good_checksum_is_rejected() {
        let mut buf = [0u8; PAGE_SIZE];
        buf[OFF_VERSION..OFF_VERSION + 8].copy_from_slice(&CURRENT_VERSION.to_be_bytes());
        let sum = crc32c::crc32c(&buf[..PAGE_SIZE - CHECKSUM_SIZE]);
        let start = PAGE_SIZE - CHECKSUM_SIZE;
        buf[start..].copy_from_slice(&(sum as u64).to_be_bytes());
        assert!(matches!(MetaPage::read_from(&buf), Err(Error::Magic)));
    }
}
