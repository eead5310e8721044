//! Paged storage I/O.
//!
//! Exact-size reads/writes at `pageId * PAGE_SIZE` offsets, no caching and
//! no retries. Short transfers surface as `ShortRead`/`ShortWrite` rather
//! than being silently retried.

use std::fs::OpenOptions;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

use fs2::FileExt as _;

use crate::config::{PageId, PAGE_SIZE};
use crate::error::{Error, Result};

pub struct Disk {
    file: File,
}

impl Disk {
    /// Create or open the single backing file at `dir/filename`, taking an
    /// advisory exclusive lock so a second process can't open the same
    /// database concurrently.
    pub fn open(dir: &Path, filename: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(filename);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.try_lock_exclusive()?;
        Ok(Disk { file })
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn read_page(&self, pid: PageId, buf: &mut [u8; PAGE_SIZE]) -> Result<()> {
        let off = pid * PAGE_SIZE as u64;
        match self.file.read_exact_at(buf, off) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                let len = self.file.metadata()?.len();
                let got = len.saturating_sub(off).min(PAGE_SIZE as u64) as usize;
                Err(Error::ShortRead { page_id: pid, got, want: PAGE_SIZE })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn write_page(&self, pid: PageId, buf: &[u8; PAGE_SIZE]) -> Result<()> {
        let off = pid * PAGE_SIZE as u64;
        self.file.write_all_at(buf, off)?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let dir = std::env::temp_dir().join(format!("ingens-disk-test-{}", std::process::id()));
        let disk = Disk::open(&dir, "data.ingens").unwrap();
        let mut buf = [0u8; PAGE_SIZE];
        buf[0] = 0xAB;
        buf[PAGE_SIZE - 1] = 0xCD;
        disk.write_page(3, &buf).unwrap();
        let mut out = [0u8; PAGE_SIZE];
        disk.read_page(3, &mut out).unwrap();
        assert_eq!(buf, out);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
