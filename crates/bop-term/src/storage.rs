use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use tracing::{debug, warn};

use crate::error::{TermError, TermResult};
use crate::fs::create_fixed_size_file;

/// A writable memory mapping backing one term buffer.
///
/// File-backed regions live at a path derived from the publication identity so
/// other processes (a media driver, a subscriber) can map the same bytes.
/// Anonymous regions are private to this process.
pub struct MappedRegion {
    map: MmapMut,
    ptr: *mut u8,
    len: usize,
    path: Option<PathBuf>,
    unlink_on_drop: bool,
}

// The mapping is only accessed through raw pointers with explicit atomics or
// through ranges reserved by a single writer.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    pub fn anonymous(len: usize) -> TermResult<Self> {
        if len == 0 {
            return Err(TermError::invalid_config("mapped region length is zero"));
        }
        let mut map = MmapMut::map_anon(len)?;
        let ptr = map.as_mut_ptr();
        Ok(Self {
            map,
            ptr,
            len,
            path: None,
            unlink_on_drop: false,
        })
    }

    pub fn create_file(path: &Path, len: usize, unlink_on_drop: bool) -> TermResult<Self> {
        if len == 0 {
            return Err(TermError::invalid_config("mapped region length is zero"));
        }
        let file = create_fixed_size_file(path, len as u64)?;
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        if map.len() != len {
            return Err(TermError::invalid_state(format!(
                "mapped {} bytes of {}, expected {len}",
                map.len(),
                path.display()
            )));
        }
        let ptr = map.as_mut_ptr();
        debug!(path = %path.display(), len, "mapped term file");
        Ok(Self {
            map,
            ptr,
            len,
            path: Some(path.to_path_buf()),
            unlink_on_drop,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Flushes file-backed regions to storage. No-op for anonymous regions.
    pub fn flush(&self) -> TermResult<()> {
        if self.path.is_some() {
            self.map.flush()?;
        }
        Ok(())
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        if !self.unlink_on_drop {
            return;
        }
        if let Some(path) = self.path.take() {
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "unlinked term file"),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to unlink term file")
                }
            }
        }
    }
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("len", &self.len)
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn anonymous_region_is_zeroed() {
        let region = MappedRegion::anonymous(4096).expect("map");
        assert_eq!(region.len(), 4096);
        let bytes = unsafe { std::slice::from_raw_parts(region.as_ptr(), region.len()) };
        assert!(bytes.iter().all(|b| *b == 0));
        assert!(region.path().is_none());
    }

    #[test]
    fn zero_length_is_rejected() {
        assert!(matches!(
            MappedRegion::anonymous(0),
            Err(TermError::InvalidConfig(_))
        ));
    }

    #[test]
    fn file_region_writes_reach_the_file() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("term-0.logbuffer");
        let region = MappedRegion::create_file(&path, 4096, false).expect("map");
        unsafe { region.as_ptr().add(10).write(0xAB) };
        region.flush().expect("flush");
        drop(region);
        let bytes = std::fs::read(&path).expect("read");
        assert_eq!(bytes.len(), 4096);
        assert_eq!(bytes[10], 0xAB);
    }

    #[test]
    fn file_region_unlinks_on_drop_when_requested() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("term-1.logbuffer");
        let region = MappedRegion::create_file(&path, 4096, true).expect("map");
        assert!(path.exists());
        drop(region);
        assert!(!path.exists());
    }
}
