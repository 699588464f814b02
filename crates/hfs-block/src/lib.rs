#![forbid(unsafe_code)]
//! Byte-addressed backing stores.
//!
//! Provides the `ByteDevice` trait (positioned reads, no shared seek
//! position), in-memory and file-backed implementations, and `PageCache`,
//! an optional read-through cache callers may wrap around any device. The
//! B-tree engine itself never caches.

use hfs_error::{HfsError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

/// Byte-addressed device for fixed-offset reads (pread semantics).
///
/// Every read names its own offset, so one device can be shared between
/// readers without external locking.
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    ///
    /// Fails with `HfsError::OutOfRange` if any byte lies past `len_bytes()`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Read `len` bytes at `offset` into a fresh buffer.
    fn read_vec_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0_u8; len];
        self.read_exact_at(offset, &mut buf)?;
        Ok(buf)
    }
}

impl<D: ByteDevice + ?Sized> ByteDevice for Arc<D> {
    fn len_bytes(&self) -> u64 {
        (**self).len_bytes()
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact_at(offset, buf)
    }
}

impl<D: ByteDevice + ?Sized> ByteDevice for &D {
    fn len_bytes(&self) -> u64 {
        (**self).len_bytes()
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact_at(offset, buf)
    }
}

/// Validate that `[offset, offset + len)` lies within a store of `size` bytes.
pub fn check_range(offset: u64, len: usize, size: u64) -> Result<()> {
    let len = u64::try_from(len)
        .map_err(|_| HfsError::InvalidArgument("read length overflows u64".to_owned()))?;
    let in_range = offset.checked_add(len).is_some_and(|end| end <= size);
    if !in_range {
        return Err(HfsError::OutOfRange { offset, len, size });
    }
    Ok(())
}

/// Immutable in-memory image.
#[derive(Debug, Clone)]
pub struct MemByteDevice {
    bytes: Arc<[u8]>,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len_bytes())?;
        // In range, so the offset fits the slice length and therefore usize.
        let start = usize::try_from(offset).map_err(|_| HfsError::OutOfRange {
            offset,
            len: buf.len() as u64,
            size: self.len_bytes(),
        })?;
        buf.copy_from_slice(&self.bytes[start..start + buf.len()]);
        Ok(())
    }
}

/// Read-only file-backed device using `pread`.
///
/// `FileExt::read_exact_at` carries its own offset, so the shared `File`
/// handle has no seek position to race on.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }
}

/// Sizing for [`PageCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cache granule in bytes. Usually the B-tree node size.
    pub page_size: u32,
    /// Maximum number of resident pages.
    pub capacity_pages: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            capacity_pages: 256,
        }
    }
}

/// Hit/miss counters for a [`PageCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Default)]
struct LruState {
    /// Least recently used at the front.
    order: VecDeque<u64>,
    resident: HashMap<u64, Arc<[u8]>>,
    stats: CacheStats,
}

impl LruState {
    fn touch(&mut self, page: u64) {
        if let Some(pos) = self.order.iter().position(|p| *p == page) {
            let _ = self.order.remove(pos);
        }
        self.order.push_back(page);
    }

    fn insert(&mut self, page: u64, bytes: Arc<[u8]>, capacity: usize) {
        while self.resident.len() >= capacity {
            let Some(victim) = self.order.pop_front() else {
                break;
            };
            let _ = self.resident.remove(&victim);
        }
        self.resident.insert(page, bytes);
        self.touch(page);
    }
}

/// Read-through LRU page cache around a [`ByteDevice`].
///
/// Reads are served from whole cached pages; a page at the tail of the
/// device may be shorter than `page_size`.
#[derive(Debug)]
pub struct PageCache<D: ByteDevice> {
    inner: D,
    config: CacheConfig,
    state: Mutex<LruState>,
}

impl<D: ByteDevice> PageCache<D> {
    pub fn new(inner: D, config: CacheConfig) -> Result<Self> {
        if config.capacity_pages == 0 {
            return Err(HfsError::InvalidArgument(
                "PageCache capacity_pages must be > 0".to_owned(),
            ));
        }
        if config.page_size == 0 || !config.page_size.is_power_of_two() {
            return Err(HfsError::InvalidArgument(format!(
                "PageCache page_size={} must be a non-zero power of two",
                config.page_size
            )));
        }
        Ok(Self {
            inner,
            config,
            state: Mutex::new(LruState::default()),
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.state.lock().stats
    }

    fn page(&self, page: u64) -> Result<Arc<[u8]>> {
        {
            let mut guard = self.state.lock();
            if let Some(bytes) = guard.resident.get(&page).cloned() {
                guard.stats.hits += 1;
                guard.touch(page);
                return Ok(bytes);
            }
        }

        let page_size = u64::from(self.config.page_size);
        let start = page
            .checked_mul(page_size)
            .ok_or_else(|| HfsError::InvalidArgument("page offset overflow".to_owned()))?;
        let len = page_size.min(self.inner.len_bytes().saturating_sub(start));
        let len = usize::try_from(len)
            .map_err(|_| HfsError::InvalidArgument("page length overflows usize".to_owned()))?;
        trace!(page, len, "page cache miss");
        let bytes: Arc<[u8]> = self.inner.read_vec_at(start, len)?.into();

        let mut guard = self.state.lock();
        guard.stats.misses += 1;
        guard.insert(page, Arc::clone(&bytes), self.config.capacity_pages);
        drop(guard);
        Ok(bytes)
    }
}

impl<D: ByteDevice> ByteDevice for PageCache<D> {
    fn len_bytes(&self) -> u64 {
        self.inner.len_bytes()
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len_bytes())?;
        let page_size = u64::from(self.config.page_size);
        let mut done = 0_usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let page = pos / page_size;
            // Bounded by page_size, which is a u32.
            let within = usize::try_from(pos % page_size).unwrap_or(0);
            let bytes = self.page(page)?;
            let available = bytes.len().saturating_sub(within);
            if available == 0 {
                return Err(HfsError::OutOfRange {
                    offset: pos,
                    len: (buf.len() - done) as u64,
                    size: self.len_bytes(),
                });
            }
            let n = available.min(buf.len() - done);
            buf[done..done + n].copy_from_slice(&bytes[within..within + n]);
            done += n;
        }
        Ok(())
    }
}
