#![forbid(unsafe_code)]
//! Extent resolution for one fork of one file.
//!
//! A fork lists up to eight extents inline. When those cover fewer blocks
//! than the fork's total, the rest live in the extents-overflow tree under
//! keys `(file_id, fork, first_logical_block)`, each record holding further
//! packed extent descriptors.

use hfs_block::{ByteDevice, check_range};
use hfs_btree::ExtentsTree;
use hfs_error::{HfsError, Result};
use hfs_ondisk::{ExtentDescriptor, ExtentKey, ForkData, parse_extent_record};
use hfs_types::{AllocationBlockSize, CatalogNodeId, ForkType};
use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// An extent together with the fork-relative block it begins at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedExtent {
    pub extent: ExtentDescriptor,
    pub logical_start: u64,
}

impl ResolvedExtent {
    /// One past the last logical block covered.
    #[must_use]
    pub fn logical_end(&self) -> u64 {
        self.logical_start + u64::from(self.extent.block_count)
    }

    #[must_use]
    pub fn covers(&self, logical_block: u64) -> bool {
        (self.logical_start..self.logical_end()).contains(&logical_block)
    }
}

/// Reads a fork's logical bytes from the volume.
pub struct ForkReader {
    volume: Arc<dyn ByteDevice>,
    overflow: Option<Arc<ExtentsTree>>,
    file_id: CatalogNodeId,
    fork_type: ForkType,
    fork: ForkData,
    block_size: AllocationBlockSize,
}

impl ForkReader {
    /// `overflow` may be `None` for forks known to fit inline (the
    /// extents-overflow file itself, for instance).
    pub fn new(
        volume: Arc<dyn ByteDevice>,
        overflow: Option<Arc<ExtentsTree>>,
        file_id: CatalogNodeId,
        fork_type: ForkType,
        fork: ForkData,
        block_size: AllocationBlockSize,
    ) -> Self {
        debug!(
            file_id = file_id.0,
            fork = fork_type.name(),
            logical_size = fork.logical_size,
            total_blocks = fork.total_blocks,
            inline_blocks = fork.inline_blocks(),
            has_overflow = overflow.is_some(),
            "fork reader"
        );
        Self {
            volume,
            overflow,
            file_id,
            fork_type,
            fork,
            block_size,
        }
    }

    #[must_use]
    pub fn file_id(&self) -> CatalogNodeId {
        self.file_id
    }

    #[must_use]
    pub fn fork_type(&self) -> ForkType {
        self.fork_type
    }

    #[must_use]
    pub fn fork(&self) -> &ForkData {
        &self.fork
    }

    #[must_use]
    pub fn logical_size(&self) -> u64 {
        self.fork.logical_size
    }

    #[must_use]
    pub fn block_size(&self) -> AllocationBlockSize {
        self.block_size
    }

    /// Locate the extent holding `logical_block`.
    ///
    /// Inline slots are scanned first; overflow records are fetched one at a
    /// time, each keyed by the number of blocks seen so far.
    pub fn find_extent_for(&self, logical_block: u64) -> Result<ResolvedExtent> {
        let total = u64::from(self.fork.total_blocks);
        if logical_block >= total {
            return Err(HfsError::BeyondEndOfFile {
                position: logical_block,
                size: total,
            });
        }
        let found = self.walk_extents(|resolved| {
            if resolved.covers(logical_block) {
                ControlFlow::Break(resolved)
            } else {
                ControlFlow::Continue(())
            }
        })?;
        let resolved = found.ok_or_else(|| self.missing(logical_block))?;
        trace!(
            file_id = self.file_id.0,
            logical_block,
            start_block = resolved.extent.start_block,
            logical_start = resolved.logical_start,
            "resolved extent"
        );
        Ok(resolved)
    }

    /// Every extent of the fork in logical order, up to `total_blocks`.
    pub fn extents(&self) -> Result<Vec<ResolvedExtent>> {
        let mut out = Vec::new();
        self.walk_extents(|resolved| {
            out.push(resolved);
            ControlFlow::<()>::Continue(())
        })?;
        Ok(out)
    }

    /// Byte ranges `(offset, len)` within `[start, start + count)` that are
    /// backed by extents, clamped to the logical size. Adjacent ranges are
    /// merged.
    pub fn extents_in_range(&self, start: u64, count: u64) -> Result<Vec<(u64, u64)>> {
        let end = start.saturating_add(count).min(self.fork.logical_size);
        let mut ranges: Vec<(u64, u64)> = Vec::new();
        if start >= end {
            return Ok(ranges);
        }
        let bs = self.block_size.as_u64();
        self.walk_extents(|resolved| {
            let ext_start = resolved.logical_start.saturating_mul(bs);
            let ext_end = resolved.logical_end().saturating_mul(bs);
            if ext_start >= end {
                return ControlFlow::Break(());
            }
            let lo = ext_start.max(start);
            let hi = ext_end.min(end);
            if lo < hi {
                match ranges.last_mut() {
                    Some((offset, len)) if *offset + *len == lo => *len += hi - lo,
                    _ => ranges.push((lo, hi - lo)),
                }
            }
            ControlFlow::Continue(())
        })?;
        Ok(ranges)
    }

    /// Read up to `buf.len()` bytes at logical position `pos`.
    ///
    /// Returns 0 at exactly end of fork; starting past it is an error. The
    /// request is split into one positioned volume read per extent touched.
    pub fn read(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let size = self.fork.logical_size;
        if pos > size {
            return Err(HfsError::BeyondEndOfFile {
                position: pos,
                size,
            });
        }
        let available = size - pos;
        let want = usize::try_from(available).map_or(buf.len(), |n| n.min(buf.len()));
        let bs = self.block_size.as_u64();

        let mut done = 0_usize;
        while done < want {
            let cur = pos + done as u64;
            let resolved = self.find_extent_for(self.block_size.byte_to_block(cur))?;
            let within = cur - resolved.logical_start * bs;
            let run = u64::from(resolved.extent.block_count) * bs - within;
            let n = usize::try_from(run).map_or(want - done, |run| run.min(want - done));
            let physical = self
                .block_size
                .block_to_byte(u64::from(resolved.extent.start_block))
                .and_then(|byte| byte.checked_add(within))
                .ok_or_else(|| {
                    HfsError::Parse(format!(
                        "extent start block {} overflows byte offset",
                        resolved.extent.start_block
                    ))
                })?;
            trace!(
                file_id = self.file_id.0,
                logical = cur,
                physical,
                len = n,
                "fork read chunk"
            );
            self.volume
                .read_exact_at(physical, &mut buf[done..done + n])?;
            done += n;
        }
        Ok(done)
    }

    /// Feed extents in logical order to `f` until it breaks or the fork's
    /// block count is reached.
    fn walk_extents<T>(
        &self,
        mut f: impl FnMut(ResolvedExtent) -> ControlFlow<T>,
    ) -> Result<Option<T>> {
        let total = u64::from(self.fork.total_blocks);
        let mut seen = 0_u64;
        if let Some(value) = feed(&self.fork.extents, total, &mut seen, &mut f) {
            return Ok(Some(value));
        }
        while seen < total {
            let record = self.overflow_record(seen)?;
            let before = seen;
            if let Some(value) = feed(&record, total, &mut seen, &mut f) {
                return Ok(Some(value));
            }
            if seen == before {
                // A record that covers nothing would be fetched again forever.
                return Err(self.missing(seen));
            }
        }
        Ok(None)
    }

    fn overflow_record(&self, start_block: u64) -> Result<Vec<ExtentDescriptor>> {
        let Some(tree) = &self.overflow else {
            warn!(
                file_id = self.file_id.0,
                fork = self.fork_type.name(),
                start_block,
                "fork needs overflow extents but no overflow tree was supplied"
            );
            return Err(self.missing(start_block));
        };
        let key_block = u32::try_from(start_block)
            .map_err(|_| HfsError::Parse(format!("start block {start_block} exceeds u32")))?;
        let key = ExtentKey::new(self.file_id, self.fork_type, key_block);
        let Some(payload) = tree.find(&key)? else {
            warn!(
                file_id = self.file_id.0,
                fork = self.fork_type.name(),
                start_block,
                "no extents-overflow record"
            );
            return Err(self.missing(start_block));
        };
        parse_extent_record(&payload)
            .map_err(|err| HfsError::Parse(format!("overflow record {key}: {err}")))
    }

    fn missing(&self, start_block: u64) -> HfsError {
        HfsError::MissingExtent {
            file_id: self.file_id.0,
            fork: self.fork_type.name(),
            start_block,
        }
    }
}

/// Offer each non-empty extent in `extents` to `f`, advancing `seen`.
fn feed<T>(
    extents: &[ExtentDescriptor],
    total: u64,
    seen: &mut u64,
    f: &mut impl FnMut(ResolvedExtent) -> ControlFlow<T>,
) -> Option<T> {
    for extent in extents {
        if *seen >= total {
            break;
        }
        if extent.is_empty() {
            continue;
        }
        let resolved = ResolvedExtent {
            extent: *extent,
            logical_start: *seen,
        };
        if let ControlFlow::Break(value) = f(resolved) {
            return Some(value);
        }
        *seen += u64::from(extent.block_count);
    }
    None
}

/// The fork's logical bytes as a device, so a B-tree stored in a fork can
/// be opened directly.
impl ByteDevice for ForkReader {
    fn len_bytes(&self) -> u64 {
        self.fork.logical_size
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.fork.logical_size)?;
        let n = self.read(offset, buf)?;
        if n != buf.len() {
            return Err(HfsError::OutOfRange {
                offset,
                len: buf.len() as u64,
                size: self.fork.logical_size,
            });
        }
        Ok(())
    }
}

impl fmt::Debug for ForkReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForkReader")
            .field("file_id", &self.file_id)
            .field("fork_type", &self.fork_type)
            .field("fork", &self.fork)
            .field("block_size", &self.block_size)
            .field("has_overflow", &self.overflow.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hfs_block::MemByteDevice;
    use hfs_btree::BTree;
    use hfs_harness::{TreeImageBuilder, extent_key_bytes};
    use hfs_types::INLINE_EXTENT_COUNT;
    use proptest::prelude::*;

    const BLOCK: u32 = 512;
    const FILE: u32 = 16;

    fn block_size() -> AllocationBlockSize {
        AllocationBlockSize::new(BLOCK).unwrap()
    }

    fn fork(logical_size: u64, total_blocks: u32, inline: &[(u32, u32)]) -> ForkData {
        let mut extents = [ExtentDescriptor::default(); INLINE_EXTENT_COUNT];
        for (slot, (start, count)) in extents.iter_mut().zip(inline) {
            *slot = ExtentDescriptor::new(*start, *count);
        }
        ForkData {
            logical_size,
            clump_size: 0,
            total_blocks,
            extents,
        }
    }

    /// Every byte encodes its physical block and offset.
    fn volume(blocks: usize) -> Vec<u8> {
        (0..blocks * BLOCK as usize)
            .map(|p| ((p / BLOCK as usize) as u8).wrapping_mul(31) ^ (p % 251) as u8)
            .collect()
    }

    fn overflow_payload(extents: &[(u32, u32)]) -> Vec<u8> {
        let mut out = vec![0_u8; 64];
        for (i, (start, count)) in extents.iter().enumerate() {
            out[i * 8..i * 8 + 4].copy_from_slice(&start.to_be_bytes());
            out[i * 8 + 4..i * 8 + 8].copy_from_slice(&count.to_be_bytes());
        }
        out
    }

    fn overflow_tree(records: Vec<(Vec<u8>, Vec<u8>)>) -> Arc<ExtentsTree> {
        let image = TreeImageBuilder::new(512).leaf_capacity(2).records(records).build();
        Arc::new(BTree::open(Arc::new(MemByteDevice::new(image.bytes))).unwrap())
    }

    fn reader(
        vol: Vec<u8>,
        overflow: Option<Arc<ExtentsTree>>,
        fork_data: ForkData,
    ) -> ForkReader {
        ForkReader::new(
            Arc::new(MemByteDevice::new(vol)),
            overflow,
            CatalogNodeId(FILE),
            ForkType::Data,
            fork_data,
            block_size(),
        )
    }

    #[test]
    fn inline_extents_resolve_with_cumulative_start() {
        let r = reader(volume(1), None, fork(5120, 10, &[(0, 4), (10, 6)]));
        for block in 0..4 {
            let resolved = r.find_extent_for(block).unwrap();
            assert_eq!(resolved.extent, ExtentDescriptor::new(0, 4));
            assert_eq!(resolved.logical_start, 0);
        }
        for block in 4..10 {
            let resolved = r.find_extent_for(block).unwrap();
            assert_eq!(resolved.extent, ExtentDescriptor::new(10, 6));
            assert_eq!(resolved.logical_start, 4);
        }
        assert!(matches!(
            r.find_extent_for(10),
            Err(HfsError::BeyondEndOfFile {
                position: 10,
                size: 10
            })
        ));
    }

    #[test]
    fn overflow_tree_supplies_remaining_blocks() {
        let tree = overflow_tree(vec![
            (extent_key_bytes(15, 0x00, 8), overflow_payload(&[(90, 1)])),
            (extent_key_bytes(FILE, 0x00, 4), overflow_payload(&[(20, 8)])),
            (extent_key_bytes(FILE, 0xFF, 0), overflow_payload(&[(70, 2)])),
            (extent_key_bytes(17, 0x00, 8), overflow_payload(&[(80, 3)])),
        ]);
        let r = reader(volume(1), Some(tree), fork(6144, 12, &[(0, 4)]));
        for block in 4..12 {
            let resolved = r.find_extent_for(block).unwrap();
            assert_eq!(resolved.extent, ExtentDescriptor::new(20, 8));
            assert_eq!(resolved.logical_start, 4);
        }
        assert_eq!(r.find_extent_for(3).unwrap().extent, ExtentDescriptor::new(0, 4));
        assert_eq!(
            r.extents().unwrap(),
            vec![
                ResolvedExtent {
                    extent: ExtentDescriptor::new(0, 4),
                    logical_start: 0
                },
                ResolvedExtent {
                    extent: ExtentDescriptor::new(20, 8),
                    logical_start: 4
                },
            ]
        );
    }

    #[test]
    fn absent_overflow_record_is_missing_extent() {
        let tree = overflow_tree(vec![(
            extent_key_bytes(FILE, 0xFF, 4),
            overflow_payload(&[(20, 8)]),
        )]);
        let r = reader(volume(1), Some(tree), fork(6144, 12, &[(0, 4)]));
        let err = r.find_extent_for(5).unwrap_err();
        assert!(matches!(
            err,
            HfsError::MissingExtent {
                file_id: FILE,
                fork: "data",
                start_block: 4
            }
        ));
        assert!(err.is_corruption());
        assert!(r.find_extent_for(2).is_ok());

        let no_tree = reader(volume(1), None, fork(6144, 12, &[(0, 4)]));
        assert!(matches!(
            no_tree.find_extent_for(4),
            Err(HfsError::MissingExtent { start_block: 4, .. })
        ));
    }

    #[test]
    fn empty_overflow_record_does_not_loop() {
        let tree = overflow_tree(vec![(
            extent_key_bytes(FILE, 0x00, 4),
            overflow_payload(&[]),
        )]);
        let r = reader(volume(1), Some(tree), fork(6144, 12, &[(0, 4)]));
        assert!(matches!(
            r.find_extent_for(6),
            Err(HfsError::MissingExtent { start_block: 4, .. })
        ));
    }

    fn two_extent_reader() -> (ForkReader, Vec<u8>) {
        let vol = volume(16);
        // Logical bytes: block 2, then blocks 5..7, cut at 1400 bytes.
        let mut expected = vol[2 * 512..3 * 512].to_vec();
        expected.extend_from_slice(&vol[5 * 512..5 * 512 + 888]);
        (reader(vol, None, fork(1400, 3, &[(2, 1), (5, 2)])), expected)
    }

    #[test]
    fn read_spans_extents_and_stops_at_eof() {
        let (r, expected) = two_extent_reader();
        let mut buf = vec![0_u8; 2000];
        assert_eq!(r.read(0, &mut buf).unwrap(), 1400);
        assert_eq!(&buf[..1400], &expected[..]);

        let mut buf = vec![0_u8; 100];
        assert_eq!(r.read(480, &mut buf).unwrap(), 100);
        assert_eq!(&buf[..], &expected[480..580]);

        assert_eq!(r.read(1350, &mut buf).unwrap(), 50);
        assert_eq!(&buf[..50], &expected[1350..]);
    }

    #[test]
    fn read_at_eof_is_empty_and_past_eof_fails() {
        let (r, _) = two_extent_reader();
        let mut buf = [0_u8; 16];
        assert_eq!(r.read(1400, &mut buf).unwrap(), 0);
        assert!(matches!(
            r.read(1401, &mut buf),
            Err(HfsError::BeyondEndOfFile {
                position: 1401,
                size: 1400
            })
        ));
        assert_eq!(r.read(0, &mut []).unwrap(), 0);
    }

    #[test]
    fn extents_in_range_clamps_and_merges() {
        let (r, _) = two_extent_reader();
        assert_eq!(r.extents_in_range(0, u64::MAX).unwrap(), vec![(0, 1400)]);
        assert_eq!(r.extents_in_range(100, 500).unwrap(), vec![(100, 500)]);
        assert_eq!(r.extents_in_range(1300, 1000).unwrap(), vec![(1300, 100)]);
        assert!(r.extents_in_range(1400, 10).unwrap().is_empty());
        assert!(r.extents_in_range(10, 0).unwrap().is_empty());

        // Blocks cover less than the logical size: the tail is unbacked.
        let short = reader(volume(16), None, fork(1400, 2, &[(2, 1), (5, 1)]));
        assert_eq!(short.extents_in_range(0, 1400).unwrap(), vec![(0, 1024)]);
    }

    #[test]
    fn fork_reader_is_a_byte_device() {
        let (r, expected) = two_extent_reader();
        assert_eq!(r.len_bytes(), 1400);
        let got = r.read_vec_at(500, 600).unwrap();
        assert_eq!(got, expected[500..1100]);
        assert!(matches!(
            r.read_vec_at(1000, 401),
            Err(HfsError::OutOfRange { .. })
        ));
    }

    #[test]
    fn btree_opens_inside_a_fragmented_fork() {
        let image = TreeImageBuilder::new(512)
            .leaf_capacity(3)
            .records((1..=20_u32).map(|f| (extent_key_bytes(f, 0x00, 0), f.to_be_bytes().to_vec())))
            .build();
        let nodes = image.total_nodes;
        let half = nodes / 2;
        // First half of the tree at block 40, the rest at block 3.
        let mut vol = volume(64);
        let split = half as usize * 512;
        vol[40 * 512..40 * 512 + split].copy_from_slice(&image.bytes[..split]);
        vol[3 * 512..3 * 512 + image.bytes.len() - split].copy_from_slice(&image.bytes[split..]);

        let fork_data = fork(image.bytes.len() as u64, nodes, &[(40, half), (3, nodes - half)]);
        let r = reader(vol, None, fork_data);
        let tree: ExtentsTree = BTree::open(Arc::new(r)).unwrap();
        for f in 1..=20_u32 {
            let key = ExtentKey::new(CatalogNodeId(f), ForkType::Data, 0);
            assert_eq!(tree.find(&key).unwrap(), Some(f.to_be_bytes().to_vec()));
        }
        assert_eq!(tree.walk_leaves(|_, _| {}).unwrap(), 20);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn proptest_split_reads_match_single_read(
            cuts in proptest::collection::btree_set(1_u64..1400, 0..12),
        ) {
            let (r, expected) = two_extent_reader();
            let mut bounds: Vec<u64> = std::iter::once(0).chain(cuts).collect();
            bounds.push(1400);
            let mut joined = Vec::new();
            let mut total = 0;
            for pair in bounds.windows(2) {
                let mut buf = vec![0_u8; (pair[1] - pair[0]) as usize];
                let n = r.read(pair[0], &mut buf).unwrap();
                total += n;
                joined.extend_from_slice(&buf[..n]);
            }
            prop_assert_eq!(total, 1400);
            prop_assert_eq!(joined, expected);
        }
    }
}
