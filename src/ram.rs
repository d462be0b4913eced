//! RAM block directory and chunk-level registration cache.
//!
//! Both peers build the same directory of guest RAM blocks at session
//! init by iterating the hypervisor's block list; the directory is
//! immutable once the connection is established. Blocks are tiled by
//! power-of-two chunks, the unit of dynamic memory registration.

use std::io;

use crate::error::{Error, Result};
use crate::proto::RemoteBlockEntry;
use crate::verbs::mr::{IbvMr, Permission};
use crate::verbs::pd::IbvPd;

/// Smallest guest page size; RAM blocks must start page-aligned.
const PAGE_ALIGN: u64 = 4096;

/// Description of one guest RAM block, provided by the hypervisor.
#[derive(Debug, Clone, Copy)]
pub struct RamBlockInfo {
    /// Host virtual address of the block.
    pub host_addr: *mut u8,
    /// Block identifier, stable across both peers.
    pub guest_offset: u64,
    /// Length in bytes.
    pub length: u64,
}

/// A guest RAM block from the transport's perspective.
pub(crate) struct LocalBlock {
    pub local_addr: *mut u8,
    /// Peer virtual address, learned from the directory exchange.
    pub remote_addr: u64,
    pub guest_offset: u64,
    pub length: u64,
    /// MR covering the whole block (whole-block registration mode).
    mr: Option<IbvMr>,
    /// Lazily created per-chunk MRs (chunk registration mode).
    chunk_mrs: Option<Vec<Option<IbvMr>>>,
    /// Peer rkey for the whole block (whole-block registration mode).
    pub remote_rkey: u32,
    /// Source-side cache of peer rkeys per chunk; `0` means not yet
    /// obtained (chunk registration mode).
    remote_keys: Option<Vec<u32>>,
}

/// The session's view of all guest RAM blocks.
pub(crate) struct LocalBlocks {
    blocks: Vec<LocalBlock>,
    chunk_shift: u32,
}

impl LocalBlocks {
    /// Build the directory from the hypervisor's block list.
    pub fn new(infos: impl IntoIterator<Item = RamBlockInfo>, chunk_shift: u32) -> Result<Self> {
        let mut blocks = Vec::new();
        for info in infos {
            if (info.host_addr as u64) % PAGE_ALIGN != 0 {
                return Err(Error::Config(format!(
                    "RAM block at guest offset {:#x} is not page-aligned",
                    info.guest_offset
                )));
            }
            blocks.push(LocalBlock {
                local_addr: info.host_addr,
                remote_addr: 0,
                guest_offset: info.guest_offset,
                length: info.length,
                mr: None,
                chunk_mrs: None,
                remote_rkey: 0,
                remote_keys: None,
            });
        }
        log::debug!("ram directory holds {} blocks", blocks.len());
        Ok(Self {
            blocks,
            chunk_shift,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[inline]
    pub fn get(&self, index: usize) -> &LocalBlock {
        &self.blocks[index]
    }

    /// Index of the chunk containing `host_addr` within `block`.
    #[inline]
    pub fn chunk_index(&self, block: &LocalBlock, host_addr: u64) -> usize {
        ((host_addr >> self.chunk_shift) - ((block.local_addr as u64) >> self.chunk_shift)) as usize
    }

    /// Number of chunks tiling `[local_addr, local_addr + length)`.
    pub fn num_chunks(&self, block: &LocalBlock) -> usize {
        if block.length == 0 {
            return 0;
        }
        self.chunk_index(block, block.local_addr as u64 + block.length - 1) + 1
    }

    /// Host address bounds of a chunk, clipped to the block.
    pub fn chunk_range(&self, block: &LocalBlock, chunk: usize) -> (u64, u64) {
        let base = block.local_addr as u64;
        let start = ((base >> self.chunk_shift) + chunk as u64) << self.chunk_shift;
        let end = start + (1u64 << self.chunk_shift);
        (start.max(base), end.min(base + block.length))
    }

    /// Find the block containing `[offset, offset + length)` of the guest
    /// address space, along with the chunk index of `offset`.
    ///
    /// A miss is fatal: the caller and its peer disagree about the guest
    /// memory layout.
    pub fn search(&self, offset: u64, length: u64) -> Option<(usize, usize)> {
        let end = offset.checked_add(length)?;
        for (i, block) in self.blocks.iter().enumerate() {
            if offset < block.guest_offset {
                continue;
            }
            if end > block.guest_offset + block.length {
                continue;
            }
            let host_addr = block.local_addr as u64 + (offset - block.guest_offset);
            return Some((i, self.chunk_index(block, host_addr)));
        }
        None
    }

    /// Whether `[offset, offset + length)` of the guest address space lies
    /// entirely within one chunk of one block.
    pub fn range_within_chunk(&self, block_index: usize, chunk: usize, offset: u64, length: u64) -> bool {
        let block = &self.blocks[block_index];
        let host_addr = block.local_addr as u64 + (offset - block.guest_offset);
        let (start, end) = self.chunk_range(block, chunk);
        host_addr >= start && host_addr + length <= end
    }

    /// Whether `[offset, offset + length)` lies entirely within the block.
    pub fn range_within_block(&self, block_index: usize, offset: u64, length: u64) -> bool {
        let block = &self.blocks[block_index];
        let Some(end) = offset.checked_add(length) else {
            return false;
        };
        offset >= block.guest_offset && end <= block.guest_offset + block.length
    }

    /// Register every block with one whole-block MR.
    ///
    /// On failure, regions registered so far are released in reverse
    /// order before the error is surfaced.
    pub fn register_whole(&mut self, pd: IbvPd, perm: Permission) -> io::Result<()> {
        for i in 0..self.blocks.len() {
            let block = &self.blocks[i];
            // SAFETY: the hypervisor guarantees the block outlives the
            // migration session.
            let mr = unsafe { IbvMr::reg(pd, block.local_addr, block.length as usize, perm) };
            match mr {
                Ok(mr) => self.blocks[i].mr = Some(mr),
                Err(e) => {
                    log::error!("failed to register RAM block {i}: {e}");
                    for block in self.blocks[..i].iter_mut().rev() {
                        if let Some(mr) = block.mr.take() {
                            // SAFETY: registered above, deregistered once.
                            let _ = unsafe { mr.dereg() };
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Ensure an MR covers `host_addr` within the given block and return
    /// its `(lkey, rkey)`.
    ///
    /// Idempotent: a whole-block MR wins, an existing chunk MR is reused,
    /// and otherwise the clipped chunk range is registered. `for_remote`
    /// selects the destination's access flags (the peer will RDMA-WRITE
    /// into the chunk); the source registers for local access only.
    pub fn register_and_get_keys(
        &mut self,
        pd: IbvPd,
        block_index: usize,
        host_addr: u64,
        for_remote: bool,
    ) -> io::Result<(u32, u32)> {
        let (chunk, start, end, num_chunks) = {
            let block = &self.blocks[block_index];
            if let Some(mr) = block.mr {
                return Ok((mr.lkey(), mr.rkey()));
            }
            let chunk = self.chunk_index(block, host_addr);
            let (start, end) = self.chunk_range(block, chunk);
            (chunk, start, end, self.num_chunks(block))
        };

        let block = &mut self.blocks[block_index];
        let mrs = block.chunk_mrs.get_or_insert_with(|| vec![None; num_chunks]);
        if let Some(mr) = mrs[chunk] {
            return Ok((mr.lkey(), mr.rkey()));
        }

        let perm = if for_remote {
            Permission::LOCAL_WRITE | Permission::REMOTE_WRITE | Permission::REMOTE_READ
        } else {
            Permission::LOCAL_WRITE
        };
        // SAFETY: the chunk range lies within the block, which the
        // hypervisor keeps alive for the whole migration session.
        let mr = unsafe { IbvMr::reg(pd, start as *mut u8, (end - start) as usize, perm) }?;
        log::trace!(
            "registered chunk {chunk} of block {block_index}: [{start:#x}, {end:#x})"
        );
        mrs[chunk] = Some(mr);
        Ok((mr.lkey(), mr.rkey()))
    }

    /// Allocate the per-chunk remote-rkey caches (source, chunk mode).
    pub fn alloc_remote_key_caches(&mut self) {
        for i in 0..self.blocks.len() {
            let num = self.num_chunks(&self.blocks[i]);
            self.blocks[i].remote_keys = Some(vec![0u32; num]);
        }
    }

    /// Cached peer rkey for a chunk; `0` means not yet obtained.
    pub fn remote_key(&self, block_index: usize, chunk: usize) -> u32 {
        self.blocks[block_index]
            .remote_keys
            .as_ref()
            .map_or(0, |keys| keys[chunk])
    }

    pub fn set_remote_key(&mut self, block_index: usize, chunk: usize, rkey: u32) {
        if let Some(keys) = self.blocks[block_index].remote_keys.as_mut() {
            keys[chunk] = rkey;
        }
    }

    /// Pack the directory for the wire (destination side). Whole-block
    /// rkeys are only present when whole-block registration is in effect.
    pub fn export_entries(&self) -> Vec<RemoteBlockEntry> {
        self.blocks
            .iter()
            .map(|block| RemoteBlockEntry {
                remote_addr: block.local_addr as u64,
                guest_offset: block.guest_offset,
                length: block.length,
                rkey: block.mr.map_or(0, |mr| mr.rkey()),
            })
            .collect()
    }

    /// Reconcile the peer's directory with ours (source side).
    ///
    /// Sizes must match exactly; entries are matched by `guest_offset`,
    /// tolerating reorder, and lengths must agree per block.
    pub fn apply_remote_entries(&mut self, entries: &[RemoteBlockEntry]) -> Result<()> {
        if entries.len() != self.blocks.len() {
            return Err(Error::Protocol(format!(
                "peer announces {} RAM blocks, local directory holds {}",
                entries.len(),
                self.blocks.len()
            )));
        }
        for entry in entries {
            let block = self
                .blocks
                .iter_mut()
                .find(|b| b.guest_offset == entry.guest_offset)
                .ok_or_else(|| {
                    Error::Protocol(format!(
                        "peer block at guest offset {:#x} has no local counterpart",
                        entry.guest_offset
                    ))
                })?;
            if block.length != entry.length {
                return Err(Error::Protocol(format!(
                    "block at guest offset {:#x}: local length {}, peer length {}",
                    entry.guest_offset, block.length, entry.length
                )));
            }
            block.remote_addr = entry.remote_addr;
            block.remote_rkey = entry.rkey;
        }
        Ok(())
    }

    /// Deregister every MR. Failures are logged and do not stop the walk;
    /// teardown runs from multiple error paths and must always finish.
    pub fn deregister_all(&mut self) {
        for (i, block) in self.blocks.iter_mut().enumerate() {
            if let Some(mrs) = block.chunk_mrs.take() {
                for (j, mr) in mrs.into_iter().enumerate() {
                    if let Some(mr) = mr {
                        // SAFETY: registered by us, deregistered once.
                        if let Err(e) = unsafe { mr.dereg() } {
                            log::warn!("failed to deregister chunk {j} of block {i}: {e}");
                        }
                    }
                }
            }
            if let Some(mr) = block.mr.take() {
                // SAFETY: registered by us, deregistered once.
                if let Err(e) = unsafe { mr.dereg() } {
                    log::warn!("failed to deregister block {i}: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1 << 20;

    fn directory(blocks: &[(u64, u64, u64)]) -> LocalBlocks {
        // (fake host addr, guest offset, length); addresses are never
        // dereferenced by the directory.
        let infos: Vec<_> = blocks
            .iter()
            .map(|&(addr, offset, length)| RamBlockInfo {
                host_addr: addr as *mut u8,
                guest_offset: offset,
                length,
            })
            .collect();
        LocalBlocks::new(infos, 20).unwrap()
    }

    #[test]
    fn rejects_unaligned_blocks() {
        let info = RamBlockInfo {
            host_addr: 0x1000_0001 as *mut u8,
            guest_offset: 0,
            length: MIB,
        };
        assert!(LocalBlocks::new([info], 20).is_err());
    }

    #[test]
    fn chunk_count_with_clipped_tail() {
        let dir = directory(&[(0x1000_0000, 0, 3 * MIB + 1)]);
        let block = dir.get(0);
        assert_eq!(dir.num_chunks(block), 4);

        // The last chunk is clipped to the block end.
        let (start, end) = dir.chunk_range(block, 3);
        assert_eq!(start, 0x1000_0000 + 3 * MIB);
        assert_eq!(end, 0x1000_0000 + 3 * MIB + 1);
    }

    #[test]
    fn chunk_count_exact_multiple() {
        let dir = directory(&[(0x1000_0000, 0, 3 * MIB)]);
        assert_eq!(dir.num_chunks(dir.get(0)), 3);
    }

    #[test]
    fn chunk_index_by_shift() {
        let dir = directory(&[(0x1000_0000, 0, 8 * MIB)]);
        let block = dir.get(0);
        assert_eq!(dir.chunk_index(block, 0x1000_0000), 0);
        assert_eq!(dir.chunk_index(block, 0x1000_0000 + MIB - 1), 0);
        assert_eq!(dir.chunk_index(block, 0x1000_0000 + MIB), 1);
        assert_eq!(dir.chunk_index(block, 0x1000_0000 + 5 * MIB + 42), 5);
    }

    #[test]
    fn search_hits_and_misses() {
        let dir = directory(&[
            (0x1000_0000, 0, 4 * MIB),
            (0x2000_0000, 4 * MIB, 2 * MIB),
        ]);

        assert_eq!(dir.search(0, 4096), Some((0, 0)));
        assert_eq!(dir.search(4 * MIB, 4096), Some((1, 0)));
        assert_eq!(dir.search(5 * MIB + 4096, 4096), Some((1, 1)));

        // A range ending exactly at the block end is accepted; one byte
        // beyond is a miss.
        assert_eq!(dir.search(6 * MIB - 4096, 4096), Some((1, 1)));
        assert_eq!(dir.search(6 * MIB - 4095, 4096), None);
        assert_eq!(dir.search(6 * MIB, 1), None);
        assert_eq!(dir.search(u64::MAX, 2), None);
    }

    #[test]
    fn range_within_chunk_clips() {
        let dir = directory(&[(0x1000_0000, 0, 4 * MIB)]);
        assert!(dir.range_within_chunk(0, 0, 0, 4096));
        assert!(dir.range_within_chunk(0, 0, MIB - 4096, 4096));
        // Straddles the chunk 0 / chunk 1 boundary.
        assert!(!dir.range_within_chunk(0, 0, MIB - 2048, 4096));
        assert!(dir.range_within_chunk(0, 1, MIB, 4096));
    }

    #[test]
    fn reconcile_matches_by_guest_offset() {
        let mut dir = directory(&[
            (0x1000_0000, 0, 4 * MIB),
            (0x2000_0000, 4 * MIB, 2 * MIB),
        ]);

        // Peer iterates its blocks in the opposite order.
        let entries = vec![
            RemoteBlockEntry {
                remote_addr: 0x7f00_0040_0000,
                guest_offset: 4 * MIB,
                length: 2 * MIB,
                rkey: 7,
            },
            RemoteBlockEntry {
                remote_addr: 0x7f00_0000_0000,
                guest_offset: 0,
                length: 4 * MIB,
                rkey: 9,
            },
        ];
        dir.apply_remote_entries(&entries).unwrap();
        assert_eq!(dir.get(0).remote_addr, 0x7f00_0000_0000);
        assert_eq!(dir.get(0).remote_rkey, 9);
        assert_eq!(dir.get(1).remote_addr, 0x7f00_0040_0000);
        assert_eq!(dir.get(1).remote_rkey, 7);
    }

    #[test]
    fn reconcile_rejects_size_mismatch() {
        let mut dir = directory(&[(0x1000_0000, 0, 4 * MIB)]);
        assert!(dir.apply_remote_entries(&[]).is_err());

        let entries = vec![RemoteBlockEntry {
            remote_addr: 0x7f00_0000_0000,
            guest_offset: 0,
            length: 2 * MIB,
            rkey: 0,
        }];
        assert!(dir.apply_remote_entries(&entries).is_err());
    }

    #[test]
    fn remote_key_cache() {
        let mut dir = directory(&[(0x1000_0000, 0, 4 * MIB)]);
        assert_eq!(dir.remote_key(0, 2), 0);
        dir.alloc_remote_key_caches();
        assert_eq!(dir.remote_key(0, 2), 0);
        dir.set_remote_key(0, 2, 0xbeef);
        assert_eq!(dir.remote_key(0, 2), 0xbeef);
        assert_eq!(dir.remote_key(0, 1), 0);
    }
}
