//! Write engine: coalesce page writes into chunk-sized RDMA WRITEs.

use std::mem;
use std::slice;

use rdma_sys::*;

use crate::control::SLOT_RESPONSE;
use crate::error::{Error, Result};
use crate::proto::{
    decode_register_results, encode_register_commands, ControlHeader, MessageType,
    RegisterCommand,
};
use crate::ram::LocalBlocks;
use crate::session::{Session, SessionState};
use crate::verbs::wr::WrId;

/// Signaled/unsignaled batching of RDMA WRITEs.
///
/// Keeping most writes unsignaled avoids one completion per chunk; after
/// `unsignaled_max` consecutive unsignaled posts the next one is forced
/// to be signaled so the hardware periodically acknowledges a batch.
#[derive(Debug)]
pub(crate) struct SignalBatch {
    unsignaled_pending: u32,
    signaled_inflight: u32,
    unsignaled_max: u32,
}

impl SignalBatch {
    pub fn new(unsignaled_max: u32) -> Self {
        Self {
            unsignaled_pending: 0,
            signaled_inflight: 0,
            unsignaled_max,
        }
    }

    /// Whether the next post must be signaled.
    pub fn next_signaled(&self) -> bool {
        self.unsignaled_pending >= self.unsignaled_max
    }

    /// Account for a successful post.
    pub fn posted(&mut self, signaled: bool) {
        if signaled {
            self.unsignaled_pending = 0;
            self.signaled_inflight += 1;
        } else {
            self.unsignaled_pending += 1;
        }
    }

    /// Account for a retired RDMA-WRITE completion.
    pub fn completed(&mut self) {
        self.signaled_inflight = self.signaled_inflight.saturating_sub(1);
    }

    pub fn idle(&self) -> bool {
        self.signaled_inflight == 0
    }

    pub fn inflight(&self) -> u32 {
        self.signaled_inflight
    }

    #[cfg(test)]
    pub fn pending(&self) -> u32 {
        self.unsignaled_pending
    }
}

/// A coalesced range ready to be posted as one RDMA WRITE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingWrite {
    pub block: usize,
    pub chunk: usize,
    pub offset: u64,
    pub length: u64,
}

/// The coalescing cursor.
///
/// Adjacent pages grow one pending range until a page lands elsewhere
/// (different block, different chunk, or a gap) or the range reaches
/// `merge_max`, at which point the range is surrendered for posting.
#[derive(Debug)]
pub(crate) struct Coalescer {
    block: Option<usize>,
    chunk: Option<usize>,
    offset: u64,
    length: u64,
    merge_max: u64,
}

impl Coalescer {
    pub fn new(merge_max: u64) -> Self {
        Self {
            block: None,
            chunk: None,
            offset: 0,
            length: 0,
            merge_max,
        }
    }

    fn mergeable(&self, dir: &LocalBlocks, chunked: bool, offset: u64, length: u64) -> bool {
        if self.length == 0 {
            return false;
        }
        if offset != self.offset + self.length {
            return false;
        }
        let (Some(block), Some(chunk)) = (self.block, self.chunk) else {
            return false;
        };
        if !dir.range_within_block(block, offset, length) {
            return false;
        }
        if chunked && !dir.range_within_chunk(block, chunk, offset, length) {
            return false;
        }
        true
    }

    /// Admit one page. Returns up to two ranges that must be posted now:
    /// the previously pending range if the page could not be merged into
    /// it, and the grown range itself if it reached `merge_max`.
    pub fn push(
        &mut self,
        dir: &LocalBlocks,
        chunked: bool,
        offset: u64,
        length: u64,
    ) -> Result<(Option<PendingWrite>, Option<PendingWrite>)> {
        let mut displaced = None;
        if !self.mergeable(dir, chunked, offset, length) {
            displaced = self.take();
            let (block, chunk) = dir.search(offset, length).ok_or_else(|| {
                Error::Fatal(format!(
                    "no RAM block covers [{offset:#x}, {offset:#x} + {length:#x})"
                ))
            })?;
            self.block = Some(block);
            self.chunk = Some(chunk);
            self.offset = offset;
        }

        self.length += length;

        let capped = if self.length >= self.merge_max {
            self.take()
        } else {
            None
        };
        Ok((displaced, capped))
    }

    /// Surrender the pending range, if any.
    pub fn take(&mut self) -> Option<PendingWrite> {
        if self.length == 0 {
            return None;
        }
        let pending = PendingWrite {
            block: self.block?,
            chunk: self.chunk?,
            offset: self.offset,
            length: self.length,
        };
        self.length = 0;
        self.offset = 0;
        Some(pending)
    }

    #[cfg(test)]
    pub fn pending_length(&self) -> u64 {
        self.length
    }
}

impl Session {
    /// Admit one page write; post whatever ranges the coalescer emits.
    pub(crate) fn queue_write(&mut self, offset: u64, length: u64) -> Result<()> {
        let chunked = self.chunk_register;
        let (displaced, capped) = self
            .coalescer
            .push(&self.blocks, chunked, offset, length)?;
        if let Some(pending) = displaced {
            self.flush_pending(pending)?;
        }
        if let Some(pending) = capped {
            self.flush_pending(pending)?;
        }
        Ok(())
    }

    /// Push out the pending coalesced range, if any.
    pub(crate) fn write_flush(&mut self) -> Result<()> {
        if let Some(pending) = self.coalescer.take() {
            self.flush_pending(pending)?;
        }
        Ok(())
    }

    /// Post one coalesced range, recovering from a full send queue by
    /// waiting for any RDMA-WRITE completion and retrying.
    fn flush_pending(&mut self, pending: PendingWrite) -> Result<()> {
        let signaled = self.batch.next_signaled();
        loop {
            match self.post_write(&pending, signaled) {
                Ok(()) => break,
                Err(Error::Capacity) => {
                    log::debug!("send queue full, waiting for a write completion");
                    self.wait_for_wrid(WrId::RdmaWrite)?;
                }
                Err(e) => return Err(e),
            }
        }
        self.batch.posted(signaled);
        Ok(())
    }

    fn post_write(&mut self, pending: &PendingWrite, signaled: bool) -> Result<()> {
        let pd = self.pd_handle()?;
        let qp = self.qp_handle()?;

        let (local_addr, remote_addr, whole_rkey) = {
            let block = self.blocks.get(pending.block);
            let delta = pending.offset - block.guest_offset;
            (
                block.local_addr as u64 + delta,
                block.remote_addr + delta,
                block.remote_rkey,
            )
        };

        let (lkey, _) = self
            .blocks
            .register_and_get_keys(pd, pending.block, local_addr, false)?;

        let rkey = if self.chunk_register {
            match self.blocks.remote_key(pending.block, pending.chunk) {
                0 => self.request_remote_key(pending)?,
                cached => cached,
            }
        } else {
            whole_rkey
        };

        let mut sge = ibv_sge {
            addr: local_addr,
            length: pending.length as u32,
            lkey,
        };
        // SAFETY: POD type.
        let mut wr = unsafe { mem::zeroed::<ibv_send_wr>() };
        wr.wr_id = WrId::RdmaWrite.to_raw();
        wr.opcode = ibv_wr_opcode::IBV_WR_RDMA_WRITE;
        wr.send_flags = if signaled {
            ibv_send_flags::IBV_SEND_SIGNALED.0
        } else {
            0
        };
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        wr.wr.rdma = rdma_t { remote_addr, rkey };

        qp.post_send(&mut wr).map_err(|e| {
            if e.raw_os_error() == Some(libc::ENOMEM) {
                Error::Capacity
            } else {
                Error::Transport(e)
            }
        })
    }

    /// Ask the destination to register the chunk and cache the returned
    /// rkey for all later writes into it.
    fn request_remote_key(&mut self, pending: &PendingWrite) -> Result<u32> {
        let command = RegisterCommand {
            len: pending.length as u32,
            block_index: pending.block as u32,
            offset: pending.offset,
        };
        log::debug!(
            "requesting registration of chunk {} in block {} ({} bytes)",
            pending.chunk,
            pending.block,
            pending.length
        );

        let payload = encode_register_commands(&[command]);
        let head = ControlHeader::with_len(MessageType::RegisterRequest, payload.len() as u32);
        let resp = self
            .exchange_send(&head, &payload, Some(MessageType::RegisterResult))?
            .ok_or_else(|| Error::Fatal("registration response went missing".into()))?;

        let rkeys = decode_register_results(self.control_payload(SLOT_RESPONSE), resp.repeat)?;
        let rkey = *rkeys
            .first()
            .ok_or_else(|| Error::Protocol("empty registration result".into()))?;

        log::debug!(
            "peer rkey {rkey:#x} cached for chunk {} of block {}",
            pending.chunk,
            pending.block
        );
        self.blocks.set_remote_key(pending.block, pending.chunk, rkey);
        Ok(rkey)
    }

    /// Queue one page, skipping all-zero pages when the destination pins
    /// memory on demand (it then never has to pin the page at all).
    pub(crate) fn save_page(
        &mut self,
        block_offset: u64,
        offset: u64,
        length: u64,
        host_va: *const u8,
    ) -> Result<usize> {
        self.transition(SessionState::Streaming);

        if self.chunk_register {
            if let Some(probe) = self.zero_probe {
                // SAFETY: the caller hands us a live page of `length` bytes.
                let page = unsafe { slice::from_raw_parts(host_va, length as usize) };
                if probe(page) {
                    return Ok(length as usize);
                }
            }
        }

        self.queue_write(block_offset + offset, length)?;

        // Retire whatever already completed, without blocking, so the
        // send queue cannot silently fill between flushes.
        self.drain_available()?;
        Ok(length as usize)
    }

    /// Flush and wait until every signaled write has retired.
    pub(crate) fn drain(&mut self) -> Result<()> {
        self.transition(SessionState::Draining);
        self.write_flush()?;
        while !self.batch.idle() {
            self.wait_for_wrid(WrId::RdmaWrite)?;
        }
        self.transition(SessionState::Connected);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ram::RamBlockInfo;

    const KIB: u64 = 1 << 10;
    const MIB: u64 = 1 << 20;

    fn directory() -> LocalBlocks {
        let infos = [
            RamBlockInfo {
                host_addr: 0x1000_0000 as *mut u8,
                guest_offset: 0,
                length: 16 * MIB,
            },
            RamBlockInfo {
                host_addr: 0x4000_0000 as *mut u8,
                guest_offset: 16 * MIB,
                length: 4 * MIB,
            },
        ];
        LocalBlocks::new(infos, 20).unwrap()
    }

    /// Feed pages through the coalescer the way `save_page` does and
    /// account posted writes the way `flush_pending` does, with a final
    /// flush at the end of the run.
    fn run(
        pages: &[(u64, u64)],
        chunked: bool,
        merge_max: u64,
        unsignaled_max: u32,
    ) -> (Vec<PendingWrite>, SignalBatch) {
        let dir = directory();
        let mut coalescer = Coalescer::new(merge_max);
        let mut batch = SignalBatch::new(unsignaled_max);
        let mut writes = Vec::new();
        let mut post = |batch: &mut SignalBatch, pending: PendingWrite| {
            let signaled = batch.next_signaled();
            batch.posted(signaled);
            writes.push(pending);
        };

        for &(offset, length) in pages {
            let (displaced, capped) = coalescer.push(&dir, chunked, offset, length).unwrap();
            if let Some(p) = displaced {
                post(&mut batch, p);
            }
            if let Some(p) = capped {
                post(&mut batch, p);
            }
            assert!(coalescer.pending_length() < merge_max);
        }
        if let Some(p) = coalescer.take() {
            post(&mut batch, p);
        }
        (writes, batch)
    }

    #[test]
    fn single_page_single_write() {
        let (writes, batch) = run(&[(0, 4 * KIB)], true, 64 * KIB, 4);
        assert_eq!(
            writes,
            vec![PendingWrite {
                block: 0,
                chunk: 0,
                offset: 0,
                length: 4 * KIB
            }]
        );
        assert_eq!(batch.pending(), 1);
        assert_eq!(batch.inflight(), 0);
    }

    #[test]
    fn adjacent_pages_coalesce_to_merge_max() {
        let pages: Vec<_> = (0..16).map(|i| (i * 4 * KIB, 4 * KIB)).collect();
        let (writes, batch) = run(&pages, true, 64 * KIB, 4);
        assert_eq!(
            writes,
            vec![PendingWrite {
                block: 0,
                chunk: 0,
                offset: 0,
                length: 64 * KIB
            }]
        );
        assert_eq!(batch.pending(), 1);
        assert_eq!(batch.inflight(), 0);
    }

    #[test]
    fn fifth_write_is_signaled() {
        // Five discontiguous ranges, each forced out by the next one.
        let pages: Vec<_> = (0..5).map(|i| (i * MIB, 16 * KIB)).collect();
        let (writes, batch) = run(&pages, true, 64 * KIB, 4);
        assert_eq!(writes.len(), 5);
        assert_eq!(batch.pending(), 0);
        assert_eq!(batch.inflight(), 1);
    }

    #[test]
    fn gap_breaks_coalescing() {
        let (writes, _) = run(&[(0, 4 * KIB), (8 * KIB, 4 * KIB)], true, 64 * KIB, 64);
        assert_eq!(writes.len(), 2);
    }

    #[test]
    fn chunk_boundary_breaks_coalescing() {
        // Adjacent pages on either side of the 1 MiB chunk boundary must
        // not fold into one WRITE in chunk mode.
        let pages = [(MIB - 4 * KIB, 4 * KIB), (MIB, 4 * KIB)];
        let (writes, _) = run(&pages, true, 64 * KIB, 64);
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].chunk, 0);
        assert_eq!(writes[1].chunk, 1);

        // In whole-block mode the same pair coalesces.
        let (writes, _) = run(&pages, false, 64 * KIB, 64);
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].length, 8 * KIB);
    }

    #[test]
    fn block_boundary_breaks_coalescing() {
        let pages = [(16 * MIB - 4 * KIB, 4 * KIB), (16 * MIB, 4 * KIB)];
        let (writes, _) = run(&pages, false, 64 * KIB, 64);
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].block, 0);
        assert_eq!(writes[1].block, 1);
    }

    #[test]
    fn search_miss_is_fatal() {
        let dir = directory();
        let mut coalescer = Coalescer::new(4 * MIB);
        assert!(matches!(
            coalescer.push(&dir, true, 64 * MIB, 4 * KIB),
            Err(Error::Fatal(_))
        ));
    }

    #[test]
    fn batch_counters() {
        let mut batch = SignalBatch::new(2);
        assert!(!batch.next_signaled());
        batch.posted(false);
        batch.posted(false);
        assert!(batch.next_signaled());
        batch.posted(true);
        assert_eq!(batch.pending(), 0);
        assert_eq!(batch.inflight(), 1);
        assert!(!batch.idle());
        batch.completed();
        assert!(batch.idle());
        // A stray completion does not underflow.
        batch.completed();
        assert!(batch.idle());
    }
}
