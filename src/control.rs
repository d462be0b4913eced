//! Control channel: framed SEND/RECV with READY-gated flow control.
//!
//! Three fixed buffers back the channel. Slot 0 receives the peer's
//! current message (READY tokens included), slot 1 is the look-ahead
//! RECV for piggy-backed responses, and slot 2 stages outgoing SENDs.
//! The destination drives credit: the source consumes one READY before
//! each SEND, so both peers hold at most one message in flight.

use std::mem;

use rdma_sys::*;

use crate::error::{Error, Result};
use crate::proto::{ControlHeader, MessageType, CONTROL_HEADER_SIZE};
use crate::session::Session;
use crate::verbs::mr::{IbvMr, Permission};
use crate::verbs::wr::WrId;

/// Slot receiving READY tokens and data messages.
pub(crate) const SLOT_READY: usize = 0;
/// Look-ahead slot receiving piggy-backed responses.
pub(crate) const SLOT_RESPONSE: usize = 1;
/// Slot staging outgoing SENDs.
pub(crate) const SLOT_SEND: usize = 2;

pub(crate) const CONTROL_SLOT_COUNT: usize = 3;

/// One pre-registered control buffer.
pub(crate) struct ControlSlot {
    buf: Vec<u8>,
    pub mr: Option<IbvMr>,
    /// Unconsumed payload bytes of the last received message.
    len: usize,
    /// Offset of the first unconsumed byte.
    cursor: usize,
}

impl ControlSlot {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
            mr: None,
            len: 0,
            cursor: 0,
        }
    }

    /// Expose the payload of a just-received message for consumption.
    fn open_payload(&mut self, len: usize) {
        self.len = len;
        self.cursor = CONTROL_HEADER_SIZE;
    }

    /// Unconsumed payload bytes.
    fn remaining(&self) -> &[u8] {
        &self.buf[self.cursor..self.cursor + self.len]
    }

    /// Copy buffered payload bytes into `out`, consuming them.
    fn fill(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.len);
        if n > 0 {
            out[..n].copy_from_slice(&self.buf[self.cursor..self.cursor + n]);
            self.cursor += n;
            self.len -= n;
        }
        n
    }
}

/// Explicit READY credit accounting.
///
/// The destination grants one SEND credit per READY token. `arm` records
/// that a token is owed to us; the completion pump `grant`s it the
/// moment the RECV completes, even if the session was waiting on some
/// other work request at the time; `consume` spends it right before the
/// next SEND.
#[derive(Debug, Default)]
pub(crate) struct ReadyCredits {
    armed: bool,
    granted: u32,
}

impl ReadyCredits {
    pub fn new() -> Self {
        Self::default()
    }

    /// A READY token is owed before our next SEND.
    pub fn arm(&mut self) {
        self.armed = true;
    }

    /// Whether a token is owed at all.
    pub fn armed(&self) -> bool {
        self.armed
    }

    /// Whether we are still waiting for the owed token to arrive.
    pub fn awaiting(&self) -> bool {
        self.armed && self.granted == 0
    }

    /// Bank the READY token observed by the completion pump.
    pub fn grant(&mut self) {
        self.granted += 1;
    }

    /// Spend one credit. Returns `false` on underflow, which would mean
    /// a SEND without a matching READY.
    #[must_use]
    pub fn consume(&mut self) -> bool {
        if self.granted == 0 {
            return false;
        }
        self.granted -= 1;
        self.armed = false;
        true
    }
}

impl Session {
    /// Register all control buffers with the protection domain.
    pub(crate) fn register_control(&mut self) -> Result<()> {
        let pd = self.pd_handle()?;
        for slot in self.slots.iter_mut() {
            let perm = Permission::LOCAL_WRITE | Permission::REMOTE_WRITE | Permission::REMOTE_READ;
            // SAFETY: the slot buffer lives until session teardown, which
            // deregisters before freeing.
            let mr = unsafe { IbvMr::reg(pd, slot.buf.as_mut_ptr(), slot.buf.len(), perm) }?;
            slot.mr = Some(mr);
        }
        Ok(())
    }

    /// Post a RECV covering the whole buffer of `slot`.
    pub(crate) fn post_recv_control(&mut self, slot: usize) -> Result<()> {
        let qp = self.qp_handle()?;
        let s = &self.slots[slot];
        let mr = s.mr.ok_or_else(|| Error::Fatal("control buffer not registered".into()))?;

        let mut sge = ibv_sge {
            addr: s.buf.as_ptr() as u64,
            length: s.buf.len() as u32,
            lkey: mr.lkey(),
        };
        // SAFETY: POD type.
        let mut wr = unsafe { mem::zeroed::<ibv_recv_wr>() };
        wr.wr_id = WrId::CtrlRecv(slot).to_raw();
        wr.sg_list = &mut sge;
        wr.num_sge = 1;

        qp.post_recv(&mut wr)?;
        Ok(())
    }

    /// Stage `head` + `data` in the send slot, post the SEND, and wait
    /// for its completion. Control SENDs are always signaled.
    pub(crate) fn post_send_control(&mut self, head: &ControlHeader, data: &[u8]) -> Result<()> {
        let qp = self.qp_handle()?;

        if head.len as usize != data.len() {
            return Err(Error::Fatal(format!(
                "control header announces {} bytes, payload holds {}",
                head.len,
                data.len()
            )));
        }

        let total = CONTROL_HEADER_SIZE + data.len();
        let slot = &mut self.slots[SLOT_SEND];
        if total > slot.buf.len() {
            return Err(Error::Protocol(format!(
                "control message of {total} bytes exceeds the control buffer"
            )));
        }

        log::trace!("control: sending {:?} ({} bytes)", head.kind, head.len);

        slot.buf[..CONTROL_HEADER_SIZE].copy_from_slice(&head.encode());
        slot.buf[CONTROL_HEADER_SIZE..total].copy_from_slice(data);

        let mr = slot.mr.ok_or_else(|| Error::Fatal("control buffer not registered".into()))?;
        let mut sge = ibv_sge {
            addr: slot.buf.as_ptr() as u64,
            length: total as u32,
            lkey: mr.lkey(),
        };
        // SAFETY: POD type.
        let mut wr = unsafe { mem::zeroed::<ibv_send_wr>() };
        wr.wr_id = WrId::CtrlSend.to_raw();
        wr.opcode = ibv_wr_opcode::IBV_WR_SEND;
        wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;

        qp.post_send(&mut wr)?;
        self.wait_for_wrid(WrId::CtrlSend)
    }

    /// Wait for a RECV completion on `slot` and decode its header.
    pub(crate) fn wait_control_message(
        &mut self,
        slot: usize,
        expecting: Option<MessageType>,
    ) -> Result<ControlHeader> {
        self.wait_for_wrid(WrId::CtrlRecv(slot))?;

        let head = ControlHeader::decode(&self.slots[slot].buf)?;
        if head.len as usize > self.slots[slot].buf.len() - CONTROL_HEADER_SIZE {
            return Err(Error::Protocol(format!(
                "control message announces {} bytes, receive buffer holds {}",
                head.len,
                self.slots[slot].buf.len() - CONTROL_HEADER_SIZE
            )));
        }
        if let Some(want) = expecting {
            if head.kind != want {
                return Err(Error::Protocol(format!(
                    "was expecting a {:?} control message, got {:?} ({} bytes)",
                    want, head.kind, head.len
                )));
            }
        }
        log::trace!("control: received {:?} ({} bytes)", head.kind, head.len);
        Ok(head)
    }

    /// Point the slot's read cursor at the payload of the just-received
    /// message.
    pub(crate) fn move_header(&mut self, slot: usize, head: &ControlHeader) {
        self.slots[slot].open_payload(head.len as usize);
    }

    /// Unconsumed payload bytes of the last message on `slot`.
    pub(crate) fn control_payload(&self, slot: usize) -> &[u8] {
        self.slots[slot].remaining()
    }

    /// Copy buffered payload bytes into `out`, consuming them.
    pub(crate) fn fill_from_slot(&mut self, slot: usize, out: &mut [u8]) -> usize {
        self.slots[slot].fill(out)
    }

    /// Deliver one control message, READY-gated.
    ///
    /// If `response` is given, a look-ahead RECV is posted before the
    /// SEND and its completion is awaited, letting the peer piggy-back
    /// its reply without an extra READY round.
    pub(crate) fn exchange_send(
        &mut self,
        head: &ControlHeader,
        data: &[u8],
        response: Option<MessageType>,
    ) -> Result<Option<ControlHeader>> {
        if self.credits.armed() {
            if self.credits.awaiting() {
                let ready = self.wait_control_message(SLOT_READY, Some(MessageType::Ready))?;
                if !self.credits.consume() {
                    return Err(Error::Fatal("READY credit lost in flight".into()));
                }
                debug_assert_eq!(ready.len, 0);
            } else if !self.credits.consume() {
                return Err(Error::Fatal("SEND attempted without a READY credit".into()));
            }
        }

        if response.is_some() {
            self.post_recv_control(SLOT_RESPONSE)?;
        }

        // Replace the RECV consumed by the READY message.
        self.post_recv_control(SLOT_READY)?;

        self.post_send_control(head, data)?;

        let resp = match response {
            Some(kind) => {
                let head = self.wait_control_message(SLOT_RESPONSE, Some(kind))?;
                self.move_header(SLOT_RESPONSE, &head);
                Some(head)
            }
            None => None,
        };

        self.credits.arm();
        Ok(resp)
    }

    /// Receive one control message, granting the peer a credit first.
    pub(crate) fn exchange_recv(&mut self, expecting: Option<MessageType>) -> Result<ControlHeader> {
        let ready = ControlHeader::empty(MessageType::Ready);
        self.post_send_control(&ready, &[])?;

        let head = self.wait_control_message(SLOT_READY, expecting)?;
        self.move_header(SLOT_READY, &head);

        // Replace the RECV we just consumed.
        self.post_recv_control(SLOT_READY)?;
        Ok(head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_send_per_ready() {
        let mut credits = ReadyCredits::new();

        // Before the first READY is owed, sends are not gated.
        assert!(!credits.armed());

        credits.arm();
        assert!(credits.awaiting());

        // The pump observes the READY completion.
        credits.grant();
        assert!(!credits.awaiting());

        // Exactly one consume succeeds per grant.
        assert!(credits.consume());
        assert!(!credits.armed());
        assert!(!credits.consume());
    }

    #[test]
    fn early_grant_is_banked() {
        let mut credits = ReadyCredits::new();
        credits.arm();
        // READY observed while waiting on an unrelated completion.
        credits.grant();
        credits.consume().then_some(()).unwrap();
        credits.arm();
        assert!(credits.awaiting());
    }

    #[test]
    fn control_slot_cursor() {
        let mut slot = ControlSlot::new(64);
        slot.buf[CONTROL_HEADER_SIZE..CONTROL_HEADER_SIZE + 5].copy_from_slice(b"hello");
        slot.open_payload(5);
        assert_eq!(slot.remaining(), b"hello");

        // Bytes are handed out across multiple reads.
        let mut out = [0u8; 3];
        assert_eq!(slot.fill(&mut out), 3);
        assert_eq!(&out, b"hel");
        assert_eq!(slot.fill(&mut out), 2);
        assert_eq!(&out[..2], b"lo");
        assert_eq!(slot.fill(&mut out), 0);
    }
}
