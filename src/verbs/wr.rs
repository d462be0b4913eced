//! Work request identifiers.
//!
//! Completions are dispatched by the class of the work request they
//! belong to. The class is a tagged enum everywhere in the crate; the
//! reserved integer encoding below exists only at the verbs boundary,
//! where `ibv_send_wr::wr_id` is a bare `u64`.

/// Work request classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WrId {
    /// A coalesced RAM write.
    RdmaWrite,
    /// A control-channel SEND.
    CtrlSend,
    /// A control-channel RECV on the given buffer slot.
    CtrlRecv(usize),
}

const RDMA_WRITE_BASE: u64 = 1;
const CTRL_SEND_BASE: u64 = 1000;
const CTRL_RECV_BASE: u64 = 2000;

impl WrId {
    /// Encode for the verbs boundary.
    #[inline]
    pub fn to_raw(self) -> u64 {
        match self {
            WrId::RdmaWrite => RDMA_WRITE_BASE,
            WrId::CtrlSend => CTRL_SEND_BASE,
            WrId::CtrlRecv(slot) => CTRL_RECV_BASE + slot as u64,
        }
    }

    /// Decode a completed work request id. Unknown encodings yield `None`.
    #[inline]
    pub fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            RDMA_WRITE_BASE => Some(WrId::RdmaWrite),
            CTRL_SEND_BASE => Some(WrId::CtrlSend),
            x if x >= CTRL_RECV_BASE => Some(WrId::CtrlRecv((x - CTRL_RECV_BASE) as usize)),
            _ => None,
        }
    }

    /// Whether this id is a control RECV on any slot.
    #[inline]
    pub fn is_ctrl_recv(self) -> bool {
        matches!(self, WrId::CtrlRecv(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_encoding() {
        assert_eq!(WrId::RdmaWrite.to_raw(), 1);
        assert_eq!(WrId::CtrlSend.to_raw(), 1000);
        assert_eq!(WrId::CtrlRecv(0).to_raw(), 2000);
        assert_eq!(WrId::CtrlRecv(1).to_raw(), 2001);
    }

    #[test]
    fn raw_roundtrip() {
        for wrid in [
            WrId::RdmaWrite,
            WrId::CtrlSend,
            WrId::CtrlRecv(0),
            WrId::CtrlRecv(2),
        ] {
            assert_eq!(WrId::from_raw(wrid.to_raw()), Some(wrid));
        }
        assert_eq!(WrId::from_raw(0), None);
        assert_eq!(WrId::from_raw(17), None);
    }

    #[test]
    fn ctrl_recv_class() {
        assert!(WrId::CtrlRecv(1).is_ctrl_recv());
        assert!(!WrId::CtrlSend.is_ctrl_recv());
    }
}
