//! Queue pair.

use std::io::{self, Error as IoError};
use std::mem;
use std::ptr::NonNull;

use rdma_sys::*;

use super::cm::CmId;
use super::cq::IbvCq;
use super::pd::IbvPd;
use crate::utils::interop::from_c_ret;

/// Receive work request depth. The control channel keeps at most two
/// RECVs outstanding (current and look-ahead), plus one slack slot.
pub(crate) const RECV_WR_DEPTH: u32 = 3;

/// Wrapper for `*mut ibv_qp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct IbvQp(NonNull<ibv_qp>);

impl IbvQp {
    /// Create a reliable-connected queue pair on a connection-manager id.
    ///
    /// The connection manager drives the QP state transitions itself, so
    /// the returned QP needs no manual RESET/INIT/RTR/RTS handling.
    pub fn create_on(cm_id: &CmId, pd: IbvPd, cq: IbvCq, send_depth: u32) -> io::Result<Self> {
        // SAFETY: POD type.
        let mut attr = unsafe { mem::zeroed::<ibv_qp_init_attr>() };
        attr.cap.max_send_wr = send_depth;
        attr.cap.max_recv_wr = RECV_WR_DEPTH;
        attr.cap.max_send_sge = 1;
        attr.cap.max_recv_sge = 1;
        attr.send_cq = cq.as_ptr();
        attr.recv_cq = cq.as_ptr();
        attr.qp_type = ibv_qp_type::IBV_QPT_RC;

        // SAFETY: FFI.
        let ret = unsafe { rdma_create_qp(cm_id.as_ptr(), pd.as_ptr(), &mut attr) };
        from_c_ret(ret)?;

        NonNull::new(cm_id.qp())
            .map(Self)
            .ok_or_else(IoError::last_os_error)
    }

    /// Post a send-queue work request.
    ///
    /// A full send queue surfaces as `ENOMEM`; the write engine recovers
    /// from that by waiting for a completion and retrying.
    #[inline]
    pub fn post_send(&self, wr: &mut ibv_send_wr) -> io::Result<()> {
        let mut bad_wr = std::ptr::null_mut();
        // SAFETY: FFI; the SGE list outlives the call.
        let ret = unsafe { ibv_post_send(self.as_ptr(), wr, &mut bad_wr) };
        from_c_ret(ret)
    }

    /// Post a receive-queue work request.
    #[inline]
    pub fn post_recv(&self, wr: &mut ibv_recv_wr) -> io::Result<()> {
        let mut bad_wr = std::ptr::null_mut();
        // SAFETY: FFI; the SGE list outlives the call.
        let ret = unsafe { ibv_post_recv(self.as_ptr(), wr, &mut bad_wr) };
        from_c_ret(ret)
    }

    /// Destroy the QP.
    ///
    /// # Safety
    ///
    /// - A QP must not be destroyed more than once.
    /// - Destroyed QPs must not be used anymore.
    pub unsafe fn destroy(self) -> io::Result<()> {
        // SAFETY: FFI.
        let ret = ibv_destroy_qp(self.as_ptr());
        from_c_ret(ret)
    }
}

impl_raw_handle!(ibv_qp, IbvQp);
