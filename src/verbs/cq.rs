//! Completion queue and completion channel.

use std::ffi::CStr;
use std::io::{self, Error as IoError};
use std::os::fd::RawFd;
use std::ptr::{self, NonNull};

use rdma_sys::*;

use crate::utils::interop::{from_c_err, from_c_ret};

/// Wrapper for `*mut ibv_comp_channel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct IbvCompChannel(NonNull<ibv_comp_channel>);

impl IbvCompChannel {
    /// Create a completion channel for blocking CQ waits.
    pub fn create(ctx: *mut ibv_context) -> io::Result<Self> {
        // SAFETY: FFI.
        let channel = unsafe { ibv_create_comp_channel(ctx) };
        let channel = NonNull::new(channel).ok_or_else(IoError::last_os_error)?;
        Ok(Self(channel))
    }

    #[allow(dead_code)]
    #[inline]
    pub fn fd(&self) -> RawFd {
        // SAFETY: the pointed-to channel is valid.
        unsafe { (*self.as_ptr()).fd }
    }

    /// Block until a CQ on this channel raises a completion event.
    /// The event must later be acknowledged with [`IbvCq::ack_events`].
    pub fn get_event(&self) -> io::Result<*mut ibv_cq> {
        let mut cq = ptr::null_mut();
        let mut cq_ctx = ptr::null_mut();
        // SAFETY: FFI.
        let ret = unsafe { ibv_get_cq_event(self.as_ptr(), &mut cq, &mut cq_ctx) };
        from_c_ret(ret)?;
        Ok(cq)
    }

    /// Destroy the completion channel.
    ///
    /// # Safety
    ///
    /// - A channel must not be destroyed more than once.
    /// - Destroyed channels must not be used anymore.
    pub unsafe fn destroy(self) -> io::Result<()> {
        // SAFETY: FFI.
        let ret = ibv_destroy_comp_channel(self.as_ptr());
        from_c_ret(ret)
    }
}

impl_raw_handle!(ibv_comp_channel, IbvCompChannel);

/// Wrapper for `*mut ibv_cq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct IbvCq(NonNull<ibv_cq>);

impl IbvCq {
    /// Create a completion queue of the given depth, optionally bound to a
    /// completion channel.
    pub fn create(
        ctx: *mut ibv_context,
        capacity: u32,
        channel: Option<IbvCompChannel>,
    ) -> io::Result<Self> {
        let channel = channel.map_or(ptr::null_mut(), |c| c.as_ptr());
        // SAFETY: FFI.
        let cq = unsafe { ibv_create_cq(ctx, capacity as i32, ptr::null_mut(), channel, 0) };
        let cq = NonNull::new(cq).ok_or_else(IoError::last_os_error)?;
        Ok(Self(cq))
    }

    /// Arm completion notification on the bound channel.
    pub fn req_notify(&self) -> io::Result<()> {
        // SAFETY: FFI.
        let ret = unsafe { ibv_req_notify_cq(self.as_ptr(), 0) };
        from_c_ret(ret)
    }

    /// Non-blockingly poll one work completion into `wc`.
    /// Return whether a completion was polled.
    #[inline]
    pub fn poll_one(&self, wc: &mut ibv_wc) -> io::Result<bool> {
        // SAFETY: FFI.
        let num = unsafe { ibv_poll_cq(self.as_ptr(), 1, wc) };
        match num {
            0 => Ok(false),
            1 => Ok(true),
            _ => from_c_err(num),
        }
    }

    /// Acknowledge `num` completion channel events on this CQ.
    pub fn ack_events(&self, num: u32) {
        // SAFETY: FFI.
        unsafe { ibv_ack_cq_events(self.as_ptr(), num) };
    }

    /// Destroy the CQ.
    ///
    /// # Safety
    ///
    /// - A CQ must not be destroyed more than once.
    /// - Destroyed CQs must not be used anymore.
    pub unsafe fn destroy(self) -> io::Result<()> {
        // SAFETY: FFI.
        let ret = ibv_destroy_cq(self.as_ptr());
        from_c_ret(ret)
    }
}

impl_raw_handle!(ibv_cq, IbvCq);

/// Human-readable work completion status, for diagnostics.
pub(crate) fn wc_status_str(status: ibv_wc_status::Type) -> String {
    // SAFETY: FFI; libibverbs returns static strings.
    unsafe { CStr::from_ptr(ibv_wc_status_str(status)) }
        .to_str()
        .unwrap_or("unknown")
        .to_owned()
}
