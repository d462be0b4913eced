//! Protection domain.

use std::io::{self, Error as IoError};
use std::ptr::NonNull;

use rdma_sys::*;

use crate::utils::interop::from_c_ret;

/// Wrapper for `*mut ibv_pd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct IbvPd(NonNull<ibv_pd>);

impl IbvPd {
    /// Allocate a protection domain on the given device context.
    pub fn alloc(ctx: *mut ibv_context) -> io::Result<Self> {
        // SAFETY: FFI.
        let pd = unsafe { ibv_alloc_pd(ctx) };
        let pd = NonNull::new(pd).ok_or_else(IoError::last_os_error)?;
        Ok(Self(pd))
    }

    /// Deallocate the PD.
    ///
    /// # Safety
    ///
    /// - A PD must not be deallocated more than once.
    /// - Deallocated PDs must not be used anymore.
    pub unsafe fn dealloc(self) -> io::Result<()> {
        // SAFETY: FFI.
        let ret = ibv_dealloc_pd(self.as_ptr());
        from_c_ret(ret)
    }
}

impl_raw_handle!(ibv_pd, IbvPd);
