//! Memory regions and access permissions.

use std::ffi::c_void;
use std::io::{self, Error as IoError};
use std::ops::{BitOr, BitOrAssign};
use std::ptr::NonNull;

use rdma_sys::*;

use super::pd::IbvPd;
use crate::utils::interop::from_c_ret;

/// Memory region access permissions.
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub(crate) struct Permission(ibv_access_flags);

impl Permission {
    pub const EMPTY: Self = Self(ibv_access_flags(0));
    pub const LOCAL_WRITE: Self = Self(ibv_access_flags::IBV_ACCESS_LOCAL_WRITE);
    pub const REMOTE_READ: Self = Self(ibv_access_flags::IBV_ACCESS_REMOTE_READ);
    pub const REMOTE_WRITE: Self = Self(ibv_access_flags::IBV_ACCESS_REMOTE_WRITE);
}

impl From<Permission> for i32 {
    fn from(p: Permission) -> Self {
        p.0 .0 as _
    }
}

impl BitOr for Permission {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Permission {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Wrapper for `*mut ibv_mr`.
///
/// The wrapper does not own the registered memory, only the registration.
/// The memory area must outlive the registration; releasing it is the
/// session's teardown responsibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct IbvMr(NonNull<ibv_mr>);

impl IbvMr {
    /// Register `[addr, addr + len)` with the given protection domain.
    ///
    /// # Safety
    ///
    /// The memory area must stay valid until the region is deregistered.
    pub unsafe fn reg(
        pd: IbvPd,
        addr: *mut u8,
        len: usize,
        perm: Permission,
    ) -> io::Result<Self> {
        // SAFETY: FFI.
        let mr = ibv_reg_mr(pd.as_ptr(), addr as *mut c_void, len, perm.into());
        let mr = NonNull::new(mr).ok_or_else(IoError::last_os_error)?;
        Ok(Self(mr))
    }

    /// Get the local key of the memory region.
    #[inline]
    pub fn lkey(&self) -> u32 {
        // SAFETY: the `ibv_mr` instance is valid.
        unsafe { (*self.as_ptr()).lkey }
    }

    /// Get the remote key of the memory region.
    #[inline]
    pub fn rkey(&self) -> u32 {
        // SAFETY: the `ibv_mr` instance is valid.
        unsafe { (*self.as_ptr()).rkey }
    }

    /// Deregister the MR.
    ///
    /// # Safety
    ///
    /// - An MR must not be deregistered more than once.
    /// - Deregistered MRs must not be used anymore.
    pub unsafe fn dereg(self) -> io::Result<()> {
        // SAFETY: FFI.
        let ret = ibv_dereg_mr(self.as_ptr());
        from_c_ret(ret)
    }
}

impl_raw_handle!(ibv_mr, IbvMr);
