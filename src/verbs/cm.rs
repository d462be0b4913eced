//! Connection manager event channel, ids, and events.

use std::ffi::CStr;
use std::io::{self, Error as IoError};
use std::net::SocketAddrV4;
use std::os::fd::RawFd;
use std::ptr::{self, NonNull};

use rdma_sys::*;

use crate::utils::interop::from_c_ret;

/// Wrapper for `*mut rdma_event_channel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct CmEventChannel(NonNull<rdma_event_channel>);

impl CmEventChannel {
    /// Create a new connection-manager event channel.
    pub fn new() -> io::Result<Self> {
        // SAFETY: FFI.
        let channel = unsafe { rdma_create_event_channel() };
        let channel = NonNull::new(channel).ok_or_else(IoError::last_os_error)?;
        Ok(Self(channel))
    }

    /// File descriptor of the channel, for readiness registration with a
    /// host event loop.
    #[inline]
    pub fn fd(&self) -> RawFd {
        // SAFETY: the pointed-to channel is valid.
        unsafe { (*self.as_ptr()).fd }
    }

    /// Block until the next connection-manager event arrives.
    ///
    /// The returned event must be acknowledged with [`CmEvent::ack`].
    pub fn get_event(&self) -> io::Result<CmEvent> {
        let mut event = ptr::null_mut();
        // SAFETY: FFI.
        let ret = unsafe { rdma_get_cm_event(self.as_ptr(), &mut event) };
        from_c_ret(ret)?;
        Ok(CmEvent(
            NonNull::new(event).ok_or_else(IoError::last_os_error)?,
        ))
    }

    /// Destroy the event channel.
    ///
    /// # Safety
    ///
    /// - A channel must not be destroyed more than once.
    /// - Destroyed channels must not be used anymore.
    pub unsafe fn destroy(self) {
        // SAFETY: FFI.
        rdma_destroy_event_channel(self.as_ptr());
    }
}

impl_raw_handle!(rdma_event_channel, CmEventChannel);

/// Wrapper for `*mut rdma_cm_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct CmId(NonNull<rdma_cm_id>);

impl CmId {
    /// Create a connection-manager id on the given channel, using the
    /// reliable-connection (TCP) port space.
    pub fn create(channel: &CmEventChannel) -> io::Result<Self> {
        let mut id = ptr::null_mut();
        // SAFETY: FFI.
        let ret = unsafe {
            rdma_create_id(
                channel.as_ptr(),
                &mut id,
                ptr::null_mut(),
                rdma_port_space::RDMA_PS_TCP,
            )
        };
        from_c_ret(ret)?;
        Ok(Self(NonNull::new(id).ok_or_else(IoError::last_os_error)?))
    }

    /// Wrap an id handed out by a connection event.
    pub fn from_event(raw: *mut rdma_cm_id) -> io::Result<Self> {
        NonNull::new(raw)
            .map(Self)
            .ok_or_else(|| IoError::other("connection event carried no cm id"))
    }

    /// Resolve the peer address into an RDMA device binding.
    pub fn resolve_addr(&self, dst: SocketAddrV4, timeout_ms: i32) -> io::Result<()> {
        let mut sin = sockaddr_in_from(dst);
        // SAFETY: FFI.
        let ret = unsafe {
            rdma_resolve_addr(
                self.as_ptr(),
                ptr::null_mut(),
                (&mut sin as *mut libc::sockaddr_in).cast(),
                timeout_ms,
            )
        };
        from_c_ret(ret)
    }

    /// Resolve a route to the already-resolved peer address.
    pub fn resolve_route(&self, timeout_ms: i32) -> io::Result<()> {
        // SAFETY: FFI.
        let ret = unsafe { rdma_resolve_route(self.as_ptr(), timeout_ms) };
        from_c_ret(ret)
    }

    /// Bind to a local address for listening.
    pub fn bind_addr(&self, addr: SocketAddrV4) -> io::Result<()> {
        let mut sin = sockaddr_in_from(addr);
        // SAFETY: FFI.
        let ret =
            unsafe { rdma_bind_addr(self.as_ptr(), (&mut sin as *mut libc::sockaddr_in).cast()) };
        from_c_ret(ret)
    }

    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        // SAFETY: FFI.
        let ret = unsafe { rdma_listen(self.as_ptr(), backlog) };
        from_c_ret(ret)
    }

    pub fn connect(&self, param: &mut rdma_conn_param) -> io::Result<()> {
        // SAFETY: FFI.
        let ret = unsafe { rdma_connect(self.as_ptr(), param) };
        from_c_ret(ret)
    }

    pub fn accept(&self, param: &mut rdma_conn_param) -> io::Result<()> {
        // SAFETY: FFI.
        let ret = unsafe { rdma_accept(self.as_ptr(), param) };
        from_c_ret(ret)
    }

    pub fn disconnect(&self) -> io::Result<()> {
        // SAFETY: FFI.
        let ret = unsafe { rdma_disconnect(self.as_ptr()) };
        from_c_ret(ret)
    }

    /// Verbs context bound to this id. Null until the address is resolved
    /// (client) or the first connection request arrives (server).
    #[inline]
    pub fn verbs(&self) -> *mut ibv_context {
        // SAFETY: the pointed-to id is valid.
        unsafe { (*self.as_ptr()).verbs }
    }

    /// Queue pair created on this id, if any.
    #[inline]
    pub fn qp(&self) -> *mut ibv_qp {
        // SAFETY: the pointed-to id is valid.
        unsafe { (*self.as_ptr()).qp }
    }

    /// Destroy the id.
    ///
    /// # Safety
    ///
    /// - An id must not be destroyed more than once.
    /// - Destroyed ids must not be used anymore.
    pub unsafe fn destroy(self) -> io::Result<()> {
        // SAFETY: FFI.
        let ret = rdma_destroy_id(self.as_ptr());
        from_c_ret(ret)
    }
}

impl_raw_handle!(rdma_cm_id, CmId);

/// A connection-manager event. Must be acknowledged exactly once.
pub(crate) struct CmEvent(NonNull<rdma_cm_event>);

impl CmEvent {
    #[inline]
    pub fn kind(&self) -> rdma_cm_event_type::Type {
        // SAFETY: the pointed-to event is valid until acked.
        unsafe { (*self.0.as_ptr()).event }
    }

    /// Human-readable event name, for diagnostics.
    pub fn kind_str(&self) -> &'static str {
        // SAFETY: FFI; librdmacm returns static strings.
        unsafe { CStr::from_ptr(rdma_event_str(self.kind())) }
            .to_str()
            .unwrap_or("unknown")
    }

    /// Connection id the event refers to (the new id for connect requests).
    #[inline]
    pub fn id(&self) -> *mut rdma_cm_id {
        // SAFETY: the pointed-to event is valid until acked.
        unsafe { (*self.0.as_ptr()).id }
    }

    /// Copy out the connection private data, if the peer attached at least
    /// `len` bytes.
    pub fn conn_private_data(&self, len: usize) -> Option<Vec<u8>> {
        // SAFETY: the pointed-to event is valid until acked; for connect
        // request/response events `param.conn` is the active union member.
        unsafe {
            let conn = &(*self.0.as_ptr()).param.conn;
            if conn.private_data.is_null() || (conn.private_data_len as usize) < len {
                return None;
            }
            let data = std::slice::from_raw_parts(conn.private_data as *const u8, len);
            Some(data.to_vec())
        }
    }

    /// Acknowledge and release the event.
    pub fn ack(self) -> io::Result<()> {
        // SAFETY: FFI; ack consumes the event exactly once.
        let ret = unsafe { rdma_ack_cm_event(self.0.as_ptr()) };
        from_c_ret(ret)
    }
}

/// Build a `sockaddr_in` for the CM calls.
fn sockaddr_in_from(addr: SocketAddrV4) -> libc::sockaddr_in {
    // SAFETY: POD type.
    let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_port = addr.port().to_be();
    sin.sin_addr.s_addr = u32::from(*addr.ip()).to_be();
    sin
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_layout() {
        let sin = sockaddr_in_from("192.168.1.2:4444".parse().unwrap());
        assert_eq!(sin.sin_family, libc::AF_INET as libc::sa_family_t);
        assert_eq!(u16::from_be(sin.sin_port), 4444);
        assert_eq!(u32::from_be(sin.sin_addr.s_addr), 0xc0a8_0102);
    }
}
