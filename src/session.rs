//! Migration session: connection lifecycle and resource ownership.

use std::array;
use std::io::Error as IoError;
use std::mem;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::os::fd::RawFd;

use rdma_sys::*;

use crate::config::Config;
use crate::control::{ControlSlot, ReadyCredits, CONTROL_SLOT_COUNT, SLOT_READY, SLOT_RESPONSE};
use crate::error::{Error, Result};
use crate::proto::{
    decode_directory, encode_directory, Capabilities, ControlHeader, MessageType,
    CAP_CHUNK_REGISTER,
};
use crate::ram::{LocalBlocks, RamBlockInfo};
use crate::verbs::cm::{CmEvent, CmEventChannel, CmId};
use crate::verbs::cq::{IbvCompChannel, IbvCq};
use crate::verbs::mr::Permission;
use crate::verbs::pd::IbvPd;
use crate::verbs::qp::IbvQp;
use crate::write::{Coalescer, SignalBatch};

/// Caller-provided probe reporting whether a page is all zero.
pub type ZeroProbe = fn(&[u8]) -> bool;

/// Lifecycle of a migration session. Failure in any state funnels into
/// `Closed` through full teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    Init,
    Resolving,
    PdCqQp,
    BlocksRegistered,
    Connected,
    Streaming,
    Draining,
    Closed,
}

/// One end of a migration transport.
///
/// The session exclusively owns every verbs handle and buffer it
/// creates. There is no interior `Drop` per resource: teardown releases
/// everything in one strict order and tolerates absent handles, because
/// it runs from every error path.
pub(crate) struct Session {
    pub config: Config,
    host: String,
    port: u16,

    /// Negotiated registration mode: chunks on demand vs. whole blocks.
    pub chunk_register: bool,
    state: SessionState,

    channel: Option<CmEventChannel>,
    listen_id: Option<CmId>,
    cm_id: Option<CmId>,
    verbs: *mut ibv_context,
    pd: Option<IbvPd>,
    comp_channel: Option<IbvCompChannel>,
    cq: Option<IbvCq>,
    qp: Option<IbvQp>,

    pub slots: [ControlSlot; CONTROL_SLOT_COUNT],
    pub credits: ReadyCredits,
    pub blocks: LocalBlocks,
    pub batch: SignalBatch,
    pub coalescer: Coalescer,
    pub zero_probe: Option<ZeroProbe>,
}

impl Session {
    pub fn new(
        host_port: &str,
        config: Config,
        chunk_register: bool,
        ram: impl IntoIterator<Item = RamBlockInfo>,
        zero_probe: Option<ZeroProbe>,
    ) -> Result<Self> {
        config.validate()?;
        let (host, port) = parse_host_port(host_port)?;
        let blocks = LocalBlocks::new(ram, config.chunk_shift)?;
        let slots = array::from_fn(|_| ControlSlot::new(config.control_max_buffer));

        Ok(Self {
            host,
            port,
            chunk_register,
            state: SessionState::Init,
            channel: None,
            listen_id: None,
            cm_id: None,
            verbs: std::ptr::null_mut(),
            pd: None,
            comp_channel: None,
            cq: None,
            qp: None,
            slots,
            credits: ReadyCredits::new(),
            blocks,
            batch: SignalBatch::new(config.unsignaled_max),
            coalescer: Coalescer::new(config.merge_max),
            zero_probe,
            config,
        })
    }

    pub(crate) fn transition(&mut self, next: SessionState) {
        if self.state != next {
            log::trace!("session state {:?} -> {next:?}", self.state);
            self.state = next;
        }
    }

    pub(crate) fn pd_handle(&self) -> Result<IbvPd> {
        self.pd
            .ok_or_else(|| Error::Fatal("protection domain not allocated".into()))
    }

    pub(crate) fn cq_handle(&self) -> Result<IbvCq> {
        self.cq
            .ok_or_else(|| Error::Fatal("completion queue not created".into()))
    }

    pub(crate) fn qp_handle(&self) -> Result<IbvQp> {
        self.qp
            .ok_or_else(|| Error::Fatal("queue pair not created".into()))
    }

    #[cfg(not(feature = "busy-poll"))]
    pub(crate) fn comp_channel_handle(&self) -> Result<IbvCompChannel> {
        self.comp_channel
            .ok_or_else(|| Error::Fatal("completion channel not created".into()))
    }

    /// File descriptor of the CM event channel, for host event loops.
    pub fn channel_fd(&self) -> Option<RawFd> {
        self.channel.map(|c| c.fd())
    }

    fn listen_addr(&self) -> Result<SocketAddrV4> {
        if self.host.is_empty() {
            return Ok(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.port));
        }
        lookup_ipv4(&self.host, self.port)
    }

    /// Wait for the next CM event and require it to be of kind `want`.
    /// The event is returned unacknowledged when data must be read first.
    fn expect_cm_event(&mut self, want: rdma_cm_event_type::Type) -> Result<CmEvent> {
        let channel = self
            .channel
            .ok_or_else(|| Error::Fatal("no CM event channel".into()))?;
        let event = channel.get_event()?;
        if event.kind() != want {
            let got = event.kind_str();
            let _ = event.ack();
            return Err(Error::Transport(IoError::other(format!(
                "unexpected connection event: {got}"
            ))));
        }
        Ok(event)
    }

    /// Resolve the peer address and route (source side).
    fn resolve_host(&mut self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::Config("migration peer hostname is not set".into()));
        }
        let dst = lookup_ipv4(&self.host, self.port)?;
        log::info!("resolving migration peer {}:{} => {dst}", self.host, self.port);

        let channel = CmEventChannel::new()?;
        self.channel = Some(channel);
        let cm_id = CmId::create(&channel)?;
        self.cm_id = Some(cm_id);
        self.transition(SessionState::Resolving);

        cm_id.resolve_addr(dst, self.config.resolve_timeout_ms)?;
        self.expect_cm_event(rdma_cm_event_type::RDMA_CM_EVENT_ADDR_RESOLVED)?
            .ack()?;

        cm_id.resolve_route(self.config.resolve_timeout_ms)?;
        self.expect_cm_event(rdma_cm_event_type::RDMA_CM_EVENT_ROUTE_RESOLVED)?
            .ack()?;

        self.verbs = cm_id.verbs();
        Ok(())
    }

    /// Allocate the protection domain, completion channel, and CQ.
    fn alloc_pd_cq(&mut self) -> Result<()> {
        let pd = IbvPd::alloc(self.verbs)?;
        self.pd = Some(pd);

        let channel = if cfg!(feature = "busy-poll") {
            None
        } else {
            match IbvCompChannel::create(self.verbs) {
                Ok(c) => Some(c),
                Err(e) => {
                    // Release the partial acquisition in reverse order.
                    // SAFETY: allocated above, deallocated once.
                    let _ = unsafe { pd.dealloc() };
                    self.pd = None;
                    return Err(e.into());
                }
            }
        };
        self.comp_channel = channel;

        match IbvCq::create(self.verbs, self.config.cq_size(), self.comp_channel) {
            Ok(cq) => self.cq = Some(cq),
            Err(e) => {
                if let Some(c) = self.comp_channel.take() {
                    // SAFETY: created above, destroyed once.
                    let _ = unsafe { c.destroy() };
                }
                if let Some(pd) = self.pd.take() {
                    // SAFETY: allocated above, deallocated once.
                    let _ = unsafe { pd.dealloc() };
                }
                return Err(e.into());
            }
        }
        Ok(())
    }

    fn alloc_qp(&mut self) -> Result<()> {
        let cm_id = self
            .cm_id
            .ok_or_else(|| Error::Fatal("no connection id".into()))?;
        let qp = IbvQp::create_on(&cm_id, self.pd_handle()?, self.cq_handle()?, self.config.qp_size)?;
        self.qp = Some(qp);
        self.transition(SessionState::PdCqQp);
        Ok(())
    }

    /// Source-side setup: resolve the peer, stand up verbs resources,
    /// and pre-register what the negotiated-mode candidate requires.
    pub fn source_init(&mut self) -> Result<()> {
        self.resolve_host()?;
        self.alloc_pd_cq()?;
        self.alloc_qp()?;

        if !self.chunk_register {
            // Whole-block mode drives one-sided WRITEs from these MRs;
            // local read access is all the source needs.
            self.blocks
                .register_whole(self.pd_handle()?, Permission::REMOTE_READ)?;
        }
        self.register_control()?;
        self.transition(SessionState::BlocksRegistered);
        Ok(())
    }

    /// Connect and negotiate capabilities, then consume the destination's
    /// RAM block directory.
    pub fn connect(&mut self) -> Result<()> {
        let cm_id = self
            .cm_id
            .ok_or_else(|| Error::Fatal("no connection id".into()))?;

        let mut flags = 0;
        if self.chunk_register {
            log::info!("requesting dynamic chunk registration from the destination");
            flags |= CAP_CHUNK_REGISTER;
        }
        let wire = Capabilities::new(flags).encode();

        // SAFETY: POD type.
        let mut param = unsafe { mem::zeroed::<rdma_conn_param>() };
        param.private_data = wire.as_ptr().cast();
        param.private_data_len = wire.len() as u8;
        param.initiator_depth = 2;
        param.retry_count = 5;

        cm_id.connect(&mut param)?;

        let event = self.expect_cm_event(rdma_cm_event_type::RDMA_CM_EVENT_ESTABLISHED)?;
        let blob = event.conn_private_data(Capabilities::WIRE_SIZE);
        event.ack()?;

        let echoed = Capabilities::decode(&blob.ok_or_else(|| {
            Error::Protocol("destination acknowledged without capabilities".into())
        })?)?;
        if self.chunk_register && echoed.flags & CAP_CHUNK_REGISTER == 0 {
            log::warn!("destination cannot chunk-register; falling back to whole-block mode");
            self.chunk_register = false;
        }
        log::info!(
            "chunk registration {}",
            if self.chunk_register { "enabled" } else { "disabled" }
        );

        // Two RECVs go up front: slot 1 catches the directory the
        // destination sends immediately after ESTABLISHED, slot 0
        // catches its first READY token.
        self.post_recv_control(SLOT_RESPONSE)?;
        self.post_recv_control(SLOT_READY)?;

        let head = self.wait_control_message(SLOT_RESPONSE, Some(MessageType::RamBlocks))?;
        self.move_header(SLOT_RESPONSE, &head);
        let entries = decode_directory(self.control_payload(SLOT_RESPONSE))?;
        self.blocks.apply_remote_entries(&entries)?;

        if self.chunk_register {
            self.blocks.alloc_remote_key_caches();
        }

        self.credits.arm();
        self.transition(SessionState::Connected);
        Ok(())
    }

    /// Destination-side setup: bind and listen. The verbs context is
    /// generally unknown until the first connection request, so all
    /// verbs resources wait until [`Session::accept`].
    pub fn server_init(&mut self) -> Result<()> {
        let channel = CmEventChannel::new()?;
        self.channel = Some(channel);
        let listen_id = CmId::create(&channel)?;
        self.listen_id = Some(listen_id);

        let addr = self.listen_addr()?;
        listen_id.bind_addr(addr)?;
        listen_id.listen(5)?;
        self.verbs = listen_id.verbs();

        log::info!("listening for an incoming migration on {addr}");
        self.transition(SessionState::Resolving);
        Ok(())
    }

    /// Accept one migration connection: negotiate capabilities, stand up
    /// verbs resources on the requester's device, and send the RAM
    /// block directory.
    pub fn accept(&mut self) -> Result<()> {
        let event =
            self.expect_cm_event(rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_REQUEST)?;
        let blob = event.conn_private_data(Capabilities::WIRE_SIZE);
        let id = event.id();
        event.ack()?;

        let requested = Capabilities::decode(&blob.ok_or_else(|| {
            Error::Protocol("connection request carried no capabilities".into())
        })?)?;
        self.chunk_register = requested.flags & CAP_CHUNK_REGISTER != 0;
        log::info!(
            "chunk registration {}",
            if self.chunk_register { "enabled" } else { "disabled" }
        );

        let cm_id = CmId::from_event(id)?;
        self.cm_id = Some(cm_id);
        self.verbs = cm_id.verbs();

        self.alloc_pd_cq()?;
        self.register_control()?;
        self.alloc_qp()?;

        let echo = requested.clamp(CAP_CHUNK_REGISTER);
        let wire = echo.encode();
        // SAFETY: POD type.
        let mut param = unsafe { mem::zeroed::<rdma_conn_param>() };
        param.private_data = wire.as_ptr().cast();
        param.private_data_len = wire.len() as u8;
        param.responder_resources = 2;

        cm_id.accept(&mut param)?;
        self.expect_cm_event(rdma_cm_event_type::RDMA_CM_EVENT_ESTABLISHED)?
            .ack()?;

        self.post_recv_control(SLOT_READY)?;

        if !self.chunk_register {
            self.blocks.register_whole(
                self.pd_handle()?,
                Permission::LOCAL_WRITE | Permission::REMOTE_WRITE,
            )?;
        }
        self.transition(SessionState::BlocksRegistered);

        let entries = self.blocks.export_entries();
        let payload = encode_directory(&entries);
        let head = ControlHeader::with_len(MessageType::RamBlocks, payload.len() as u32);
        self.post_send_control(&head, &payload)?;

        self.transition(SessionState::Connected);
        Ok(())
    }

    /// Tear the session down.
    ///
    /// Strict release order: disconnect, drain the CM event, free
    /// control MRs, deregister RAM MRs, then destroy QP, CQ, completion
    /// channel, PD, the CM ids, and the event channel. Each step
    /// tolerates an absent handle and logs (but never propagates) its
    /// failure, since teardown runs from every error path.
    pub fn cleanup(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        log::debug!("tearing down migration session");

        if let Some(cm_id) = self.cm_id {
            if cm_id.disconnect().is_ok() {
                if let Some(channel) = self.channel {
                    if let Ok(event) = channel.get_event() {
                        let _ = event.ack();
                    }
                }
            }
        }

        for (i, slot) in self.slots.iter_mut().enumerate() {
            if let Some(mr) = slot.mr.take() {
                // SAFETY: registered by us, deregistered once.
                if let Err(e) = unsafe { mr.dereg() } {
                    log::warn!("failed to deregister control buffer {i}: {e}");
                }
            }
        }

        self.blocks.deregister_all();

        if let Some(qp) = self.qp.take() {
            // SAFETY: created by us, destroyed once.
            if let Err(e) = unsafe { qp.destroy() } {
                log::warn!("failed to destroy QP: {e}");
            }
        }
        if let Some(cq) = self.cq.take() {
            // SAFETY: created by us, destroyed once.
            if let Err(e) = unsafe { cq.destroy() } {
                log::warn!("failed to destroy CQ: {e}");
            }
        }
        if let Some(channel) = self.comp_channel.take() {
            // SAFETY: created by us, destroyed once.
            if let Err(e) = unsafe { channel.destroy() } {
                log::warn!("failed to destroy completion channel: {e}");
            }
        }
        if let Some(pd) = self.pd.take() {
            // SAFETY: allocated by us, deallocated once.
            if let Err(e) = unsafe { pd.dealloc() } {
                log::warn!("failed to deallocate PD: {e}");
            }
        }
        if let Some(listen_id) = self.listen_id.take() {
            // SAFETY: created by us, destroyed once.
            if let Err(e) = unsafe { listen_id.destroy() } {
                log::warn!("failed to destroy listen id: {e}");
            }
        }
        if let Some(cm_id) = self.cm_id.take() {
            // SAFETY: created by us, destroyed once.
            if let Err(e) = unsafe { cm_id.destroy() } {
                log::warn!("failed to destroy connection id: {e}");
            }
        }
        if let Some(channel) = self.channel.take() {
            // SAFETY: created by us, destroyed once.
            unsafe { channel.destroy() };
        }

        self.verbs = std::ptr::null_mut();
        self.transition(SessionState::Closed);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Split a `host:port` migration address.
fn parse_host_port(s: &str) -> Result<(String, u16)> {
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| Error::Config(format!("bad migration address '{s}', expected host:port")))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| Error::Config(format!("bad port in migration address '{s}'")))?;
    Ok((host.to_owned(), port))
}

/// Resolve a hostname (or numeric address) to an IPv4 socket address.
fn lookup_ipv4(host: &str, port: u16) -> Result<SocketAddrV4> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::Config(format!("cannot resolve '{host}': {e}")))?;
    for addr in addrs {
        if let SocketAddr::V4(v4) = addr {
            return Ok(v4);
        }
    }
    Err(Error::Config(format!("no IPv4 address for '{host}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_port_parsing() {
        assert_eq!(
            parse_host_port("node7:4444").unwrap(),
            ("node7".to_owned(), 4444)
        );
        assert_eq!(
            parse_host_port("10.0.0.1:18515").unwrap(),
            ("10.0.0.1".to_owned(), 18515)
        );
        // Empty host means "listen on any address" for the destination.
        assert_eq!(parse_host_port(":4444").unwrap(), (String::new(), 4444));

        assert!(parse_host_port("node7").is_err());
        assert!(parse_host_port("node7:notaport").is_err());
        assert!(parse_host_port("node7:99999").is_err());
    }

    #[test]
    fn numeric_lookup() {
        let addr = lookup_ipv4("127.0.0.1", 7777).unwrap();
        assert_eq!(addr, "127.0.0.1:7777".parse().unwrap());
    }
}
