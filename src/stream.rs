//! Byte-stream surface handed to the outer migration driver.
//!
//! RDMA links do not carry a bytestream of their own: device state and
//! protocol commands travel as framed control SENDs, while guest RAM
//! bypasses the stream entirely through [`RdmaStream::save_page`].

use std::os::fd::RawFd;

use crate::config::Config;
use crate::control::SLOT_READY;
use crate::error::{Error, Result};
use crate::proto::{
    decode_register_commands, encode_register_results, ControlHeader, MessageType, STREAM_HOOK,
};
use crate::ram::RamBlockInfo;
use crate::session::{Session, ZeroProbe};

/// Open an outgoing migration transport towards `host_port`.
///
/// `chunk_register_destination` asks the destination to pin guest pages
/// on demand instead of pinning every block up front; the destination
/// may decline during capability negotiation. `ram` enumerates the
/// guest's RAM blocks and `zero_probe` reports all-zero pages, which
/// are then never transmitted in chunk mode.
pub fn start_outgoing(
    host_port: &str,
    chunk_register_destination: bool,
    ram: impl IntoIterator<Item = RamBlockInfo>,
    zero_probe: ZeroProbe,
    config: Config,
) -> Result<RdmaStream> {
    let mut session = Session::new(
        host_port,
        config,
        chunk_register_destination,
        ram,
        Some(zero_probe),
    )?;
    if let Err(e) = session.source_init().and_then(|_| session.connect()) {
        log::error!("outgoing migration setup failed: {e}");
        session.cleanup();
        return Err(e);
    }
    Ok(RdmaStream { session })
}

/// Bind and listen for one incoming migration on `host_port`.
///
/// An empty host (`":4444"`) listens on any address.
pub fn start_incoming(
    host_port: &str,
    ram: impl IntoIterator<Item = RamBlockInfo>,
    config: Config,
) -> Result<Incoming> {
    let mut session = Session::new(host_port, config, false, ram, None)?;
    if let Err(e) = session.server_init() {
        log::error!("incoming migration setup failed: {e}");
        session.cleanup();
        return Err(e);
    }
    Ok(Incoming { session })
}

/// A bound listener awaiting the source's connection.
pub struct Incoming {
    session: Session,
}

impl Incoming {
    /// File descriptor of the CM event channel. Register it for read
    /// readiness with the host event loop and call [`Incoming::accept`]
    /// when it fires; `accept` itself blocks until the connection is up.
    pub fn channel_fd(&self) -> Option<RawFd> {
        self.session.channel_fd()
    }

    /// Accept the migration connection and yield the reader stream.
    pub fn accept(mut self) -> Result<RdmaStream> {
        match self.session.accept() {
            Ok(()) => Ok(RdmaStream {
                session: self.session,
            }),
            Err(e) => {
                log::error!("failed to accept migration connection: {e}");
                self.session.cleanup();
                Err(e)
            }
        }
    }
}

/// The established transport, wearing a byte-stream interface.
pub struct RdmaStream {
    session: Session,
}

impl RdmaStream {
    /// Whether chunk registration survived capability negotiation.
    pub fn chunk_register(&self) -> bool {
        self.session.chunk_register
    }

    /// Tear the session down on any fatal error before surfacing it.
    /// `Capacity` never escapes the write engine, so everything that
    /// reaches here closes the transport.
    fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.session.cleanup();
        }
        result
    }

    /// Write byte-stream data, fragmenting into control SENDs.
    ///
    /// Queued RAM writes are pushed out first so stream data never
    /// overtakes the pages of the iteration it belongs to.
    pub fn put_buffer(&mut self, buf: &[u8]) -> Result<usize> {
        let result = self.put_inner(buf);
        self.guard(result)
    }

    fn put_inner(&mut self, buf: &[u8]) -> Result<usize> {
        self.session.write_flush()?;

        let mut sent = 0;
        while sent < buf.len() {
            let n = (buf.len() - sent).min(self.session.config.send_increment);
            let head = ControlHeader::with_len(MessageType::Stream, n as u32);
            self.session.exchange_send(&head, &buf[sent..sent + n], None)?;
            sent += n;
        }
        Ok(buf.len())
    }

    /// Read byte-stream data. Bytes left over from the previous frame
    /// are handed out first; once exhausted, blocks for the next frame.
    pub fn get_buffer(&mut self, buf: &mut [u8]) -> Result<usize> {
        let result = self.get_inner(buf);
        self.guard(result)
    }

    fn get_inner(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.session.fill_from_slot(SLOT_READY, buf);
        if n > 0 {
            return Ok(n);
        }

        self.session.exchange_recv(Some(MessageType::Stream))?;
        Ok(self.session.fill_from_slot(SLOT_READY, buf))
    }

    /// Queue one guest page for transmission via RDMA WRITE.
    ///
    /// Returns the page length once the page is accepted; the actual
    /// write may still be coalescing and is only guaranteed durable
    /// after [`RdmaStream::registration_stop`].
    pub fn save_page(
        &mut self,
        block_offset: u64,
        offset: u64,
        length: u64,
        host_va: *const u8,
    ) -> Result<usize> {
        let result = self.session.save_page(block_offset, offset, length, host_va);
        self.guard(result)
    }

    /// Source hook for the start of a RAM iteration: stamps the hook
    /// marker so the destination loader enters its registration loop.
    pub fn registration_start(&mut self) -> Result<()> {
        self.put_buffer(&STREAM_HOOK.to_be_bytes())?;
        Ok(())
    }

    /// Source hook for the end of a RAM iteration: drain every posted
    /// write, then release the destination from its registration loop.
    pub fn registration_stop(&mut self) -> Result<()> {
        let result = self.stop_inner();
        self.guard(result)
    }

    fn stop_inner(&mut self) -> Result<()> {
        self.session.drain()?;
        log::debug!("iteration drained, sending registration finish");
        let head = ControlHeader::empty(MessageType::RegisterFinished);
        self.session.exchange_send(&head, &[], None)?;
        Ok(())
    }

    /// Destination loop serving the source's dynamic registrations.
    ///
    /// Runs until the source signals the end of the iteration, answering
    /// each registration request with the rkeys of the pinned chunks.
    pub fn registration_handle(&mut self) -> Result<()> {
        let result = self.handle_inner();
        self.guard(result)
    }

    fn handle_inner(&mut self) -> Result<()> {
        loop {
            let head = self.session.exchange_recv(None)?;
            match head.kind {
                MessageType::RegisterFinished => {
                    log::debug!("registrations complete for this iteration");
                    return Ok(());
                }
                MessageType::RegisterRequest => {
                    let commands = decode_register_commands(
                        self.session.control_payload(SLOT_READY),
                        head.repeat,
                    )?;

                    let mut rkeys = Vec::with_capacity(commands.len());
                    for command in commands {
                        rkeys.push(self.register_for_peer(&command)?);
                    }

                    let payload = encode_register_results(&rkeys);
                    let mut resp =
                        ControlHeader::with_len(MessageType::RegisterResult, payload.len() as u32);
                    resp.repeat = rkeys.len() as u32;
                    // The result rides in place of the next READY token.
                    self.session.post_send_control(&resp, &payload)?;
                }
                MessageType::RegisterResult => {
                    return Err(Error::Protocol(
                        "registration result arrived at the destination".into(),
                    ));
                }
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected {other:?} message in the registration loop"
                    )));
                }
            }
        }
    }

    fn register_for_peer(&mut self, command: &crate::proto::RegisterCommand) -> Result<u32> {
        let block_index = command.block_index as usize;
        if block_index >= self.session.blocks.len() {
            return Err(Error::Protocol(format!(
                "registration request names block {block_index}, directory holds {}",
                self.session.blocks.len()
            )));
        }
        if !self
            .session
            .blocks
            .range_within_block(block_index, command.offset, command.len as u64)
        {
            return Err(Error::Protocol(format!(
                "registration request range [{:#x}, +{:#x}) escapes block {block_index}",
                command.offset, command.len
            )));
        }

        let host_addr = {
            let block = self.session.blocks.get(block_index);
            block.local_addr as u64 + (command.offset - block.guest_offset)
        };
        let pd = self.session.pd_handle()?;
        let (_, rkey) =
            self.session
                .blocks
                .register_and_get_keys(pd, block_index, host_addr, true)?;
        log::trace!(
            "pinned chunk for block {block_index} offset {:#x}, rkey {rkey:#x}",
            command.offset
        );
        Ok(rkey)
    }

    /// Close the transport, releasing every transport resource.
    pub fn close(mut self) -> Result<()> {
        self.session.cleanup();
        Ok(())
    }
}
