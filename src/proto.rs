//! Control-channel wire formats.
//!
//! Every control SEND starts with a 16-byte big-endian [`ControlHeader`].
//! Payloads that follow the header are packed little-endian structures;
//! both peers of one migration run in the same cluster, so a version bump
//! is required before heterogeneous-endian clusters may interoperate.

use crate::error::{Error, Result};

/// Oldest control protocol version we accept.
pub const VERSION_MIN: u32 = 1;
/// Newest control protocol version we accept.
pub const VERSION_MAX: u32 = 1;
/// Version stamped into every outgoing header.
pub const VERSION_CURRENT: u32 = 1;

/// Encoded size of [`ControlHeader`].
pub const CONTROL_HEADER_SIZE: usize = 16;

/// Encoded size of one directory entry ([`RemoteBlockEntry`]).
pub const REMOTE_BLOCK_SIZE: usize = 32;

/// Encoded size of one [`RegisterCommand`].
pub const REGISTER_COMMAND_SIZE: usize = 16;

/// Upper bound on `repeat` for registration messages.
pub const MAX_COMMANDS_PER_MESSAGE: u32 = 4096;

/// Marker stamped into the byte-stream at every iteration start so the
/// destination loader enters its registration loop.
pub const STREAM_HOOK: u64 = 0x80;

/// Control message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    /// Placeholder; never sent.
    None = 0,
    /// Destination grants the source one SEND credit.
    Ready = 1,
    /// Opaque byte-stream bytes (device state and friends).
    Stream = 2,
    /// RAM block directory, sent once by the destination after accept.
    RamBlocks = 3,
    /// Source asks the destination to register chunks.
    RegisterRequest = 4,
    /// Destination answers a registration request with rkeys.
    RegisterResult = 5,
    /// Source is done registering for this iteration.
    RegisterFinished = 6,
}

impl MessageType {
    pub fn from_wire(raw: u32) -> Result<Self> {
        Ok(match raw {
            0 => MessageType::None,
            1 => MessageType::Ready,
            2 => MessageType::Stream,
            3 => MessageType::RamBlocks,
            4 => MessageType::RegisterRequest,
            5 => MessageType::RegisterResult,
            6 => MessageType::RegisterFinished,
            x => return Err(Error::Protocol(format!("unknown control message type {x}"))),
        })
    }
}

/// Header prepended to every control SEND, big-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlHeader {
    /// Length of the data portion following the header.
    pub len: u32,
    /// Message type.
    pub kind: MessageType,
    /// Control protocol version.
    pub version: u32,
    /// Number of same-type commands in the data portion.
    pub repeat: u32,
}

impl ControlHeader {
    /// Header for a message without payload.
    pub fn empty(kind: MessageType) -> Self {
        Self {
            len: 0,
            kind,
            version: VERSION_CURRENT,
            repeat: 1,
        }
    }

    /// Header for a message carrying `len` payload bytes.
    pub fn with_len(kind: MessageType, len: u32) -> Self {
        Self {
            len,
            kind,
            version: VERSION_CURRENT,
            repeat: 1,
        }
    }

    pub fn encode(&self) -> [u8; CONTROL_HEADER_SIZE] {
        let mut buf = [0u8; CONTROL_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.len.to_be_bytes());
        buf[4..8].copy_from_slice(&(self.kind as u32).to_be_bytes());
        buf[8..12].copy_from_slice(&self.version.to_be_bytes());
        buf[12..16].copy_from_slice(&self.repeat.to_be_bytes());
        buf
    }

    /// Decode a header and validate the version window.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < CONTROL_HEADER_SIZE {
            return Err(Error::Protocol(format!(
                "control message truncated: {} bytes",
                buf.len()
            )));
        }
        let len = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        let kind = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        let version = u32::from_be_bytes(buf[8..12].try_into().unwrap());
        let repeat = u32::from_be_bytes(buf[12..16].try_into().unwrap());

        if !(VERSION_MIN..=VERSION_MAX).contains(&version) {
            return Err(Error::Protocol(format!(
                "control message version {version} outside [{VERSION_MIN}, {VERSION_MAX}]"
            )));
        }

        Ok(Self {
            len,
            kind: MessageType::from_wire(kind)?,
            version,
            repeat,
        })
    }
}

/// Capability bit: destination performs chunk-level dynamic registration.
pub const CAP_CHUNK_REGISTER: u32 = 0x01;
/// Reserved for the next negotiated feature.
pub const CAP_NEXT_FEATURE: u32 = 0x02;

/// Capabilities carried as RDMA-CM private data, big-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub version: u32,
    pub flags: u32,
}

impl Capabilities {
    /// Encoded size on the wire.
    pub const WIRE_SIZE: usize = 8;

    pub fn new(flags: u32) -> Self {
        Self {
            version: VERSION_CURRENT,
            flags,
        }
    }

    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..4].copy_from_slice(&self.version.to_be_bytes());
        buf[4..8].copy_from_slice(&self.flags.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::WIRE_SIZE {
            return Err(Error::Protocol(format!(
                "capability blob truncated: {} bytes",
                buf.len()
            )));
        }
        let version = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        let flags = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        if !(VERSION_MIN..=VERSION_MAX).contains(&version) {
            return Err(Error::Protocol(format!(
                "peer speaks version {version}, supported [{VERSION_MIN}, {VERSION_MAX}]"
            )));
        }
        Ok(Self { version, flags })
    }

    /// Intersect the requested flags with what this peer supports. The
    /// result is what the destination echoes back in its accept.
    pub fn clamp(&self, supported: u32) -> Self {
        Self {
            version: self.version,
            flags: self.flags & supported,
        }
    }
}

/// One RAM block as transmitted in the directory message.
///
/// 32 bytes packed little-endian: `remote_addr`, `guest_offset`, `length`,
/// `rkey`, 4 bytes of padding. The rkey is only meaningful in whole-block
/// registration mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteBlockEntry {
    pub remote_addr: u64,
    pub guest_offset: u64,
    pub length: u64,
    pub rkey: u32,
}

/// Encode the directory payload: a little-endian block count (padded to
/// eight bytes) followed by the packed entries.
pub fn encode_directory(entries: &[RemoteBlockEntry]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + entries.len() * REMOTE_BLOCK_SIZE);
    buf.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    buf.extend_from_slice(&[0u8; 4]);
    for entry in entries {
        buf.extend_from_slice(&entry.remote_addr.to_le_bytes());
        buf.extend_from_slice(&entry.guest_offset.to_le_bytes());
        buf.extend_from_slice(&entry.length.to_le_bytes());
        buf.extend_from_slice(&entry.rkey.to_le_bytes());
        buf.extend_from_slice(&[0u8; 4]);
    }
    buf
}

pub fn decode_directory(buf: &[u8]) -> Result<Vec<RemoteBlockEntry>> {
    if buf.len() < 8 {
        return Err(Error::Protocol("directory payload truncated".into()));
    }
    let count = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
    let body = &buf[8..];
    if body.len() < count * REMOTE_BLOCK_SIZE {
        return Err(Error::Protocol(format!(
            "directory announces {count} blocks but carries {} bytes",
            body.len()
        )));
    }
    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let e = &body[i * REMOTE_BLOCK_SIZE..(i + 1) * REMOTE_BLOCK_SIZE];
        entries.push(RemoteBlockEntry {
            remote_addr: u64::from_le_bytes(e[0..8].try_into().unwrap()),
            guest_offset: u64::from_le_bytes(e[8..16].try_into().unwrap()),
            length: u64::from_le_bytes(e[16..24].try_into().unwrap()),
            rkey: u32::from_le_bytes(e[24..28].try_into().unwrap()),
        });
    }
    Ok(entries)
}

/// One chunk registration command, 16 bytes packed little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterCommand {
    /// Length of the range the source is about to write.
    pub len: u32,
    /// Index of the RAM block the chunk belongs to.
    pub block_index: u32,
    /// Guest offset of the range within the directory's address space.
    pub offset: u64,
}

pub fn encode_register_commands(commands: &[RegisterCommand]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(commands.len() * REGISTER_COMMAND_SIZE);
    for c in commands {
        buf.extend_from_slice(&c.len.to_le_bytes());
        buf.extend_from_slice(&c.block_index.to_le_bytes());
        buf.extend_from_slice(&c.offset.to_le_bytes());
    }
    buf
}

pub fn decode_register_commands(buf: &[u8], repeat: u32) -> Result<Vec<RegisterCommand>> {
    if repeat > MAX_COMMANDS_PER_MESSAGE {
        return Err(Error::Protocol(format!(
            "too many registration commands in one message: {repeat}"
        )));
    }
    let repeat = repeat as usize;
    if buf.len() < repeat * REGISTER_COMMAND_SIZE {
        return Err(Error::Protocol(format!(
            "registration request announces {repeat} commands but carries {} bytes",
            buf.len()
        )));
    }
    let mut commands = Vec::with_capacity(repeat);
    for i in 0..repeat {
        let c = &buf[i * REGISTER_COMMAND_SIZE..(i + 1) * REGISTER_COMMAND_SIZE];
        commands.push(RegisterCommand {
            len: u32::from_le_bytes(c[0..4].try_into().unwrap()),
            block_index: u32::from_le_bytes(c[4..8].try_into().unwrap()),
            offset: u64::from_le_bytes(c[8..16].try_into().unwrap()),
        });
    }
    Ok(commands)
}

pub fn encode_register_results(rkeys: &[u32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(rkeys.len() * 4);
    for rkey in rkeys {
        buf.extend_from_slice(&rkey.to_le_bytes());
    }
    buf
}

pub fn decode_register_results(buf: &[u8], repeat: u32) -> Result<Vec<u32>> {
    let repeat = repeat as usize;
    if buf.len() < repeat * 4 {
        return Err(Error::Protocol(format!(
            "registration result announces {repeat} rkeys but carries {} bytes",
            buf.len()
        )));
    }
    Ok((0..repeat)
        .map(|i| u32::from_le_bytes(buf[i * 4..(i + 1) * 4].try_into().unwrap()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let head = ControlHeader {
            len: 7,
            kind: MessageType::RamBlocks,
            version: 1,
            repeat: 2,
        };
        let wire = head.encode();
        // Fixed big-endian sample: len=7, type=3, version=1, repeat=2.
        assert_eq!(
            wire,
            [0, 0, 0, 7, 0, 0, 0, 3, 0, 0, 0, 1, 0, 0, 0, 2]
        );
        assert_eq!(ControlHeader::decode(&wire).unwrap(), head);
    }

    #[test]
    fn header_rejects_bad_version() {
        let mut wire = ControlHeader::empty(MessageType::Ready).encode();
        wire[8..12].copy_from_slice(&2u32.to_be_bytes());
        assert!(ControlHeader::decode(&wire).is_err());
        wire[8..12].copy_from_slice(&0u32.to_be_bytes());
        assert!(ControlHeader::decode(&wire).is_err());
    }

    #[test]
    fn header_rejects_unknown_type() {
        let mut wire = ControlHeader::empty(MessageType::Ready).encode();
        wire[4..8].copy_from_slice(&99u32.to_be_bytes());
        assert!(ControlHeader::decode(&wire).is_err());
    }

    #[test]
    fn capability_clamp() {
        // Both sides support chunk registration.
        let offered = Capabilities::new(CAP_CHUNK_REGISTER);
        let echoed = offered.clamp(CAP_CHUNK_REGISTER);
        assert_eq!(echoed.flags, CAP_CHUNK_REGISTER);

        // Source also offers a future feature the destination lacks.
        let offered = Capabilities::new(CAP_CHUNK_REGISTER | CAP_NEXT_FEATURE);
        let echoed = offered.clamp(CAP_CHUNK_REGISTER);
        assert_eq!(echoed.flags, CAP_CHUNK_REGISTER);

        // Source offers nothing.
        let offered = Capabilities::new(0);
        let echoed = offered.clamp(CAP_CHUNK_REGISTER);
        assert_eq!(echoed.flags, 0);
    }

    #[test]
    fn capability_wire_is_big_endian() {
        let caps = Capabilities::new(CAP_CHUNK_REGISTER);
        assert_eq!(caps.encode(), [0, 0, 0, 1, 0, 0, 0, 1]);
        assert_eq!(Capabilities::decode(&caps.encode()).unwrap(), caps);
        assert!(Capabilities::decode(&[0, 0, 0, 9, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn directory_roundtrip() -> anyhow::Result<()> {
        let entries = vec![
            RemoteBlockEntry {
                remote_addr: 0x7f00_0000_0000,
                guest_offset: 0,
                length: 1 << 30,
                rkey: 0x1234,
            },
            RemoteBlockEntry {
                remote_addr: 0x7f80_0000_0000,
                guest_offset: 1 << 30,
                length: 2 << 20,
                rkey: 0,
            },
        ];
        let wire = encode_directory(&entries);
        assert_eq!(wire.len(), 8 + 2 * REMOTE_BLOCK_SIZE);
        assert_eq!(decode_directory(&wire)?, entries);
        Ok(())
    }

    #[test]
    fn directory_rejects_short_payload() {
        let entries = vec![RemoteBlockEntry {
            remote_addr: 1,
            guest_offset: 2,
            length: 3,
            rkey: 4,
        }];
        let mut wire = encode_directory(&entries);
        wire.truncate(wire.len() - 1);
        assert!(decode_directory(&wire).is_err());
    }

    #[test]
    fn register_command_roundtrip() -> anyhow::Result<()> {
        let commands = vec![
            RegisterCommand {
                len: 4096,
                block_index: 1,
                offset: 0x10_0000,
            },
            RegisterCommand {
                len: 1 << 20,
                block_index: 0,
                offset: 0,
            },
        ];
        let wire = encode_register_commands(&commands);
        assert_eq!(decode_register_commands(&wire, 2)?, commands);
        Ok(())
    }

    #[test]
    fn register_command_repeat_bound() {
        let wire = vec![0u8; REGISTER_COMMAND_SIZE];
        assert!(decode_register_commands(&wire, MAX_COMMANDS_PER_MESSAGE + 1).is_err());
    }

    #[test]
    fn register_result_roundtrip() {
        let rkeys = vec![0xdead_beef, 0x42];
        let wire = encode_register_results(&rkeys);
        assert_eq!(decode_register_results(&wire, 2).unwrap(), rkeys);
        assert!(decode_register_results(&wire, 3).is_err());
    }
}
