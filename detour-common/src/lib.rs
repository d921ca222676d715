#![cfg_attr(not(test), no_std)]

//! Definitions shared between the detour daemon, the DETOUR kernel module
//! and detour (mproxy) servers.

/// Generic netlink family registered by the kernel module.
pub const DETOUR_FAMILY: &str = "DETOUR";
/// Multicast group the kernel uses to ask for detours.
pub const DETOUR_GROUP: &str = "detour_req";
pub const DETOUR_VERSION: u8 = 1;

/// Kernel interface-name limit, terminator included.
pub const IFNAMSIZ: usize = 16;

/// Commands understood by the kernel module (genlmsghdr.cmd)
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetourCommand {
    Unspec = 0,
    Echo = 1,
    Add = 2,
    Delete = 3,
    Request = 4,
    Stat = 5,
}

impl TryFrom<u8> for DetourCommand {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Unspec),
            1 => Ok(Self::Echo),
            2 => Ok(Self::Add),
            3 => Ok(Self::Delete),
            4 => Ok(Self::Request),
            5 => Ok(Self::Stat),
            other => Err(other),
        }
    }
}

/// Attribute types carried by DETOUR commands (nlattr.nla_type)
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetourAttribute {
    Unspec = 0,
    /// u32, network byte order
    DetourIp = 1,
    /// u16, network byte order
    DetourPort = 2,
    /// u32, network byte order
    RemoteIp = 3,
    /// u16, network byte order
    RemotePort = 4,
    /// NUL-terminated string, at most IFNAMSIZ bytes
    Ifname = 5,
}

impl DetourAttribute {
    pub const fn id(self) -> u16 {
        self as u16
    }
}

/// Well-known UDP port of detour (mproxy) servers.
pub const MPROXY_PORT: u16 = 45672;
pub const MPROXY_VERSION: u8 = 1;
/// Size of one negotiation datagram.
pub const MPROXY_RECORD_LEN: usize = 12;

/// Operation code of a negotiation record
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MproxyOp {
    Request = 0,
    Response = 1,
}

impl TryFrom<u8> for MproxyOp {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Request),
            1 => Ok(Self::Response),
            other => Err(other),
        }
    }
}

/// Why a negotiation datagram was rejected
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordError {
    /// Datagram was not exactly MPROXY_RECORD_LEN bytes
    Length(usize),
    Version(u8),
    Opcode(u8),
}

/// Detour negotiation record, `!BBxx4sHH` on the wire.
///
/// `remote_ip` holds the address octets as they appear on the wire; both
/// ports are host-order values that are encoded big-endian.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MproxyRecord {
    pub version: u8,
    pub op: MproxyOp,
    pub remote_ip: [u8; 4],
    pub remote_port: u16,
    pub detour_port: u16,
}

impl MproxyRecord {
    /// Build a request; the requested detour port mirrors the remote port.
    pub const fn request(remote_ip: [u8; 4], remote_port: u16) -> Self {
        Self {
            version: MPROXY_VERSION,
            op: MproxyOp::Request,
            remote_ip,
            remote_port,
            detour_port: remote_port,
        }
    }

    pub const fn response(remote_ip: [u8; 4], remote_port: u16, detour_port: u16) -> Self {
        Self {
            version: MPROXY_VERSION,
            op: MproxyOp::Response,
            remote_ip,
            remote_port,
            detour_port,
        }
    }

    pub fn to_bytes(&self) -> [u8; MPROXY_RECORD_LEN] {
        let mut buf = [0u8; MPROXY_RECORD_LEN];
        buf[0] = self.version;
        buf[1] = self.op as u8;
        // buf[2..4] reserved, zero
        buf[4..8].copy_from_slice(&self.remote_ip);
        buf[8..10].copy_from_slice(&self.remote_port.to_be_bytes());
        buf[10..12].copy_from_slice(&self.detour_port.to_be_bytes());
        buf
    }

    /// Decode a whole datagram. Partial records are never accepted.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, RecordError> {
        if buf.len() != MPROXY_RECORD_LEN {
            return Err(RecordError::Length(buf.len()));
        }
        if buf[0] != MPROXY_VERSION {
            return Err(RecordError::Version(buf[0]));
        }
        let op = MproxyOp::try_from(buf[1]).map_err(RecordError::Opcode)?;
        Ok(Self {
            version: buf[0],
            op,
            remote_ip: [buf[4], buf[5], buf[6], buf[7]],
            remote_port: u16::from_be_bytes([buf[8], buf[9]]),
            detour_port: u16::from_be_bytes([buf[10], buf[11]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_mirrors_remote_port() {
        let req = MproxyRecord::request([1, 2, 3, 4], 5000);
        assert_eq!(req.detour_port, 5000);
        assert_eq!(
            req.to_bytes(),
            [1, 0, 0, 0, 1, 2, 3, 4, 0x13, 0x88, 0x13, 0x88]
        );
    }

    #[test]
    fn test_response_bytes_survive_decode() {
        let bytes = [1, 1, 0, 0, 10, 0, 0, 7, 0x13, 0x88, 0x17, 0x70];
        let rec = MproxyRecord::from_bytes(&bytes).unwrap();
        assert_eq!(rec.op, MproxyOp::Response);
        assert_eq!(rec.remote_ip, [10, 0, 0, 7]);
        assert_eq!(rec.remote_port, 5000);
        assert_eq!(rec.detour_port, 6000);
        assert_eq!(rec.to_bytes(), bytes);
    }

    #[test]
    fn test_rejects_short_and_long_datagrams() {
        let bytes = MproxyRecord::request([1, 2, 3, 4], 80).to_bytes();
        assert_eq!(
            MproxyRecord::from_bytes(&bytes[..11]),
            Err(RecordError::Length(11))
        );
        let mut long = [0u8; 13];
        long[..12].copy_from_slice(&bytes);
        assert_eq!(MproxyRecord::from_bytes(&long), Err(RecordError::Length(13)));
    }

    #[test]
    fn test_rejects_wrong_version_and_opcode() {
        let mut bytes = MproxyRecord::request([1, 2, 3, 4], 80).to_bytes();
        bytes[0] = 2;
        assert_eq!(MproxyRecord::from_bytes(&bytes), Err(RecordError::Version(2)));
        bytes[0] = MPROXY_VERSION;
        bytes[1] = 9;
        assert_eq!(MproxyRecord::from_bytes(&bytes), Err(RecordError::Opcode(9)));
    }

    #[test]
    fn test_command_numbers_match_kernel() {
        assert_eq!(DetourCommand::try_from(4), Ok(DetourCommand::Request));
        assert_eq!(DetourCommand::try_from(6), Err(6));
        assert_eq!(DetourAttribute::Ifname.id(), 5);
    }
}
