//! Generic netlink wire codec
//!
//! Only the subset the daemon needs: building `nlmsghdr + genlmsghdr +
//! nlattr*` requests, splitting received datagrams into messages and
//! walking (nested) attribute lists. Header fields are host byte order;
//! attribute payloads carry whatever the kernel module defines (the DETOUR
//! addresses and ports are network byte order).

use crate::error::{DetourError, Result};
use std::net::Ipv4Addr;

pub const NLMSG_HDRLEN: usize = 16;
pub const GENL_HDRLEN: usize = 4;
const NLA_HDRLEN: usize = 4;

pub const NLM_F_REQUEST: u16 = 0x01;
pub const NLM_F_ACK: u16 = 0x04;

pub const NLMSG_NOOP: u16 = 0x01;
pub const NLMSG_ERROR: u16 = 0x02;
pub const NLMSG_DONE: u16 = 0x03;

/// Generic netlink controller (family/group resolution)
pub const GENL_ID_CTRL: u16 = 0x10;
pub const CTRL_VERSION: u8 = 1;
pub const CTRL_CMD_GETFAMILY: u8 = 3;
pub const CTRL_ATTR_FAMILY_ID: u16 = 1;
pub const CTRL_ATTR_FAMILY_NAME: u16 = 2;
pub const CTRL_ATTR_MCAST_GROUPS: u16 = 7;
pub const CTRL_ATTR_MCAST_GRP_NAME: u16 = 1;
pub const CTRL_ATTR_MCAST_GRP_ID: u16 = 2;

/// Strips NLA_F_NESTED and NLA_F_NET_BYTEORDER
const NLA_TYPE_MASK: u16 = 0x3fff;

const fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// One netlink attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attr {
    pub kind: u16,
    pub payload: Vec<u8>,
}

impl Attr {
    pub fn new(kind: u16, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    /// IPv4 address as a network byte order u32
    pub fn ipv4(kind: u16, addr: Ipv4Addr) -> Self {
        Self::new(kind, addr.octets().to_vec())
    }

    /// Port as a network byte order u16
    pub fn port(kind: u16, port: u16) -> Self {
        Self::new(kind, port.to_be_bytes().to_vec())
    }

    pub fn u16(kind: u16, value: u16) -> Self {
        Self::new(kind, value.to_ne_bytes().to_vec())
    }

    pub fn u32(kind: u16, value: u32) -> Self {
        Self::new(kind, value.to_ne_bytes().to_vec())
    }

    /// NUL-terminated string (NLA_STRING / NLA_NUL_STRING)
    pub fn string(kind: u16, value: &str) -> Self {
        let mut payload = Vec::with_capacity(value.len() + 1);
        payload.extend_from_slice(value.as_bytes());
        payload.push(0);
        Self::new(kind, payload)
    }

    pub fn as_ipv4(&self) -> Option<Ipv4Addr> {
        <[u8; 4]>::try_from(self.payload.as_slice())
            .ok()
            .map(Ipv4Addr::from)
    }

    pub fn as_port(&self) -> Option<u16> {
        <[u8; 2]>::try_from(self.payload.as_slice())
            .ok()
            .map(u16::from_be_bytes)
    }

    pub fn as_u16(&self) -> Option<u16> {
        <[u8; 2]>::try_from(self.payload.as_slice())
            .ok()
            .map(u16::from_ne_bytes)
    }

    pub fn as_u32(&self) -> Option<u32> {
        <[u8; 4]>::try_from(self.payload.as_slice())
            .ok()
            .map(u32::from_ne_bytes)
    }

    /// String payload without its terminator
    pub fn as_str(&self) -> Option<&str> {
        let end = self
            .payload
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(self.payload.len());
        std::str::from_utf8(&self.payload[..end]).ok()
    }

    pub fn nested(&self) -> Result<Vec<Attr>> {
        parse_attrs(&self.payload)
    }

    fn encoded_len(&self) -> usize {
        NLA_HDRLEN + self.payload.len()
    }
}

/// First attribute of the given type
pub fn find_attr(attrs: &[Attr], kind: u16) -> Option<&Attr> {
    attrs.iter().find(|a| a.kind == kind)
}

/// Build one generic netlink message.
pub fn encode(
    nl_type: u16,
    flags: u16,
    seq: u32,
    cmd: u8,
    version: u8,
    attrs: &[Attr],
) -> Vec<u8> {
    let attrs_len: usize = attrs.iter().map(|a| align4(a.encoded_len())).sum();
    let total = NLMSG_HDRLEN + GENL_HDRLEN + attrs_len;
    let mut buf = Vec::with_capacity(total);

    // nlmsghdr; nlmsg_pid 0 lets the kernel fill in our port id
    buf.extend_from_slice(&(total as u32).to_ne_bytes());
    buf.extend_from_slice(&nl_type.to_ne_bytes());
    buf.extend_from_slice(&flags.to_ne_bytes());
    buf.extend_from_slice(&seq.to_ne_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes());

    // genlmsghdr
    buf.push(cmd);
    buf.push(version);
    buf.extend_from_slice(&0u16.to_ne_bytes());

    for attr in attrs {
        buf.extend_from_slice(&(attr.encoded_len() as u16).to_ne_bytes());
        buf.extend_from_slice(&attr.kind.to_ne_bytes());
        buf.extend_from_slice(&attr.payload);
        buf.resize(align4(buf.len()), 0);
    }

    buf
}

/// One message out of a received datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub nl_type: u16,
    pub flags: u16,
    pub seq: u32,
    pub pid: u32,
    pub payload: Vec<u8>,
}

/// Decoded generic netlink payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenlMessage {
    pub cmd: u8,
    pub version: u8,
    pub attrs: Vec<Attr>,
}

impl GenlMessage {
    pub fn attr(&self, kind: u16) -> Option<&Attr> {
        find_attr(&self.attrs, kind)
    }
}

impl Message {
    /// errno carried by an NLMSG_ERROR message; 0 is an acknowledgement.
    pub fn error_code(&self) -> Option<i32> {
        if self.nl_type != NLMSG_ERROR || self.payload.len() < 4 {
            return None;
        }
        let code = i32::from_ne_bytes([
            self.payload[0],
            self.payload[1],
            self.payload[2],
            self.payload[3],
        ]);
        Some(-code)
    }

    pub fn genl(&self) -> Result<GenlMessage> {
        if self.payload.len() < GENL_HDRLEN {
            return Err(DetourError::Malformed(format!(
                "generic netlink header truncated ({} bytes)",
                self.payload.len()
            )));
        }
        Ok(GenlMessage {
            cmd: self.payload[0],
            version: self.payload[1],
            attrs: parse_attrs(&self.payload[GENL_HDRLEN..])?,
        })
    }
}

/// Split a datagram into its netlink messages.
pub fn split_messages(mut buf: &[u8]) -> Result<Vec<Message>> {
    let mut messages = Vec::new();
    while !buf.is_empty() {
        if buf.len() < NLMSG_HDRLEN {
            return Err(DetourError::Malformed(format!(
                "{} trailing bytes after last netlink message",
                buf.len()
            )));
        }
        let len = u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len < NLMSG_HDRLEN || len > buf.len() {
            return Err(DetourError::Malformed(format!(
                "netlink message length {} out of range ({} available)",
                len,
                buf.len()
            )));
        }
        messages.push(Message {
            nl_type: u16::from_ne_bytes([buf[4], buf[5]]),
            flags: u16::from_ne_bytes([buf[6], buf[7]]),
            seq: u32::from_ne_bytes([buf[8], buf[9], buf[10], buf[11]]),
            pid: u32::from_ne_bytes([buf[12], buf[13], buf[14], buf[15]]),
            payload: buf[NLMSG_HDRLEN..len].to_vec(),
        });
        buf = &buf[align4(len).min(buf.len())..];
    }
    Ok(messages)
}

/// Walk an attribute list.
pub fn parse_attrs(mut buf: &[u8]) -> Result<Vec<Attr>> {
    let mut attrs = Vec::new();
    while !buf.is_empty() {
        if buf.len() < NLA_HDRLEN {
            return Err(DetourError::Malformed(format!(
                "{} trailing bytes in attribute list",
                buf.len()
            )));
        }
        let len = u16::from_ne_bytes([buf[0], buf[1]]) as usize;
        if len < NLA_HDRLEN || len > buf.len() {
            return Err(DetourError::Malformed(format!(
                "attribute length {} out of range ({} available)",
                len,
                buf.len()
            )));
        }
        attrs.push(Attr {
            kind: u16::from_ne_bytes([buf[2], buf[3]]) & NLA_TYPE_MASK,
            payload: buf[NLA_HDRLEN..len].to_vec(),
        });
        buf = &buf[align4(len).min(buf.len())..];
    }
    Ok(attrs)
}
