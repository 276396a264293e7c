use std::collections::HashMap;
use std::net::Ipv4Addr;

use crate::error::{Error, Result};
use crate::options::{MessageType, OptionCode, decode_option_value};

const DHCP_MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];
const OPTIONS_OFFSET: usize = 240;
const MIN_REPLY_SIZE: usize = 300;
const MAX_HOPS: u8 = 16;

pub const BOOTREQUEST: u8 = 1;
pub const BOOTREPLY: u8 = 2;
pub const HTYPE_ETHERNET: u8 = 1;
pub const HLEN_ETHERNET: u8 = 6;

fn be_u16(data: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([data[at], data[at + 1]])
}

fn be_u32(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn ipv4_at(data: &[u8], at: usize) -> Ipv4Addr {
    Ipv4Addr::new(data[at], data[at + 1], data[at + 2], data[at + 3])
}

/// A single option as it appears on the wire: code plus raw payload.
///
/// The server composes replies from dynamically rendered option sets, so
/// options stay untyped here; interpretation happens at the edges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawOption {
    pub code: u8,
    pub data: Vec<u8>,
}

impl RawOption {
    pub fn new(code: u8, data: Vec<u8>) -> Self {
        Self { code, data }
    }

    pub fn ip(code: OptionCode, addr: Ipv4Addr) -> Self {
        Self::new(code as u8, addr.octets().to_vec())
    }

    pub fn seconds(code: OptionCode, value: u32) -> Self {
        Self::new(code as u8, value.to_be_bytes().to_vec())
    }

    pub fn byte(code: OptionCode, value: u8) -> Self {
        Self::new(code as u8, vec![value])
    }
}

#[derive(Debug, Clone)]
pub struct DhcpPacket {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub sname: [u8; 64],
    pub file: [u8; 128],
    pub options: Vec<RawOption>,
}

impl DhcpPacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < OPTIONS_OFFSET {
            return Err(Error::InvalidPacket(format!(
                "{} bytes is shorter than a BOOTP header",
                data.len()
            )));
        }
        if data[236..OPTIONS_OFFSET] != DHCP_MAGIC_COOKIE {
            return Err(Error::InvalidPacket(
                "Missing DHCP magic cookie".to_string(),
            ));
        }
        if data[3] > MAX_HOPS {
            return Err(Error::InvalidPacket(format!(
                "Relay hop count {} exceeds {}",
                data[3], MAX_HOPS
            )));
        }

        let mut chaddr = [0u8; 16];
        chaddr.copy_from_slice(&data[28..44]);
        let mut sname = [0u8; 64];
        sname.copy_from_slice(&data[44..108]);
        let mut file = [0u8; 128];
        file.copy_from_slice(&data[108..236]);

        Ok(Self {
            op: data[0],
            htype: data[1],
            hlen: data[2],
            hops: data[3],
            xid: be_u32(data, 4),
            secs: be_u16(data, 8),
            flags: be_u16(data, 10),
            ciaddr: ipv4_at(data, 12),
            yiaddr: ipv4_at(data, 16),
            siaddr: ipv4_at(data, 20),
            giaddr: ipv4_at(data, 24),
            chaddr,
            sname,
            file,
            options: Self::parse_options(&data[OPTIONS_OFFSET..])?,
        })
    }

    fn parse_options(mut data: &[u8]) -> Result<Vec<RawOption>> {
        let mut options = Vec::new();

        while let [code, rest @ ..] = data {
            if *code == OptionCode::End as u8 {
                break;
            }
            if *code == OptionCode::Pad as u8 {
                data = rest;
                continue;
            }

            let [length, rest @ ..] = rest else {
                return Err(Error::InvalidPacket(
                    "Option without a length byte".to_string(),
                ));
            };
            let length = *length as usize;
            if rest.len() < length {
                return Err(Error::InvalidPacket(
                    "Option payload runs past the frame".to_string(),
                ));
            }

            options.push(RawOption::new(*code, rest[..length].to_vec()));
            data = &rest[length..];
        }

        Ok(options)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(MIN_REPLY_SIZE);

        frame.extend_from_slice(&[self.op, self.htype, self.hlen, self.hops]);
        frame.extend_from_slice(&self.xid.to_be_bytes());
        frame.extend_from_slice(&self.secs.to_be_bytes());
        frame.extend_from_slice(&self.flags.to_be_bytes());
        for addr in [self.ciaddr, self.yiaddr, self.siaddr, self.giaddr] {
            frame.extend_from_slice(&addr.octets());
        }
        frame.extend_from_slice(&self.chaddr);
        frame.extend_from_slice(&self.sname);
        frame.extend_from_slice(&self.file);
        frame.extend_from_slice(&DHCP_MAGIC_COOKIE);

        for option in &self.options {
            frame.push(option.code);
            frame.push(option.data.len() as u8);
            frame.extend_from_slice(&option.data);
        }
        frame.push(OptionCode::End as u8);

        // BOOTP requires replies of at least 300 bytes.
        if frame.len() < MIN_REPLY_SIZE {
            frame.resize(MIN_REPLY_SIZE, 0);
        }

        frame
    }

    pub fn option(&self, code: u8) -> Option<&[u8]> {
        self.options
            .iter()
            .find(|option| option.code == code)
            .map(|option| option.data.as_slice())
    }

    pub fn message_type(&self) -> Option<MessageType> {
        let data = self.option(OptionCode::MessageType as u8)?;
        if data.len() != 1 {
            return None;
        }
        MessageType::try_from(data[0]).ok()
    }

    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        let data = self.option(OptionCode::RequestedIpAddress as u8)?;
        if data.len() != 4 {
            return None;
        }
        Some(ipv4_at(data, 0))
    }

    pub fn server_identifier(&self) -> Option<Ipv4Addr> {
        let data = self.option(OptionCode::ServerIdentifier as u8)?;
        if data.len() != 4 {
            return None;
        }
        Some(ipv4_at(data, 0))
    }

    /// Hardware address as the lowercase colon-joined form leases are keyed by.
    pub fn mac_string(&self) -> String {
        self.chaddr[..6]
            .iter()
            .map(|byte| format!("{:02x}", byte))
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Inbound options decoded to text, keyed by code; the template input.
    pub fn decoded_options(&self) -> HashMap<u8, String> {
        self.options
            .iter()
            .map(|option| (option.code, decode_option_value(option.code, &option.data)))
            .collect()
    }

    pub fn is_broadcast(&self) -> bool {
        (self.flags & 0x8000) != 0
    }

    pub fn create_reply(
        request: &DhcpPacket,
        message_type: MessageType,
        your_ip: Ipv4Addr,
        next_server: Ipv4Addr,
        options: Vec<RawOption>,
    ) -> Self {
        let mut all_options = vec![RawOption::byte(OptionCode::MessageType, message_type as u8)];
        all_options.extend(options);

        Self {
            op: BOOTREPLY,
            htype: HTYPE_ETHERNET,
            hlen: HLEN_ETHERNET,
            hops: 0,
            xid: request.xid,
            secs: 0,
            flags: request.flags,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: your_ip,
            siaddr: next_server,
            giaddr: request.giaddr,
            chaddr: request.chaddr,
            sname: [0u8; 64],
            file: [0u8; 128],
            options: all_options,
        }
    }
}
