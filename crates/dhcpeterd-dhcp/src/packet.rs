//! DHCPv4 packet parser/serializer (RFC 2131).

use std::net::Ipv4Addr;
use thiserror::Error;

use crate::options::{
    self, DhcpOption, OPT_HOSTNAME, OPT_MSG_TYPE, OPT_PARAM_REQUEST, OPT_REQUESTED_IP,
    OPT_SERVER_ID,
};

/// DHCP magic cookie.
pub const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

pub const OP_BOOTREQUEST: u8 = 1;
pub const OP_BOOTREPLY: u8 = 2;

/// RFC 2131 §2: the client's broadcast bit, bit 0 of the 16-bit flags field.
const FLAG_BROADCAST: u16 = 0x8000;

#[derive(Error, Debug)]
pub enum DhcpParseError {
    #[error("packet too short: {0} bytes (minimum 240)")]
    TooShort(usize),
    #[error("invalid magic cookie")]
    InvalidMagic,
}

/// A parsed DHCPv4 message.
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
    pub options: Vec<DhcpOption>,
}

impl DhcpPacket {
    pub fn parse(data: &[u8]) -> Result<Self, DhcpParseError> {
        if data.len() < 240 {
            return Err(DhcpParseError::TooShort(data.len()));
        }
        if data[236..240] != MAGIC_COOKIE {
            return Err(DhcpParseError::InvalidMagic);
        }

        let mut chaddr = [0u8; 16];
        chaddr.copy_from_slice(&data[28..44]);
        let mut sname = [0u8; 64];
        sname.copy_from_slice(&data[44..108]);
        let mut file = [0u8; 128];
        file.copy_from_slice(&data[108..236]);

        let options = if data.len() > 240 {
            options::parse_options(&data[240..])
        } else {
            vec![]
        };

        Ok(DhcpPacket {
            op: data[0],
            htype: data[1],
            hlen: data[2],
            hops: data[3],
            xid: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            secs: u16::from_be_bytes([data[8], data[9]]),
            flags: u16::from_be_bytes([data[10], data[11]]),
            ciaddr: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
            yiaddr: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
            siaddr: Ipv4Addr::new(data[20], data[21], data[22], data[23]),
            giaddr: Ipv4Addr::new(data[24], data[25], data[26], data[27]),
            chaddr,
            sname,
            file,
            options,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(300);

        buf.push(self.op);
        buf.push(self.htype);
        buf.push(self.hlen);
        buf.push(self.hops);
        buf.extend_from_slice(&self.xid.to_be_bytes());
        buf.extend_from_slice(&self.secs.to_be_bytes());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&self.ciaddr.octets());
        buf.extend_from_slice(&self.yiaddr.octets());
        buf.extend_from_slice(&self.siaddr.octets());
        buf.extend_from_slice(&self.giaddr.octets());
        buf.extend_from_slice(&self.chaddr);
        buf.extend_from_slice(&self.sname);
        buf.extend_from_slice(&self.file);
        buf.extend_from_slice(&MAGIC_COOKIE);
        buf.extend_from_slice(&options::encode_options(&self.options));

        while buf.len() < 300 {
            buf.push(0);
        }

        buf
    }

    /// Lowercase colon-separated MAC, matching the `hardware_addr` format
    /// used throughout the lease tables.
    pub fn mac_str(&self) -> String {
        let len = self.hlen.min(16) as usize;
        self.chaddr[..len]
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(":")
    }

    pub fn get_option(&self, code: u8) -> Option<&DhcpOption> {
        self.options.iter().find(|o| o.code == code)
    }

    pub fn msg_type(&self) -> Option<u8> {
        self.get_option(OPT_MSG_TYPE)?.as_u8()
    }

    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        self.get_option(OPT_REQUESTED_IP)?.as_ipv4()
    }

    pub fn server_id(&self) -> Option<Ipv4Addr> {
        self.get_option(OPT_SERVER_ID)?.as_ipv4()
    }

    pub fn hostname(&self) -> Option<String> {
        self.get_option(OPT_HOSTNAME)?.as_str()
    }

    /// Option 55: the set of option codes the client asked us to include.
    /// Absent means "no filtering" — include everything we computed.
    pub fn param_request_list(&self) -> Option<&[u8]> {
        self.get_option(OPT_PARAM_REQUEST).map(|o| o.data.as_slice())
    }

    pub fn is_broadcast(&self) -> bool {
        self.flags & FLAG_BROADCAST != 0
    }

    /// Build a BOOTREPLY echoing this request's transaction identity.
    pub fn build_reply(
        &self,
        msg_type: u8,
        yiaddr: Ipv4Addr,
        siaddr: Ipv4Addr,
        ciaddr: Ipv4Addr,
        options: Vec<DhcpOption>,
    ) -> DhcpPacket {
        DhcpPacket {
            op: OP_BOOTREPLY,
            htype: self.htype,
            hlen: self.hlen,
            hops: 0,
            xid: self.xid,
            secs: 0,
            flags: self.flags,
            ciaddr,
            yiaddr,
            siaddr,
            giaddr: self.giaddr,
            chaddr: self.chaddr,
            sname: [0u8; 64],
            file: [0u8; 128],
            options: {
                let mut opts = vec![DhcpOption::msg_type(msg_type)];
                opts.extend(options);
                opts
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::DHCPDISCOVER;

    fn make_discover() -> Vec<u8> {
        let mut pkt = vec![0u8; 300];
        pkt[0] = OP_BOOTREQUEST;
        pkt[1] = 1;
        pkt[2] = 6;
        pkt[4..8].copy_from_slice(&0x12345678u32.to_be_bytes());
        pkt[28] = 0xAA;
        pkt[29] = 0xBB;
        pkt[30] = 0xCC;
        pkt[31] = 0xDD;
        pkt[32] = 0xEE;
        pkt[33] = 0xFF;
        pkt[236..240].copy_from_slice(&MAGIC_COOKIE);
        pkt[240] = options::OPT_MSG_TYPE;
        pkt[241] = 1;
        pkt[242] = DHCPDISCOVER;
        pkt[243] = options::OPT_END;
        pkt
    }

    #[test]
    fn parse_discover() {
        let data = make_discover();
        let pkt = DhcpPacket::parse(&data).unwrap();
        assert_eq!(pkt.op, OP_BOOTREQUEST);
        assert_eq!(pkt.xid, 0x12345678);
        assert_eq!(pkt.mac_str(), "aa:bb:cc:dd:ee:ff");
        assert_eq!(pkt.msg_type(), Some(DHCPDISCOVER));
    }

    #[test]
    fn roundtrip() {
        let data = make_discover();
        let pkt = DhcpPacket::parse(&data).unwrap();
        let again = DhcpPacket::parse(&pkt.to_bytes()).unwrap();
        assert_eq!(again.xid, pkt.xid);
        assert_eq!(again.mac_str(), pkt.mac_str());
        assert_eq!(again.msg_type(), pkt.msg_type());
    }

    #[test]
    fn too_short_is_rejected() {
        assert!(matches!(
            DhcpPacket::parse(&[0u8; 100]),
            Err(DhcpParseError::TooShort(100))
        ));
    }

    #[test]
    fn bad_cookie_is_rejected() {
        let mut data = make_discover();
        data[236] = 0;
        assert!(matches!(
            DhcpPacket::parse(&data),
            Err(DhcpParseError::InvalidMagic)
        ));
    }
}
