//! Packet Framer: wraps a DHCP reply in Ethernet II / IPv4 / UDP headers so
//! it can be written to a raw link-layer socket. DHCP clients without a
//! configured IP can only be reached this way — there is no
//! routable source address to bind a UDP socket to yet.

use std::net::Ipv4Addr;

use pnet_packet::ethernet::{EtherTypes, MutableEthernetPacket};
use pnet_packet::ipv4::{self, Ipv4Flags, MutableIpv4Packet};
use pnet_packet::udp::{self, MutableUdpPacket};
use pnet_packet::Packet;

const DHCP_SERVER_PORT: u16 = 67;
const DHCP_CLIENT_PORT: u16 = 68;

const ETHERNET_HEADER_LEN: usize = 14;
const IPV4_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;

/// Frame a DHCP reply for link-layer transmission.
///
/// `dest_mac`/`dest_ip` pick the datagram's destination:
/// the broadcast flag and the presence of `yiaddr`/`ciaddr` decide whether
/// that's the client's own hardware and offered address, or the Ethernet
/// and IPv4 broadcast addresses.
pub fn frame_reply(
    payload: &[u8],
    src_mac: [u8; 6],
    src_ip: Ipv4Addr,
    dest_mac: [u8; 6],
    dest_ip: Ipv4Addr,
) -> Vec<u8> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let ip_len = IPV4_HEADER_LEN + udp_len;
    let total_len = ETHERNET_HEADER_LEN + ip_len;

    let mut buf = vec![0u8; total_len];

    {
        let mut eth = MutableEthernetPacket::new(&mut buf).expect("buffer sized for ethernet header");
        eth.set_destination(dest_mac.into());
        eth.set_source(src_mac.into());
        eth.set_ethertype(EtherTypes::Ipv4);
    }

    {
        let mut ip = MutableIpv4Packet::new(&mut buf[ETHERNET_HEADER_LEN..]).expect("buffer sized for ipv4 header");
        ip.set_version(4);
        ip.set_header_length((IPV4_HEADER_LEN / 4) as u8);
        ip.set_total_length(ip_len as u16);
        ip.set_ttl(255);
        ip.set_flags(Ipv4Flags::DontFragment);
        ip.set_next_level_protocol(pnet_packet::ip::IpNextHeaderProtocols::Udp);
        ip.set_source(src_ip);
        ip.set_destination(dest_ip);
        let checksum = ipv4::checksum(&ip.to_immutable());
        ip.set_checksum(checksum);
    }

    {
        let mut udp_pkt =
            MutableUdpPacket::new(&mut buf[ETHERNET_HEADER_LEN + IPV4_HEADER_LEN..]).expect("buffer sized for udp header");
        udp_pkt.set_source(DHCP_SERVER_PORT);
        udp_pkt.set_destination(DHCP_CLIENT_PORT);
        udp_pkt.set_length(udp_len as u16);
        udp_pkt.set_payload(payload);
        let checksum = udp::ipv4_checksum(&udp_pkt.to_immutable(), &src_ip, &dest_ip);
        udp_pkt.set_checksum(checksum);
    }

    buf
}

/// Strip Ethernet/IPv4/UDP framing off an inbound raw frame, returning the
/// DHCP payload if the frame is in fact IPv4/UDP addressed to port 67.
pub fn extract_payload(frame: &[u8]) -> Option<&[u8]> {
    let eth = pnet_packet::ethernet::EthernetPacket::new(frame)?;
    if eth.get_ethertype() != EtherTypes::Ipv4 {
        return None;
    }
    let ip = pnet_packet::ipv4::Ipv4Packet::new(eth.payload())?;
    if ip.get_next_level_protocol() != pnet_packet::ip::IpNextHeaderProtocols::Udp {
        return None;
    }
    let udp_pkt = pnet_packet::udp::UdpPacket::new(ip.payload())?;
    if udp_pkt.get_destination() != DHCP_SERVER_PORT {
        return None;
    }
    Some(&frame[ETHERNET_HEADER_LEN + IPV4_HEADER_LEN + UDP_HEADER_LEN..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_reply_round_trips_through_extract() {
        let payload = b"\x02\x01\x06\x00hello-dhcp-payload";
        let framed = frame_reply(
            payload,
            [0x00, 0x11, 0x22, 0x33, 0x44, 0x55],
            Ipv4Addr::new(10, 0, 0, 1),
            [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff],
            Ipv4Addr::new(10, 0, 0, 10),
        );
        let extracted = extract_payload(&framed).expect("payload extracted");
        assert_eq!(extracted, payload);
    }

    #[test]
    fn non_ip_frame_is_rejected() {
        let mut frame = vec![0u8; 64];
        frame[12] = 0x08;
        frame[13] = 0x06; // ARP, not IPv4
        assert!(extract_payload(&frame).is_none());
    }
}
