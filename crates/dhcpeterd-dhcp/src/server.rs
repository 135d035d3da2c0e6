//! Serve Loop: per-interface resolution, socket setup, and the receive/
//! reply cycle that drives a [`Handler`].
//!
//! The UDP:67 listener is a broadcast-capable `socket2` socket
//! (`SO_REUSEADDR`, `SO_BROADCAST`, `SO_BINDTODEVICE` on Linux). Replies go
//! out over a raw Ethernet channel instead of that same UDP socket, since
//! an unconfigured client has no routable address a UDP `send_to` could
//! reach — see [`crate::framer`].

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use pnet_datalink::Channel;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use crate::error::{DhcpError, Result};
use crate::framer;
use crate::handler::Handler;
use crate::packet::{DhcpPacket, OP_BOOTREQUEST};

const BROADCAST_MAC: [u8; 6] = [0xff; 6];
const BROADCAST_IP: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 255);

/// `start_ip`'s pool must sit inside the interface's own `/netmask`
/// network, or a misconfigured daemon would hand out addresses no local
/// route can reach.
pub fn validate_start_ip(server_ip: Ipv4Addr, start_ip: Ipv4Addr, netmask: Ipv4Addr) -> Result<()> {
    let mask = u32::from(netmask);
    if u32::from(server_ip) & mask != u32::from(start_ip) & mask {
        return Err(DhcpError::Config(format!(
            "start_ip {start_ip} is not on the {server_ip}/{netmask} network"
        )));
    }
    Ok(())
}

fn resolve_interface(name: &str) -> Result<pnet_datalink::NetworkInterface> {
    pnet_datalink::interfaces()
        .into_iter()
        .find(|i| i.name == name)
        .ok_or_else(|| DhcpError::Config(format!("interface {name} not found")))
}

/// Startup-time check: does this interface exist at all? Called once
/// before any supervised retry loop starts, so a typo in the config file
/// is a fatal error rather than an infinite retry.
pub fn require_interface(name: &str) -> Result<()> {
    resolve_interface(name).map(|_| ())
}

/// The daemon's own address on `name` — used both as the DHCP server
/// identifier and as the default router handed out to clients. Not part
/// of the TOML schema; it comes from whatever IPv4 address the OS has
/// already assigned the interface, the same way dnsmasq/ISC dhcpd infer
/// it rather than asking the operator to duplicate it in config.
pub fn resolve_server_ip(name: &str) -> Result<Ipv4Addr> {
    let iface = resolve_interface(name)?;
    iface
        .ips
        .iter()
        .find_map(|net| match net.ip() {
            std::net::IpAddr::V4(v4) => Some(v4),
            std::net::IpAddr::V6(_) => None,
        })
        .ok_or_else(|| DhcpError::Config(format!("interface {name} has no IPv4 address")))
}

/// Bind the broadcast-capable UDP:67 listener used to receive client
/// requests.
fn bind_udp67(interface: &str) -> Result<tokio::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;

    let addr: SocketAddr = "0.0.0.0:67".parse().expect("static address");
    socket.bind(&addr.into())?;

    #[cfg(target_os = "linux")]
    socket.bind_device(Some(interface.as_bytes()))?;
    #[cfg(not(target_os = "linux"))]
    let _ = interface;

    socket.set_nonblocking(true)?;
    Ok(tokio::net::UdpSocket::from_std(socket.into())?)
}

/// Run one interface's serve loop until cancelled or a fatal socket error.
/// Startup failures (interface lookup, socket bind) are returned to the
/// caller, which treats them as fatal.
///
/// Two ingress paths run in parallel: the raw
/// ETH_P_ALL socket is primary (it is the only path that can see a client
/// with no IP yet), the UDP:67 listener is an alternate for environments
/// where raw capture isn't needed. `pnet_datalink`'s receiver is a blocking
/// API, so it runs on its own blocking thread and forwards frames to this
/// loop over a channel; the UDP socket is read directly since it is already
/// async. Both paths dispatch through the same `Handler` and reply over the
/// raw channel, since a reply may need to reach a client that still has no
/// routable address.
pub async fn run(handler: Arc<Mutex<Handler>>, server_ip: Ipv4Addr) -> Result<()> {
    let interface_name = handler.lock().unwrap().interface().to_string();
    let iface = resolve_interface(&interface_name)?;
    let src_mac = iface
        .mac
        .ok_or_else(|| DhcpError::Config(format!("interface {interface_name} has no MAC address")))?
        .octets();

    let (eth_tx, eth_rx) = match pnet_datalink::channel(&iface, Default::default())? {
        Channel::Ethernet(tx, rx) => (tx, rx),
        _ => {
            return Err(DhcpError::Config(format!(
                "interface {interface_name} does not support raw Ethernet framing"
            )))
        }
    };
    let eth_tx = Mutex::new(eth_tx);

    let udp = bind_udp67(&interface_name)?;
    info!(interface = %interface_name, "DHCP server listening on 0.0.0.0:67 and the raw link layer");

    let (raw_tx, mut raw_rx) = tokio::sync::mpsc::channel::<Vec<u8>>(64);
    let raw_iface = interface_name.clone();
    tokio::task::spawn_blocking(move || {
        let mut eth_rx = eth_rx;
        loop {
            match eth_rx.next() {
                Ok(frame) => {
                    if raw_tx.blocking_send(frame.to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(interface = %raw_iface, error = %e, "raw link read failed, stopping raw ingress");
                    break;
                }
            }
        }
    });

    let mut udp_buf = [0u8; 1500];
    loop {
        tokio::select! {
            frame = raw_rx.recv() => {
                let Some(frame) = frame else {
                    debug!(interface = %interface_name, "raw ingress closed");
                    continue;
                };
                if let Some(payload) = framer::extract_payload(&frame) {
                    dispatch(&handler, &eth_tx, payload, src_mac, server_ip, &interface_name);
                }
            }
            res = udp.recv_from(&mut udp_buf) => {
                let (len, src) = res?;
                debug!(interface = %interface_name, %src, "received via UDP:67");
                dispatch(&handler, &eth_tx, &udp_buf[..len], src_mac, server_ip, &interface_name);
            }
        }
    }
}

/// Parse one DHCP payload (from either ingress path), run it through the
/// Handler, and — if a reply is produced — frame and send it over the raw
/// link. Replies always go out raw: a client with no IP yet
/// cannot be reached any other way, and replying uniformly keeps one code
/// path instead of branching per ingress source.
fn dispatch(
    handler: &Mutex<Handler>,
    eth_tx: &Mutex<Box<dyn pnet_datalink::DataLinkSender>>,
    payload: &[u8],
    src_mac: [u8; 6],
    server_ip: Ipv4Addr,
    interface_name: &str,
) {
    let request = match DhcpPacket::parse(payload) {
        Ok(p) => p,
        Err(e) => {
            debug!(interface = %interface_name, error = %e, "dropping invalid packet");
            return;
        }
    };
    if request.op != OP_BOOTREQUEST {
        return;
    }

    let reply = handler.lock().unwrap().serve_dhcp(&request);
    let Some(reply) = reply else { return };

    // Destination MAC is CHAddr and destination IP is
    // YIAddr, unless the client set the Broadcast flag, in which case both
    // fall back to their link/IP broadcast forms.
    let (dest_mac, dest_ip) = if request.is_broadcast() {
        (BROADCAST_MAC, BROADCAST_IP)
    } else {
        (mac_bytes(&request.chaddr, request.hlen), reply.yiaddr)
    };

    let frame = framer::frame_reply(&reply.to_bytes(), src_mac, server_ip, dest_mac, dest_ip);
    if let Some(Err(e)) = eth_tx.lock().unwrap().send_to(&frame, None) {
        warn!(interface = %interface_name, error = %e, "failed to send framed reply");
    }
}

fn mac_bytes(chaddr: &[u8; 16], hlen: u8) -> [u8; 6] {
    let mut mac = [0u8; 6];
    let len = (hlen as usize).min(6);
    mac[..len].copy_from_slice(&chaddr[..len]);
    mac
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_ip_must_share_the_interface_network() {
        let server = Ipv4Addr::new(10, 0, 0, 1);
        let mask = Ipv4Addr::new(255, 255, 255, 0);
        assert!(validate_start_ip(server, Ipv4Addr::new(10, 0, 0, 10), mask).is_ok());
        assert!(validate_start_ip(server, Ipv4Addr::new(10, 0, 1, 10), mask).is_err());
    }
}
