//! The Handler: per-interface lease allocation and DHCPv4 message logic.
//!
//! This is the component the rest of the daemon is built around — the
//! serve loop and the persistence bridge both exist to feed it packets and
//! to durably record what it decides. Allocation works on an offset-based
//! pool, with one allocation quirk preserved verbatim rather than quietly
//! corrected (see the comment on `find_free_offset`).

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rand::RngCore;
use tracing::{debug, info, warn};

use crate::error::{DhcpError, Result};
use crate::lease::{Lease, StaticLease};
use crate::options::{self, DhcpOption};
use crate::packet::DhcpPacket;
use crate::vendor;

/// Default lease period for clients not matched by the Vendor Prefix Table.
pub const EXTENDED_LEASE_PERIOD: Duration = Duration::from_secs(60 * 60);

/// Receives lease-table snapshots whenever the Handler's state changes.
/// The Persistence Bridge is the production implementation; tests use a
/// `Vec`-backed stub. One-way by design — the Handler never reads back
/// through this trait.
pub trait Sink: Send + Sync {
    fn publish(&self, interface: &str, leases: Vec<Lease>);
}

/// Injected wall clock, so allocation and expiry logic can be driven by a
/// fixed instant in tests instead of racing `SystemTime::now()`.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// `u32::from(other) - u32::from(base)`, signed so an out-of-range address
/// (below `base`) is detectable rather than wrapping.
fn ip_delta(base: Ipv4Addr, other: Ipv4Addr) -> i64 {
    u32::from(other) as i64 - u32::from(base) as i64
}

fn addr_at_offset(base: Ipv4Addr, offset: u32) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(base).wrapping_add(offset))
}

/// Construction inputs for a single interface's Handler.
pub struct HandlerConfig {
    pub interface: String,
    pub server_ip: Ipv4Addr,
    pub start_ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub range: u32,
    pub lease_period: Duration,
    pub dns_servers: Vec<Ipv4Addr>,
    pub static_leases: Vec<StaticLease>,
}

pub struct Handler {
    interface: String,
    server_ip: Ipv4Addr,
    start_ip: Ipv4Addr,
    range: u32,
    lease_period: Duration,

    /// Precomputed, order-independent of any particular request.
    base_options: Vec<DhcpOption>,

    reserved_offsets: HashSet<u32>,
    /// The exact pool offset each static reservation is pinned to, computed
    /// once at construction the same way `reserved_offsets` is. DISCOVER
    /// reads this directly for a static client instead of resolving the
    /// reservation's own address through `can_lease`.
    static_offset_by_hw: HashMap<String, u32>,

    leases_by_offset: HashMap<u32, Lease>,
    leases_by_hw: HashMap<String, u32>,

    clock: Arc<dyn Clock>,
    rng: Box<dyn RngCore + Send>,
    sink: Option<Arc<dyn Sink>>,
}

impl Handler {
    /// Fails only if a configured DNS server address doesn't parse as IPv4 —
    /// in practice this can't happen since `dns_servers` is already typed,
    /// but we keep the `Result` return to match the documented construction
    /// failure mode and to leave room for future input
    /// validation (e.g. rejecting a `start_ip` outside `netmask`'s network).
    pub fn new(
        cfg: HandlerConfig,
        clock: Arc<dyn Clock>,
        rng: Box<dyn RngCore + Send>,
        sink: Option<Arc<dyn Sink>>,
    ) -> Result<Self> {
        if cfg.range == 0 {
            return Err(DhcpError::Config("lease range must be non-zero".into()));
        }

        let mut base_options = vec![
            DhcpOption::subnet_mask(cfg.netmask),
            DhcpOption::router(cfg.server_ip),
            DhcpOption::server_id(cfg.server_ip),
        ];
        if !cfg.dns_servers.is_empty() {
            base_options.push(DhcpOption::dns_servers(&cfg.dns_servers));
        }

        let mut reserved_offsets = HashSet::new();
        let mut static_offset_by_hw = HashMap::new();
        for s in &cfg.static_leases {
            let delta = ip_delta(cfg.start_ip, s.addr);
            if delta >= 0 {
                reserved_offsets.insert(delta as u32);
                static_offset_by_hw.insert(s.hardware_addr.clone(), delta as u32);
            }
        }

        Ok(Handler {
            interface: cfg.interface,
            server_ip: cfg.server_ip,
            start_ip: cfg.start_ip,
            range: cfg.range,
            lease_period: cfg.lease_period,
            base_options,
            reserved_offsets,
            static_offset_by_hw,
            leases_by_offset: HashMap::new(),
            leases_by_hw: HashMap::new(),
            clock,
            rng,
            sink,
        })
    }

    /// Restore persisted leases at startup. Any lease whose `last_ack` is
    /// the zero value (persisted snapshots predating that field, or a
    /// permanent lease with no ACK history) is backfilled from `expiry` so
    /// `is_active_at` has something sane to compare against.
    pub fn set_leases(&mut self, leases: Vec<Lease>) {
        self.leases_by_offset.clear();
        self.leases_by_hw.clear();
        for mut lease in leases {
            if lease.last_ack == SystemTime::UNIX_EPOCH {
                lease.last_ack = lease.expiry;
            }
            self.leases_by_hw.insert(lease.hardware_addr.clone(), lease.num);
            self.leases_by_offset.insert(lease.num, lease);
        }
        info!(
            interface = %self.interface,
            count = self.leases_by_offset.len(),
            "restored leases"
        );
    }

    fn is_vacant(&self, offset: u32, now: SystemTime) -> bool {
        match self.leases_by_offset.get(&offset) {
            None => true,
            Some(lease) => lease.is_expired_at(now),
        }
    }

    /// Random-probe-then-linear-scan allocation.
    ///
    /// The reserved-offset flag for the probed slot is read up front but,
    /// per a preserved quirk, is only acted on
    /// inside the same vacancy check the linear scan uses — so a probe
    /// landing on a reserved offset always falls through to the scan
    /// rather than short-circuiting early.
    pub fn find_free_offset(&mut self, now: SystemTime) -> Option<u32> {
        if self.range == 0 {
            return None;
        }

        let probe = self.rng.next_u32() % self.range;
        let probe_reserved = self.reserved_offsets.contains(&probe);
        if !probe_reserved && self.is_vacant(probe, now) {
            return Some(probe);
        }

        (0..self.range).find(|offset| {
            !self.reserved_offsets.contains(offset) && self.is_vacant(*offset, now)
        })
    }

    /// Validate a client-requested address, returning its pool offset if
    /// acceptable. The offset is the plain delta from `start_ip` — the same
    /// arithmetic `find_free_offset`/`addr_at_offset` use to hand the
    /// address out in the first place, so an address the server just
    /// offered always resolves back to the slot it was offered from.
    pub fn can_lease(&self, requested_ip: Ipv4Addr, hardware_addr: &str, now: SystemTime) -> Option<u32> {
        if requested_ip == Ipv4Addr::UNSPECIFIED {
            return None;
        }

        let delta = ip_delta(self.start_ip, requested_ip);
        if delta < 0 {
            return None;
        }
        let offset = delta as u32;

        match self.leases_by_offset.get(&offset) {
            Some(lease) if lease.hardware_addr == hardware_addr => Some(offset),
            Some(lease) if !lease.is_expired_at(now) => None,
            _ if offset < self.range => Some(offset),
            _ => None,
        }
    }

    pub fn lease_period_for(&self, hardware_addr: &str) -> Duration {
        if vendor::is_extended_lease_mac(hardware_addr) {
            EXTENDED_LEASE_PERIOD
        } else {
            self.lease_period
        }
    }

    fn filtered_options(&self, prl: Option<&[u8]>) -> Vec<DhcpOption> {
        match prl {
            None => self.base_options.clone(),
            Some(codes) => self
                .base_options
                .iter()
                .filter(|o| codes.contains(&o.code))
                .cloned()
                .collect(),
        }
    }

    fn publish(&self) {
        if let Some(sink) = &self.sink {
            let mut leases: Vec<Lease> = self.leases_by_offset.values().cloned().collect();
            leases.sort_by_key(|l| l.num);
            sink.publish(&self.interface, leases);
        }
    }

    /// Handle one parsed client packet, returning the reply to send (if
    /// any). Unrecognized message types produce no reply.
    pub fn serve_dhcp(&mut self, packet: &DhcpPacket) -> Option<DhcpPacket> {
        let now = self.clock.now();
        match packet.msg_type() {
            Some(options::DHCPDISCOVER) => self.handle_discover(packet, now),
            Some(options::DHCPREQUEST) => self.handle_request(packet, now),
            Some(options::DHCPDECLINE) => {
                self.handle_decline(packet, now);
                None
            }
            _ => None,
        }
    }

    /// DISCOVER: try each candidate source in order and take
    /// the first one that validates — not the first *category present*, so
    /// e.g. a requested_ip that fails `can_lease` still falls through to
    /// the client's existing lease before resorting to `find_free_offset`.
    fn handle_discover(&mut self, packet: &DhcpPacket, now: SystemTime) -> Option<DhcpPacket> {
        let hw = packet.mac_str();

        let mut offset = self.static_offset_by_hw.get(&hw).copied();

        if offset.is_none() {
            if let Some(req) = packet.requested_ip() {
                offset = self.can_lease(req, &hw, now);
            }
        }

        if offset.is_none() {
            if let Some(&existing) = self.leases_by_hw.get(&hw) {
                if self
                    .leases_by_offset
                    .get(&existing)
                    .is_some_and(|l| !l.is_expired_at(now))
                {
                    offset = Some(existing);
                }
            }
        }

        if offset.is_none() {
            offset = self.find_free_offset(now);
        }

        let offset = offset?;

        let addr = addr_at_offset(self.start_ip, offset);
        let lease_secs = self.lease_period_for(&hw).as_secs() as u32;
        let prl = packet.param_request_list();

        let mut opts = vec![DhcpOption::lease_time(lease_secs)];
        opts.extend(self.filtered_options(prl));

        debug!(interface = %self.interface, %hw, %addr, "offering lease");
        Some(packet.build_reply(options::DHCPOFFER, addr, self.server_ip, Ipv4Addr::UNSPECIFIED, opts))
    }

    fn handle_request(&mut self, packet: &DhcpPacket, now: SystemTime) -> Option<DhcpPacket> {
        if let Some(server_id) = packet.server_id() {
            if server_id != self.server_ip {
                return None;
            }
        }

        let hw = packet.mac_str();
        let requested = packet.requested_ip().filter(|ip| *ip != Ipv4Addr::UNSPECIFIED).unwrap_or(packet.ciaddr);

        let Some(offset) = self.can_lease(requested, &hw, now) else {
            warn!(interface = %self.interface, %hw, %requested, "NAK: address not available");
            return Some(packet.build_reply(
                options::DHCPNAK,
                Ipv4Addr::UNSPECIFIED,
                self.server_ip,
                Ipv4Addr::UNSPECIFIED,
                vec![],
            ));
        }

        let lease_period = self.lease_period_for(&hw);
        let mut expiry = now + lease_period;
        let mut hostname = packet.hostname();
        let mut hostname_override = None;

        if let Some(&prior_offset) = self.leases_by_hw.get(&hw) {
            // Reassignment to a different slot frees the old one; a renewal
            // at the same offset just rereads it. Either way the prior
            // lease's permanence and hostname override carry forward.
            let prior = if prior_offset != offset {
                self.leases_by_offset.remove(&prior_offset)
            } else {
                self.leases_by_offset.get(&prior_offset).cloned()
            };
            if let Some(prior) = prior {
                if prior.is_permanent() {
                    expiry = SystemTime::UNIX_EPOCH;
                    hostname = prior.hostname.clone();
                }
                if prior.hostname_override.is_some() {
                    hostname_override = prior.hostname_override.clone();
                    hostname = hostname_override.clone();
                }
            }
        }

        let lease = Lease {
            num: offset,
            addr: requested,
            hardware_addr: hw.clone(),
            hostname,
            hostname_override,
            expiry,
            last_ack: now,
        };
        self.leases_by_offset.insert(offset, lease);
        self.leases_by_hw.insert(hw.clone(), offset);
        self.publish();

        let lease_secs = lease_period.as_secs() as u32;
        let prl = packet.param_request_list();
        let mut opts = vec![DhcpOption::lease_time(lease_secs)];
        opts.extend(self.filtered_options(prl));

        info!(interface = %self.interface, %hw, %requested, "ACK");
        Some(packet.build_reply(options::DHCPACK, requested, self.server_ip, Ipv4Addr::UNSPECIFIED, opts))
    }

    fn handle_decline(&mut self, packet: &DhcpPacket, now: SystemTime) {
        let hw = packet.mac_str();
        if let Some(&offset) = self.leases_by_hw.get(&hw) {
            if let Some(lease) = self.leases_by_offset.get_mut(&offset) {
                lease.expiry = now;
                warn!(interface = %self.interface, %hw, "client declined offered address");
                self.publish();
            }
        }
    }

    /// Operator-driven hostname override. Must check both indices before
    /// touching the lease record — `leases_by_hw` can in principle name an
    /// offset whose `leases_by_offset` entry was since removed (e.g. by
    /// reassignment in `handle_request`), and stale cross-references there
    /// must not be dereferenced blindly.
    pub fn set_hostname(&mut self, hardware_addr: &str, name: &str) -> Result<()> {
        let now = self.clock.now();
        let Some(&offset) = self.leases_by_hw.get(hardware_addr) else {
            return Err(DhcpError::Operator(format!("no lease for {hardware_addr}")));
        };
        let Some(lease) = self.leases_by_offset.get_mut(&offset) else {
            return Err(DhcpError::Operator(format!("no lease for {hardware_addr}")));
        };
        if lease.hardware_addr != hardware_addr {
            return Err(DhcpError::Operator(format!("no lease for {hardware_addr}")));
        }
        if lease.is_expired_at(now) {
            return Err(DhcpError::Operator(format!("lease for {hardware_addr} has expired")));
        }

        lease.hostname = Some(name.to_string());
        lease.hostname_override = Some(name.to_string());
        self.publish();
        Ok(())
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Deterministic stand-in for a real RNG: always returns the same value.
    struct FixedRng(u32);
    impl RngCore for FixedRng {
        fn next_u32(&mut self) -> u32 {
            self.0
        }
        fn next_u64(&mut self) -> u64 {
            self.0 as u64
        }
        fn fill_bytes(&mut self, dest: &mut [u8]) {
            dest.fill(0);
        }
    }

    struct FixedClock(SystemTime);
    impl Clock for FixedClock {
        fn now(&self) -> SystemTime {
            self.0
        }
    }

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<(String, Vec<Lease>)>>);
    impl Sink for RecordingSink {
        fn publish(&self, interface: &str, leases: Vec<Lease>) {
            self.0.lock().unwrap().push((interface.to_string(), leases));
        }
    }

    fn handler(now: SystemTime, probe: u32) -> Handler {
        let cfg = HandlerConfig {
            interface: "eth0".into(),
            server_ip: Ipv4Addr::new(10, 0, 0, 1),
            start_ip: Ipv4Addr::new(10, 0, 0, 10),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            range: 10,
            lease_period: Duration::from_secs(20 * 60),
            dns_servers: vec![Ipv4Addr::new(10, 0, 0, 1)],
            static_leases: vec![],
        };
        Handler::new(
            cfg,
            Arc::new(FixedClock(now)),
            Box::new(FixedRng(probe)),
            None,
        )
        .unwrap()
    }

    fn discover_packet(hw: [u8; 6], xid: u32) -> DhcpPacket {
        let mut chaddr = [0u8; 16];
        chaddr[..6].copy_from_slice(&hw);
        DhcpPacket {
            op: crate::packet::OP_BOOTREQUEST,
            htype: 1,
            hlen: 6,
            hops: 0,
            xid,
            secs: 0,
            flags: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            sname: [0; 64],
            file: [0; 128],
            options: vec![DhcpOption::msg_type(options::DHCPDISCOVER)],
        }
    }

    #[test]
    fn find_free_offset_falls_back_to_scan_on_reserved_probe() {
        let now = SystemTime::now();
        let mut h = handler(now, 3);
        h.reserved_offsets.insert(3);
        let offset = h.find_free_offset(now).unwrap();
        assert_eq!(offset, 0);
    }

    #[test]
    fn can_lease_offset_is_the_plain_delta_from_start_ip() {
        let now = SystemTime::now();
        let h = handler(now, 0);
        let offset = h.can_lease(Ipv4Addr::new(10, 0, 0, 11), "aa:bb:cc:00:00:01", now);
        assert_eq!(offset, Some(1));
    }

    #[test]
    fn discover_offers_the_static_lease_own_address() {
        let now = SystemTime::now();
        let cfg = HandlerConfig {
            interface: "eth0".into(),
            server_ip: Ipv4Addr::new(10, 0, 0, 1),
            start_ip: Ipv4Addr::new(10, 0, 0, 10),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            range: 10,
            lease_period: Duration::from_secs(20 * 60),
            dns_servers: vec![],
            static_leases: vec![StaticLease {
                addr: Ipv4Addr::new(10, 0, 0, 12),
                hardware_addr: "aa:bb:cc:00:00:02".into(),
                hostname: "printer".into(),
            }],
        };
        let mut h = Handler::new(cfg, Arc::new(FixedClock(now)), Box::new(FixedRng(0)), None).unwrap();

        let discover = discover_packet([0xaa, 0xbb, 0xcc, 0, 0, 2], 1);
        let offer = h.serve_dhcp(&discover).expect("offer");
        assert_eq!(offer.yiaddr, Ipv4Addr::new(10, 0, 0, 12));
    }

    #[test]
    fn discover_then_request_assigns_and_publishes() {
        let now = SystemTime::now();
        let sink = Arc::new(RecordingSink::default());
        let cfg = HandlerConfig {
            interface: "eth0".into(),
            server_ip: Ipv4Addr::new(10, 0, 0, 1),
            start_ip: Ipv4Addr::new(10, 0, 0, 10),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            range: 10,
            lease_period: Duration::from_secs(20 * 60),
            dns_servers: vec![],
            static_leases: vec![],
        };
        let mut h = Handler::new(
            cfg,
            Arc::new(FixedClock(now)),
            Box::new(FixedRng(0)),
            Some(sink.clone()),
        )
        .unwrap();

        let discover = discover_packet([0xaa, 0xbb, 0xcc, 0, 0, 1], 1);
        let offer = h.serve_dhcp(&discover).expect("offer");
        assert_eq!(offer.yiaddr, Ipv4Addr::new(10, 0, 0, 10));

        let mut request = discover_packet([0xaa, 0xbb, 0xcc, 0, 0, 1], 2);
        request.options = vec![
            DhcpOption::msg_type(options::DHCPREQUEST),
            DhcpOption::requested_ip(Ipv4Addr::new(10, 0, 0, 10)),
        ];
        let ack = h.serve_dhcp(&request).expect("ack");
        assert_eq!(ack.yiaddr, Ipv4Addr::new(10, 0, 0, 10));
        assert_eq!(sink.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn request_with_wrong_server_id_is_ignored() {
        let now = SystemTime::now();
        let mut h = handler(now, 0);
        let mut request = discover_packet([0xaa, 0xbb, 0xcc, 0, 0, 1], 1);
        request.options = vec![
            DhcpOption::msg_type(options::DHCPREQUEST),
            DhcpOption::requested_ip(Ipv4Addr::new(10, 0, 0, 10)),
            DhcpOption::server_id(Ipv4Addr::new(10, 0, 0, 99)),
        ];
        assert!(h.serve_dhcp(&request).is_none());
    }

    #[test]
    fn set_hostname_rejects_unknown_hardware_addr() {
        let now = SystemTime::now();
        let mut h = handler(now, 0);
        assert!(h.set_hostname("aa:bb:cc:00:00:01", "toaster").is_err());
    }

    #[test]
    fn renewal_at_the_same_offset_keeps_hostname_override() {
        let now = SystemTime::now();
        let mut h = handler(now, 0);

        let mut first = discover_packet([0xaa, 0xbb, 0xcc, 0, 0, 1], 1);
        first.options = vec![
            DhcpOption::msg_type(options::DHCPREQUEST),
            DhcpOption::requested_ip(Ipv4Addr::new(10, 0, 0, 10)),
            DhcpOption::hostname("laptop-home"),
        ];
        h.serve_dhcp(&first).expect("ack");
        h.set_hostname("aa:bb:cc:00:00:01", "work-laptop").unwrap();

        let mut renewal = discover_packet([0xaa, 0xbb, 0xcc, 0, 0, 1], 2);
        renewal.options = vec![
            DhcpOption::msg_type(options::DHCPREQUEST),
            DhcpOption::requested_ip(Ipv4Addr::new(10, 0, 0, 10)),
            DhcpOption::hostname("laptop-home"),
        ];
        let ack = h.serve_dhcp(&renewal).expect("ack");
        assert_eq!(ack.yiaddr, Ipv4Addr::new(10, 0, 0, 10));

        let lease = h.leases_by_offset.get(&0).expect("lease retained");
        assert_eq!(lease.hostname.as_deref(), Some("work-laptop"));
        assert_eq!(lease.hostname_override.as_deref(), Some("work-laptop"));
    }
}
