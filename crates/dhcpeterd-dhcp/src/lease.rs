//! The per-client lease record and its static-reservation counterpart.

use std::net::Ipv4Addr;
use std::time::{Duration, SystemTime};

/// How long an `active_at` lease is considered freshly bound after its last
/// successful ACK, independent of `expiry`.
const ACTIVE_WINDOW: Duration = Duration::from_secs(20 * 60);

/// A dynamically assigned lease. `expiry == SystemTime::UNIX_EPOCH` means
/// "permanent" — it never expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Zero-based offset into the configured pool.
    pub num: u32,
    pub addr: Ipv4Addr,
    /// Lowercase colon-separated MAC.
    pub hardware_addr: String,
    /// Client-supplied hostname.
    pub hostname: Option<String>,
    /// Operator-supplied name; sticky across reassignment.
    pub hostname_override: Option<String>,
    pub expiry: SystemTime,
    pub last_ack: SystemTime,
}

impl Lease {
    pub fn is_permanent(&self) -> bool {
        self.expiry == SystemTime::UNIX_EPOCH
    }

    /// Expired at t: expiry is non-zero and t is after expiry.
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        !self.is_permanent() && now > self.expiry
    }

    /// Active at t: last_ack is non-zero and t is before last_ack + 20
    /// minutes.
    pub fn is_active_at(&self, now: SystemTime) -> bool {
        self.last_ack != SystemTime::UNIX_EPOCH && now < self.last_ack + ACTIVE_WINDOW
    }
}

/// An operator-configured reservation. Populated at startup only, never
/// expires, and is never mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticLease {
    pub addr: Ipv4Addr,
    /// Lowercase colon-separated MAC.
    pub hardware_addr: String,
    pub hostname: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(expiry: SystemTime, last_ack: SystemTime) -> Lease {
        Lease {
            num: 0,
            addr: Ipv4Addr::new(10, 0, 0, 10),
            hardware_addr: "aa:bb:cc:00:00:01".into(),
            hostname: None,
            hostname_override: None,
            expiry,
            last_ack,
        }
    }

    #[test]
    fn permanent_lease_never_expires() {
        let l = lease(SystemTime::UNIX_EPOCH, SystemTime::UNIX_EPOCH);
        assert!(l.is_permanent());
        assert!(!l.is_expired_at(SystemTime::now() + Duration::from_secs(10_000_000)));
    }

    #[test]
    fn expiry_in_the_past_is_expired() {
        let now = SystemTime::now();
        let l = lease(now - Duration::from_secs(1), SystemTime::UNIX_EPOCH);
        assert!(l.is_expired_at(now));
    }

    #[test]
    fn active_window_is_twenty_minutes() {
        let now = SystemTime::now();
        let l = lease(now + Duration::from_secs(3600), now - Duration::from_secs(60));
        assert!(l.is_active_at(now));
        assert!(!l.is_active_at(now + Duration::from_secs(21 * 60)));
    }
}
