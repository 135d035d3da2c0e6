//! DHCPv4 server library: packet codec, lease allocation, and the
//! link-layer plumbing that lets an unconfigured client be reached at all.

pub mod error;
pub mod framer;
pub mod handler;
pub mod lease;
pub mod options;
pub mod packet;
pub mod persistence;
pub mod server;
pub mod vendor;

pub use error::{DhcpError, Result};
pub use handler::{Clock, Handler, HandlerConfig, Sink, SystemClock};
pub use lease::{Lease, StaticLease};
pub use packet::DhcpPacket;
