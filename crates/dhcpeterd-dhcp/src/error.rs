//! Structured error types, one variant per failure category the daemon needs to report.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DhcpError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to parse DHCP packet: {0}")]
    Parse(#[from] crate::packet::DhcpParseError),

    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),

    #[error("lease persistence error: {0}")]
    Persistence(String),

    #[error("operator request rejected: {0}")]
    Operator(String),
}

pub type Result<T> = std::result::Result<T, DhcpError>;
