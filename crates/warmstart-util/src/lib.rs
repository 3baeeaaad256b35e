//! Shared utilities for warmstartd
//!
//! This crate provides:
//! - ID types (ConnectionId)
//! - Default paths for sockets and configuration
//! - The reporting sink (console or syslog) and `die`

mod ids;
mod paths;
mod report;

pub use ids::*;
pub use paths::*;
pub use report::*;
