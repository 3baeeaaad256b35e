//! Protocol types shared by the invoker and warmstartd
//!
//! This crate is the single source of truth for the wire protocol:
//! - Frame tags and what follows each one
//! - Option flags and protocol limits
//! - The request record handed to the spawner
//! - The invoker-side description of a launch

mod protocol;
mod request;

pub use protocol::*;
pub use request::*;
