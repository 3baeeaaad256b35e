//! warmstartd library
//!
//! The pieces of the daemon that do not need a process of their own:
//! - Spawning launch requests as child processes
//! - Serving one invoker connection end to end
//! - The per-socket accept loop

mod mock;
mod spawner;
mod worker;

pub use mock::*;
pub use spawner::*;
pub use worker::*;
