//! Two processes taking turns over a pair of memory-mapped files.
//!
//! A small control file carries the protocol version, the generation of the
//! current data file, its capacity and the turn flags. The data file holds
//! the payload and is replaced, never grown in place, when a side resizes.

pub mod control;
pub mod core;
pub mod errors;
pub mod handshake;
pub mod region;
pub mod session;

#[cfg(test)]
mod tests;

/// Bumped whenever the control layout or handshake changes.
pub const PROTOCOL_VERSION: i32 = 1;

pub use crate::control::{ControlChannel, Role, CONTROL_LEN};
pub use crate::core::{delete_files, ShmemConfig, GENERATION_SEPARATOR, SHMEM_DIR_NAME};
pub use crate::errors::{Result, ShmemError};
pub use crate::handshake::TurnState;
pub use crate::region::MappedRegion;
pub use crate::session::{Session, SessionConfig};
