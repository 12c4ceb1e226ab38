//! The 15-byte control ("hook") file.
//!
//! | offset | field          | type |
//! |--------|----------------|------|
//! | 0      | version        | i32  |
//! | 4      | generation     | i32  |
//! | 8      | capacity       | i32  |
//! | 12     | companion flag | bool |
//! | 13     | host flag      | bool |
//! | 14     | closed         | bool |

use std::path::Path;

use serde_derive::{Deserialize, Serialize};

use crate::errors::Result;
use crate::region::MappedRegion;

pub const VERSION_OFFSET: usize = 0;
pub const GENERATION_OFFSET: usize = 4;
pub const CAPACITY_OFFSET: usize = 8;
pub const COMPANION_ACTIVE_OFFSET: usize = 12;
pub const HOST_ACTIVE_OFFSET: usize = 13;
pub const CLOSED_OFFSET: usize = 14;
pub const CONTROL_LEN: usize = CLOSED_OFFSET + 1;

/// Which turn flag a side owns. Independent of who created the files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Companion,
}

impl Default for Role {
    fn default() -> Role {
        Role::Host
    }
}

impl Role {
    pub fn peer(self) -> Role {
        match self {
            Role::Host => Role::Companion,
            Role::Companion => Role::Host,
        }
    }

    pub fn active_offset(self) -> usize {
        match self {
            Role::Host => HOST_ACTIVE_OFFSET,
            Role::Companion => COMPANION_ACTIVE_OFFSET,
        }
    }
}

pub struct ControlChannel {
    region: MappedRegion,
}

impl ControlChannel {
    /// Creates the control file. The version is written last so a joiner
    /// that sees a valid version also sees the other fields.
    pub fn create(path: &Path, version: i32, capacity: i32, role: Role) -> Result<ControlChannel> {
        let mut region = MappedRegion::open(path, CONTROL_LEN, true)?;
        region.write_i32(GENERATION_OFFSET, 1)?;
        region.write_i32(CAPACITY_OFFSET, capacity)?;
        region.write_bool(role.active_offset(), true)?;
        region.write_i32(VERSION_OFFSET, version)?;
        Ok(ControlChannel { region })
    }

    pub fn attach(path: &Path) -> Result<ControlChannel> {
        let region = MappedRegion::open(path, CONTROL_LEN, false)?;
        Ok(ControlChannel { region })
    }

    pub fn path(&self) -> &Path {
        self.region.path()
    }

    pub fn version(&self) -> Result<i32> {
        Ok(self.region.read_i32(VERSION_OFFSET)?.0)
    }

    pub fn generation(&self) -> Result<i32> {
        Ok(self.region.read_i32(GENERATION_OFFSET)?.0)
    }

    pub fn set_generation(&mut self, generation: i32) -> Result<()> {
        self.region.write_i32(GENERATION_OFFSET, generation)?;
        Ok(())
    }

    pub fn capacity(&self) -> Result<i32> {
        Ok(self.region.read_i32(CAPACITY_OFFSET)?.0)
    }

    pub fn set_capacity(&mut self, capacity: i32) -> Result<()> {
        self.region.write_i32(CAPACITY_OFFSET, capacity)?;
        Ok(())
    }

    pub fn is_active(&self, role: Role) -> Result<bool> {
        Ok(self.region.read_bool(role.active_offset())?.0)
    }

    pub fn is_closed(&self) -> Result<bool> {
        Ok(self.region.read_bool(CLOSED_OFFSET)?.0)
    }

    pub fn mark_closed(&mut self) -> Result<()> {
        self.region.write_bool(CLOSED_OFFSET, true)?;
        Ok(())
    }

    /// Passes the turn from `from` to its peer. Clearing our own flag comes
    /// first so there is never a moment where both sides are active.
    pub(crate) fn hand_over(&mut self, from: Role) -> Result<()> {
        self.region.write_bool(from.active_offset(), false)?;
        self.region.write_bool(from.peer().active_offset(), true)?;
        Ok(())
    }

    pub fn close(&mut self) {
        self.region.close()
    }

    pub fn delete(&mut self) -> Result<()> {
        self.region.delete()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn layout_is_fifteen_bytes() -> std::result::Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("hook");
        let _control = ControlChannel::create(&path, 1, 100, Role::Host)?;
        let raw = fs::read(&path)?;
        assert_eq!(raw.len(), CONTROL_LEN);
        assert_eq!(&raw[0..4], &1i32.to_le_bytes());
        assert_eq!(&raw[4..8], &1i32.to_le_bytes());
        assert_eq!(&raw[8..12], &100i32.to_le_bytes());
        assert_eq!(&raw[12..15], &[0u8, 1, 0]);
        Ok(())
    }

    #[test]
    fn creator_flag_follows_role() -> std::result::Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let control = ControlChannel::create(&dir.path().join("hook"), 1, 8, Role::Companion)?;
        assert!(control.is_active(Role::Companion)?);
        assert!(!control.is_active(Role::Host)?);
        assert!(!control.is_closed()?);
        Ok(())
    }

    #[test]
    fn hand_over_flips_both_flags() -> std::result::Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("hook");
        let mut host = ControlChannel::create(&path, 1, 8, Role::Host)?;
        let mut companion = ControlChannel::attach(&path)?;
        host.hand_over(Role::Host)?;
        assert!(!companion.is_active(Role::Host)?);
        assert!(companion.is_active(Role::Companion)?);
        companion.hand_over(Role::Companion)?;
        assert!(host.is_active(Role::Host)?);
        assert!(!host.is_active(Role::Companion)?);
        Ok(())
    }

    #[test]
    fn fields_are_visible_to_attached_side() -> std::result::Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("hook");
        let mut host = ControlChannel::create(&path, 3, 8, Role::Host)?;
        let companion = ControlChannel::attach(&path)?;
        assert_eq!(companion.version()?, 3);
        host.set_generation(5)?;
        host.set_capacity(4096)?;
        host.mark_closed()?;
        assert_eq!(companion.generation()?, 5);
        assert_eq!(companion.capacity()?, 4096);
        assert!(companion.is_closed()?);
        Ok(())
    }

    #[test]
    fn roles_are_mirrored() {
        assert_eq!(Role::Host.peer(), Role::Companion);
        assert_eq!(Role::Companion.peer().active_offset(), HOST_ACTIVE_OFFSET);
    }
}
