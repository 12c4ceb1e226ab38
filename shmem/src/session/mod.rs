use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::control::{ControlChannel, Role};
use crate::core::{self, ShmemConfig};
use crate::errors::{Result, ShmemError};
use crate::handshake::{timeout_from_secs, PollClock, TurnEvent, TurnState};
use crate::region::MappedRegion;
use crate::PROTOCOL_VERSION;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub shmem: ShmemConfig,
    pub prefix: String,
    /// Initial data capacity in bytes. Ignored when joining.
    pub capacity: usize,
    pub create: bool,
    pub role: Role,
    /// Zero or negative waits forever.
    pub timeout_secs: f64,
}

impl Default for SessionConfig {
    fn default() -> SessionConfig {
        SessionConfig {
            shmem: ShmemConfig::default(),
            prefix: "handoff".to_string(),
            capacity: 4096,
            create: true,
            role: Role::Host,
            timeout_secs: -1.0,
        }
    }
}

impl SessionConfig {
    pub fn new(
        prefix: &str,
        capacity: usize,
        create: bool,
        role: Role,
        timeout_secs: f64,
    ) -> SessionConfig {
        SessionConfig {
            prefix: prefix.to_string(),
            capacity,
            create,
            role,
            timeout_secs,
            ..Default::default()
        }
    }

    pub fn data_dir<P: Into<std::path::PathBuf>>(mut self, data_dir: P) -> SessionConfig {
        self.shmem.data_dir = data_dir.into();
        self
    }
}

fn capacity_field(capacity: usize) -> Result<i32> {
    match i32::try_from(capacity) {
        Ok(v) if v > 0 => Ok(v),
        _ => Err(ShmemError::InvalidArgument(format!(
            "capacity must be between 1 and {} bytes, got {}",
            i32::MAX,
            capacity
        ))),
    }
}

fn capacity_len(capacity: i32) -> Result<usize> {
    usize::try_from(capacity)
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| {
            ShmemError::InvalidArgument(format!("control file holds capacity {}", capacity))
        })
}

/// One side of a two-party channel.
///
/// Every payload accessor first waits for this side's turn, so callers
/// never touch the data file while the peer holds control.
pub struct Session {
    cfg: ShmemConfig,
    prefix: String,
    role: Role,
    timeout: Option<Duration>,
    control: ControlChannel,
    data: MappedRegion,
    generation: i32,
    /// Generation in place when this side last took control; the peer maps it.
    shared_generation: i32,
    state: TurnState,
}

impl Session {
    pub fn new(cfg: &SessionConfig) -> Result<Session> {
        core::validate_prefix(&cfg.prefix)?;
        cfg.shmem.ensure_data_dir()?;
        let mut session = if cfg.create {
            Session::create(cfg)?
        } else {
            Session::join(cfg)?
        };
        session.wait_unblocked()?;
        Ok(session)
    }

    fn create(cfg: &SessionConfig) -> Result<Session> {
        let capacity = capacity_field(cfg.capacity)?;
        let control_path = cfg.shmem.control_path(&cfg.prefix);
        let mut control =
            ControlChannel::create(&control_path, PROTOCOL_VERSION, capacity, cfg.role)?;
        let data_path = cfg.shmem.data_path(&cfg.prefix, 1);
        let data = match MappedRegion::open(&data_path, cfg.capacity, true) {
            Ok(v) => v,
            Err(e) => {
                if let Err(cleanup) = control.delete() {
                    tracing::warn!(
                        error = %cleanup,
                        "failed to remove control file after aborted create"
                    );
                }
                return Err(e);
            }
        };
        tracing::debug!(prefix = %cfg.prefix, role = ?cfg.role, capacity, "created session");
        Ok(Session::assemble(cfg, control, data, 1))
    }

    fn join(cfg: &SessionConfig) -> Result<Session> {
        let mut control = ControlChannel::attach(&cfg.shmem.control_path(&cfg.prefix))?;
        match Session::attach_data(cfg, &control) {
            Ok((data, generation)) => {
                tracing::debug!(
                    prefix = %cfg.prefix,
                    role = ?cfg.role,
                    generation,
                    "joined session"
                );
                Ok(Session::assemble(cfg, control, data, generation))
            }
            Err(e) => {
                // The files belong to the creator; only release our mapping.
                control.close();
                Err(e)
            }
        }
    }

    fn attach_data(cfg: &SessionConfig, control: &ControlChannel) -> Result<(MappedRegion, i32)> {
        let found = control.version()?;
        if found != PROTOCOL_VERSION {
            return Err(ShmemError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                found,
            });
        }
        let generation = control.generation()?;
        let capacity = capacity_len(control.capacity()?)?;
        let data_path = cfg.shmem.data_path(&cfg.prefix, generation);
        let data = MappedRegion::open(&data_path, capacity, false)?;
        Ok((data, generation))
    }

    fn assemble(
        cfg: &SessionConfig,
        control: ControlChannel,
        data: MappedRegion,
        generation: i32,
    ) -> Session {
        Session {
            cfg: cfg.shmem.clone(),
            prefix: cfg.prefix.clone(),
            role: cfg.role,
            timeout: timeout_from_secs(cfg.timeout_secs),
            control,
            data,
            generation,
            shared_generation: generation,
            state: TurnState::Idle,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    /// The generation of the data file this side currently maps.
    pub fn generation(&self) -> i32 {
        self.generation
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Reads the live flag; does not wait.
    pub fn is_blocked(&self) -> Result<bool> {
        self.ensure_open()?;
        Ok(!self.control.is_active(self.role)?)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state == TurnState::Closed {
            return Err(ShmemError::Closed);
        }
        Ok(())
    }

    fn advance(&mut self, event: TurnEvent) -> Result<()> {
        match self.state.on(event) {
            Some(next) => {
                self.state = next;
                Ok(())
            }
            None => Err(ShmemError::InvalidArgument(format!(
                "{:?} is not allowed while {:?}",
                event, self.state
            ))),
        }
    }

    fn abort(&mut self, event: TurnEvent, err: ShmemError) -> ShmemError {
        tracing::warn!(
            prefix = %self.prefix,
            role = ?self.role,
            error = %err,
            "tearing down session"
        );
        self.teardown();
        self.state = self.state.on(event).unwrap_or(TurnState::Closed);
        err
    }

    /// Blocks until this side holds control, the peer closes, or the
    /// configured timeout passes. The last two destroy the session.
    pub fn wait_unblocked(&mut self) -> Result<()> {
        self.ensure_open()?;
        let mut clock: Option<PollClock> = None;
        loop {
            if self.control.is_closed()? {
                return Err(self.abort(TurnEvent::PeerClosed, ShmemError::PeerGone));
            }
            if self.control.is_active(self.role)? {
                break;
            }
            if self.state != TurnState::Blocked {
                self.advance(TurnEvent::StillBlocked)?;
            }
            let clock = clock.get_or_insert_with(|| PollClock::start(self.timeout, &self.cfg));
            if clock.tick() {
                let waited = clock.elapsed();
                return Err(self.abort(TurnEvent::TimedOut, ShmemError::Timeout(waited)));
            }
        }
        let regained = self.state != TurnState::Active;
        self.advance(TurnEvent::Unblocked)?;
        self.follow_generation()?;
        if regained {
            self.shared_generation = self.generation;
        }
        Ok(())
    }

    fn follow_generation(&mut self) -> Result<()> {
        let live = self.control.generation()?;
        if live == self.generation {
            return Ok(());
        }
        let capacity = capacity_len(self.control.capacity()?)?;
        let next = MappedRegion::open(&self.cfg.data_path(&self.prefix, live), capacity, false)?;
        let mut old = std::mem::replace(&mut self.data, next);
        if let Err(e) = old.delete() {
            tracing::warn!(
                path = %old.path().display(),
                error = %e,
                "failed to remove old data file"
            );
        }
        tracing::debug!(
            prefix = %self.prefix,
            from = self.generation,
            to = live,
            capacity,
            "migrated data file"
        );
        self.generation = live;
        Ok(())
    }

    /// Hands control to the peer. With `wait` set, returns only after the
    /// peer has handed it back.
    pub fn give_control(&mut self, wait: bool) -> Result<()> {
        self.wait_unblocked()?;
        self.advance(TurnEvent::Yielded)?;
        self.control.hand_over(self.role)?;
        tracing::trace!(prefix = %self.prefix, role = ?self.role, "yielded control");
        if wait {
            self.wait_unblocked()?;
        }
        Ok(())
    }

    /// Grows the data file by replacing it with a new generation holding a
    /// copy of every old byte. Only the side holding control may resize.
    pub fn resize(&mut self, new_capacity: usize) -> Result<()> {
        self.ensure_open()?;
        if !self.state.holds_control() {
            // The peer may have handed control back since this side last looked.
            if !self.control.is_active(self.role)? {
                return Err(ShmemError::NotInControl);
            }
            self.wait_unblocked()?;
        }
        let old_capacity = self.data.len();
        if new_capacity < old_capacity {
            return Err(ShmemError::InvalidArgument(format!(
                "new capacity {} is smaller than current capacity {}",
                new_capacity, old_capacity
            )));
        }
        let capacity = capacity_field(new_capacity)?;
        let generation = self.generation.checked_add(1).ok_or_else(|| {
            ShmemError::InvalidArgument("generation counter exhausted".to_string())
        })?;

        let next_path = self.cfg.data_path(&self.prefix, generation);
        let mut next = MappedRegion::open(&next_path, new_capacity, true)?;
        let copied = self.data.as_bytes().and_then(|old| next.write_bytes(0, old));
        if let Err(e) = copied {
            let _ = next.delete();
            return Err(e);
        }
        self.control.set_generation(generation)?;
        self.control.set_capacity(capacity)?;
        let mut old = std::mem::replace(&mut self.data, next);
        // The peer deletes the file it maps when it migrates; any later one is ours.
        if self.generation != self.shared_generation {
            if let Err(e) = old.delete() {
                tracing::warn!(
                    path = %old.path().display(),
                    error = %e,
                    "failed to remove superseded data file"
                );
            }
        }
        self.generation = generation;
        tracing::info!(
            prefix = %self.prefix,
            generation,
            old_capacity,
            new_capacity,
            "resized data file"
        );
        Ok(())
    }

    /// Marks the session closed for the peer, releases both mappings and
    /// removes the current data file. Safe to call more than once.
    pub fn close(&mut self) {
        if self.state == TurnState::Closed {
            return;
        }
        self.release();
        self.state = TurnState::Closed;
    }

    fn release(&mut self) {
        if let Err(e) = self.control.mark_closed() {
            tracing::debug!(error = %e, "could not mark control file closed");
        }
        self.control.close();
        if let Err(e) = self.data.delete() {
            tracing::warn!(
                path = %self.data.path().display(),
                error = %e,
                "failed to remove data file"
            );
        }
    }

    /// Closes, then removes the control file and every generation file.
    pub fn delete(&mut self) {
        self.teardown();
        self.state = TurnState::Closed;
    }

    fn teardown(&mut self) {
        if self.state != TurnState::Closed {
            self.release();
        }
        if let Err(e) = self.control.delete() {
            tracing::warn!(
                path = %self.control.path().display(),
                error = %e,
                "failed to remove control file"
            );
        }
        if let Err(e) = core::delete_generation_files(&self.cfg, &self.prefix) {
            tracing::warn!(prefix = %self.prefix, error = %e, "failed to remove generation files");
        }
    }

    pub fn read_i32(&mut self, offset: usize) -> Result<(i32, usize)> {
        self.wait_unblocked()?;
        self.data.read_i32(offset)
    }

    pub fn write_i32(&mut self, offset: usize, value: i32) -> Result<usize> {
        self.wait_unblocked()?;
        self.data.write_i32(offset, value)
    }

    pub fn read_bool(&mut self, offset: usize) -> Result<(bool, usize)> {
        self.wait_unblocked()?;
        self.data.read_bool(offset)
    }

    pub fn write_bool(&mut self, offset: usize, value: bool) -> Result<usize> {
        self.wait_unblocked()?;
        self.data.write_bool(offset, value)
    }

    pub fn read_f32(&mut self, offset: usize) -> Result<(f32, usize)> {
        self.wait_unblocked()?;
        self.data.read_f32(offset)
    }

    pub fn write_f32(&mut self, offset: usize, value: f32) -> Result<usize> {
        self.wait_unblocked()?;
        self.data.write_f32(offset, value)
    }

    pub fn read_bytes(&mut self, offset: usize, len: usize) -> Result<(Vec<u8>, usize)> {
        self.wait_unblocked()?;
        self.data.read_bytes(offset, len)
    }

    pub fn write_bytes(&mut self, offset: usize, data: &[u8]) -> Result<usize> {
        self.wait_unblocked()?;
        self.data.write_bytes(offset, data)
    }

    /// Reads an i32 length followed by that many ASCII bytes.
    pub fn read_string(&mut self, offset: usize) -> Result<(String, usize)> {
        self.wait_unblocked()?;
        let (len, offset) = self.data.read_i32(offset)?;
        let len = usize::try_from(len)
            .map_err(|_| ShmemError::Encoding(format!("negative string length {}", len)))?;
        let (raw, next) = self.data.read_bytes(offset, len)?;
        if !raw.is_ascii() {
            return Err(ShmemError::Encoding(format!("non-ASCII string at offset {}", offset)));
        }
        let value = String::from_utf8(raw).map_err(|e| ShmemError::Encoding(e.to_string()))?;
        Ok((value, next))
    }

    pub fn write_string(&mut self, offset: usize, value: &str) -> Result<usize> {
        if !value.is_ascii() {
            return Err(ShmemError::InvalidArgument(format!("{:?} is not ASCII", value)));
        }
        let len = i32::try_from(value.len())
            .map_err(|_| ShmemError::InvalidArgument("string too long".to_string()))?;
        self.wait_unblocked()?;
        // Bounds-check the whole run before writing the length.
        if offset.checked_add(4 + value.len()).map_or(true, |end| end > self.data.len()) {
            return Err(ShmemError::OutOfBounds {
                offset,
                len: 4 + value.len(),
                capacity: self.data.len(),
            });
        }
        let offset = self.data.write_i32(offset, len)?;
        self.data.write_bytes(offset, value.as_bytes())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
