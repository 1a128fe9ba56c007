//! Hardware mutex arbitration.
//!
//! The chip exposes a bank of mutex registers shared between the host, the
//! firmware, and other agents (BIOS/SMI). Ownership is claimed by writing a
//! hardware-issued owner token into the mutex register and reading it back;
//! a mismatch means another agent holds it. The arbiter adds host-side
//! reference counting so nested acquisition of the same mutex does not
//! repeat the handshake.
//!
//! The arbiter is not internally locked; the transport serializes access
//! with an outer mutex.

use pmu_protocol::{MutexId, MUTEX_COUNT};
use thiserror::Error;

use crate::hw::{RegisterBus, RegisterLayout};

/// Owner token of an unowned mutex register.
pub const MUTEX_OWNER_INIT: u8 = 0x00;
/// Owner token reported when the hardware pool is exhausted.
pub const MUTEX_OWNER_NOT_AVAIL: u8 = 0xFF;

/// Poll budget for the grant loop.
const ACQUIRE_ATTEMPTS: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MutexError {
    #[error("mutex id {0} is outside the valid range")]
    InvalidId(u8),
    #[error("hardware owner-token pool exhausted")]
    OwnerIdUnavailable,
    #[error("mutex {index} not granted after {attempts} attempts")]
    Timeout { index: usize, attempts: u32 },
    #[error("mutex {index} is not held")]
    NotOwned { index: usize },
    #[error("token {found:#04x} does not match granted token {expected:#04x}")]
    TokenMismatch { expected: u8, found: u8 },
}

#[derive(Debug, Clone, Copy, Default)]
struct MutexEntry {
    ref_cnt: u32,
    token: u8,
}

#[derive(Debug)]
pub struct MutexArbiter {
    entries: [MutexEntry; MUTEX_COUNT],
}

impl Default for MutexArbiter {
    fn default() -> Self {
        Self::new()
    }
}

impl MutexArbiter {
    pub fn new() -> Self {
        Self { entries: [MutexEntry::default(); MUTEX_COUNT] }
    }

    /// Claim `id`, performing the hardware handshake on the first
    /// acquisition. Returns the owner token to pass back to
    /// [`MutexArbiter::release`].
    pub fn acquire(
        &mut self,
        regs: &mut dyn RegisterBus,
        layout: &RegisterLayout,
        id: u8,
    ) -> Result<u8, MutexError> {
        let index = MutexId::from_raw(id).ok_or(MutexError::InvalidId(id))?.index();
        let entry = &mut self.entries[index];

        if entry.ref_cnt == 0 {
            let token = regs.read32(layout.mutex_owner_acquire) as u8;
            if token == MUTEX_OWNER_INIT || token == MUTEX_OWNER_NOT_AVAIL {
                return Err(MutexError::OwnerIdUnavailable);
            }

            let mut granted = false;
            for _ in 0..ACQUIRE_ATTEMPTS {
                regs.write32(layout.mutex_reg(index), u32::from(token));
                if regs.read32(layout.mutex_reg(index)) as u8 == token {
                    granted = true;
                    break;
                }
                std::hint::spin_loop();
            }
            if !granted {
                // Hand the unused token back before reporting failure.
                regs.write32(layout.mutex_owner_release, u32::from(token));
                return Err(MutexError::Timeout { index, attempts: ACQUIRE_ATTEMPTS });
            }
            entry.token = token;
        }

        entry.ref_cnt += 1;
        Ok(entry.token)
    }

    /// Drop one reference on `id`; the final release clears the hardware
    /// register and returns the owner token to the pool.
    pub fn release(
        &mut self,
        regs: &mut dyn RegisterBus,
        layout: &RegisterLayout,
        id: u8,
        token: u8,
    ) -> Result<(), MutexError> {
        let index = MutexId::from_raw(id).ok_or(MutexError::InvalidId(id))?.index();
        let entry = &mut self.entries[index];

        if entry.ref_cnt == 0 {
            return Err(MutexError::NotOwned { index });
        }
        if entry.token != token {
            return Err(MutexError::TokenMismatch { expected: entry.token, found: token });
        }

        entry.ref_cnt -= 1;
        if entry.ref_cnt == 0 {
            regs.write32(layout.mutex_reg(index), u32::from(MUTEX_OWNER_INIT));
            regs.write32(layout.mutex_owner_release, u32::from(token));
            entry.token = 0;
        }
        Ok(())
    }

    pub fn ref_count(&self, id: MutexId) -> u32 {
        self.entries[id.index()].ref_cnt
    }
}
