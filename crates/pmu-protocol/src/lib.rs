//! Wire format for the PMU host↔firmware command/message interface.
//!
//! This crate is the byte-level contract only:
//! - the 4-byte record header and the unit/queue/mutex id spaces,
//! - the versioned init-message geometry and payload-allocation encodings,
//! - typed command bodies (encode) and message bodies (decode) for the
//!   PG, ACR, PERFMON, and RC units, with `Unknown` fallback arms so a
//!   reader can always resynchronize past records it does not understand.
//!
//! Queue mechanics, sequence tracking, and dispatch live in
//! `pmu-transport`; this crate has no I/O and no state.
#![forbid(unsafe_code)]

pub mod acr;
pub mod alloc;
pub mod cmd;
pub mod header;
pub mod init;
pub mod perfmon;
pub mod pg;
pub mod rc;
pub mod version;
pub mod wire;

pub use alloc::{DmemSlice, FbSurface, PayloadAlloc};
pub use cmd::{CommandBody, Message, RawCommand};
pub use header::{
    unit_id, unit_id_is_valid, CtrlFlags, MutexId, QueueId, RecordHeader, MUTEX_COUNT,
    MUTEX_ID_INVALID, QUEUE_COUNT,
};
pub use init::{DmemRegion, InitMessage, QueueGeometry};
pub use version::ProtocolVersion;
pub use wire::{align_up, DecodeError, DMEM_ALIGN};
