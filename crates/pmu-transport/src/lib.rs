//! Host-side transport for the PMU command/message interface.
//!
//! This crate owns the moving parts between "caller wants to send a
//! command" and "caller's callback fires with the firmware's response":
//!
//! - [`queue`]: ring queues over the shared DMEM window, cursors in chip
//!   registers, REWIND wrap protocol;
//! - [`mutex`]: the hardware mutex handshake guarding the BIOS/SMI queues;
//! - [`sequence`]: the 256-entry in-flight command table and its opaque
//!   correlation descriptors;
//! - [`transport`]: the dispatcher (`post`) and the message pump
//!   (`pump_once`), tied together by the init/teardown lifecycle;
//! - [`hw`] / [`dmem`]: the collaborator seams (register bus, DMEM copy
//!   engine, payload allocator, interrupt gate) that keep chip specifics
//!   out of the core.
//!
//! The wire format itself lives in `pmu-protocol`.
#![forbid(unsafe_code)]

pub mod dmem;
pub mod hw;
pub mod mutex;
pub mod queue;
pub mod sequence;
pub mod transport;

pub use dmem::{DmemAllocator, DmemHeap};
pub use hw::{DmemBus, InterruptControl, NullInterruptControl, RegisterBus, RegisterLayout};
pub use mutex::{MutexArbiter, MutexError, MUTEX_OWNER_INIT, MUTEX_OWNER_NOT_AVAIL};
pub use queue::{OpenMode, Queue, QueueError, Room};
pub use sequence::{
    CompletionStatus, SeqCallback, SeqDesc, SequenceCompletion, SequenceError, SequenceTable,
    SEQ_COUNT,
};
pub use transport::{
    Payload, PayloadSource, PerfmonEvents, PostError, PumpError, Transport,
};
