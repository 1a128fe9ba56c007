//! In-flight command tracking.
//!
//! Every posted command reserves one of 256 slots; the slot index travels
//! in the record header's one-byte `seq_id` and is how the firmware's
//! response finds its way back. Callers never see the index; they get an
//! opaque, monotonically increasing [`SeqDesc`], so a descriptor from a
//! long-retired command can never be confused with a recycled slot.
//!
//! The table itself is plain data guarded by the transport; none of these
//! methods invoke user callbacks. Extraction methods hand the callback and
//! payload bookkeeping out so the caller can run them after dropping its
//! lock.

use pmu_protocol::{Message, PayloadAlloc};
use thiserror::Error;

pub const SEQ_COUNT: usize = 256;
const BITMAP_WORDS: usize = SEQ_COUNT / 32;

/// Opaque correlation handle returned by `post`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SeqDesc(u32);

impl SeqDesc {
    pub fn raw(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqState {
    Free,
    /// Reserved, command not yet on the wire.
    Pending,
    /// Command transmitted, response outstanding.
    Used,
    /// Retired by the caller; a late response is dropped silently.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SequenceError {
    #[error("sequence table exhausted (all 256 slots outstanding)")]
    ExhaustedTable,
    #[error("double free of sequence index {index}")]
    DoubleFree { index: u8 },
    #[error("no outstanding sequence matches descriptor {0}")]
    UnknownDescriptor(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Completed,
    Cancelled,
}

/// Everything a completion callback learns about its command's fate.
pub struct SequenceCompletion {
    pub desc: SeqDesc,
    pub status: CompletionStatus,
    /// Decoded response (absent on cancellation or undecodable bodies).
    pub message: Option<Message>,
    /// Raw response body, truncated to the capacity declared at post time.
    pub response: Vec<u8>,
    /// Out-of-line payload read back from the sequence's DMEM region.
    pub out_data: Vec<u8>,
    /// The response body exceeded the declared capacity and was cut short.
    pub truncated: bool,
}

pub type SeqCallback = Box<dyn FnOnce(SequenceCompletion) + Send>;

#[derive(Default)]
struct SequenceEntry {
    state: State,
    desc: u32,
    callback: Option<SeqCallback>,
    in_alloc: Option<PayloadAlloc>,
    out_alloc: Option<PayloadAlloc>,
    response_capacity: usize,
}

// Private alias so `derive(Default)` picks Free.
#[derive(Default, Clone, Copy, PartialEq, Eq)]
enum State {
    #[default]
    Free,
    Pending,
    Used,
    Cancelled,
}

impl From<State> for SeqState {
    fn from(state: State) -> SeqState {
        match state {
            State::Free => SeqState::Free,
            State::Pending => SeqState::Pending,
            State::Used => SeqState::Used,
            State::Cancelled => SeqState::Cancelled,
        }
    }
}

/// Slot bookkeeping handed back when an entry is retired; the caller owns
/// returning the DMEM regions and firing the callback.
pub struct RetiredEntry {
    pub desc: SeqDesc,
    pub callback: Option<SeqCallback>,
    pub in_alloc: Option<PayloadAlloc>,
    pub out_alloc: Option<PayloadAlloc>,
    pub response_capacity: usize,
}

impl core::fmt::Debug for RetiredEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RetiredEntry")
            .field("desc", &self.desc)
            .field("callback", &self.callback.as_ref().map(|_| "<callback>"))
            .field("in_alloc", &self.in_alloc)
            .field("out_alloc", &self.out_alloc)
            .field("response_capacity", &self.response_capacity)
            .finish()
    }
}

/// Outcome of resolving a response against the table.
pub enum Resolution {
    /// Entry was live; run the callback.
    Live(RetiredEntry),
    /// Entry was cancelled earlier; reclaim silently.
    CancelledEarlier(RetiredEntry),
    /// Entry already free (a stale or duplicate response).
    Stale,
}

pub struct SequenceTable {
    bitmap: [u32; BITMAP_WORDS],
    entries: Vec<SequenceEntry>,
    next_desc: u32,
}

impl Default for SequenceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceTable {
    pub fn new() -> Self {
        Self {
            bitmap: [0; BITMAP_WORDS],
            entries: (0..SEQ_COUNT).map(|_| SequenceEntry::default()).collect(),
            next_desc: 0,
        }
    }

    pub fn outstanding(&self) -> usize {
        self.bitmap.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Reserve the lowest free slot.
    pub fn allocate(
        &mut self,
        callback: SeqCallback,
        response_capacity: usize,
    ) -> Result<(u8, SeqDesc), SequenceError> {
        let index = self
            .bitmap
            .iter()
            .enumerate()
            .find_map(|(word, &bits)| {
                (bits != u32::MAX).then(|| word * 32 + bits.trailing_ones() as usize)
            })
            .ok_or(SequenceError::ExhaustedTable)?;

        self.bitmap[index / 32] |= 1 << (index % 32);
        let desc = self.next_desc;
        self.next_desc = self.next_desc.wrapping_add(1);

        let entry = &mut self.entries[index];
        entry.state = State::Pending;
        entry.desc = desc;
        entry.callback = Some(callback);
        entry.in_alloc = None;
        entry.out_alloc = None;
        entry.response_capacity = response_capacity;

        Ok((index as u8, SeqDesc(desc)))
    }

    pub fn set_allocs(
        &mut self,
        index: u8,
        in_alloc: Option<PayloadAlloc>,
        out_alloc: Option<PayloadAlloc>,
    ) {
        let entry = &mut self.entries[index as usize];
        entry.in_alloc = in_alloc;
        entry.out_alloc = out_alloc;
    }

    /// The command hit the wire; the slot now awaits its response.
    pub fn mark_transmitted(&mut self, index: u8) {
        self.entries[index as usize].state = State::Used;
    }

    pub fn state(&self, index: u8) -> SeqState {
        self.entries[index as usize].state.into()
    }

    pub fn out_alloc(&self, index: u8) -> Option<PayloadAlloc> {
        self.entries[index as usize].out_alloc
    }

    /// Resolve a response for `index`. Live entries are freed and handed
    /// back for callback delivery; cancelled entries are reclaimed without
    /// a callback; free entries report [`Resolution::Stale`].
    pub fn resolve(&mut self, index: u8) -> Resolution {
        match self.entries[index as usize].state {
            State::Free => Resolution::Stale,
            State::Cancelled => Resolution::CancelledEarlier(self.retire(index)),
            State::Pending | State::Used => Resolution::Live(self.retire(index)),
        }
    }

    /// Release a reserved slot that never made it onto the wire (post
    /// failure path). Freeing a free slot is a hard logic error.
    pub fn release(&mut self, index: u8) -> Result<RetiredEntry, SequenceError> {
        if self.entries[index as usize].state == State::Free {
            return Err(SequenceError::DoubleFree { index });
        }
        Ok(self.retire(index))
    }

    /// Caller-side cancellation (timeout path). The callback and payload
    /// regions are handed back immediately, but the slot stays reserved in
    /// the Cancelled state so a late firmware response reclaims it instead
    /// of colliding with a recycled index.
    pub fn cancel(&mut self, desc: SeqDesc) -> Result<RetiredEntry, SequenceError> {
        let index = self
            .entries
            .iter()
            .position(|e| e.state != State::Free && e.desc == desc.0)
            .ok_or(SequenceError::UnknownDescriptor(desc.0))?;

        let entry = &mut self.entries[index];
        entry.state = State::Cancelled;
        Ok(RetiredEntry {
            desc,
            callback: entry.callback.take(),
            in_alloc: entry.in_alloc.take(),
            out_alloc: entry.out_alloc.take(),
            response_capacity: entry.response_capacity,
        })
    }

    /// Teardown: retire every outstanding entry (cancelled ones included)
    /// and leave the table fully free.
    pub fn cancel_all(&mut self) -> Vec<RetiredEntry> {
        let mut retired = Vec::new();
        for index in 0..SEQ_COUNT {
            if self.entries[index].state != State::Free {
                retired.push(self.retire(index as u8));
            }
        }
        retired
    }

    fn retire(&mut self, index: u8) -> RetiredEntry {
        self.bitmap[index as usize / 32] &= !(1 << (index as usize % 32));
        let entry = &mut self.entries[index as usize];
        entry.state = State::Free;
        RetiredEntry {
            desc: SeqDesc(entry.desc),
            callback: entry.callback.take(),
            in_alloc: entry.in_alloc.take(),
            out_alloc: entry.out_alloc.take(),
            response_capacity: std::mem::take(&mut entry.response_capacity),
        }
    }
}
