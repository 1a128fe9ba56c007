//! The transport context: command dispatch and the message pump.
//!
//! One [`Transport`] owns the whole host side of the interface. It starts
//! in the `Starting` phase knowing nothing about DMEM layout; the
//! firmware's init message (consumed by [`Transport::pump_once`]) carries
//! the queue geometry and the software-managed allocation region, after
//! which the transport is `Ready` and [`Transport::post`] is open for
//! business.
//!
//! Locking: per-queue mutexes serialize producers; the sequence table,
//! allocator, register bus, and DMEM copy engine each sit behind their own
//! mutex. No transport lock is ever held while a completion callback or a
//! registered unit handler runs, so user code is free to post from either.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use pmu_protocol::rc::RcMessage;
use pmu_protocol::{
    align_up, unit_id, unit_id_is_valid, CommandBody, CtrlFlags, DecodeError, DmemSlice,
    FbSurface, InitMessage, Message, PayloadAlloc, ProtocolVersion, QueueId, RecordHeader,
    QUEUE_COUNT,
};
use pmu_protocol::perfmon::PerfmonMessage;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::dmem::DmemAllocator;
use crate::hw::{DmemBus, InterruptControl, RegisterBus, RegisterLayout};
use crate::mutex::{MutexArbiter, MutexError};
use crate::queue::{OpenMode, Queue, QueueError};
use crate::sequence::{
    CompletionStatus, Resolution, RetiredEntry, SeqCallback, SeqDesc, SequenceCompletion,
    SequenceError, SequenceTable,
};

/// Where the payload bytes for a command come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadSource {
    /// No inbound payload.
    None,
    /// Bytes the dispatcher copies into a fresh DMEM region.
    Bytes(Vec<u8>),
    /// A frame-buffer surface the firmware reads through its own DMA
    /// engine; only the descriptor travels.
    Surface(FbSurface),
}

/// Out-of-line payload description for [`Transport::post`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub input: PayloadSource,
    /// Bytes of DMEM to reserve for the firmware's reply data (0 = none).
    pub output_size: u16,
}

impl Payload {
    pub const NONE: Payload = Payload { input: PayloadSource::None, output_size: 0 };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PostError {
    #[error("transport has not completed firmware init")]
    NotReady,
    #[error("unit id {0:#04x} is not valid")]
    InvalidUnit(u8),
    #[error("queue {0:?} is not a command queue")]
    InvalidQueue(QueueId),
    #[error("encoded command is {size} bytes; records are limited to {max}")]
    CommandTooLarge { size: usize, max: usize },
    #[error("payload does not match the command's allocation slots")]
    PayloadMismatch,
    #[error("software-managed DMEM exhausted")]
    DmemExhausted,
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Mutex(#[from] MutexError),
    #[error(transparent)]
    Sequence(#[from] SequenceError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PumpError {
    #[error("message stream desynchronized (declared record size {size})")]
    Desynchronized { size: u8 },
    #[error("firmware init message rejected: {0}")]
    InvalidInit(DecodeError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for the firmware's init message.
    Starting,
    Ready,
}

/// Running perfmon event counters, updated by the pump.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerfmonEvents {
    pub increase: u64,
    pub decrease: u64,
}

type EventHandler = Arc<dyn Fn(&Message) + Send + Sync>;

pub struct Transport {
    version: ProtocolVersion,
    layout: RegisterLayout,
    regs: Mutex<Box<dyn RegisterBus>>,
    dmem: Mutex<Box<dyn DmemBus>>,
    allocator: Mutex<Box<dyn DmemAllocator>>,
    intr: Mutex<Box<dyn InterruptControl>>,
    queues: [Mutex<Option<Queue>>; QUEUE_COUNT],
    sequences: Mutex<SequenceTable>,
    arbiter: Mutex<MutexArbiter>,
    handlers: Mutex<HashMap<u8, EventHandler>>,
    phase: Mutex<Phase>,
    perfmon_events: Mutex<PerfmonEvents>,
}

impl Transport {
    pub fn new(
        version: ProtocolVersion,
        layout: RegisterLayout,
        regs: Box<dyn RegisterBus>,
        dmem: Box<dyn DmemBus>,
        allocator: Box<dyn DmemAllocator>,
        intr: Box<dyn InterruptControl>,
    ) -> Transport {
        Transport {
            version,
            layout,
            regs: Mutex::new(regs),
            dmem: Mutex::new(dmem),
            allocator: Mutex::new(allocator),
            intr: Mutex::new(intr),
            queues: std::array::from_fn(|_| Mutex::new(None)),
            sequences: Mutex::new(SequenceTable::new()),
            arbiter: Mutex::new(MutexArbiter::new()),
            handlers: Mutex::new(HashMap::new()),
            phase: Mutex::new(Phase::Starting),
            perfmon_events: Mutex::new(PerfmonEvents::default()),
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.phase.lock().unwrap(), Phase::Ready)
    }

    pub fn outstanding_commands(&self) -> usize {
        self.sequences.lock().unwrap().outstanding()
    }

    pub fn perfmon_events(&self) -> PerfmonEvents {
        *self.perfmon_events.lock().unwrap()
    }

    /// Route EVENT-flagged messages for `unit` to `handler`. One handler
    /// per unit; re-registering replaces the previous one.
    pub fn register_message_handler(
        &self,
        unit: u8,
        handler: impl Fn(&Message) + Send + Sync + 'static,
    ) {
        self.handlers.lock().unwrap().insert(unit, Arc::new(handler));
    }

    /// Submit a command. The call returns as soon as the record is in the
    /// target queue; completion arrives through `callback` when the pump
    /// drains the matching response (or on cancellation).
    ///
    /// The transport runs no timers: a caller that wants a timeout waits on
    /// its own primitive and retires the sequence with
    /// [`Transport::cancel`] when it gives up.
    pub fn post(
        &self,
        body: CommandBody,
        payload: Payload,
        queue_id: QueueId,
        response_capacity: usize,
        callback: SeqCallback,
    ) -> Result<SeqDesc, PostError> {
        if !self.is_ready() {
            return Err(PostError::NotReady);
        }
        if !queue_id.is_command_queue() {
            return Err(PostError::InvalidQueue(queue_id));
        }
        let unit = body.unit_id();
        if !unit_id_is_valid(unit) {
            return Err(PostError::InvalidUnit(unit));
        }

        let mut encoded = body.encode(self.version);
        let (index, desc) = self
            .sequences
            .lock()
            .unwrap()
            .allocate(callback, response_capacity)?;

        if let Err(err) = self.fill_payload(&body, &payload, &mut encoded, index) {
            self.reclaim_failed_post(index);
            return Err(err);
        }

        let total = RecordHeader::SIZE_BYTES + encoded.len();
        if total > u8::MAX as usize {
            self.reclaim_failed_post(index);
            return Err(PostError::CommandTooLarge { size: total, max: u8::MAX as usize });
        }

        let header = RecordHeader {
            unit_id: unit,
            size: total as u8,
            ctrl_flags: (CtrlFlags::STATUS | CtrlFlags::INTR).bits(),
            seq_id: index,
        };
        let mut record = Vec::with_capacity(total);
        header.encode_into(&mut record);
        record.extend_from_slice(&encoded);

        if let Err(err) = self.enqueue(queue_id, &record) {
            self.reclaim_failed_post(index);
            return Err(err);
        }

        self.sequences.lock().unwrap().mark_transmitted(index);
        debug!(unit, queue = ?queue_id, seq = index, "command posted");
        Ok(desc)
    }

    /// Retire an outstanding sequence whose response the caller no longer
    /// wants (timeout path). The callback fires with a Cancelled status; a
    /// response that still arrives later is reclaimed silently.
    pub fn cancel(&self, desc: SeqDesc) -> Result<(), SequenceError> {
        let retired = self.sequences.lock().unwrap().cancel(desc)?;
        self.return_payload_regions(&retired);
        deliver_cancellation(desc, retired.callback);
        Ok(())
    }

    /// Tear the transport down: every outstanding sequence completes with a
    /// cancellation, queues close, and the transport returns to `Starting`
    /// awaiting a fresh firmware init.
    pub fn shutdown(&self) {
        self.intr.lock().unwrap().set_enabled(false);
        let retired = self.sequences.lock().unwrap().cancel_all();
        for entry in retired {
            self.return_payload_regions(&entry);
            deliver_cancellation(entry.desc, entry.callback);
        }
        for slot in &self.queues {
            *slot.lock().unwrap() = None;
        }
        *self.phase.lock().unwrap() = Phase::Starting;
        info!("transport shut down");
    }

    /// Drain whatever the firmware has queued. Invoked from the message
    /// interrupt or a polling loop; returns the number of records
    /// processed.
    pub fn pump_once(&self) -> Result<usize, PumpError> {
        let phase = *self.phase.lock().unwrap();
        match phase {
            Phase::Starting => self.pump_init(),
            Phase::Ready => self.pump_ready(),
        }
    }

    // --- dispatch internals ---

    fn alloc_dmem(&self, size: usize) -> Result<u32, PostError> {
        u32::try_from(size)
            .ok()
            .and_then(|size| self.allocator.lock().unwrap().alloc(size))
            .ok_or(PostError::DmemExhausted)
    }

    /// Reserve and fill the DMEM payload regions, then splice their
    /// descriptors into the encoded body at the command's slots.
    fn fill_payload(
        &self,
        body: &CommandBody,
        payload: &Payload,
        encoded: &mut [u8],
        index: u8,
    ) -> Result<(), PostError> {
        let mut in_alloc = None;
        let mut out_alloc = None;

        let result = (|| {
            match &payload.input {
                PayloadSource::None => {}
                PayloadSource::Bytes(bytes) => {
                    let size =
                        u16::try_from(bytes.len()).map_err(|_| PostError::PayloadMismatch)?;
                    let offset = self.alloc_dmem(bytes.len())?;
                    self.dmem.lock().unwrap().copy_to(offset, bytes);
                    in_alloc = Some(PayloadAlloc {
                        dmem: DmemSlice { size, offset },
                        fb: FbSurface::default(),
                    });
                }
                PayloadSource::Surface(surface) => {
                    in_alloc = Some(PayloadAlloc {
                        dmem: DmemSlice::default(),
                        fb: *surface,
                    });
                }
            }
            if payload.output_size > 0 {
                let offset = self.alloc_dmem(payload.output_size as usize)?;
                out_alloc = Some(PayloadAlloc {
                    dmem: DmemSlice { size: payload.output_size, offset },
                    fb: FbSurface::default(),
                });
            }

            if let Some(alloc) = &in_alloc {
                let slot = body.in_alloc_offset().ok_or(PostError::PayloadMismatch)?;
                splice_alloc(encoded, slot, alloc, self.version)?;
            }
            if let Some(alloc) = &out_alloc {
                let slot = body.out_alloc_offset().ok_or(PostError::PayloadMismatch)?;
                splice_alloc(encoded, slot, alloc, self.version)?;
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                self.sequences
                    .lock()
                    .unwrap()
                    .set_allocs(index, in_alloc, out_alloc);
                Ok(())
            }
            Err(err) => {
                let mut allocator = self.allocator.lock().unwrap();
                for alloc in [&in_alloc, &out_alloc].into_iter().flatten() {
                    if alloc.dmem.size > 0 {
                        allocator.free(alloc.dmem.offset, u32::from(alloc.dmem.size));
                    }
                }
                Err(err)
            }
        }
    }

    fn enqueue(&self, queue_id: QueueId, record: &[u8]) -> Result<(), PostError> {
        let mut guard = self.queues[queue_id.index()].lock().unwrap();
        let queue = guard.as_mut().ok_or(PostError::NotReady)?;

        let hw_mutex = match queue_id.hardware_mutex() {
            Some(mutex_id) => {
                let mut arbiter = self.arbiter.lock().unwrap();
                let mut regs = self.regs.lock().unwrap();
                let token = arbiter.acquire(&mut **regs, &self.layout, mutex_id as u8)?;
                Some((mutex_id, token))
            }
            None => None,
        };

        let result = self.write_record(queue, record);

        if let Some((mutex_id, token)) = hw_mutex {
            let mut arbiter = self.arbiter.lock().unwrap();
            let mut regs = self.regs.lock().unwrap();
            // The token was granted above, so release cannot mismatch.
            let _ = arbiter.release(&mut **regs, &self.layout, mutex_id as u8, token);
        }
        result
    }

    fn write_record(&self, queue: &mut Queue, record: &[u8]) -> Result<(), PostError> {
        let mut regs = self.regs.lock().unwrap();
        let mut dmem = self.dmem.lock().unwrap();
        let regs = &mut **regs;
        let dmem = &mut **dmem;

        queue.open(regs, &self.layout, OpenMode::Write)?;
        let room = queue.has_room(regs, &self.layout, record.len());
        if !room.fits {
            let _ = queue.close(regs, &self.layout, false);
            return Err(QueueError::Overflow {
                id: queue.id(),
                need: align_up(record.len()),
                free: room.free,
            }
            .into());
        }

        let written = (|| {
            if room.rewind {
                queue.rewind_write(dmem)?;
            }
            queue.push(dmem, record)
        })();

        match written {
            Ok(()) => {
                queue.close(regs, &self.layout, true)?;
                Ok(())
            }
            Err(err) => {
                let _ = queue.close(regs, &self.layout, false);
                Err(err.into())
            }
        }
    }

    fn reclaim_failed_post(&self, index: u8) {
        match self.sequences.lock().unwrap().release(index) {
            Ok(retired) => self.return_payload_regions(&retired),
            Err(err) => warn!(%err, "sequence reclaim after failed post"),
        }
    }

    fn return_payload_regions(&self, retired: &RetiredEntry) {
        let mut allocator = self.allocator.lock().unwrap();
        for alloc in [&retired.in_alloc, &retired.out_alloc].into_iter().flatten() {
            if alloc.dmem.size > 0 {
                allocator.free(alloc.dmem.offset, u32::from(alloc.dmem.size));
            }
        }
    }

    // --- pump internals ---

    /// Before init, the message queue's bounds are unknown; the init record
    /// is read straight through the dedicated cursor registers.
    fn pump_init(&self) -> Result<usize, PumpError> {
        let (header, body) = {
            let mut regs = self.regs.lock().unwrap();
            let regs = &mut **regs;
            let tail = regs.read32(self.layout.msgq_tail);
            let head = regs.read32(self.layout.msgq_head);
            if head == tail {
                return Ok(0);
            }

            let mut dmem = self.dmem.lock().unwrap();
            let mut raw = [0u8; RecordHeader::SIZE_BYTES];
            dmem.copy_from(tail, &mut raw);
            let header = RecordHeader::from_bytes(raw);
            if (header.size as usize) < RecordHeader::SIZE_BYTES {
                return Err(PumpError::Desynchronized { size: header.size });
            }
            let mut body = vec![0u8; header.body_len()];
            dmem.copy_from(tail + RecordHeader::SIZE_BYTES as u32, &mut body);
            regs.write32(self.layout.msgq_tail, tail + align_up(header.size as usize) as u32);
            (header, body)
        };

        if header.unit_id != unit_id::INIT {
            warn!(unit = header.unit_id, "dropping pre-init message");
            return Ok(0);
        }

        let init = InitMessage::decode(self.version, &body).map_err(PumpError::InvalidInit)?;
        self.apply_init(&init);
        Ok(1)
    }

    fn apply_init(&self, init: &InitMessage) {
        for (i, geometry) in init.queues.iter().enumerate() {
            if let Some(id) = QueueId::from_index(i) {
                *self.queues[i].lock().unwrap() = Some(Queue::new(id, *geometry));
            }
        }
        self.allocator.lock().unwrap().set_region(init.sw_managed);
        self.intr.lock().unwrap().set_enabled(true);
        *self.phase.lock().unwrap() = Phase::Ready;
        info!(
            sw_offset = init.sw_managed.offset,
            sw_size = init.sw_managed.size,
            "firmware init received; transport ready"
        );
    }

    fn pump_ready(&self) -> Result<usize, PumpError> {
        let mut processed = 0;
        while let Some((header, body)) = self.read_message()? {
            self.process_message(&header, &body);
            processed += 1;
        }
        Ok(processed)
    }

    /// Dequeue one record from the message queue, committing the tail so
    /// the firmware regains the space even if processing drops the record.
    fn read_message(&self) -> Result<Option<(RecordHeader, Vec<u8>)>, PumpError> {
        let mut guard = self.queues[QueueId::Message.index()].lock().unwrap();
        let Some(queue) = guard.as_mut() else {
            return Ok(None);
        };
        let mut regs = self.regs.lock().unwrap();
        let mut dmem = self.dmem.lock().unwrap();
        let regs = &mut **regs;
        let dmem = &mut **dmem;

        if queue.is_empty(regs, &self.layout) {
            return Ok(None);
        }

        queue.open(regs, &self.layout, OpenMode::Read)?;
        let mut raw = [0u8; RecordHeader::SIZE_BYTES];
        queue.pop(dmem, &mut raw)?;
        let mut header = RecordHeader::from_bytes(raw);
        if header.unit_id == unit_id::REWIND {
            queue.rewind_read();
            queue.pop(dmem, &mut raw)?;
            header = RecordHeader::from_bytes(raw);
        }

        if (header.size as usize) < RecordHeader::SIZE_BYTES {
            // A corrupt length cannot be skipped; the stream is lost until
            // the firmware re-initializes the transport.
            let _ = queue.close(regs, &self.layout, false);
            *guard = None;
            *self.phase.lock().unwrap() = Phase::Starting;
            warn!(size = header.size, "message queue desynchronized; closed");
            return Err(PumpError::Desynchronized { size: header.size });
        }

        let mut body = vec![0u8; header.body_len()];
        if !body.is_empty() {
            queue.pop(dmem, &mut body)?;
        }
        queue.close(regs, &self.layout, true)?;
        Ok(Some((header, body)))
    }

    fn process_message(&self, header: &RecordHeader, body: &[u8]) {
        if !unit_id_is_valid(header.unit_id) {
            warn!(unit = header.unit_id, "dropping message from invalid unit");
            return;
        }
        let message = match Message::decode(self.version, header, body) {
            Ok(message) => message,
            Err(err) => {
                warn!(unit = header.unit_id, %err, "dropping undecodable message");
                return;
            }
        };

        if header.flags().contains(CtrlFlags::EVENT) {
            self.process_event(header.unit_id, &message);
        } else {
            self.resolve_response(header, body, message);
        }
    }

    fn process_event(&self, unit: u8, message: &Message) {
        match message {
            Message::Rc(RcMessage::UnhandledCommand { unit_id }) => {
                warn!(unit = unit_id, "firmware could not handle a command");
            }
            Message::Perfmon(PerfmonMessage::Increase { .. }) => {
                self.perfmon_events.lock().unwrap().increase += 1;
            }
            Message::Perfmon(PerfmonMessage::Decrease { .. }) => {
                self.perfmon_events.lock().unwrap().decrease += 1;
            }
            Message::Init(_) => {
                warn!("unexpected init message while ready");
                return;
            }
            _ => {}
        }

        let handler = self.handlers.lock().unwrap().get(&unit).cloned();
        if let Some(handler) = handler {
            handler(message);
        }
    }

    fn resolve_response(&self, header: &RecordHeader, body: &[u8], message: Message) {
        let resolution = self.sequences.lock().unwrap().resolve(header.seq_id);
        match resolution {
            Resolution::Stale => {
                debug!(seq = header.seq_id, "stale response for a free sequence slot");
            }
            Resolution::CancelledEarlier(retired) => {
                debug!(seq = header.seq_id, "response for a cancelled sequence");
                self.return_payload_regions(&retired);
            }
            Resolution::Live(retired) => {
                let out_data = match &retired.out_alloc {
                    Some(alloc) if alloc.dmem.size > 0 => {
                        let mut buf = vec![0u8; alloc.dmem.size as usize];
                        self.dmem.lock().unwrap().copy_from(alloc.dmem.offset, &mut buf);
                        buf
                    }
                    _ => Vec::new(),
                };
                self.return_payload_regions(&retired);

                let truncated = body.len() > retired.response_capacity;
                if truncated {
                    warn!(
                        seq = header.seq_id,
                        declared = body.len(),
                        capacity = retired.response_capacity,
                        "response truncated to caller capacity"
                    );
                }
                let response = body[..body.len().min(retired.response_capacity)].to_vec();
                if let Some(callback) = retired.callback {
                    callback(SequenceCompletion {
                        desc: retired.desc,
                        status: CompletionStatus::Completed,
                        message: Some(message),
                        response,
                        out_data,
                        truncated,
                    });
                }
            }
        }
    }
}

fn splice_alloc(
    encoded: &mut [u8],
    offset: usize,
    alloc: &PayloadAlloc,
    version: ProtocolVersion,
) -> Result<(), PostError> {
    let bytes = alloc.encode(version);
    let end = offset
        .checked_add(bytes.len())
        .filter(|&end| end <= encoded.len())
        .ok_or(PostError::PayloadMismatch)?;
    encoded[offset..end].copy_from_slice(&bytes);
    Ok(())
}

fn deliver_cancellation(desc: SeqDesc, callback: Option<SeqCallback>) {
    if let Some(callback) = callback {
        callback(SequenceCompletion {
            desc,
            status: CompletionStatus::Cancelled,
            message: None,
            response: Vec::new(),
            out_data: Vec::new(),
            truncated: false,
        });
    }
}
