//! Ring queues over the shared DMEM window.
//!
//! A queue is a flat byte ring at `(offset, size)` in DMEM. The cursors
//! live in chip registers: the producer commits its position to the head
//! register, the consumer to the tail register, so each side always sees
//! the other's last committed cursor and nothing in between. Records never
//! straddle the ring end; a writer that runs out of tail room emits a
//! 4-byte REWIND header and wraps to the base, and the reader wraps when it
//! dequeues that header. `has_room` keeps one header of slack so the
//! marker always fits.

use pmu_protocol::{align_up, QueueGeometry, QueueId, RecordHeader};
use thiserror::Error;

use crate::hw::{DmemBus, RegisterBus, RegisterLayout};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue {id:?} is not open")]
    NotOpen { id: QueueId },
    #[error("queue {id:?} is already open")]
    AlreadyOpen { id: QueueId },
    #[error("queue {id:?} flows {direction:?}, operation requires {requested:?}")]
    WrongMode {
        id: QueueId,
        direction: OpenMode,
        requested: OpenMode,
    },
    #[error("record length {len} is not representable after alignment")]
    Misaligned { len: usize },
    #[error("queue {id:?} overflow: {need} bytes needed, {free} free")]
    Overflow { id: QueueId, need: usize, free: usize },
}

/// Result of a writer-side space probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Room {
    pub fits: bool,
    /// The record only fits after wrapping to the queue base.
    pub rewind: bool,
    /// Usable bytes on the side of the ring the record would land in.
    pub free: usize,
}

/// One ring instance. Direction is fixed by identity: the message queue is
/// read-only for the host, command queues are write-only.
#[derive(Debug)]
pub struct Queue {
    id: QueueId,
    index: u8,
    offset: u32,
    size: u32,
    /// Uncommitted cursor while open.
    position: u32,
    opened: bool,
}

impl Queue {
    pub fn new(id: QueueId, geometry: QueueGeometry) -> Queue {
        Queue {
            id,
            index: geometry.index,
            offset: u32::from(geometry.offset),
            size: u32::from(geometry.size),
            position: 0,
            opened: false,
        }
    }

    pub fn id(&self) -> QueueId {
        self.id
    }

    fn direction(&self) -> OpenMode {
        if self.id == QueueId::Message {
            OpenMode::Read
        } else {
            OpenMode::Write
        }
    }

    fn head(&self, regs: &mut dyn RegisterBus, layout: &RegisterLayout) -> u32 {
        match self.id {
            QueueId::Message => regs.read32(layout.msgq_head),
            _ => regs.read32(layout.cmd_queue_head(self.index)),
        }
    }

    fn set_head(&self, regs: &mut dyn RegisterBus, layout: &RegisterLayout, value: u32) {
        match self.id {
            QueueId::Message => regs.write32(layout.msgq_head, value),
            _ => regs.write32(layout.cmd_queue_head(self.index), value),
        }
    }

    fn tail(&self, regs: &mut dyn RegisterBus, layout: &RegisterLayout) -> u32 {
        match self.id {
            QueueId::Message => regs.read32(layout.msgq_tail),
            _ => regs.read32(layout.cmd_queue_tail(self.index)),
        }
    }

    fn set_tail(&self, regs: &mut dyn RegisterBus, layout: &RegisterLayout, value: u32) {
        match self.id {
            QueueId::Message => regs.write32(layout.msgq_tail, value),
            _ => regs.write32(layout.cmd_queue_tail(self.index), value),
        }
    }

    pub fn is_empty(&self, regs: &mut dyn RegisterBus, layout: &RegisterLayout) -> bool {
        self.head(regs, layout) == self.tail(regs, layout)
    }

    /// Whether an aligned record of `len` bytes fits right now, and whether
    /// the writer must emit a REWIND marker first.
    ///
    /// One header of slack is reserved past the committed head so the
    /// marker itself always has a place to land.
    pub fn has_room(
        &self,
        regs: &mut dyn RegisterBus,
        layout: &RegisterLayout,
        len: usize,
    ) -> Room {
        let need = align_up(len) as u32;
        let mut head = self.head(regs, layout);
        let tail = self.tail(regs, layout);
        let mut rewind = false;
        let mut free = 0;

        if head >= tail {
            free = (self.offset + self.size - head)
                .saturating_sub(RecordHeader::SIZE_BYTES as u32);
            if need > free {
                rewind = true;
                head = self.offset;
            }
        }
        if head < tail {
            free = tail - head - 1;
        }

        Room { fits: need <= free, rewind, free: free as usize }
    }

    pub fn open(
        &mut self,
        regs: &mut dyn RegisterBus,
        layout: &RegisterLayout,
        mode: OpenMode,
    ) -> Result<(), QueueError> {
        if self.opened {
            return Err(QueueError::AlreadyOpen { id: self.id });
        }
        if mode != self.direction() {
            return Err(QueueError::WrongMode {
                id: self.id,
                direction: self.direction(),
                requested: mode,
            });
        }
        self.position = match mode {
            OpenMode::Write => self.head(regs, layout),
            OpenMode::Read => self.tail(regs, layout),
        };
        self.opened = true;
        Ok(())
    }

    /// Close the queue; `commit` publishes the cursor to the other side.
    pub fn close(
        &mut self,
        regs: &mut dyn RegisterBus,
        layout: &RegisterLayout,
        commit: bool,
    ) -> Result<(), QueueError> {
        if !self.opened {
            return Err(QueueError::NotOpen { id: self.id });
        }
        if commit {
            match self.direction() {
                OpenMode::Write => self.set_head(regs, layout, self.position),
                OpenMode::Read => self.set_tail(regs, layout, self.position),
            }
        }
        self.opened = false;
        Ok(())
    }

    pub fn push(&mut self, dmem: &mut dyn DmemBus, bytes: &[u8]) -> Result<(), QueueError> {
        if !self.opened {
            return Err(QueueError::NotOpen { id: self.id });
        }
        if self.direction() != OpenMode::Write {
            return Err(QueueError::WrongMode {
                id: self.id,
                direction: self.direction(),
                requested: OpenMode::Write,
            });
        }
        let aligned = Self::aligned_len(bytes.len())?;
        dmem.copy_to(self.position, bytes);
        self.position += aligned;
        Ok(())
    }

    /// Emit the wrap marker at the current position and restart at the
    /// queue base. The caller has already verified room via `has_room`.
    pub fn rewind_write(&mut self, dmem: &mut dyn DmemBus) -> Result<(), QueueError> {
        if !self.opened {
            return Err(QueueError::NotOpen { id: self.id });
        }
        let mut marker = Vec::with_capacity(RecordHeader::SIZE_BYTES);
        RecordHeader::rewind().encode_into(&mut marker);
        dmem.copy_to(self.position, &marker);
        self.position = self.offset;
        Ok(())
    }

    pub fn pop(&mut self, dmem: &mut dyn DmemBus, out: &mut [u8]) -> Result<(), QueueError> {
        if !self.opened {
            return Err(QueueError::NotOpen { id: self.id });
        }
        if self.direction() != OpenMode::Read {
            return Err(QueueError::WrongMode {
                id: self.id,
                direction: self.direction(),
                requested: OpenMode::Read,
            });
        }
        let aligned = Self::aligned_len(out.len())?;
        dmem.copy_from(self.position, out);
        self.position += aligned;
        Ok(())
    }

    /// Reader-side wrap: restart at the queue base after dequeuing a REWIND
    /// header.
    pub fn rewind_read(&mut self) {
        self.position = self.offset;
    }

    fn aligned_len(len: usize) -> Result<u32, QueueError> {
        if len == 0 {
            return Err(QueueError::Misaligned { len });
        }
        u32::try_from(align_up(len)).map_err(|_| QueueError::Misaligned { len })
    }
}
