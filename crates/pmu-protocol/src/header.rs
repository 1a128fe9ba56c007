//! The 4-byte record header shared by commands and messages, and the id
//! spaces it indexes into (units, queues, mutexes).
//!
//! Every record in a command or message queue starts with this header;
//! `size` counts the header itself, so a bare header is a legal 4-byte
//! record (the REWIND marker uses exactly that).

use bitflags::bitflags;

use crate::wire::{DecodeError, Reader};

/// Units a command can be addressed to / a message can originate from.
///
/// The id space is sparse; ids outside the known set but below
/// [`unit_id::END`] belong to firmware units this host build does not talk
/// to and still count as valid on the wire.
pub mod unit_id {
    /// Queue-control marker, never dispatched to a unit handler.
    pub const REWIND: u8 = 0x00;
    pub const PG: u8 = 0x03;
    pub const INIT: u8 = 0x07;
    pub const ACR: u8 = 0x0A;
    pub const PERFMON: u8 = 0x12;
    pub const RC: u8 = 0x1F;
    /// First id past the defined unit range.
    pub const END: u8 = 0x23;
    /// Reserved verification range at the top of the id space.
    pub const TEST_START: u8 = 0xFE;
}

/// A unit id is valid if it is below the end marker or inside the reserved
/// test range.
pub fn unit_id_is_valid(id: u8) -> bool {
    id < unit_id::END || id >= unit_id::TEST_START
}

/// Logical queue identifiers.
///
/// The first four queues carry host→firmware commands; the last carries
/// firmware→host messages. BIOS/SMI are shared with other hardware agents
/// and writes to them take the hardware mutex instead of a host lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum QueueId {
    /// High-priority command queue (software lock).
    Hpq = 0,
    /// Low-priority command queue (software lock).
    Lpq = 1,
    /// BIOS-shared command queue (hardware mutex).
    Bios = 2,
    /// SMI-shared command queue (hardware mutex).
    Smi = 3,
    /// Firmware→host message queue (single reader, no lock).
    Message = 4,
}

pub const QUEUE_COUNT: usize = 5;

impl QueueId {
    pub fn from_index(index: usize) -> Option<QueueId> {
        match index {
            0 => Some(QueueId::Hpq),
            1 => Some(QueueId::Lpq),
            2 => Some(QueueId::Bios),
            3 => Some(QueueId::Smi),
            4 => Some(QueueId::Message),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn is_command_queue(self) -> bool {
        !matches!(self, QueueId::Message)
    }

    /// Command queues whose writers serialize on a host-side lock rather
    /// than the hardware mutex.
    pub fn is_software_queue(self) -> bool {
        matches!(self, QueueId::Hpq | QueueId::Lpq)
    }

    pub fn hardware_mutex(self) -> Option<MutexId> {
        match self {
            QueueId::Bios => Some(MutexId::QueueBios),
            QueueId::Smi => Some(MutexId::QueueSmi),
            _ => None,
        }
    }
}

/// Hardware mutex ids. One sentinel id past the end marks "invalid".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MutexId {
    Rsvd1 = 0,
    GpUser = 1,
    QueueBios = 2,
    QueueSmi = 3,
    GpMutex = 4,
    I2c = 5,
    RmLock = 6,
    MsgBox = 7,
    Fifo = 8,
    Pg = 9,
    Gr = 10,
    Clk = 11,
    Rsvd6 = 12,
    Rsvd7 = 13,
    Rsvd8 = 14,
    Rsvd9 = 15,
}

pub const MUTEX_COUNT: usize = 16;

/// The sentinel value above the enumerated range.
pub const MUTEX_ID_INVALID: u8 = MUTEX_COUNT as u8;

impl MutexId {
    pub fn from_raw(raw: u8) -> Option<MutexId> {
        match raw {
            0 => Some(MutexId::Rsvd1),
            1 => Some(MutexId::GpUser),
            2 => Some(MutexId::QueueBios),
            3 => Some(MutexId::QueueSmi),
            4 => Some(MutexId::GpMutex),
            5 => Some(MutexId::I2c),
            6 => Some(MutexId::RmLock),
            7 => Some(MutexId::MsgBox),
            8 => Some(MutexId::Fifo),
            9 => Some(MutexId::Pg),
            10 => Some(MutexId::Gr),
            11 => Some(MutexId::Clk),
            12 => Some(MutexId::Rsvd6),
            13 => Some(MutexId::Rsvd7),
            14 => Some(MutexId::Rsvd8),
            15 => Some(MutexId::Rsvd9),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

bitflags! {
    /// Control-flag byte of the record header. The low nibble belongs to
    /// the host; the high nibble ([`CtrlFlags::FIRMWARE_MASK`]) is owned by
    /// the firmware and must be preserved on echo.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CtrlFlags: u8 {
        /// The command expects a status response.
        const STATUS = 1 << 0;
        /// Raise an interrupt on completion.
        const INTR = 1 << 1;
        /// The message is an unsolicited event, not a response.
        const EVENT = 1 << 2;
        const WATERMARK = 1 << 3;
        const FIRMWARE_MASK = 0xF0;
    }
}

/// `unit_id:u8, size:u8, ctrl_flags:u8, seq_id:u8`. `size` includes the
/// header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub unit_id: u8,
    pub size: u8,
    pub ctrl_flags: u8,
    pub seq_id: u8,
}

impl RecordHeader {
    pub const SIZE_BYTES: usize = 4;

    /// Largest body a record can carry given the u8 size field.
    pub const MAX_BODY_BYTES: usize = u8::MAX as usize - Self::SIZE_BYTES;

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.unit_id);
        out.push(self.size);
        out.push(self.ctrl_flags);
        out.push(self.seq_id);
    }

    pub fn from_bytes(bytes: [u8; Self::SIZE_BYTES]) -> RecordHeader {
        RecordHeader {
            unit_id: bytes[0],
            size: bytes[1],
            ctrl_flags: bytes[2],
            seq_id: bytes[3],
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<RecordHeader, DecodeError> {
        let mut r = Reader::new(bytes);
        let mut raw = [0u8; Self::SIZE_BYTES];
        raw.copy_from_slice(r.read_bytes(Self::SIZE_BYTES)?);
        Ok(Self::from_bytes(raw))
    }

    pub fn body_len(&self) -> usize {
        (self.size as usize).saturating_sub(Self::SIZE_BYTES)
    }

    pub fn flags(&self) -> CtrlFlags {
        CtrlFlags::from_bits_retain(self.ctrl_flags)
    }

    /// A 4-byte header with the REWIND unit: tells the reader the writer
    /// wrapped to the queue base.
    pub fn rewind() -> RecordHeader {
        RecordHeader {
            unit_id: unit_id::REWIND,
            size: Self::SIZE_BYTES as u8,
            ctrl_flags: 0,
            seq_id: 0,
        }
    }
}
