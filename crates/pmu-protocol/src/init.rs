//! The one-shot init message the firmware sends at boot.
//!
//! It advertises where each queue lives in DMEM and which slice of DMEM the
//! host may manage for payload allocations. The geometry layout changed
//! across interface revisions; v3 in particular stopped carrying per-queue
//! offsets and instead packs the queues back-to-back from a single base
//! offset. Everything decodes to the canonical [`InitMessage`].

use crate::header::QUEUE_COUNT;
use crate::version::ProtocolVersion;
use crate::wire::{push_u16, DecodeError, Reader};

/// Discriminant of the only defined init message type.
pub const INIT_MSG_TYPE: u8 = 0;

/// Reserved trailing space in the v2/v3 layouts.
const INIT_MSG_TRAILER_BYTES: usize = 18;

/// One queue's placement inside the shared DMEM window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueGeometry {
    /// Ring capacity in bytes.
    pub size: u16,
    /// DMEM byte offset of the ring base.
    pub offset: u16,
    /// Physical queue index (selects the head/tail register pair).
    pub index: u8,
}

/// The host-managed DMEM slice used for payload allocations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DmemRegion {
    pub offset: u16,
    pub size: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitMessage {
    pub queues: [QueueGeometry; QUEUE_COUNT],
    pub sw_managed: DmemRegion,
    pub os_debug_entry_point: Option<u16>,
}

impl InitMessage {
    pub fn decode(version: ProtocolVersion, body: &[u8]) -> Result<InitMessage, DecodeError> {
        let mut r = Reader::new(body);
        let msg_type = r.read_u8()?;
        if msg_type != INIT_MSG_TYPE {
            return Err(DecodeError::InvalidEnum);
        }
        match version {
            ProtocolVersion::V0 => {
                r.skip(1)?;
                let queues = read_queue_info(&mut r)?;
                let sw_managed = read_region(&mut r)?;
                Ok(InitMessage { queues, sw_managed, os_debug_entry_point: None })
            }
            ProtocolVersion::V1 | ProtocolVersion::V2 => {
                r.skip(1)?;
                let entry = r.read_u16()?;
                let queues = read_queue_info(&mut r)?;
                let sw_managed = read_region(&mut r)?;
                if version == ProtocolVersion::V2 {
                    r.skip(INIT_MSG_TRAILER_BYTES)?;
                }
                Ok(InitMessage { queues, sw_managed, os_debug_entry_point: Some(entry) })
            }
            ProtocolVersion::V3 => {
                let mut index = [0u8; QUEUE_COUNT];
                for slot in index.iter_mut() {
                    *slot = r.read_u8()?;
                }
                let mut size = [0u16; QUEUE_COUNT];
                for slot in size.iter_mut() {
                    *slot = r.read_u16()?;
                }
                let base_offset = r.read_u16()?;
                let sw_managed = read_region(&mut r)?;
                let entry = r.read_u16()?;
                r.skip(INIT_MSG_TRAILER_BYTES)?;

                // Queues are packed back-to-back from the base offset.
                let mut queues = [QueueGeometry::default(); QUEUE_COUNT];
                let mut offset = base_offset;
                for (i, queue) in queues.iter_mut().enumerate() {
                    *queue = QueueGeometry { size: size[i], offset, index: index[i] };
                    offset = offset.checked_add(size[i]).ok_or(DecodeError::BadLength)?;
                }
                Ok(InitMessage { queues, sw_managed, os_debug_entry_point: Some(entry) })
            }
        }
    }

    /// Encode in the given revision's layout. Used by loopback tests and
    /// firmware models; v3 requires the queues to be contiguous because the
    /// wire format cannot express gaps.
    pub fn encode(&self, version: ProtocolVersion) -> Vec<u8> {
        let mut out = vec![INIT_MSG_TYPE];
        match version {
            ProtocolVersion::V0 => {
                out.push(0);
                write_queue_info(&mut out, &self.queues);
                write_region(&mut out, self.sw_managed);
            }
            ProtocolVersion::V1 | ProtocolVersion::V2 => {
                out.push(0);
                push_u16(&mut out, self.os_debug_entry_point.unwrap_or(0));
                write_queue_info(&mut out, &self.queues);
                write_region(&mut out, self.sw_managed);
                if version == ProtocolVersion::V2 {
                    out.extend_from_slice(&[0; INIT_MSG_TRAILER_BYTES]);
                }
            }
            ProtocolVersion::V3 => {
                for queue in &self.queues {
                    out.push(queue.index);
                }
                for queue in &self.queues {
                    push_u16(&mut out, queue.size);
                }
                push_u16(&mut out, self.queues[0].offset);
                write_region(&mut out, self.sw_managed);
                push_u16(&mut out, self.os_debug_entry_point.unwrap_or(0));
                out.extend_from_slice(&[0; INIT_MSG_TRAILER_BYTES]);
            }
        }
        out
    }
}

fn read_queue_info(r: &mut Reader<'_>) -> Result<[QueueGeometry; QUEUE_COUNT], DecodeError> {
    let mut queues = [QueueGeometry::default(); QUEUE_COUNT];
    for queue in queues.iter_mut() {
        let size = r.read_u16()?;
        let offset = r.read_u16()?;
        let index = r.read_u8()?;
        r.skip(1)?;
        *queue = QueueGeometry { size, offset, index };
    }
    Ok(queues)
}

fn write_queue_info(out: &mut Vec<u8>, queues: &[QueueGeometry; QUEUE_COUNT]) {
    for queue in queues {
        push_u16(out, queue.size);
        push_u16(out, queue.offset);
        out.push(queue.index);
        out.push(0);
    }
}

fn read_region(r: &mut Reader<'_>) -> Result<DmemRegion, DecodeError> {
    Ok(DmemRegion { offset: r.read_u16()?, size: r.read_u16()? })
}

fn write_region(out: &mut Vec<u8>, region: DmemRegion) {
    push_u16(out, region.offset);
    push_u16(out, region.size);
}
