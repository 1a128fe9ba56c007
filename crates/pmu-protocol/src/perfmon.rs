//! Performance-monitor unit bodies.
//!
//! Perfmon commands are the payload-bearing ones: init/start embed a
//! [`PayloadAlloc`] slot that the dispatcher fills in after reserving DMEM
//! for the counter block. The encoders emit a zeroed placeholder of the
//! right size; [`PerfmonCommand::alloc_offset`] tells the dispatcher where
//! to splice the real descriptor.

use crate::alloc::PayloadAlloc;
use crate::version::ProtocolVersion;
use crate::wire::{push_u16, push_u32, DecodeError, Reader};

mod cmd_type {
    pub const START: u8 = 0;
    pub const STOP: u8 = 1;
    pub const INIT: u8 = 2;
}

mod msg_type {
    pub const INCREASE_EVENT: u8 = 0;
    pub const DECREASE_EVENT: u8 = 1;
    pub const INIT_EVENT: u8 = 2;
    pub const ACK: u8 = 3;
}

/// Counter configuration flags.
pub const PERFMON_FLAG_ENABLE_INCREASE: u8 = 1 << 0;
pub const PERFMON_FLAG_ENABLE_DECREASE: u8 = 1 << 1;
pub const PERFMON_FLAG_CLEAR_PREV: u8 = 1 << 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PerfmonCommand {
    Init {
        sample_period_us: u32,
        to_decrease_count: u8,
        base_counter_id: u8,
        num_counters: u8,
        samples_in_moving_avg: u8,
        sample_buffer: u16,
    },
    Start {
        group_id: u8,
        state_id: u8,
        flags: u8,
    },
    Stop,
}

impl PerfmonCommand {
    pub fn encode(&self, version: ProtocolVersion) -> Vec<u8> {
        let mut out = Vec::new();
        let placeholder = vec![0u8; PayloadAlloc::encoded_len(version)];
        match *self {
            PerfmonCommand::Init {
                sample_period_us,
                to_decrease_count,
                base_counter_id,
                num_counters,
                samples_in_moving_avg,
                sample_buffer,
            } => {
                out.push(cmd_type::INIT);
                out.push(to_decrease_count);
                out.push(base_counter_id);
                push_u32(&mut out, sample_period_us);
                out.extend_from_slice(&placeholder);
                out.push(num_counters);
                out.push(samples_in_moving_avg);
                push_u16(&mut out, sample_buffer);
            }
            PerfmonCommand::Start { group_id, state_id, flags } => {
                out.push(cmd_type::START);
                out.push(group_id);
                out.push(state_id);
                out.push(flags);
                out.extend_from_slice(&placeholder);
            }
            PerfmonCommand::Stop => out.push(cmd_type::STOP),
        }
        out
    }

    /// Byte offset of the counter-allocation slot within the encoded body,
    /// for commands that carry one.
    pub fn alloc_offset(&self) -> Option<usize> {
        match self {
            PerfmonCommand::Init { .. } => Some(7),
            PerfmonCommand::Start { .. } => Some(4),
            PerfmonCommand::Stop => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PerfmonMessage {
    /// Load rose above the upper threshold.
    Increase { state_id: u8, group_id: u8, data: u8 },
    /// Load fell below the lower threshold.
    Decrease { state_id: u8, group_id: u8, data: u8 },
    Init { state_id: u8, group_id: u8, data: u8 },
    Ack { state_id: u8, group_id: u8, data: u8 },
    Unknown { msg_type: u8 },
}

impl PerfmonMessage {
    pub fn decode(body: &[u8]) -> Result<PerfmonMessage, DecodeError> {
        let mut r = Reader::new(body);
        let msg_type = r.read_u8()?;
        let fields = |r: &mut Reader<'_>| -> Result<(u8, u8, u8), DecodeError> {
            Ok((r.read_u8()?, r.read_u8()?, r.read_u8()?))
        };
        Ok(match msg_type {
            msg_type::INCREASE_EVENT => {
                let (state_id, group_id, data) = fields(&mut r)?;
                PerfmonMessage::Increase { state_id, group_id, data }
            }
            msg_type::DECREASE_EVENT => {
                let (state_id, group_id, data) = fields(&mut r)?;
                PerfmonMessage::Decrease { state_id, group_id, data }
            }
            msg_type::INIT_EVENT => {
                let (state_id, group_id, data) = fields(&mut r)?;
                PerfmonMessage::Init { state_id, group_id, data }
            }
            msg_type::ACK => {
                let (state_id, group_id, data) = fields(&mut r)?;
                PerfmonMessage::Ack { state_id, group_id, data }
            }
            other => PerfmonMessage::Unknown { msg_type: other },
        })
    }
}
