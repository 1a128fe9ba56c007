//! Power-gating unit bodies: the ELPG gate/ungate protocol, engine buffer
//! management, statistics exchange, and the ZBC save trigger.

use crate::alloc::FbSurface;
use crate::version::ProtocolVersion;
use crate::wire::{push_u16, push_u32, DecodeError, Reader};

mod cmd_type {
    pub const ELPG: u8 = 0;
    pub const ENG_BUF_LOAD: u8 = 1;
    pub const ENG_BUF_UNLOAD: u8 = 2;
    pub const STAT: u8 = 3;
    pub const GR_INIT_PARAM: u8 = 6;
    pub const ZBC_TABLE_UPDATE: u8 = 16;
}

/// ELPG sub-commands carried in the 16-bit `cmd` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ElpgOp {
    Init = 0,
    Disallow = 1,
    Allow = 2,
    Freeze = 3,
    Unfreeze = 4,
}

/// ELPG acknowledgement codes carried in the 16-bit `msg` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ElpgEvent {
    InitAck = 0,
    DisallowAck = 1,
    AllowAck = 2,
    FreezeAck = 3,
    FreezeAbort = 4,
    UnfreezeAck = 5,
}

impl ElpgEvent {
    fn from_raw(raw: u16) -> Option<ElpgEvent> {
        Some(match raw {
            0 => ElpgEvent::InitAck,
            1 => ElpgEvent::DisallowAck,
            2 => ElpgEvent::AllowAck,
            3 => ElpgEvent::FreezeAck,
            4 => ElpgEvent::FreezeAbort,
            5 => ElpgEvent::UnfreezeAck,
            _ => return None,
        })
    }
}

/// Statistics sub-command: tell the firmware where to mirror its gating
/// statistics block.
pub const PG_STAT_ALLOC_DMEM: u16 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PgCommand {
    Elpg {
        engine_id: u8,
        op: ElpgOp,
    },
    EngBufLoad {
        engine_id: u8,
        buf_idx: u8,
        buf: FbSurface,
    },
    EngBufUnload {
        engine_id: u8,
        buf_idx: u8,
    },
    /// Exchange the DMEM offset of the statistics block.
    Stat {
        engine_id: u8,
        data: u32,
    },
    GrInitParam {
        feature_mask: u8,
    },
    /// Ask the firmware to refresh its copy of the given ZBC table entries.
    ZbcTableUpdate {
        entry_mask: u16,
    },
}

impl PgCommand {
    pub fn encode(&self, version: ProtocolVersion) -> Vec<u8> {
        let mut out = Vec::new();
        match *self {
            PgCommand::Elpg { engine_id, op } => {
                out.push(cmd_type::ELPG);
                out.push(engine_id);
                push_u16(&mut out, op as u16);
            }
            PgCommand::EngBufLoad { engine_id, buf_idx, buf } => {
                out.push(cmd_type::ENG_BUF_LOAD);
                out.push(engine_id);
                out.push(buf_idx);
                out.push(0);
                encode_eng_buf_desc(&mut out, version, buf);
            }
            PgCommand::EngBufUnload { engine_id, buf_idx } => {
                out.push(cmd_type::ENG_BUF_UNLOAD);
                out.push(engine_id);
                out.push(buf_idx);
                out.push(0);
            }
            PgCommand::Stat { engine_id, data } => {
                out.push(cmd_type::STAT);
                out.push(engine_id);
                push_u16(&mut out, PG_STAT_ALLOC_DMEM);
                push_u32(&mut out, data);
            }
            PgCommand::GrInitParam { feature_mask } => {
                out.push(cmd_type::GR_INIT_PARAM);
                push_u16(&mut out, 0);
                out.push(feature_mask);
            }
            PgCommand::ZbcTableUpdate { entry_mask } => {
                out.push(cmd_type::ZBC_TABLE_UPDATE);
                out.push(0);
                push_u16(&mut out, entry_mask);
            }
        }
        out
    }
}

/// The engine-buffer descriptor kept its own evolution: a 32-bit block
/// base (v0), a split 64-bit address plus 16-bit size (v1), and the common
/// 64-bit address + packed params shape afterwards.
fn encode_eng_buf_desc(out: &mut Vec<u8>, version: ProtocolVersion, buf: FbSurface) {
    match version {
        ProtocolVersion::V0 => {
            push_u16(out, buf.size as u16);
            push_u32(out, (buf.address >> 8) as u32);
            out.push((buf.address & 0xFF) as u8);
            out.push(buf.dma_idx);
        }
        ProtocolVersion::V1 => {
            push_u32(out, buf.address as u32);
            push_u32(out, (buf.address >> 32) as u32);
            push_u16(out, buf.size as u16);
            out.push(buf.dma_idx);
        }
        ProtocolVersion::V2 | ProtocolVersion::V3 => {
            push_u32(out, buf.address as u32);
            push_u32(out, (buf.address >> 32) as u32);
            push_u32(out, (buf.size & 0x00FF_FFFF) | (u32::from(buf.dma_idx) << 24));
        }
    }
}

/// Engine-buffer status codes reported by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngBufStatus {
    Loaded = 0,
    Unloaded = 1,
    Failed = 2,
}

impl EngBufStatus {
    fn from_raw(raw: u8) -> Option<EngBufStatus> {
        Some(match raw {
            0 => EngBufStatus::Loaded,
            1 => EngBufStatus::Unloaded,
            2 => EngBufStatus::Failed,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PgMessage {
    Elpg {
        engine_id: u8,
        event: ElpgEvent,
    },
    EngBufStat {
        engine_id: u8,
        buf_idx: u8,
        status: EngBufStatus,
    },
    Stat {
        engine_id: u8,
        sub_msg_id: u16,
        data: u32,
    },
    /// A PG message type this host build does not interpret.
    Unknown {
        msg_type: u8,
    },
}

impl PgMessage {
    pub fn decode(body: &[u8]) -> Result<PgMessage, DecodeError> {
        let mut r = Reader::new(body);
        let msg_type = r.read_u8()?;
        Ok(match msg_type {
            cmd_type::ELPG => {
                let engine_id = r.read_u8()?;
                let event =
                    ElpgEvent::from_raw(r.read_u16()?).ok_or(DecodeError::InvalidEnum)?;
                PgMessage::Elpg { engine_id, event }
            }
            cmd_type::ENG_BUF_LOAD | cmd_type::ENG_BUF_UNLOAD => {
                let engine_id = r.read_u8()?;
                let buf_idx = r.read_u8()?;
                let status =
                    EngBufStatus::from_raw(r.read_u8()?).ok_or(DecodeError::InvalidEnum)?;
                PgMessage::EngBufStat { engine_id, buf_idx, status }
            }
            cmd_type::STAT => {
                let engine_id = r.read_u8()?;
                let sub_msg_id = r.read_u16()?;
                let data = r.read_u32()?;
                PgMessage::Stat { engine_id, sub_msg_id, data }
            }
            other => PgMessage::Unknown { msg_type: other },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elpg_command_is_four_bytes_with_op_in_low_word() {
        let bytes = PgCommand::Elpg { engine_id: 1, op: ElpgOp::Allow }
            .encode(ProtocolVersion::V1);
        assert_eq!(bytes, vec![cmd_type::ELPG, 1, 2, 0]);
    }

    #[test]
    fn elpg_ack_decodes_engine_and_event() {
        let msg = PgMessage::decode(&[cmd_type::ELPG, 3, 2, 0]).unwrap();
        assert_eq!(msg, PgMessage::Elpg { engine_id: 3, event: ElpgEvent::AllowAck });
    }

    #[test]
    fn out_of_range_elpg_event_is_a_decode_error() {
        assert_eq!(
            PgMessage::decode(&[cmd_type::ELPG, 0, 9, 0]),
            Err(DecodeError::InvalidEnum)
        );
    }

    #[test]
    fn unknown_pg_message_type_falls_back_instead_of_failing() {
        let msg = PgMessage::decode(&[0x42, 0, 0, 0]).unwrap();
        assert_eq!(msg, PgMessage::Unknown { msg_type: 0x42 });
    }

    #[test]
    fn eng_buf_load_descriptor_shape_tracks_version() {
        let buf = FbSurface { address: 0x1_0000_2000, size: 0x800, dma_idx: 6 };
        let v0 = PgCommand::EngBufLoad { engine_id: 0, buf_idx: 1, buf }
            .encode(ProtocolVersion::V0);
        let v2 = PgCommand::EngBufLoad { engine_id: 0, buf_idx: 1, buf }
            .encode(ProtocolVersion::V2);
        assert_eq!(v0.len(), 4 + 8);
        assert_eq!(v2.len(), 4 + 12);
        // v2 packs size and index into the trailing params word.
        let params = u32::from_le_bytes(v2[12..16].try_into().unwrap());
        assert_eq!(params & 0x00FF_FFFF, 0x800);
        assert_eq!(params >> 24, 6);
    }
}
