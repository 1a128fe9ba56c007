//! Access-control unit bodies: write-protected-region setup and secure
//! falcon bootstrap.

use crate::wire::{push_u32, push_u64, DecodeError, Reader};

mod cmd_type {
    pub const INIT_WPR_REGION: u8 = 0;
    pub const BOOTSTRAP_FALCON: u8 = 1;
    pub const BOOTSTRAP_MULTIPLE_FALCONS: u8 = 3;
}

mod msg_type {
    pub const INIT_WPR_REGION: u8 = 0;
    pub const BOOTSTRAP_FALCON: u8 = 1;
}

/// Ask the firmware to reset the falcon before bootstrapping it.
pub const BOOTSTRAP_FLAGS_RESET_YES: u32 = 0;
pub const BOOTSTRAP_FLAGS_RESET_NO: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcrCommand {
    InitWprRegion {
        region_id: u32,
        wpr_offset: u32,
    },
    BootstrapFalcon {
        flags: u32,
        falcon_id: u32,
    },
    BootstrapMultipleFalcons {
        flags: u32,
        falcon_id_mask: u32,
        use_va_mask: u32,
        wpr_base: u64,
    },
}

impl AcrCommand {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match *self {
            AcrCommand::InitWprRegion { region_id, wpr_offset } => {
                out.push(cmd_type::INIT_WPR_REGION);
                push_u32(&mut out, region_id);
                push_u32(&mut out, wpr_offset);
            }
            AcrCommand::BootstrapFalcon { flags, falcon_id } => {
                out.push(cmd_type::BOOTSTRAP_FALCON);
                push_u32(&mut out, flags);
                push_u32(&mut out, falcon_id);
            }
            AcrCommand::BootstrapMultipleFalcons {
                flags,
                falcon_id_mask,
                use_va_mask,
                wpr_base,
            } => {
                out.push(cmd_type::BOOTSTRAP_MULTIPLE_FALCONS);
                push_u32(&mut out, flags);
                push_u32(&mut out, falcon_id_mask);
                push_u32(&mut out, use_va_mask);
                push_u64(&mut out, wpr_base);
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcrMessage {
    /// WPR region initialized; non-zero codes are firmware errors.
    InitWprRegion { error_code: u32 },
    /// The named falcon finished (or failed) bootstrap.
    BootstrapFalcon { falcon_id: u32 },
    Unknown { msg_type: u8 },
}

impl AcrMessage {
    pub fn decode(body: &[u8]) -> Result<AcrMessage, DecodeError> {
        let mut r = Reader::new(body);
        let msg_type = r.read_u8()?;
        Ok(match msg_type {
            msg_type::INIT_WPR_REGION => AcrMessage::InitWprRegion { error_code: r.read_u32()? },
            msg_type::BOOTSTRAP_FALCON => AcrMessage::BootstrapFalcon { falcon_id: r.read_u32()? },
            other => AcrMessage::Unknown { msg_type: other },
        })
    }
}
