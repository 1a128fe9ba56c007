//! Reset-control unit bodies. The firmware only sends one thing here: a
//! diagnostic naming a unit whose command it could not handle.

use crate::wire::{DecodeError, Reader};

const MSG_TYPE_UNHANDLED_CMD: u8 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RcMessage {
    UnhandledCommand { unit_id: u8 },
    Unknown { msg_type: u8 },
}

impl RcMessage {
    pub fn decode(body: &[u8]) -> Result<RcMessage, DecodeError> {
        let mut r = Reader::new(body);
        let msg_type = r.read_u8()?;
        Ok(match msg_type {
            MSG_TYPE_UNHANDLED_CMD => RcMessage::UnhandledCommand { unit_id: r.read_u8()? },
            other => RcMessage::Unknown { msg_type: other },
        })
    }
}
