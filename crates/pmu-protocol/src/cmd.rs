//! Top-level command and message types: a record body tagged by the unit id
//! in the record header.
//!
//! Message decoding never fails on unknown units or discriminants: the
//! pump has to keep draining past records this host build does not
//! understand, so every level has an `Unknown` fallback. Command encoding
//! is the opposite: it is host-originated, so inconsistencies are hard
//! errors at encode time.

use crate::acr::{AcrCommand, AcrMessage};
use crate::header::{unit_id, RecordHeader};
use crate::init::InitMessage;
use crate::perfmon::{PerfmonCommand, PerfmonMessage};
use crate::pg::{PgCommand, PgMessage};
use crate::rc::RcMessage;
use crate::version::ProtocolVersion;
use crate::wire::DecodeError;

/// A pre-encoded body for units without a typed encoder (verification
/// units in the reserved test range, downstream extensions).
///
/// Bodies carrying out-of-line payloads must reserve zeroed allocation
/// slots of the active version's encoded size at the named offsets; the
/// dispatcher splices the real descriptors in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCommand {
    pub unit_id: u8,
    pub body: Vec<u8>,
    pub in_alloc_offset: Option<usize>,
    pub out_alloc_offset: Option<usize>,
}

/// A host→firmware command body, tagged with the unit that consumes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandBody {
    Pg(PgCommand),
    Acr(AcrCommand),
    Perfmon(PerfmonCommand),
    Raw(RawCommand),
}

impl CommandBody {
    pub fn unit_id(&self) -> u8 {
        match self {
            CommandBody::Pg(_) => unit_id::PG,
            CommandBody::Acr(_) => unit_id::ACR,
            CommandBody::Perfmon(_) => unit_id::PERFMON,
            CommandBody::Raw(raw) => raw.unit_id,
        }
    }

    pub fn encode(&self, version: ProtocolVersion) -> Vec<u8> {
        match self {
            CommandBody::Pg(cmd) => cmd.encode(version),
            CommandBody::Acr(cmd) => cmd.encode(),
            CommandBody::Perfmon(cmd) => cmd.encode(version),
            CommandBody::Raw(raw) => raw.body.clone(),
        }
    }

    /// Byte offset of the inbound payload-allocation slot in the encoded
    /// body, for commands that carry one.
    pub fn in_alloc_offset(&self) -> Option<usize> {
        match self {
            CommandBody::Perfmon(cmd) => cmd.alloc_offset(),
            CommandBody::Raw(raw) => raw.in_alloc_offset,
            CommandBody::Pg(_) | CommandBody::Acr(_) => None,
        }
    }

    /// Byte offset of the outbound payload-allocation slot, where the
    /// firmware learns the DMEM region reserved for its reply data.
    pub fn out_alloc_offset(&self) -> Option<usize> {
        match self {
            CommandBody::Raw(raw) => raw.out_alloc_offset,
            CommandBody::Pg(_) | CommandBody::Acr(_) | CommandBody::Perfmon(_) => None,
        }
    }
}

/// A decoded firmware→host message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Init(InitMessage),
    Pg(PgMessage),
    Acr(AcrMessage),
    Perfmon(PerfmonMessage),
    Rc(RcMessage),
    /// Valid unit id, but one this host build has no decoder for.
    Unknown { unit_id: u8, body: Vec<u8> },
}

impl Message {
    /// Decode a message body for the unit named in `header`.
    ///
    /// Truncated or internally inconsistent bodies for known units are
    /// decode errors; unknown units are not.
    pub fn decode(
        version: ProtocolVersion,
        header: &RecordHeader,
        body: &[u8],
    ) -> Result<Message, DecodeError> {
        Ok(match header.unit_id {
            unit_id::INIT => Message::Init(InitMessage::decode(version, body)?),
            unit_id::PG => Message::Pg(PgMessage::decode(body)?),
            unit_id::ACR => Message::Acr(AcrMessage::decode(body)?),
            unit_id::PERFMON => Message::Perfmon(PerfmonMessage::decode(body)?),
            unit_id::RC => Message::Rc(RcMessage::decode(body)?),
            other => Message::Unknown { unit_id: other, body: body.to_vec() },
        })
    }
}
