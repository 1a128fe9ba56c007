//! Engine-level power gating on top of the PMU transport.
//!
//! Each gateable engine runs a small state machine: the host requests the
//! firmware to allow or disallow gating, the firmware acknowledges, and
//! opposite requests that arrive while an acknowledgement is outstanding
//! are queued rather than raced: at most one ALLOW/DISALLOW is ever in
//! flight per engine. A nested freeze protocol covers synchronized context
//! saves without disturbing the gate state.
//!
//! The controller talks to the firmware through [`CommandSink`], which
//! `pmu_transport::Transport` implements; tests substitute a scripted
//! sink.
#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use pmu_protocol::pg::{ElpgEvent, ElpgOp, EngBufStatus, PgCommand, PgMessage};
use pmu_protocol::{CommandBody, Message, QueueId};
use pmu_transport::{CompletionStatus, Payload, PostError, Transport};
use thiserror::Error;
use tracing::{debug, warn};

/// Response bytes reserved for ELPG acknowledgements (header + elpg msg).
const ELPG_RESPONSE_CAPACITY: usize = 16;

/// Delivered once per acknowledged ELPG command.
pub type AckCallback = Box<dyn FnOnce(&PgMessage) + Send>;

/// Where ELPG commands go. Implemented for `Arc<Transport>`; anything else
/// (queues, scripts) works for testing the state machine in isolation.
pub trait CommandSink {
    fn send_elpg(&self, engine_id: u8, op: ElpgOp, on_ack: AckCallback)
        -> Result<(), PostError>;
}

impl CommandSink for Arc<Transport> {
    fn send_elpg(
        &self,
        engine_id: u8,
        op: ElpgOp,
        on_ack: AckCallback,
    ) -> Result<(), PostError> {
        self.post(
            CommandBody::Pg(PgCommand::Elpg { engine_id, op }),
            Payload::NONE,
            QueueId::Hpq,
            ELPG_RESPONSE_CAPACITY,
            Box::new(move |completion| {
                if completion.status == CompletionStatus::Completed {
                    if let Some(Message::Pg(msg)) = completion.message {
                        on_ack(&msg);
                    }
                }
            }),
        )
        .map(|_| ())
    }
}

/// Gate state of one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElpgState {
    /// Gating disallowed (reset state).
    Off,
    /// Gating allowed.
    On,
    /// ALLOW sent, acknowledgement outstanding. A disable request that
    /// arrived in the meantime is queued, not sent.
    OnPending { disable_queued: bool },
    /// DISALLOW sent, acknowledgement outstanding. A queued enable request
    /// replays once the acknowledgement lands.
    OffPending { enable_queued: bool },
}

/// Nested context-save freeze protocol, independent of the gate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreezeState {
    Idle,
    FreezePending,
    Frozen,
    UnfreezePending,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub allow_acks: u64,
    pub disallow_acks: u64,
    /// DMEM offset of the firmware's statistics block, once reported.
    pub stat_dmem_offset: Option<u32>,
    pub last_buf_status: Option<EngBufStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ElpgError {
    #[error("engine {0} is not registered for power gating")]
    UnknownEngine(u8),
    #[error("engine {0} has not acknowledged power-gating init")]
    NotInitialized(u8),
    #[error("engine {engine_id}: unexpected {event:?} while {state:?}")]
    ProtocolViolation {
        engine_id: u8,
        event: ElpgEvent,
        state: ElpgState,
    },
    #[error("engine {0}: freeze request out of order")]
    FreezeOutOfOrder(u8),
    #[error(transparent)]
    Post(#[from] PostError),
}

#[derive(Debug)]
struct EngineGate {
    initialized: bool,
    state: ElpgState,
    freeze: FreezeState,
    stats: EngineStats,
    last_error: Option<ElpgError>,
}

impl EngineGate {
    fn new() -> EngineGate {
        EngineGate {
            initialized: false,
            state: ElpgState::Off,
            freeze: FreezeState::Idle,
            stats: EngineStats::default(),
            last_error: None,
        }
    }
}

type Engines = Arc<Mutex<HashMap<u8, EngineGate>>>;

pub struct ElpgController<S> {
    sink: S,
    engines: Engines,
}

impl<S: CommandSink + Clone + Send + 'static> ElpgController<S> {
    pub fn new(sink: S) -> ElpgController<S> {
        ElpgController { sink, engines: Arc::default() }
    }

    /// Register `engine_id` and kick off the firmware-side init.
    /// Enable/disable requests are rejected until the init acknowledgement
    /// arrives.
    pub fn init_engine(&self, engine_id: u8) -> Result<(), ElpgError> {
        self.engines
            .lock()
            .unwrap()
            .entry(engine_id)
            .or_insert_with(EngineGate::new);
        send(&self.sink, &self.engines, engine_id, ElpgOp::Init)
    }

    /// Ask the firmware to start gating the engine when idle.
    pub fn request_enable(&self, engine_id: u8) -> Result<(), ElpgError> {
        let mut engines = self.engines.lock().unwrap();
        let gate = usable_gate(&mut engines, engine_id)?;
        match gate.state {
            ElpgState::Off => {
                gate.state = ElpgState::OnPending { disable_queued: false };
                send(&self.sink, &self.engines, engine_id, ElpgOp::Allow)
            }
            ElpgState::On | ElpgState::OnPending { disable_queued: false } => Ok(()),
            ElpgState::OnPending { disable_queued: true } => {
                // Retract the queued opposite instead of sending anything.
                gate.state = ElpgState::OnPending { disable_queued: false };
                Ok(())
            }
            ElpgState::OffPending { .. } => {
                gate.state = ElpgState::OffPending { enable_queued: true };
                Ok(())
            }
        }
    }

    /// Ask the firmware to stop gating the engine.
    pub fn request_disable(&self, engine_id: u8) -> Result<(), ElpgError> {
        let mut engines = self.engines.lock().unwrap();
        let gate = usable_gate(&mut engines, engine_id)?;
        match gate.state {
            ElpgState::On => {
                gate.state = ElpgState::OffPending { enable_queued: false };
                send(&self.sink, &self.engines, engine_id, ElpgOp::Disallow)
            }
            ElpgState::Off | ElpgState::OffPending { enable_queued: false } => Ok(()),
            ElpgState::OffPending { enable_queued: true } => {
                gate.state = ElpgState::OffPending { enable_queued: false };
                Ok(())
            }
            ElpgState::OnPending { .. } => {
                gate.state = ElpgState::OnPending { disable_queued: true };
                Ok(())
            }
        }
    }

    /// Start a synchronized context save: the firmware freezes gating
    /// activity until [`ElpgController::end_freeze`] (or a firmware-side
    /// abort).
    pub fn begin_freeze(&self, engine_id: u8) -> Result<(), ElpgError> {
        let mut engines = self.engines.lock().unwrap();
        let gate = usable_gate(&mut engines, engine_id)?;
        if gate.freeze != FreezeState::Idle {
            return Err(ElpgError::FreezeOutOfOrder(engine_id));
        }
        gate.freeze = FreezeState::FreezePending;
        send(&self.sink, &self.engines, engine_id, ElpgOp::Freeze)
    }

    pub fn end_freeze(&self, engine_id: u8) -> Result<(), ElpgError> {
        let mut engines = self.engines.lock().unwrap();
        let gate = usable_gate(&mut engines, engine_id)?;
        if gate.freeze != FreezeState::Frozen {
            return Err(ElpgError::FreezeOutOfOrder(engine_id));
        }
        gate.freeze = FreezeState::UnfreezePending;
        send(&self.sink, &self.engines, engine_id, ElpgOp::Unfreeze)
    }

    /// Feed a PG unit message into the controller. Wire this to the
    /// transport's PG message handler so firmware-initiated traffic
    /// (statistics, freeze aborts) reaches the state machine; command
    /// acknowledgements arrive here through the per-command callbacks.
    pub fn handle_message(&self, message: &PgMessage) -> Result<(), ElpgError> {
        match *message {
            PgMessage::Elpg { engine_id, event } => {
                handle_elpg_ack(&self.sink, &self.engines, engine_id, event)
            }
            PgMessage::Stat { engine_id, data, .. } => {
                let mut engines = self.engines.lock().unwrap();
                let gate = engines
                    .get_mut(&engine_id)
                    .ok_or(ElpgError::UnknownEngine(engine_id))?;
                gate.stats.stat_dmem_offset = Some(data);
                Ok(())
            }
            PgMessage::EngBufStat { engine_id, status, .. } => {
                let mut engines = self.engines.lock().unwrap();
                let gate = engines
                    .get_mut(&engine_id)
                    .ok_or(ElpgError::UnknownEngine(engine_id))?;
                gate.stats.last_buf_status = Some(status);
                Ok(())
            }
            PgMessage::Unknown { msg_type } => {
                debug!(msg_type, "ignoring unrecognized power-gating message");
                Ok(())
            }
        }
    }

    pub fn state(&self, engine_id: u8) -> Option<ElpgState> {
        self.engines.lock().unwrap().get(&engine_id).map(|g| g.state)
    }

    pub fn freeze_state(&self, engine_id: u8) -> Option<FreezeState> {
        self.engines.lock().unwrap().get(&engine_id).map(|g| g.freeze)
    }

    pub fn is_initialized(&self, engine_id: u8) -> bool {
        self.engines
            .lock()
            .unwrap()
            .get(&engine_id)
            .is_some_and(|g| g.initialized)
    }

    pub fn stats(&self, engine_id: u8) -> Option<EngineStats> {
        self.engines.lock().unwrap().get(&engine_id).map(|g| g.stats)
    }

    /// Last asynchronous failure recorded for the engine (protocol
    /// violations observed in acknowledgement handling), cleared on read.
    pub fn take_error(&self, engine_id: u8) -> Option<ElpgError> {
        self.engines
            .lock()
            .unwrap()
            .get_mut(&engine_id)
            .and_then(|g| g.last_error.take())
    }
}

fn usable_gate<'a>(
    engines: &'a mut HashMap<u8, EngineGate>,
    engine_id: u8,
) -> Result<&'a mut EngineGate, ElpgError> {
    let gate = engines
        .get_mut(&engine_id)
        .ok_or(ElpgError::UnknownEngine(engine_id))?;
    if !gate.initialized {
        return Err(ElpgError::NotInitialized(engine_id));
    }
    Ok(gate)
}

/// Hand one ELPG command to the sink with the ack path pre-wired back
/// into [`handle_elpg_ack`]. Callers may hold the engines lock: the sink
/// never invokes the acknowledgement callback inline with the send.
fn send<S: CommandSink + Clone + Send + 'static>(
    sink: &S,
    engines: &Engines,
    engine_id: u8,
    op: ElpgOp,
) -> Result<(), ElpgError> {
    let ack_sink = sink.clone();
    let ack_engines = engines.clone();
    sink.send_elpg(
        engine_id,
        op,
        Box::new(move |message| {
            if let PgMessage::Elpg { engine_id, event } = *message {
                if let Err(err) = handle_elpg_ack(&ack_sink, &ack_engines, engine_id, event) {
                    warn!(%err, "power-gating acknowledgement rejected");
                }
            }
        }),
    )?;
    Ok(())
}

fn handle_elpg_ack<S: CommandSink + Clone + Send + 'static>(
    sink: &S,
    engines: &Engines,
    engine_id: u8,
    event: ElpgEvent,
) -> Result<(), ElpgError> {
    let mut chained: Option<ElpgOp> = None;
    let result = {
        let mut map = engines.lock().unwrap();
        let gate = map
            .get_mut(&engine_id)
            .ok_or(ElpgError::UnknownEngine(engine_id))?;

        match (event, gate.state, gate.freeze) {
            (ElpgEvent::InitAck, _, _) if !gate.initialized => {
                gate.initialized = true;
                gate.state = ElpgState::Off;
                Ok(())
            }
            (ElpgEvent::AllowAck, ElpgState::OnPending { disable_queued }, _) => {
                gate.stats.allow_acks += 1;
                if disable_queued {
                    gate.state = ElpgState::OffPending { enable_queued: false };
                    chained = Some(ElpgOp::Disallow);
                } else {
                    gate.state = ElpgState::On;
                }
                Ok(())
            }
            (ElpgEvent::DisallowAck, ElpgState::OffPending { enable_queued }, _) => {
                gate.stats.disallow_acks += 1;
                if enable_queued {
                    gate.state = ElpgState::OnPending { disable_queued: false };
                    chained = Some(ElpgOp::Allow);
                } else {
                    gate.state = ElpgState::Off;
                }
                Ok(())
            }
            (ElpgEvent::FreezeAck, _, FreezeState::FreezePending) => {
                gate.freeze = FreezeState::Frozen;
                Ok(())
            }
            (ElpgEvent::UnfreezeAck, _, FreezeState::UnfreezePending) => {
                gate.freeze = FreezeState::Idle;
                Ok(())
            }
            (ElpgEvent::FreezeAbort, _, FreezeState::FreezePending | FreezeState::Frozen) => {
                // The firmware backed out of the context save; the gate
                // state is untouched.
                gate.freeze = FreezeState::Idle;
                Ok(())
            }
            (event, state, _) => {
                let err = ElpgError::ProtocolViolation { engine_id, event, state };
                warn!(%err, "forcing engine to the ungated state");
                gate.state = ElpgState::Off;
                gate.freeze = FreezeState::Idle;
                gate.last_error = Some(err);
                Err(err)
            }
        }
    };

    if let Some(op) = chained {
        send(sink, engines, engine_id, op)?;
    }
    result
}
