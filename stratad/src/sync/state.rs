use thiserror::Error;

use crate::store::SyncPhase;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    /// A run starts comparing both sides.
    Scan,
    /// The scan queued its jobs and workers start draining them.
    Drain,
    /// Every job of the batch finished without failure.
    Finish,
    Fail,
    /// Retry after the error backoff elapsed.
    Recover,
    Pause,
    Resume,
}

impl PhaseEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseEvent::Scan => "scan",
            PhaseEvent::Drain => "drain",
            PhaseEvent::Finish => "finish",
            PhaseEvent::Fail => "fail",
            PhaseEvent::Recover => "recover",
            PhaseEvent::Pause => "pause",
            PhaseEvent::Resume => "resume",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot {} a sync that is {}", .event.as_str(), .from.as_str())]
pub struct InvalidTransition {
    pub from: SyncPhase,
    pub event: PhaseEvent,
}

/// idle → scanning → syncing → idle, any active phase → error or paused,
/// error → idle on recovery and paused → idle on resume.
pub fn next_phase(from: SyncPhase, event: PhaseEvent) -> Result<SyncPhase, InvalidTransition> {
    use PhaseEvent as E;
    use SyncPhase as P;
    let to = match (from, event) {
        (P::Idle, E::Scan) => P::Scanning,
        (P::Scanning, E::Drain) => P::Syncing,
        (P::Syncing, E::Finish) => P::Idle,
        (P::Idle | P::Scanning | P::Syncing, E::Fail) => P::Error,
        (P::Error, E::Recover) => P::Idle,
        (P::Idle | P::Scanning | P::Syncing | P::Error, E::Pause) => P::Paused,
        (P::Paused, E::Resume) => P::Idle,
        _ => return Err(InvalidTransition { from, event }),
    };
    Ok(to)
}
