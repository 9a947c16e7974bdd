//! Decode session state machine.
//!
//! Every transition goes through [`reduce`], which returns the next state and
//! the effects the caller has to execute. States only move forward:
//! `Executing -> Draining -> Stopped -> Released`, with shortcuts allowed but
//! never a step back.

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum DecodeState {
    /// Feeding input and collecting output.
    #[default]
    Executing,
    /// End of input signalled; waiting for the decoder to flush.
    Draining,
    /// Decoder stopped, by end of stream or cancellation.
    Stopped,
    /// Resources released by the owner.
    Released,
}

impl DecodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecodeState::Executing => "executing",
            DecodeState::Draining => "draining",
            DecodeState::Stopped => "stopped",
            DecodeState::Released => "released",
        }
    }

    /// True once the decoder no longer produces output.
    pub fn is_halted(&self) -> bool {
        matches!(self, DecodeState::Stopped | DecodeState::Released)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// An input buffer is free but the source has nothing left (or the
    /// session is past its executing phase).
    SourceExhausted,
    /// The decoder emitted its end-of-stream output buffer.
    EndOfStream,
    /// The session's cancellation token fired, or the session was dropped
    /// before finishing.
    Cancelled,
    /// The owner cleaned up.
    Release,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEffect {
    /// Queue the free input buffer with the end-of-stream flag.
    QueueEndOfStream,
    StopDecoder,
    /// Hand the partially filled batch to the drainer as the last one.
    FlushFinalBatch,
    /// Abort every pending filter task and close the batch channel.
    DiscardPending,
}

/// Pure state transition function.
pub fn reduce(state: DecodeState, event: SessionEvent) -> (DecodeState, Vec<SessionEffect>) {
    use DecodeState::*;
    use SessionEffect::*;
    use SessionEvent::*;

    match (state, event) {
        (Executing, SourceExhausted) => (Draining, vec![QueueEndOfStream]),
        // Any later input request is answered with end of stream, no read.
        (_, SourceExhausted) => (state, vec![QueueEndOfStream]),

        (Executing | Draining, EndOfStream) => (Stopped, vec![StopDecoder, FlushFinalBatch]),
        (Stopped | Released, EndOfStream) => (state, vec![]),

        (Executing | Draining, Cancelled) => (Stopped, vec![StopDecoder, DiscardPending]),
        // The owner may have released first; the decoder still has to stop.
        (Stopped | Released, Cancelled) => (state, vec![StopDecoder, DiscardPending]),

        (_, Release) => (Released, vec![]),
    }
}

/// Decode state shared between the worker thread and the owner.
///
/// The worker side applies events from codec callbacks, the owner applies
/// [`SessionEvent::Release`]. Readers subscribe through the watch channel.
#[derive(Debug)]
pub struct SharedDecodeState {
    tx: watch::Sender<DecodeState>,
}

impl Default for SharedDecodeState {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedDecodeState {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(DecodeState::Executing);
        Self { tx }
    }

    pub fn current(&self) -> DecodeState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<DecodeState> {
        self.tx.subscribe()
    }

    /// Run `event` through the reducer atomically and return the effects.
    pub fn apply(&self, event: SessionEvent) -> Vec<SessionEffect> {
        let mut effects = Vec::new();
        self.tx.send_if_modified(|state| {
            let (next, produced) = reduce(*state, event);
            effects = produced;
            if next == *state {
                return false;
            }
            log::debug!("Decode state: {} -> {} ({:?})", state.as_str(), next.as_str(), event);
            *state = next;
            true
        });
        effects
    }
}
