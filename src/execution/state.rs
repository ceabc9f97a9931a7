//! Lifecycle of a logical request, and the exactly-once completion guard.
//!
//! A response, a client cancellation and a timeout can all race to finish the
//! same attempt. [`RequestState`] arbitrates them with a single atomic word
//! and compare-and-swap transitions, so that of any set of racing completions
//! exactly one succeeds and the rest observe failure and no-op. No path ever
//! blocks, which keeps the connection's event loop responsive.

use std::sync::atomic::{AtomicU64, Ordering};

/// A decoded snapshot of the request lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No attempt has been sent yet.
    Initial,
    /// Exactly one attempt is outstanding.
    InProgress {
        /// Tag of the outstanding attempt. Callbacks capture it when the
        /// attempt is sent and must present it back to transition; a stale
        /// tag is rejected.
        attempt: u32,
    },
    /// A terminal response was delivered; no further completion may succeed.
    Complete,
    /// Cancellation was requested while an attempt was outstanding; a cancel
    /// protocol message must still be sent to the server.
    CancelledWhileInProgress,
    /// Cancellation was requested with nothing outstanding; the server needs
    /// no cancel message.
    CancelledWhileComplete,
}

/// Outcome of a [`RequestState::cancel`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// An attempt was in flight; the caller must send the cancel message.
    CancelledInFlight {
        /// Tag of the attempt that was outstanding.
        attempt: u32,
    },
    /// Nothing was in flight; no protocol message is needed.
    CancelledIdle,
    /// The request was already cancelled. Cancellation is idempotent.
    AlreadyCancelled,
}

const TAG_INITIAL: u64 = 0;
const TAG_IN_PROGRESS: u64 = 1;
const TAG_COMPLETE: u64 = 2;
const TAG_CANCELLED_IN_PROGRESS: u64 = 3;
const TAG_CANCELLED_COMPLETE: u64 = 4;

fn encode(phase: Phase) -> u64 {
    match phase {
        Phase::Initial => TAG_INITIAL << 32,
        Phase::InProgress { attempt } => (TAG_IN_PROGRESS << 32) | u64::from(attempt),
        Phase::Complete => TAG_COMPLETE << 32,
        Phase::CancelledWhileInProgress => TAG_CANCELLED_IN_PROGRESS << 32,
        Phase::CancelledWhileComplete => TAG_CANCELLED_COMPLETE << 32,
    }
}

fn decode(bits: u64) -> Phase {
    let attempt = (bits & u64::from(u32::MAX)) as u32;
    match bits >> 32 {
        TAG_INITIAL => Phase::Initial,
        TAG_IN_PROGRESS => Phase::InProgress { attempt },
        TAG_COMPLETE => Phase::Complete,
        TAG_CANCELLED_IN_PROGRESS => Phase::CancelledWhileInProgress,
        _ => Phase::CancelledWhileComplete,
    }
}

/// The state machine of one logical request.
///
/// Transitions are monotonic: once [`Phase::Complete`] or either cancelled
/// phase is reached, no transition may succeed. All operations are lock-free
/// read-compute-swap cycles.
#[derive(Debug)]
pub struct RequestState {
    bits: AtomicU64,
}

impl Default for RequestState {
    fn default() -> RequestState {
        RequestState::new()
    }
}

impl RequestState {
    /// Creates a state machine in [`Phase::Initial`].
    pub fn new() -> RequestState {
        RequestState {
            bits: AtomicU64::new(encode(Phase::Initial)),
        }
    }

    /// Current phase. A snapshot only; callers that act on it must re-verify
    /// with a CAS transition.
    pub fn load(&self) -> Phase {
        decode(self.bits.load(Ordering::Acquire))
    }

    /// Marks an attempt as outstanding and returns its tag.
    ///
    /// From [`Phase::Initial`] this starts attempt 0. If an attempt is
    /// already outstanding this is a no-op returning the current tag, which
    /// guards against double-send on retry re-entrancy. Returns `None` once
    /// the request is terminal: nothing further may be sent.
    pub fn start_next(&self) -> Option<u32> {
        let mut current = self.bits.load(Ordering::Acquire);
        loop {
            match decode(current) {
                Phase::Initial => {
                    let next = encode(Phase::InProgress { attempt: 0 });
                    match self.bits.compare_exchange_weak(
                        current,
                        next,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return Some(0),
                        Err(actual) => current = actual,
                    }
                }
                Phase::InProgress { attempt } => return Some(attempt),
                Phase::Complete
                | Phase::CancelledWhileInProgress
                | Phase::CancelledWhileComplete => return None,
            }
        }
    }

    /// Claims the right to retry after attempt `observed` failed.
    ///
    /// Exactly one of the callbacks racing over attempt `observed` can win
    /// this CAS; the winner gets the next attempt's tag, the losers get
    /// `None` and must abandon silently.
    pub fn claim_retry(&self, observed: u32) -> Option<u32> {
        let current = encode(Phase::InProgress { attempt: observed });
        let next = encode(Phase::InProgress {
            attempt: observed + 1,
        });
        self.bits
            .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| observed + 1)
    }

    /// Completes the request, conditioned on `observed` still being the
    /// outstanding attempt. This is the exactly-once delivery guard: any
    /// callback must call this right before delivering a terminal outcome and
    /// abandon if it returns `false`.
    pub fn complete(&self, observed: u32) -> bool {
        let current = encode(Phase::InProgress { attempt: observed });
        self.bits
            .compare_exchange(
                current,
                encode(Phase::Complete),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Completes the request from whatever non-terminal phase it is in.
    ///
    /// Used by the failover loop for outcomes that are not tied to a single
    /// attempt, e.g. plan exhaustion: at that point no write is outstanding,
    /// but the state may be `Initial` or a claimed-but-unsent `InProgress`.
    pub fn finish(&self) -> bool {
        let mut current = self.bits.load(Ordering::Acquire);
        loop {
            match decode(current) {
                Phase::Initial | Phase::InProgress { .. } => {
                    match self.bits.compare_exchange_weak(
                        current,
                        encode(Phase::Complete),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return true,
                        Err(actual) => current = actual,
                    }
                }
                Phase::Complete
                | Phase::CancelledWhileInProgress
                | Phase::CancelledWhileComplete => return false,
            }
        }
    }

    /// Requests cancellation. Idempotent: only the first call observes a
    /// non-[`CancelOutcome::AlreadyCancelled`] outcome, so at most one cancel
    /// protocol message is ever sent.
    pub fn cancel(&self) -> CancelOutcome {
        let mut current = self.bits.load(Ordering::Acquire);
        loop {
            let (next, outcome) = match decode(current) {
                Phase::Initial | Phase::Complete => (
                    Phase::CancelledWhileComplete,
                    CancelOutcome::CancelledIdle,
                ),
                Phase::InProgress { attempt } => (
                    Phase::CancelledWhileInProgress,
                    CancelOutcome::CancelledInFlight { attempt },
                ),
                Phase::CancelledWhileInProgress | Phase::CancelledWhileComplete => {
                    return CancelOutcome::AlreadyCancelled;
                }
            };
            match self.bits.compare_exchange_weak(
                current,
                encode(next),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return outcome,
                Err(actual) => current = actual,
            }
        }
    }

    /// Whether cancellation has been requested. The failover loop checks this
    /// before trying the next host.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.load(),
            Phase::CancelledWhileInProgress | Phase::CancelledWhileComplete
        )
    }

    /// Tag of the outstanding attempt, if one is in progress.
    pub fn attempt_in_progress(&self) -> Option<u32> {
        match self.load() {
            Phase::InProgress { attempt } => Some(attempt),
            _ => None,
        }
    }
}
