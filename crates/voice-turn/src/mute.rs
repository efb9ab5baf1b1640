//! Mute gate: the one switch deciding whether the microphone feeds the pipeline.
//!
//! Three kinds of mute can overlap:
//! - playback holds ([`MuteGate::hold`]), counted and released only by dropping
//!   the returned [`MuteGuard`];
//! - an indefinite mute, released by [`MuteGate::unmute`];
//! - a timed mute, released by `unmute` or by its deadline passing.
//!
//! Every state change bumps a generation counter. A release timer carries the
//! generation it was scheduled against and does nothing once that generation
//! is no longer current, so a stale timer can never open the gate under a
//! newer mute.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuteDuration {
    For(Duration),
    Indefinite,
}

#[derive(Debug, Default)]
struct MuteState {
    holds: usize,
    indefinite: bool,
    deadline: Option<Instant>,
    generation: u64,
}

impl MuteState {
    fn timed_active(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now < deadline)
    }

    fn is_muted(&self, now: Instant) -> bool {
        self.holds > 0 || self.indefinite || self.timed_active(now)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MuteGate {
    state: Arc<Mutex<MuteState>>,
}

impl MuteGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_muted(&self) -> bool {
        self.lock().is_muted(Instant::now())
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Mute for a duration or until [`MuteGate::unmute`].
    ///
    /// A timed request shorter than the deadline already pending is a no-op.
    pub fn mute(&self, duration: MuteDuration) {
        let mut state = self.lock();
        match duration {
            MuteDuration::Indefinite => {
                if state.indefinite {
                    return;
                }
                state.indefinite = true;
                state.generation += 1;
                info!(generation = state.generation, "Mic muted until released");
            }
            MuteDuration::For(after) => {
                let deadline = Instant::now() + after;
                if state.deadline.is_some_and(|current| current >= deadline) {
                    return;
                }
                state.deadline = Some(deadline);
                state.generation += 1;
                let generation = state.generation;
                info!(generation, "Mic muted for {:.1}s", after.as_secs_f32());
                drop(state);
                self.schedule_release(generation, deadline);
            }
        }
    }

    /// Clear any indefinite or timed mute. Playback holds stay in place.
    pub fn unmute(&self) {
        let mut state = self.lock();
        let now = Instant::now();
        if !state.indefinite && !state.timed_active(now) {
            state.deadline = None;
            return;
        }
        state.indefinite = false;
        state.deadline = None;
        state.generation += 1;
        if state.holds > 0 {
            debug!(
                generation = state.generation,
                holds = state.holds,
                "Unmute requested while playback holds the gate"
            );
        } else {
            info!(generation = state.generation, "Mic unmuted");
        }
    }

    /// Playback-driven mute. The gate stays closed at least until the guard drops.
    pub fn hold(&self) -> MuteGuard {
        let mut state = self.lock();
        state.holds += 1;
        state.generation += 1;
        debug!(generation = state.generation, holds = state.holds, "Mic muted for speech");
        MuteGuard { gate: self.clone() }
    }

    fn release_hold(&self) {
        let mut state = self.lock();
        state.holds = state.holds.saturating_sub(1);
        if state.holds > 0 {
            return;
        }
        state.generation += 1;
        let generation = state.generation;
        let now = Instant::now();
        match state.deadline {
            Some(deadline) if deadline > now => {
                debug!(generation, "Playback ended under a timed mute");
                drop(state);
                self.schedule_release(generation, deadline);
            }
            _ => {
                state.deadline = None;
                if !state.indefinite {
                    info!(generation, "Mic unmuted (after playback)");
                }
            }
        }
    }

    fn release_timed(&self, generation: u64) {
        let mut state = self.lock();
        if state.generation != generation || state.holds > 0 {
            debug!(
                scheduled = generation,
                current = state.generation,
                "Ignoring stale mute release"
            );
            return;
        }
        state.deadline = None;
        state.generation += 1;
        if !state.indefinite {
            info!(generation = state.generation, "Mic unmuted (timed mute elapsed)");
        }
    }

    fn schedule_release(&self, generation: u64, deadline: Instant) {
        // Without a runtime the deadline still expires lazily in `is_muted`.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let gate = self.clone();
        handle.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            gate.release_timed(generation);
        });
    }

    fn lock(&self) -> MutexGuard<'_, MuteState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Scoped playback mute; releases its hold on drop, whatever the exit path.
#[derive(Debug)]
pub struct MuteGuard {
    gate: MuteGate,
}

impl Drop for MuteGuard {
    fn drop(&mut self) {
        self.gate.release_hold();
    }
}
