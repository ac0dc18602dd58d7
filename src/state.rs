//! Blanking state machines.
//!
//! Both machines are pure: every operation takes the current time and
//! returns the [`Command`] the caller must apply, if any.
//! - Daemon: blank after `inactivity_time` without input, unless an exempt
//!   process runs; input after the grace period unblanks.
//! - Lock: blank once, ignore input for the grace period, then the first
//!   input releases the lock.

use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::domain::Command;

/// Minimum time a blank surface stays up before input may dismiss it.
pub const GRACE_PERIOD: Duration = Duration::from_secs(3);

/// Daemon-mode blanking state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlankState {
    /// Surfaces are down; waiting for the inactivity timeout.
    Idle,
    /// Surfaces are up since `since`.
    Blanked { since: Instant },
}

/// Daemon-mode state machine.
#[derive(Debug)]
pub struct BlankStateMachine {
    state: BlankState,

    /// Last recognized activity. Never moves backwards.
    last_activity: Instant,

    /// Idle time before blanking.
    inactivity_time: Duration,
}

impl BlankStateMachine {
    /// Create an idle machine that counts `now` as the last activity.
    pub fn new(inactivity_time: Duration, now: Instant) -> Self {
        Self {
            state: BlankState::Idle,
            last_activity: now,
            inactivity_time,
        }
    }

    pub fn state(&self) -> BlankState {
        self.state
    }

    pub fn is_blanked(&self) -> bool {
        matches!(self.state, BlankState::Blanked { .. })
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Time the surfaces were materialized, if currently blanked.
    pub fn blanked_since(&self) -> Option<Instant> {
        match self.state {
            BlankState::Blanked { since } => Some(since),
            BlankState::Idle => None,
        }
    }

    /// Record user input.
    ///
    /// Input always counts as activity. It only unblanks once the surface
    /// has been up for at least [`GRACE_PERIOD`].
    pub fn on_input_event(&mut self, now: Instant) -> Option<Command> {
        self.touch(now);

        let BlankState::Blanked { since } = self.state else {
            return None;
        };

        let shown_for = now.saturating_duration_since(since);
        if shown_for >= GRACE_PERIOD {
            info!("Input after {:?} blanked, unblanking", shown_for);
            self.state = BlankState::Idle;
            Some(Command::Unblank)
        } else {
            debug!(
                "Ignoring input {:?} after blanking (grace period {:?})",
                shown_for, GRACE_PERIOD
            );
            None
        }
    }

    /// React to the sampled exemption flag flipping.
    ///
    /// Any flip counts as activity. An exempt process starting while blanked
    /// unblanks immediately, grace period or not.
    pub fn on_exemption_change(&mut self, running: bool, now: Instant) -> Option<Command> {
        self.touch(now);

        if running && self.is_blanked() {
            info!("Exempt process started while blanked, unblanking");
            self.state = BlankState::Idle;
            return Some(Command::Unblank);
        }

        None
    }

    /// Check the inactivity timeout.
    pub fn tick(&mut self, now: Instant, exempt_running: bool) -> Option<Command> {
        if self.is_blanked() || exempt_running {
            return None;
        }

        let idle_for = now.saturating_duration_since(self.last_activity);
        if idle_for < self.inactivity_time {
            return None;
        }

        info!("Idle for {:?}, blanking", idle_for);
        self.state = BlankState::Blanked { since: now };
        Some(Command::Blank)
    }

    fn touch(&mut self, now: Instant) {
        self.last_activity = self.last_activity.max(now);
    }
}

/// Lock-mode state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// Surfaces are up; input is ignored until the grace period ends.
    Pending { locked_at: Instant },
    /// Surfaces are up; the next input releases the lock.
    Unlockable { locked_at: Instant },
    /// Input released the lock; surfaces must come down.
    Released,
}

/// Lock-mode state machine.
#[derive(Debug)]
pub struct LockStateMachine {
    state: LockState,
}

impl LockStateMachine {
    /// Engage the lock. The caller blanks at the same moment.
    pub fn engage(now: Instant) -> Self {
        info!("Lock engaged");
        Self {
            state: LockState::Pending { locked_at: now },
        }
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    pub fn is_released(&self) -> bool {
        self.state == LockState::Released
    }

    /// Advance Pending to Unlockable once the grace period has passed.
    pub fn tick(&mut self, now: Instant) {
        if let LockState::Pending { locked_at } = self.state
            && now.saturating_duration_since(locked_at) >= GRACE_PERIOD
        {
            debug!("Grace period over, lock accepts input");
            self.state = LockState::Unlockable { locked_at };
        }
    }

    /// Handle user input. Returns `Unblank` when the lock is released.
    pub fn on_input_event(&mut self, now: Instant) -> Option<Command> {
        self.tick(now);

        match self.state {
            LockState::Pending { locked_at } => {
                debug!(
                    "Ignoring input {:?} after lock",
                    now.saturating_duration_since(locked_at)
                );
                None
            }
            LockState::Unlockable { .. } => {
                info!("Input received, releasing lock");
                self.state = LockState::Released;
                Some(Command::Unblank)
            }
            LockState::Released => None,
        }
    }
}
