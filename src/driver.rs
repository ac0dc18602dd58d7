//! The poll loop tying input, state machines and surfaces together.
//!
//! [`ModeDriver`] owns the collaborators. Daemon and lock behavior plug in
//! through the [`Mode`] trait, so the loop itself is written once.

use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::domain::Command;
use crate::exemption::{ExemptProcessOracle, ExemptionSampler};
use crate::input::{InputError, InputSource};
use crate::state::{BlankStateMachine, LockStateMachine};
use crate::surface::SurfaceManager;

/// Bounded wait for input per loop iteration. Also the loop's tick rate.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(200);

/// Delay before lock mode blanks, so the keypress that started it settles.
pub const SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Current time on the tokio clock, so paused-time tests control it.
pub fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Mode-specific behavior driven by [`ModeDriver`].
#[allow(async_fn_in_trait)]
pub trait Mode {
    fn name(&self) -> &'static str;

    /// Called once before the first poll.
    async fn start(&mut self) -> Option<Command>;

    /// One recognized input event.
    fn on_input(&mut self, now: Instant) -> Option<Command>;

    /// Called after each poll, once the input batch has been fed.
    fn after_input(&mut self, now: Instant) -> Option<Command>;

    /// Whether the loop should stop.
    fn finished(&self) -> bool {
        false
    }
}

/// Blank after inactivity, unless an exempt process is running. Runs forever.
#[derive(Debug)]
pub struct DaemonMode<O> {
    machine: BlankStateMachine,
    sampler: ExemptionSampler<O>,
}

impl<O: ExemptProcessOracle> DaemonMode<O> {
    pub fn new(config: &Config, oracle: O, now: Instant) -> Self {
        Self {
            machine: BlankStateMachine::new(config.inactivity_time, now),
            sampler: ExemptionSampler::new(oracle, config.exempt_processes.clone(), now),
        }
    }

    pub fn machine(&self) -> &BlankStateMachine {
        &self.machine
    }

    pub fn sampler(&self) -> &ExemptionSampler<O> {
        &self.sampler
    }
}

impl<O: ExemptProcessOracle> Mode for DaemonMode<O> {
    fn name(&self) -> &'static str {
        "daemon"
    }

    async fn start(&mut self) -> Option<Command> {
        None
    }

    fn on_input(&mut self, now: Instant) -> Option<Command> {
        self.machine.on_input_event(now)
    }

    fn after_input(&mut self, now: Instant) -> Option<Command> {
        let sample = self.sampler.sample(now);
        let exemption = if sample.changed {
            self.machine.on_exemption_change(sample.running, now)
        } else {
            None
        };

        self.machine.tick(now, sample.running).or(exemption)
    }
}

/// Blank right away; the first input after the grace period ends the run.
#[derive(Debug, Default)]
pub struct LockMode {
    machine: Option<LockStateMachine>,
}

impl LockMode {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock state machine, once engaged.
    pub fn machine(&self) -> Option<&LockStateMachine> {
        self.machine.as_ref()
    }
}

impl Mode for LockMode {
    fn name(&self) -> &'static str {
        "lock"
    }

    async fn start(&mut self) -> Option<Command> {
        debug!("Waiting {:?} for input to settle", SETTLE_DELAY);
        tokio::time::sleep(SETTLE_DELAY).await;

        self.machine = Some(LockStateMachine::engage(now()));
        Some(Command::Blank)
    }

    fn on_input(&mut self, now: Instant) -> Option<Command> {
        self.machine.as_mut()?.on_input_event(now)
    }

    fn after_input(&mut self, now: Instant) -> Option<Command> {
        if let Some(machine) = self.machine.as_mut() {
            machine.tick(now);
        }
        None
    }

    fn finished(&self) -> bool {
        self.machine
            .as_ref()
            .is_some_and(LockStateMachine::is_released)
    }
}

/// Single-threaded poll loop.
pub struct ModeDriver<I, S> {
    input: I,
    surfaces: S,
    poll_timeout: Duration,
}

impl<I: InputSource, S: SurfaceManager> ModeDriver<I, S> {
    pub fn new(input: I, surfaces: S) -> Self {
        Self {
            input,
            surfaces,
            poll_timeout: POLL_TIMEOUT,
        }
    }

    pub fn surfaces(&self) -> &S {
        &self.surfaces
    }

    /// Run `mode` until it finishes or the input source fails.
    ///
    /// Surface failures are logged and do not stop the loop.
    pub async fn run<M: Mode>(&mut self, mode: &mut M) -> Result<(), InputError> {
        info!("Running in {} mode", mode.name());

        if let Some(command) = mode.start().await {
            self.apply(command);
        }

        loop {
            let events = self.input.poll_events(self.poll_timeout).await?;

            // Commands from one iteration collapse to the last one.
            let mut pending = None;
            for event in events {
                if !event.kind.is_activity() {
                    continue;
                }
                trace!("Input: {}", event.kind.as_str());
                if let Some(command) = mode.on_input(now()) {
                    pending = Some(command);
                }
            }

            if let Some(command) = mode.after_input(now()) {
                pending = Some(command);
            }

            if let Some(command) = pending {
                self.apply(command);
            }

            if let Err(e) = self.surfaces.dispatch() {
                warn!("Display event dispatch failed: {}", e);
            }

            if mode.finished() {
                info!("{} mode finished", mode.name());
                return Ok(());
            }
        }
    }

    /// Take the surfaces down, if shown. Used on shutdown.
    pub fn shutdown(&mut self) {
        if self.surfaces.is_shown() {
            self.apply(Command::Unblank);
        }
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Blank => match self.surfaces.materialize() {
                Ok(report) => report.log(),
                Err(e) => error!("Failed to blank outputs: {}", e),
            },
            Command::Unblank => match self.surfaces.destroy() {
                Ok(()) => info!("Unblanked outputs"),
                Err(e) => error!("Failed to unblank outputs: {}", e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ExemptionSet;
    use crate::state::LockState;

    struct FixedOracle(bool);

    impl ExemptProcessOracle for FixedOracle {
        fn is_exempt_process_running(&mut self, _: &ExemptionSet) -> anyhow::Result<bool> {
            Ok(self.0)
        }
    }

    fn config(seconds: u64) -> Config {
        Config {
            inactivity_time: Duration::from_secs(seconds),
            ..Config::default()
        }
    }

    #[test]
    fn test_daemon_blanks_after_timeout() {
        let t0 = Instant::now();
        let mut mode = DaemonMode::new(&config(5), FixedOracle(false), t0);

        assert_eq!(mode.after_input(t0 + Duration::from_secs(4)), None);
        assert_eq!(
            mode.after_input(t0 + Duration::from_millis(5100)),
            Some(Command::Blank)
        );
        assert!(mode.machine().is_blanked());
        assert!(!mode.finished());
    }

    #[test]
    fn test_daemon_never_blanks_while_exempt() {
        let t0 = Instant::now();
        let mut mode = DaemonMode::new(&config(5), FixedOracle(true), t0);

        assert!(mode.sampler().running());
        assert_eq!(mode.after_input(t0 + Duration::from_secs(60)), None);
        assert!(!mode.machine().is_blanked());
    }

    #[test]
    fn test_daemon_input_resets_timeout() {
        let t0 = Instant::now();
        let mut mode = DaemonMode::new(&config(5), FixedOracle(false), t0);

        assert_eq!(mode.on_input(t0 + Duration::from_secs(4)), None);
        assert_eq!(mode.after_input(t0 + Duration::from_secs(6)), None);
        assert_eq!(
            mode.after_input(t0 + Duration::from_secs(9)),
            Some(Command::Blank)
        );
    }

    #[test]
    fn test_lock_ignores_input_before_start() {
        let mut mode = LockMode::new();
        assert_eq!(mode.on_input(Instant::now()), None);
        assert!(mode.machine().is_none());
        assert!(!mode.finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_start_waits_then_blanks() {
        let before = now();
        let mut mode = LockMode::new();

        assert_eq!(mode.start().await, Some(Command::Blank));
        assert!(now() - before >= SETTLE_DELAY);
        assert!(matches!(
            mode.machine().map(LockStateMachine::state),
            Some(LockState::Pending { .. })
        ));
    }
}
