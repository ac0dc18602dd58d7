//! Raw input event sources.
//!
//! The blanking core only needs to know *that* the user did something, so
//! sources reduce device events to an [`InputKind`](crate::domain::InputKind).

pub mod evdev;

use std::time::Duration;

pub use self::evdev::EvdevSource;
use thiserror::Error;

use crate::domain::InputEvent;

/// Trait for input event sources.
#[allow(async_fn_in_trait)]
pub trait InputSource {
    /// Wait up to `timeout` for input, then return everything already queued.
    ///
    /// An empty vector means the wait timed out. Events are returned in
    /// arrival order.
    async fn poll_events(&mut self, timeout: Duration) -> Result<Vec<InputEvent>, InputError>;
}

/// Errors that can occur while reading input.
#[derive(Error, Debug)]
pub enum InputError {
    #[error("No readable input devices found in {0}")]
    NoDevices(String),

    #[error("All input devices disconnected")]
    Disconnected,

    #[error("Failed to read input devices: {0}")]
    Io(#[from] std::io::Error),
}
