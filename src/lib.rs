//! lscreensaver - idle screen blanker and lock-now helper.
//!
//! Watches raw input devices and covers every output with an opaque black
//! surface after a period of inactivity, unless an exempt process (a video
//! player, say) is running. Lock mode blanks immediately and exits on the
//! first input after a short grace period.

pub mod config;
pub mod domain;
pub mod driver;
pub mod exemption;
pub mod input;
pub mod state;
pub mod surface;
