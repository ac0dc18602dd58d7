//! Blank surfaces: one opaque, input-absorbing surface per display output.
//!
//! Backends create and destroy the whole set at once. Both operations are
//! idempotent. A failure on one output is reported in the [`BlankReport`]
//! and does not stop the other outputs from blanking.

pub mod wayland;
pub mod x11;

use std::env;

use clap::ValueEnum;
use thiserror::Error;
use tracing::{error, info, warn};

pub use self::wayland::WaylandSurfaces;
pub use self::x11::X11Surfaces;

/// Window/surface title used by every backend.
pub const SURFACE_TITLE: &str = "lscreensaver";

/// Outcome of materializing the blank surfaces.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlankReport {
    /// Outputs that now show a blank surface.
    pub blanked: Vec<String>,
    /// Outputs that failed, with the reason.
    pub failed: Vec<(String, String)>,
}

impl BlankReport {
    pub fn is_degraded(&self) -> bool {
        !self.failed.is_empty()
    }

    /// Log the per-output result.
    pub fn log(&self) {
        for (output, reason) in &self.failed {
            warn!("Failed to blank output {}: {}", output, reason);
        }
        if self.blanked.is_empty() {
            if self.is_degraded() {
                error!("No output could be blanked");
            }
        } else {
            info!("Blanked outputs: {}", self.blanked.join(", "));
        }
    }
}

/// Trait for blank surface backends.
pub trait SurfaceManager {
    /// Show a blank surface on every output. No-op if already shown.
    fn materialize(&mut self) -> Result<BlankReport, SurfaceError>;

    /// Remove all blank surfaces. No-op if none are shown.
    fn destroy(&mut self) -> Result<(), SurfaceError>;

    /// Whether the blank surfaces are currently up.
    fn is_shown(&self) -> bool;

    /// Process pending display-server events. Called once per loop tick.
    fn dispatch(&mut self) -> Result<(), SurfaceError> {
        Ok(())
    }
}

impl<T: SurfaceManager + ?Sized> SurfaceManager for Box<T> {
    fn materialize(&mut self) -> Result<BlankReport, SurfaceError> {
        (**self).materialize()
    }

    fn destroy(&mut self) -> Result<(), SurfaceError> {
        (**self).destroy()
    }

    fn is_shown(&self) -> bool {
        (**self).is_shown()
    }

    fn dispatch(&mut self) -> Result<(), SurfaceError> {
        (**self).dispatch()
    }
}

/// Errors that can occur while managing blank surfaces.
#[derive(Error, Debug)]
pub enum SurfaceError {
    #[error("No display server found (neither WAYLAND_DISPLAY nor DISPLAY is set)")]
    NoDisplay,

    #[error("Failed to connect to display server: {0}")]
    Connect(String),

    #[error("Compositor does not support {0}")]
    MissingGlobal(&'static str),

    #[error("Display protocol error: {0}")]
    Protocol(String),
}

/// Which display server protocol to use for blank surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum DisplayBackend {
    /// Pick from the session environment.
    #[default]
    Auto,
    Wayland,
    X11,
}

/// A concrete display server, after resolving [`DisplayBackend::Auto`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayServer {
    Wayland,
    X11,
}

impl DisplayBackend {
    /// Resolve `Auto` from `WAYLAND_DISPLAY` / `DISPLAY`.
    pub fn resolve(self) -> Result<DisplayServer, SurfaceError> {
        match self {
            Self::Wayland => Ok(DisplayServer::Wayland),
            Self::X11 => Ok(DisplayServer::X11),
            Self::Auto => {
                let is_set = |var: &str| env::var_os(var).is_some_and(|v| !v.is_empty());
                if is_set("WAYLAND_DISPLAY") {
                    Ok(DisplayServer::Wayland)
                } else if is_set("DISPLAY") {
                    Ok(DisplayServer::X11)
                } else {
                    Err(SurfaceError::NoDisplay)
                }
            }
        }
    }
}

impl DisplayServer {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Wayland => "wayland",
            Self::X11 => "x11",
        }
    }

    /// Connect the surface manager for this display server.
    pub fn connect(self) -> Result<Box<dyn SurfaceManager>, SurfaceError> {
        match self {
            Self::Wayland => Ok(Box::new(WaylandSurfaces::connect()?)),
            Self::X11 => Ok(Box::new(X11Surfaces::connect()?)),
        }
    }
}

/// Surface manager that only logs what it would do.
#[derive(Debug, Default)]
pub struct DryRunSurfaces {
    shown: bool,
}

impl DryRunSurfaces {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SurfaceManager for DryRunSurfaces {
    fn materialize(&mut self) -> Result<BlankReport, SurfaceError> {
        if !self.shown {
            info!("[DRY RUN] Would blank all outputs");
            self.shown = true;
        }
        Ok(BlankReport {
            blanked: vec!["dry-run".to_string()],
            failed: Vec::new(),
        })
    }

    fn destroy(&mut self) -> Result<(), SurfaceError> {
        if self.shown {
            info!("[DRY RUN] Would unblank all outputs");
            self.shown = false;
        }
        Ok(())
    }

    fn is_shown(&self) -> bool {
        self.shown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    /// Run `f` with the display variables set as given, then restore them.
    fn with_display_env(wayland: Option<&str>, x11: Option<&str>, f: impl FnOnce()) {
        let saved = (env::var_os("WAYLAND_DISPLAY"), env::var_os("DISPLAY"));
        // SAFETY: tests touching the environment are serialized.
        unsafe {
            match wayland {
                Some(v) => env::set_var("WAYLAND_DISPLAY", v),
                None => env::remove_var("WAYLAND_DISPLAY"),
            }
            match x11 {
                Some(v) => env::set_var("DISPLAY", v),
                None => env::remove_var("DISPLAY"),
            }
        }

        f();

        unsafe {
            match saved.0 {
                Some(v) => env::set_var("WAYLAND_DISPLAY", v),
                None => env::remove_var("WAYLAND_DISPLAY"),
            }
            match saved.1 {
                Some(v) => env::set_var("DISPLAY", v),
                None => env::remove_var("DISPLAY"),
            }
        }
    }

    #[test]
    #[serial]
    fn test_resolve_prefers_wayland() {
        with_display_env(Some("wayland-1"), Some(":0"), || {
            assert_eq!(DisplayBackend::Auto.resolve().unwrap(), DisplayServer::Wayland);
        });
    }

    #[test]
    #[serial]
    fn test_resolve_falls_back_to_x11() {
        with_display_env(None, Some(":0"), || {
            assert_eq!(DisplayBackend::Auto.resolve().unwrap(), DisplayServer::X11);
        });
        with_display_env(Some(""), Some(":1"), || {
            assert_eq!(DisplayBackend::Auto.resolve().unwrap(), DisplayServer::X11);
        });
    }

    #[test]
    #[serial]
    fn test_resolve_without_display() {
        with_display_env(None, None, || {
            assert!(matches!(
                DisplayBackend::Auto.resolve(),
                Err(SurfaceError::NoDisplay)
            ));
        });
    }

    #[test]
    #[serial]
    fn test_explicit_backend_ignores_env() {
        with_display_env(None, None, || {
            assert_eq!(DisplayBackend::X11.resolve().unwrap(), DisplayServer::X11);
        });
    }

    #[test]
    fn test_dry_run_is_idempotent() {
        let mut surfaces = DryRunSurfaces::new();
        assert!(!surfaces.is_shown());

        surfaces.materialize().unwrap();
        surfaces.materialize().unwrap();
        assert!(surfaces.is_shown());

        surfaces.destroy().unwrap();
        surfaces.destroy().unwrap();
        assert!(!surfaces.is_shown());
    }

    #[test]
    fn test_report_degraded() {
        let report = BlankReport {
            blanked: vec!["DP-1".to_string()],
            failed: vec![("HDMI-A-1".to_string(), "no configure".to_string())],
        };
        assert!(report.is_degraded());
        assert!(!BlankReport::default().is_degraded());
    }
}
