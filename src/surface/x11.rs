//! X11 blank surfaces.
//!
//! One override-redirect black window per RandR monitor, with an invisible
//! cursor. Override-redirect keeps window managers (tiling ones included)
//! from moving, resizing or decorating the windows. While shown, the keyboard
//! and pointer are grabbed so input never reaches the clients underneath.

use tracing::{debug, info, trace, warn};
use x11rb::connection::Connection;
use x11rb::protocol::randr::ConnectionExt as _;
use x11rb::protocol::xproto::{
    AtomEnum, ConfigureWindowAux, ConnectionExt as _, CreateGCAux, CreateWindowAux, Cursor,
    EventMask, GrabMode, GrabStatus, Pixmap, PropMode, Rectangle, StackMode, Window, WindowClass,
};
use x11rb::rust_connection::RustConnection;
use x11rb::wrapper::ConnectionExt as _;
use x11rb::{COPY_DEPTH_FROM_PARENT, COPY_FROM_PARENT, CURRENT_TIME, NONE};

use super::{BlankReport, SURFACE_TITLE, SurfaceError, SurfaceManager};

/// A rectangle on the root window covered by one blank window.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Monitor {
    name: String,
    x: i16,
    y: i16,
    width: u16,
    height: u16,
}

/// Blank windows on an X11 display.
pub struct X11Surfaces {
    conn: RustConnection,
    root: Window,
    black_pixel: u32,
    cursor: Cursor,
    windows: Vec<(String, Window)>,
    shown: bool,
    keyboard_grabbed: bool,
    pointer_grabbed: bool,
}

impl X11Surfaces {
    /// Connect using `DISPLAY`.
    pub fn connect() -> Result<Self, SurfaceError> {
        let (conn, screen_num) =
            x11rb::connect(None).map_err(|e| SurfaceError::Connect(e.to_string()))?;
        let screen = &conn.setup().roots[screen_num];
        let root = screen.root;
        let black_pixel = screen.black_pixel;

        let cursor = invisible_cursor(&conn, root).unwrap_or_else(|e| {
            warn!("Failed to create invisible cursor: {}", e);
            NONE
        });

        info!("Connected to X11 display (screen {})", screen_num);
        Ok(Self {
            conn,
            root,
            black_pixel,
            cursor,
            windows: Vec::new(),
            shown: false,
            keyboard_grabbed: false,
            pointer_grabbed: false,
        })
    }

    /// Monitors from RandR, or the whole root window if RandR has none.
    fn monitors(&self) -> Vec<Monitor> {
        match self.randr_monitors() {
            Ok(monitors) if !monitors.is_empty() => monitors,
            Ok(_) => {
                debug!("RandR reports no monitors, covering the root window");
                self.root_monitor().into_iter().collect()
            }
            Err(e) => {
                warn!("RandR monitor query failed: {}. Covering the root window", e);
                self.root_monitor().into_iter().collect()
            }
        }
    }

    fn randr_monitors(&self) -> Result<Vec<Monitor>, Box<dyn std::error::Error>> {
        let reply = self.conn.randr_get_monitors(self.root, true)?.reply()?;

        let mut monitors = Vec::with_capacity(reply.monitors.len());
        for (i, info) in reply.monitors.iter().enumerate() {
            let name = self
                .conn
                .get_atom_name(info.name)
                .ok()
                .and_then(|cookie| cookie.reply().ok())
                .map_or_else(
                    || format!("monitor-{i}"),
                    |r| String::from_utf8_lossy(&r.name).into_owned(),
                );
            monitors.push(Monitor {
                name,
                x: info.x,
                y: info.y,
                width: info.width,
                height: info.height,
            });
        }
        Ok(monitors)
    }

    fn root_monitor(&self) -> Option<Monitor> {
        let geometry = self.conn.get_geometry(self.root).ok()?.reply().ok()?;
        Some(Monitor {
            name: "root".to_string(),
            x: 0,
            y: 0,
            width: geometry.width,
            height: geometry.height,
        })
    }

    fn create_window(&self, monitor: &Monitor) -> Result<Window, Box<dyn std::error::Error>> {
        let window = self.conn.generate_id()?;
        let aux = CreateWindowAux::new()
            .background_pixel(self.black_pixel)
            .override_redirect(1)
            .cursor(self.cursor);

        self.conn
            .create_window(
                COPY_DEPTH_FROM_PARENT,
                window,
                self.root,
                monitor.x,
                monitor.y,
                monitor.width,
                monitor.height,
                0,
                WindowClass::INPUT_OUTPUT,
                COPY_FROM_PARENT,
                &aux,
            )?
            .check()?;

        let title = format!("{SURFACE_TITLE}-{}", monitor.name);
        self.conn.change_property8(
            PropMode::REPLACE,
            window,
            AtomEnum::WM_NAME,
            AtomEnum::STRING,
            title.as_bytes(),
        )?;

        self.conn.map_window(window)?.check()?;
        self.conn.configure_window(
            window,
            &ConfigureWindowAux::new().stack_mode(StackMode::ABOVE),
        )?;
        Ok(window)
    }

    /// Grab whatever is not grabbed yet onto the first blank window.
    ///
    /// Another client (a window manager mid key binding, say) may hold a grab
    /// for a moment, so this is retried from [`SurfaceManager::dispatch`].
    fn grab_input(&mut self, warn_on_failure: bool) {
        let Some(&(_, window)) = self.windows.first() else {
            return;
        };

        if !self.keyboard_grabbed {
            let status = self
                .conn
                .grab_keyboard(false, window, CURRENT_TIME, GrabMode::ASYNC, GrabMode::ASYNC)
                .map_err(|e| e.to_string())
                .and_then(|cookie| cookie.reply().map_err(|e| e.to_string()))
                .and_then(|reply| grab_result(reply.status));
            self.keyboard_grabbed = log_grab("keyboard", status, warn_on_failure);
        }

        if !self.pointer_grabbed {
            let mask = EventMask::BUTTON_PRESS | EventMask::BUTTON_RELEASE | EventMask::POINTER_MOTION;
            let status = self
                .conn
                .grab_pointer(
                    false,
                    window,
                    mask,
                    GrabMode::ASYNC,
                    GrabMode::ASYNC,
                    NONE,
                    self.cursor,
                    CURRENT_TIME,
                )
                .map_err(|e| e.to_string())
                .and_then(|cookie| cookie.reply().map_err(|e| e.to_string()))
                .and_then(|reply| grab_result(reply.status));
            self.pointer_grabbed = log_grab("pointer", status, warn_on_failure);
        }
    }

    fn release_input(&mut self) {
        if std::mem::take(&mut self.keyboard_grabbed)
            && let Err(e) = self.conn.ungrab_keyboard(CURRENT_TIME)
        {
            warn!("Failed to release keyboard grab: {}", e);
        }
        if std::mem::take(&mut self.pointer_grabbed)
            && let Err(e) = self.conn.ungrab_pointer(CURRENT_TIME)
        {
            warn!("Failed to release pointer grab: {}", e);
        }
    }
}

impl SurfaceManager for X11Surfaces {
    fn materialize(&mut self) -> Result<BlankReport, SurfaceError> {
        let mut report = BlankReport::default();
        if self.shown {
            report.blanked = self.windows.iter().map(|(name, _)| name.clone()).collect();
            return Ok(report);
        }

        for monitor in self.monitors() {
            match self.create_window(&monitor) {
                Ok(window) => {
                    debug!(
                        "Blank window 0x{:x} on {} at {}x{}+{}+{}",
                        window, monitor.name, monitor.width, monitor.height, monitor.x, monitor.y
                    );
                    report.blanked.push(monitor.name.clone());
                    self.windows.push((monitor.name, window));
                }
                Err(e) => report.failed.push((monitor.name, e.to_string())),
            }
        }

        self.shown = true;
        self.grab_input(true);
        self.conn
            .flush()
            .map_err(|e| SurfaceError::Protocol(e.to_string()))?;
        Ok(report)
    }

    fn destroy(&mut self) -> Result<(), SurfaceError> {
        if !self.shown {
            return Ok(());
        }

        self.release_input();
        for (name, window) in self.windows.drain(..) {
            if let Err(e) = self.conn.destroy_window(window) {
                warn!("Failed to destroy blank window on {}: {}", name, e);
            }
        }
        self.shown = false;
        self.conn
            .flush()
            .map_err(|e| SurfaceError::Protocol(e.to_string()))
    }

    fn is_shown(&self) -> bool {
        self.shown
    }

    fn dispatch(&mut self) -> Result<(), SurfaceError> {
        if self.shown && !(self.keyboard_grabbed && self.pointer_grabbed) {
            self.grab_input(false);
        }

        // Drain whatever the server sent; errors for our requests end up here.
        while let Some(event) = self
            .conn
            .poll_for_event()
            .map_err(|e| SurfaceError::Protocol(e.to_string()))?
        {
            debug!("X11 event: {:?}", event);
        }
        Ok(())
    }
}

/// Map a grab reply status to a result.
fn grab_result(status: GrabStatus) -> Result<(), String> {
    match status {
        GrabStatus::SUCCESS => Ok(()),
        GrabStatus::ALREADY_GRABBED => Err("already grabbed by another client".to_string()),
        GrabStatus::FROZEN => Err("frozen by another client's grab".to_string()),
        GrabStatus::NOT_VIEWABLE => Err("grab window is not viewable".to_string()),
        GrabStatus::INVALID_TIME => Err("invalid grab time".to_string()),
        other => Err(format!("grab status {other:?}")),
    }
}

/// Log a grab attempt and return whether it succeeded.
fn log_grab(device: &str, result: Result<(), String>, warn_on_failure: bool) -> bool {
    match result {
        Ok(()) => {
            debug!("Grabbed the {}", device);
            true
        }
        Err(e) if warn_on_failure => {
            warn!("Failed to grab the {}: {}. Will retry", device, e);
            false
        }
        Err(e) => {
            trace!("Still cannot grab the {}: {}", device, e);
            false
        }
    }
}

/// A 1x1 depth-1 pixmap cleared to 0.
fn blank_pixmap(conn: &RustConnection, root: Window) -> Result<Pixmap, Box<dyn std::error::Error>> {
    let pixmap = conn.generate_id()?;
    conn.create_pixmap(1, pixmap, root, 1, 1)?;

    // Pixmap contents start out undefined.
    let gc = conn.generate_id()?;
    conn.create_gc(gc, pixmap, &CreateGCAux::new().foreground(0))?;
    conn.poly_fill_rectangle(
        pixmap,
        gc,
        &[Rectangle {
            x: 0,
            y: 0,
            width: 1,
            height: 1,
        }],
    )?;
    conn.free_gc(gc)?;
    Ok(pixmap)
}

/// A 1x1 cursor with an empty mask.
fn invisible_cursor(
    conn: &RustConnection,
    root: Window,
) -> Result<Cursor, Box<dyn std::error::Error>> {
    let pixmap = blank_pixmap(conn, root)?;

    let cursor = conn.generate_id()?;
    conn.create_cursor(cursor, pixmap, pixmap, 0, 0, 0, 0, 0, 0, 0, 0)?
        .check()?;
    conn.free_pixmap(pixmap)?;
    Ok(cursor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use x11rb::protocol::xproto::ImageFormat;

    #[test]
    fn test_grab_result() {
        assert!(grab_result(GrabStatus::SUCCESS).is_ok());

        let err = grab_result(GrabStatus::ALREADY_GRABBED).unwrap_err();
        assert!(err.contains("another client"));
        assert!(grab_result(GrabStatus::NOT_VIEWABLE).is_err());
        assert!(grab_result(GrabStatus::FROZEN).is_err());
    }

    #[test]
    fn test_log_grab_reports_outcome() {
        assert!(log_grab("keyboard", Ok(()), true));
        assert!(!log_grab("keyboard", Err("busy".to_string()), true));
        assert!(!log_grab("pointer", Err("busy".to_string()), false));
    }

    /// Connect to the display of the test session, if there is one.
    fn session_display() -> Option<X11Surfaces> {
        std::env::var_os("DISPLAY").filter(|v| !v.is_empty())?;
        X11Surfaces::connect().ok()
    }

    #[test]
    #[serial]
    fn test_blank_pixmap_is_cleared() {
        let Some(surfaces) = session_display() else {
            return;
        };

        let pixmap = blank_pixmap(&surfaces.conn, surfaces.root).unwrap();
        let image = surfaces
            .conn
            .get_image(ImageFormat::Z_PIXMAP, pixmap, 0, 0, 1, 1, !0)
            .unwrap()
            .reply()
            .unwrap();
        surfaces.conn.free_pixmap(pixmap).unwrap();

        assert!(image.data.iter().all(|&b| b == 0));
    }

    #[test]
    #[serial]
    fn test_materialize_grabs_and_destroy_releases() {
        let Some(mut surfaces) = session_display() else {
            return;
        };

        let report = surfaces.materialize().unwrap();
        assert!(surfaces.is_shown());
        assert!(!report.blanked.is_empty());
        assert!(surfaces.keyboard_grabbed);
        assert!(surfaces.pointer_grabbed);

        surfaces.destroy().unwrap();
        assert!(!surfaces.is_shown());
        assert!(!surfaces.keyboard_grabbed);
        assert!(!surfaces.pointer_grabbed);
        assert!(surfaces.windows.is_empty());
    }
}
