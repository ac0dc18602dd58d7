//! Wayland blank surfaces via `wlr-layer-shell`.
//!
//! One overlay layer surface per `wl_output`, anchored to every edge with
//! exclusive keyboard focus and a solid black shm buffer. Outputs that appear
//! while blanked get a surface as soon as the registry announces them.

use std::fs::File;
use std::io;
use std::os::fd::AsFd;

use tracing::{debug, info, trace, warn};
use wayland_client::backend::WaylandError;
use wayland_client::globals::{GlobalList, GlobalListContents, registry_queue_init};
use wayland_client::protocol::{
    wl_buffer, wl_compositor, wl_output, wl_pointer, wl_registry, wl_seat, wl_shm, wl_shm_pool,
    wl_surface,
};
use wayland_client::{Connection, Dispatch, EventQueue, Proxy, QueueHandle, WEnum, delegate_noop};
use wayland_protocols_wlr::layer_shell::v1::client::{zwlr_layer_shell_v1, zwlr_layer_surface_v1};

use super::{BlankReport, SURFACE_TITLE, SurfaceError, SurfaceManager};

const OUTPUT_VERSION: u32 = 4;
const SEAT_VERSION: u32 = 5;

/// Blank surfaces on a wlroots-style compositor.
pub struct WaylandSurfaces {
    conn: Connection,
    queue: EventQueue<State>,
    state: State,
}

impl WaylandSurfaces {
    /// Connect using `WAYLAND_DISPLAY` and bind the required globals.
    pub fn connect() -> Result<Self, SurfaceError> {
        let conn =
            Connection::connect_to_env().map_err(|e| SurfaceError::Connect(e.to_string()))?;
        let (globals, mut queue) =
            registry_queue_init::<State>(&conn).map_err(|e| SurfaceError::Connect(e.to_string()))?;
        let qh = queue.handle();

        let mut state = State::bind(&globals, &qh)?;
        for global in globals.contents().clone_list() {
            state.on_global(globals.registry(), global.name, &global.interface, global.version, &qh);
        }

        // Collect output names before the first blank.
        queue
            .roundtrip(&mut state)
            .map_err(|e| SurfaceError::Protocol(e.to_string()))?;

        info!(
            "Connected to Wayland compositor ({} outputs)",
            state.outputs.len()
        );
        Ok(Self { conn, queue, state })
    }

    fn flush(&self) -> Result<(), SurfaceError> {
        self.conn
            .flush()
            .map_err(|e| SurfaceError::Protocol(e.to_string()))
    }
}

impl SurfaceManager for WaylandSurfaces {
    fn materialize(&mut self) -> Result<BlankReport, SurfaceError> {
        if self.state.shown {
            return Ok(self.state.report());
        }

        let qh = self.queue.handle();
        self.state.shown = true;
        let outputs: Vec<(u32, wl_output::WlOutput)> = self
            .state
            .outputs
            .iter()
            .map(|o| (o.global, o.output.clone()))
            .collect();
        for (global, output) in outputs {
            self.state.create_surface(global, &output, &qh);
        }

        // Configure events arrive here; buffers are attached in the handler.
        self.queue
            .roundtrip(&mut self.state)
            .map_err(|e| SurfaceError::Protocol(e.to_string()))?;
        self.flush()?;

        Ok(self.state.report())
    }

    fn destroy(&mut self) -> Result<(), SurfaceError> {
        if !self.state.shown {
            return Ok(());
        }

        for surface in self.state.surfaces.drain(..) {
            surface.destroy();
        }
        self.state.shown = false;
        debug!("Destroyed Wayland blank surfaces");
        self.flush()
    }

    fn is_shown(&self) -> bool {
        self.state.shown
    }

    fn dispatch(&mut self) -> Result<(), SurfaceError> {
        let protocol = |e: &dyn std::fmt::Display| SurfaceError::Protocol(e.to_string());

        self.queue
            .dispatch_pending(&mut self.state)
            .map_err(|e| protocol(&e))?;
        self.flush()?;

        if let Some(guard) = self.queue.prepare_read() {
            match guard.read() {
                Ok(_) => {}
                Err(WaylandError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(protocol(&e)),
            }
        }

        self.queue
            .dispatch_pending(&mut self.state)
            .map_err(|e| protocol(&e))?;
        Ok(())
    }
}

struct Output {
    global: u32,
    output: wl_output::WlOutput,
    name: Option<String>,
}

impl Output {
    fn label(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("wl_output@{}", self.global))
    }
}

/// A black buffer and the shm file backing it.
struct Buffer {
    buffer: wl_buffer::WlBuffer,
    width: i32,
    height: i32,
    _file: File,
}

struct BlankSurface {
    /// Registry name of the output this surface covers.
    global: u32,
    label: String,
    surface: wl_surface::WlSurface,
    layer: zwlr_layer_surface_v1::ZwlrLayerSurfaceV1,
    buffer: Option<Buffer>,
    error: Option<String>,
}

impl BlankSurface {
    fn destroy(self) {
        self.layer.destroy();
        self.surface.destroy();
        if let Some(buffer) = self.buffer {
            buffer.buffer.destroy();
        }
    }
}

struct State {
    compositor: wl_compositor::WlCompositor,
    shm: wl_shm::WlShm,
    layer_shell: zwlr_layer_shell_v1::ZwlrLayerShellV1,
    outputs: Vec<Output>,
    surfaces: Vec<BlankSurface>,
    pointers: Vec<(wl_seat::WlSeat, wl_pointer::WlPointer)>,
    shown: bool,
}

impl State {
    fn bind(globals: &GlobalList, qh: &QueueHandle<Self>) -> Result<Self, SurfaceError> {
        let compositor: wl_compositor::WlCompositor = globals
            .bind(qh, 4..=6, ())
            .map_err(|_| SurfaceError::MissingGlobal("wl_compositor"))?;
        let shm: wl_shm::WlShm = globals
            .bind(qh, 1..=1, ())
            .map_err(|_| SurfaceError::MissingGlobal("wl_shm"))?;
        let layer_shell: zwlr_layer_shell_v1::ZwlrLayerShellV1 = globals
            .bind(qh, 1..=4, ())
            .map_err(|_| SurfaceError::MissingGlobal("zwlr_layer_shell_v1"))?;

        Ok(Self {
            compositor,
            shm,
            layer_shell,
            outputs: Vec::new(),
            surfaces: Vec::new(),
            pointers: Vec::new(),
            shown: false,
        })
    }

    fn on_global(
        &mut self,
        registry: &wl_registry::WlRegistry,
        name: u32,
        interface: &str,
        version: u32,
        qh: &QueueHandle<Self>,
    ) {
        match interface {
            "wl_output" => {
                let output: wl_output::WlOutput =
                    registry.bind(name, version.min(OUTPUT_VERSION), qh, name);
                debug!("Output added: wl_output@{}", name);
                self.outputs.push(Output {
                    global: name,
                    output: output.clone(),
                    name: None,
                });
                if self.shown {
                    self.create_surface(name, &output, qh);
                }
            }
            "wl_seat" => {
                let _seat: wl_seat::WlSeat = registry.bind(name, version.min(SEAT_VERSION), qh, ());
            }
            _ => {}
        }
    }

    fn on_global_remove(&mut self, name: u32) {
        if let Some(pos) = self.surfaces.iter().position(|s| s.global == name) {
            self.surfaces.remove(pos).destroy();
        }
        if let Some(pos) = self.outputs.iter().position(|o| o.global == name) {
            let output = self.outputs.remove(pos);
            info!("Output removed: {}", output.label());
            if output.output.version() >= 3 {
                output.output.release();
            }
        }
    }

    fn create_surface(&mut self, global: u32, output: &wl_output::WlOutput, qh: &QueueHandle<Self>) {
        use zwlr_layer_surface_v1::{Anchor, KeyboardInteractivity};

        let label = self
            .outputs
            .iter()
            .find(|o| o.global == global)
            .map_or_else(|| format!("wl_output@{global}"), Output::label);

        let surface = self.compositor.create_surface(qh, ());
        let layer = self.layer_shell.get_layer_surface(
            &surface,
            Some(output),
            zwlr_layer_shell_v1::Layer::Overlay,
            SURFACE_TITLE.to_string(),
            qh,
            global,
        );
        layer.set_anchor(Anchor::Top | Anchor::Bottom | Anchor::Left | Anchor::Right);
        layer.set_exclusive_zone(-1);
        layer.set_keyboard_interactivity(KeyboardInteractivity::Exclusive);
        layer.set_size(0, 0);
        // Initial commit without a buffer asks the compositor for a configure.
        surface.commit();

        trace!("Requested layer surface for {}", label);
        self.surfaces.push(BlankSurface {
            global,
            label,
            surface,
            layer,
            buffer: None,
            error: None,
        });
    }

    fn on_configure(&mut self, global: u32, width: u32, height: u32, qh: &QueueHandle<Self>) {
        let shm = self.shm.clone();
        let Some(blank) = self.surfaces.iter_mut().find(|s| s.global == global) else {
            return;
        };

        let reuse = blank.buffer.as_ref().is_some_and(|b| {
            u32::try_from(b.width) == Ok(width) && u32::try_from(b.height) == Ok(height)
        });
        if !reuse {
            match black_buffer(&shm, width, height, qh) {
                Ok(buffer) => {
                    if let Some(old) = blank.buffer.replace(buffer) {
                        old.buffer.destroy();
                    }
                    blank.error = None;
                }
                Err(e) => {
                    blank.error = Some(e.to_string());
                    return;
                }
            }
        }

        if let Some(buffer) = &blank.buffer {
            blank.surface.attach(Some(&buffer.buffer), 0, 0);
            blank.surface.damage_buffer(0, 0, buffer.width, buffer.height);
        }
        blank.surface.commit();
        trace!("Configured {} at {}x{}", blank.label, width, height);
    }

    fn on_closed(&mut self, global: u32) {
        if let Some(pos) = self.surfaces.iter().position(|s| s.global == global) {
            let blank = self.surfaces.remove(pos);
            warn!("Compositor closed blank surface on {}", blank.label);
            blank.destroy();
        }
    }

    fn report(&self) -> BlankReport {
        let mut report = BlankReport::default();
        if self.outputs.is_empty() {
            report
                .failed
                .push(("*".to_string(), "compositor advertises no outputs".to_string()));
        }

        for blank in &self.surfaces {
            match (&blank.buffer, &blank.error) {
                (_, Some(error)) => report.failed.push((blank.label.clone(), error.clone())),
                (Some(_), None) => report.blanked.push(blank.label.clone()),
                (None, None) => report
                    .failed
                    .push((blank.label.clone(), "no configure received".to_string())),
            }
        }
        report
    }
}

/// Allocate an opaque black `XRGB8888` buffer.
fn black_buffer(
    shm: &wl_shm::WlShm,
    width: u32,
    height: u32,
    qh: &QueueHandle<State>,
) -> io::Result<Buffer> {
    let invalid = |msg: &str| io::Error::new(io::ErrorKind::InvalidInput, msg.to_string());
    if width == 0 || height == 0 {
        return Err(invalid("compositor sent an empty size"));
    }

    let width = i32::try_from(width).map_err(|_| invalid("output too wide"))?;
    let height = i32::try_from(height).map_err(|_| invalid("output too tall"))?;
    let stride = width
        .checked_mul(4)
        .ok_or_else(|| invalid("output too wide"))?;
    let size = stride
        .checked_mul(height)
        .ok_or_else(|| invalid("output too large"))?;

    // A zero-filled XRGB8888 buffer is opaque black.
    let file = tempfile::tempfile()?;
    file.set_len(u64::from(size.unsigned_abs()))?;

    let pool = shm.create_pool(file.as_fd(), size, qh, ());
    let buffer = pool.create_buffer(0, width, height, stride, wl_shm::Format::Xrgb8888, qh, ());
    pool.destroy();

    Ok(Buffer {
        buffer,
        width,
        height,
        _file: file,
    })
}

impl Dispatch<wl_registry::WlRegistry, GlobalListContents> for State {
    fn event(
        state: &mut Self,
        registry: &wl_registry::WlRegistry,
        event: wl_registry::Event,
        _: &GlobalListContents,
        _: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        match event {
            wl_registry::Event::Global {
                name,
                interface,
                version,
            } => state.on_global(registry, name, &interface, version, qh),
            wl_registry::Event::GlobalRemove { name } => state.on_global_remove(name),
            _ => {}
        }
    }
}

impl Dispatch<wl_output::WlOutput, u32> for State {
    fn event(
        state: &mut Self,
        _: &wl_output::WlOutput,
        event: wl_output::Event,
        global: &u32,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let wl_output::Event::Name { name } = event
            && let Some(output) = state.outputs.iter_mut().find(|o| o.global == *global)
        {
            debug!("wl_output@{} is {}", global, name);
            output.name = Some(name);
        }
    }
}

impl Dispatch<zwlr_layer_surface_v1::ZwlrLayerSurfaceV1, u32> for State {
    fn event(
        state: &mut Self,
        layer: &zwlr_layer_surface_v1::ZwlrLayerSurfaceV1,
        event: zwlr_layer_surface_v1::Event,
        global: &u32,
        _: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        match event {
            zwlr_layer_surface_v1::Event::Configure {
                serial,
                width,
                height,
            } => {
                layer.ack_configure(serial);
                state.on_configure(*global, width, height, qh);
            }
            zwlr_layer_surface_v1::Event::Closed => state.on_closed(*global),
            _ => {}
        }
    }
}

impl Dispatch<wl_seat::WlSeat, ()> for State {
    fn event(
        state: &mut Self,
        seat: &wl_seat::WlSeat,
        event: wl_seat::Event,
        _: &(),
        _: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        if let wl_seat::Event::Capabilities {
            capabilities: WEnum::Value(caps),
        } = event
            && caps.contains(wl_seat::Capability::Pointer)
            && !state.pointers.iter().any(|(s, _)| s == seat)
        {
            state.pointers.push((seat.clone(), seat.get_pointer(qh, ())));
        }
    }
}

impl Dispatch<wl_pointer::WlPointer, ()> for State {
    fn event(
        state: &mut Self,
        pointer: &wl_pointer::WlPointer,
        event: wl_pointer::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        // Hide the cursor while it is over one of our surfaces.
        if let wl_pointer::Event::Enter {
            serial, surface, ..
        } = event
            && state.surfaces.iter().any(|s| s.surface == surface)
        {
            pointer.set_cursor(serial, None, 0, 0);
        }
    }
}

delegate_noop!(State: wl_compositor::WlCompositor);
delegate_noop!(State: wl_shm_pool::WlShmPool);
delegate_noop!(State: zwlr_layer_shell_v1::ZwlrLayerShellV1);
delegate_noop!(State: ignore wl_shm::WlShm);
delegate_noop!(State: ignore wl_buffer::WlBuffer);
delegate_noop!(State: ignore wl_surface::WlSurface);
