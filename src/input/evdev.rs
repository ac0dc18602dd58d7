//! evdev input backend.
//!
//! Reads `/dev/input/event*` nodes directly, so it sees input regardless of
//! which client has focus, including while our own surfaces grab the keyboard.
//! Only keyboards, pointers and touch devices are watched; sensors and game
//! controllers produce motion nobody made. The directory is rescanned while
//! running so replugged and resumed devices are picked up again.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use evdev::{
    AbsoluteAxisCode, AttributeSetRef, Device, EventSummary, KeyCode, PropType, RelativeAxisCode,
};
use futures_util::stream::{LocalBoxStream, SelectAll};
use futures_util::{FutureExt, StreamExt, future};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::{InputError, InputSource};
use crate::domain::{InputEvent, InputKind};

/// Default directory scanned for event nodes.
pub const DEFAULT_INPUT_DIR: &str = "/dev/input";

/// Minimum time between two scans of the input directory.
pub const RESCAN_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on events drained per poll, so a flood cannot stall the loop.
const MAX_DRAIN: usize = 512;

/// `BTN_JOYSTICK` (`BTN_TRIGGER`) through `BTN_DEAD`.
const JOYSTICK_BUTTONS: std::ops::RangeInclusive<u16> = 0x120..=0x12f;

/// `BTN_GAMEPAD` (`BTN_SOUTH`) through `BTN_THUMBR`.
const GAMEPAD_BUTTONS: std::ops::RangeInclusive<u16> = 0x130..=0x13e;

/// What we know about one `event*` node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Node {
    /// A stream is reading it.
    Watched,
    /// Opened, but not a device that reports user activity.
    Ignored,
    /// Could not be opened; retried on every scan.
    Unreadable,
}

/// Item yielded by a per-device stream.
enum DeviceItem {
    Event(evdev::InputEvent),
    /// The device failed and its stream ends here.
    Lost(PathBuf, io::Error),
}

/// Input source merging every readable keyboard, pointer and touch device.
pub struct EvdevSource {
    dir: PathBuf,
    streams: SelectAll<LocalBoxStream<'static, DeviceItem>>,
    nodes: HashMap<PathBuf, Node>,
    last_scan: Instant,
}

impl EvdevSource {
    /// Open every readable activity device in `dir`.
    ///
    /// Fails if none can be opened. Must be called from within a tokio runtime.
    pub fn open(dir: &Path) -> Result<Self, InputError> {
        let mut source = Self::empty(dir);
        source.rescan()?;

        if source.streams.is_empty() {
            return Err(InputError::NoDevices(dir.display().to_string()));
        }

        Ok(source)
    }

    fn empty(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            streams: SelectAll::new(),
            nodes: HashMap::new(),
            last_scan: Instant::now(),
        }
    }

    /// Number of devices still being read.
    pub fn device_count(&self) -> usize {
        self.streams.len()
    }

    /// Start watching `event*` nodes that appeared since the last scan.
    ///
    /// Returns the number of new devices.
    fn rescan(&mut self) -> Result<usize, InputError> {
        self.last_scan = Instant::now();
        let listed = event_nodes(&self.dir)?;

        // Watched entries leave only when their stream reports the loss.
        self.nodes
            .retain(|path, node| *node == Node::Watched || listed.contains(path));

        let mut added = 0;
        for path in listed {
            let retry = match self.nodes.get(&path) {
                Some(Node::Watched | Node::Ignored) => continue,
                Some(Node::Unreadable) => true,
                None => false,
            };

            let node = self.watch(&path, retry);
            if node == Node::Watched {
                added += 1;
            }
            self.nodes.insert(path, node);
        }

        if added > 0 {
            debug!("Now watching {} input devices", self.streams.len());
        }
        Ok(added)
    }

    fn watch(&mut self, path: &Path, retry: bool) -> Node {
        let device = match Device::open(path) {
            Ok(device) => device,
            Err(e) if retry => {
                trace!(device = %path.display(), "Still cannot open device: {}", e);
                return Node::Unreadable;
            }
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                warn!(device = %path.display(), "No permission to read device");
                return Node::Unreadable;
            }
            Err(e) => {
                debug!(device = %path.display(), "Skipping device: {}", e);
                return Node::Unreadable;
            }
        };

        let name = device.name().unwrap_or("unnamed").to_string();
        if !is_activity_device(device.properties(), device.supported_keys()) {
            debug!(
                device = %path.display(),
                "Ignoring '{}': not a keyboard, pointer or touch device", name
            );
            return Node::Ignored;
        }

        match device.into_event_stream() {
            Ok(stream) => {
                info!(device = %path.display(), "Listening to '{}'", name);
                self.streams.push(device_stream(path.to_path_buf(), stream));
                Node::Watched
            }
            Err(e) => {
                warn!(device = %path.display(), "Failed to watch device: {}", e);
                Node::Unreadable
            }
        }
    }

    fn rescan_if_due(&mut self) -> Result<(), InputError> {
        if self.last_scan.elapsed() < RESCAN_INTERVAL {
            return Ok(());
        }

        match self.rescan() {
            Ok(_) => Ok(()),
            Err(InputError::NoDevices(dir)) if self.streams.is_empty() => {
                warn!("Input directory {} is gone", dir);
                Err(InputError::Disconnected)
            }
            Err(e) => {
                warn!("Input device rescan failed: {}", e);
                Ok(())
            }
        }
    }

    fn take(&mut self, item: DeviceItem, events: &mut Vec<InputEvent>) {
        match item {
            DeviceItem::Event(event) => events.push(InputEvent::new(classify(&event))),
            DeviceItem::Lost(path, e) => {
                warn!(device = %path.display(), "Input device lost: {}", e);
                self.nodes.remove(&path);
            }
        }
    }
}

impl InputSource for EvdevSource {
    async fn poll_events(&mut self, timeout: Duration) -> Result<Vec<InputEvent>, InputError> {
        self.rescan_if_due()?;

        if self.streams.is_empty() {
            // Every device is gone; wait for the next scan to find one.
            tokio::time::sleep(timeout).await;
            return Ok(Vec::new());
        }

        let first = match tokio::time::timeout(timeout, self.streams.next()).await {
            Err(_) | Ok(None) => return Ok(Vec::new()),
            Ok(Some(item)) => item,
        };

        let mut events = Vec::new();
        self.take(first, &mut events);
        for _ in 1..MAX_DRAIN {
            match self.streams.next().now_or_never() {
                Some(Some(item)) => self.take(item, &mut events),
                Some(None) | None => break,
            }
        }

        trace!("Read {} input events", events.len());
        Ok(events)
    }
}

/// Wrap a device stream so it ends, reporting the loss once, on its first
/// read error.
fn device_stream(
    path: PathBuf,
    stream: evdev::EventStream,
) -> LocalBoxStream<'static, DeviceItem> {
    stream
        .scan(false, move |lost, result| {
            if *lost {
                return future::ready(None);
            }
            let item = match result {
                Ok(event) => DeviceItem::Event(event),
                Err(e) => {
                    *lost = true;
                    DeviceItem::Lost(path.clone(), e)
                }
            };
            future::ready(Some(item))
        })
        .boxed_local()
}

/// `event*` nodes in `dir`, sorted by path.
fn event_nodes(dir: &Path) -> Result<Vec<PathBuf>, InputError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(InputError::NoDevices(dir.display().to_string()));
        }
        Err(e) => return Err(InputError::Io(e)),
    };

    let mut nodes: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("event"))
        })
        .collect();
    nodes.sort();
    Ok(nodes)
}

/// Whether a device reports user activity.
///
/// Accelerometers and joysticks or gamepads are left out: their axes move
/// without anyone touching the machine.
fn is_activity_device(
    properties: &AttributeSetRef<PropType>,
    keys: Option<&AttributeSetRef<KeyCode>>,
) -> bool {
    if properties.contains(PropType::ACCELEROMETER) {
        return false;
    }

    let is_controller = keys.is_some_and(|keys| {
        keys.iter()
            .any(|k| JOYSTICK_BUTTONS.contains(&k.code()) || GAMEPAD_BUTTONS.contains(&k.code()))
    });
    !is_controller
}

/// Reduce a raw evdev event to the kinds activity tracking cares about.
pub fn classify(event: &evdev::InputEvent) -> InputKind {
    match event.destructure() {
        EventSummary::RelativeAxis(_, RelativeAxisCode::REL_X | RelativeAxisCode::REL_Y, _)
        | EventSummary::AbsoluteAxis(
            _,
            AbsoluteAxisCode::ABS_X
            | AbsoluteAxisCode::ABS_Y
            | AbsoluteAxisCode::ABS_MT_POSITION_X
            | AbsoluteAxisCode::ABS_MT_POSITION_Y,
            _,
        ) => InputKind::PointerMotion,
        EventSummary::Key(_, KeyCode::BTN_TOUCH, 1) => InputKind::TouchDown,
        EventSummary::Key(_, code, 0 | 1) if is_pointer_button(code) => InputKind::PointerButton,
        EventSummary::Key(_, code, 0 | 1) if !is_non_key_button(code) => InputKind::Key,
        _ => InputKind::Other,
    }
}

/// `BTN_LEFT` through `BTN_TASK`.
fn is_pointer_button(code: KeyCode) -> bool {
    (KeyCode::BTN_LEFT.code()..=KeyCode::BTN_TASK.code()).contains(&code.code())
}

/// Controller buttons, and touch or tool-proximity codes, which are not key
/// presses.
fn is_non_key_button(code: KeyCode) -> bool {
    let code = code.code();
    JOYSTICK_BUTTONS.contains(&code)
        || GAMEPAD_BUTTONS.contains(&code)
        || (KeyCode::BTN_TOOL_PEN.code()..=KeyCode::BTN_TOOL_QUADTAP.code()).contains(&code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use evdev::{AttributeSet, EventType};

    fn key(code: KeyCode, value: i32) -> evdev::InputEvent {
        evdev::InputEvent::new(EventType::KEY.0, code.code(), value)
    }

    fn rel(code: RelativeAxisCode, value: i32) -> evdev::InputEvent {
        evdev::InputEvent::new(EventType::RELATIVE.0, code.0, value)
    }

    fn abs(code: AbsoluteAxisCode, value: i32) -> evdev::InputEvent {
        evdev::InputEvent::new(EventType::ABSOLUTE.0, code.0, value)
    }

    fn keys(codes: &[u16]) -> AttributeSet<KeyCode> {
        let mut set = AttributeSet::new();
        for &code in codes {
            set.insert(KeyCode::new(code));
        }
        set
    }

    #[test]
    fn test_classify_pointer_motion() {
        assert_eq!(classify(&rel(RelativeAxisCode::REL_X, 3)), InputKind::PointerMotion);
        assert_eq!(classify(&rel(RelativeAxisCode::REL_Y, -1)), InputKind::PointerMotion);
        assert_eq!(classify(&abs(AbsoluteAxisCode::ABS_X, 900)), InputKind::PointerMotion);
        assert_eq!(
            classify(&abs(AbsoluteAxisCode::ABS_MT_POSITION_Y, 12)),
            InputKind::PointerMotion
        );
    }

    #[test]
    fn test_classify_scroll_is_not_activity() {
        assert_eq!(classify(&rel(RelativeAxisCode::REL_WHEEL, 1)), InputKind::Other);
        assert_eq!(classify(&abs(AbsoluteAxisCode::ABS_PRESSURE, 40)), InputKind::Other);
    }

    #[test]
    fn test_classify_keys() {
        assert_eq!(classify(&key(KeyCode::KEY_A, 1)), InputKind::Key);
        assert_eq!(classify(&key(KeyCode::KEY_A, 0)), InputKind::Key);
        // Autorepeat is not reported as a key event.
        assert_eq!(classify(&key(KeyCode::KEY_A, 2)), InputKind::Other);
    }

    #[test]
    fn test_classify_pointer_buttons() {
        assert_eq!(classify(&key(KeyCode::BTN_LEFT, 1)), InputKind::PointerButton);
        assert_eq!(classify(&key(KeyCode::BTN_RIGHT, 0)), InputKind::PointerButton);
        assert_eq!(classify(&key(KeyCode::BTN_MIDDLE, 1)), InputKind::PointerButton);
    }

    #[test]
    fn test_classify_touch() {
        assert_eq!(classify(&key(KeyCode::BTN_TOUCH, 1)), InputKind::TouchDown);
        assert_eq!(classify(&key(KeyCode::BTN_TOUCH, 0)), InputKind::Other);
        assert_eq!(classify(&key(KeyCode::BTN_TOOL_FINGER, 1)), InputKind::Other);
    }

    #[test]
    fn test_classify_pen_proximity_is_other() {
        assert_eq!(classify(&key(KeyCode::BTN_TOOL_PEN, 1)), InputKind::Other);
        assert_eq!(classify(&key(KeyCode::BTN_TOOL_QUADTAP, 0)), InputKind::Other);
    }

    #[test]
    fn test_classify_controller_buttons_are_other() {
        assert_eq!(classify(&key(KeyCode::new(0x130), 1)), InputKind::Other);
        assert_eq!(classify(&key(KeyCode::new(0x120), 1)), InputKind::Other);
    }

    #[test]
    fn test_classify_sync_is_other() {
        let syn = evdev::InputEvent::new(EventType::SYNCHRONIZATION.0, 0, 0);
        assert_eq!(classify(&syn), InputKind::Other);
    }

    #[test]
    fn test_accelerometer_is_not_activity_device() {
        let mut props = AttributeSet::<PropType>::new();
        props.insert(PropType::ACCELEROMETER);
        assert!(!is_activity_device(&props, None));
    }

    #[test]
    fn test_gamepad_is_not_activity_device() {
        let props = AttributeSet::<PropType>::new();
        // BTN_SOUTH, BTN_EAST, BTN_START
        let gamepad = keys(&[0x130, 0x131, 0x13b]);
        assert!(!is_activity_device(&props, Some(&*gamepad)));
    }

    #[test]
    fn test_joystick_is_not_activity_device() {
        let props = AttributeSet::<PropType>::new();
        // BTN_TRIGGER, BTN_THUMB
        let joystick = keys(&[0x120, 0x121]);
        assert!(!is_activity_device(&props, Some(&*joystick)));
    }

    #[test]
    fn test_keyboard_mouse_and_touchpad_are_activity_devices() {
        let props = AttributeSet::<PropType>::new();
        let keyboard = keys(&[KeyCode::KEY_A.code(), KeyCode::KEY_ENTER.code()]);
        let mouse = keys(&[KeyCode::BTN_LEFT.code(), KeyCode::BTN_RIGHT.code()]);
        assert!(is_activity_device(&props, Some(&*keyboard)));
        assert!(is_activity_device(&props, Some(&*mouse)));

        let mut touchpad = AttributeSet::<PropType>::new();
        touchpad.insert(PropType::POINTER);
        touchpad.insert(PropType::BUTTONPAD);
        assert!(is_activity_device(&touchpad, Some(&*keys(&[KeyCode::BTN_TOUCH.code()]))));
    }

    #[test]
    fn test_event_nodes_missing_dir() {
        let result = event_nodes(Path::new("/definitely/not/dev/input"));
        assert!(matches!(result, Err(InputError::NoDevices(_))));
    }

    #[test]
    fn test_event_nodes_skips_non_event_entries() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("mice"), b"").unwrap();
        fs::create_dir(dir.path().join("by-path")).unwrap();
        fs::write(dir.path().join("event3"), b"").unwrap();
        fs::write(dir.path().join("event1"), b"").unwrap();

        let nodes = event_nodes(dir.path()).unwrap();
        assert_eq!(
            nodes,
            vec![dir.path().join("event1"), dir.path().join("event3")]
        );
    }

    #[tokio::test]
    async fn test_open_without_devices_fails() {
        let dir = tempfile::tempdir().unwrap();
        // A plain file is not an input device.
        fs::write(dir.path().join("event0"), b"").unwrap();

        let result = EvdevSource::open(dir.path());
        assert!(matches!(result, Err(InputError::NoDevices(_))));
    }

    #[tokio::test]
    async fn test_rescan_tracks_appearing_and_vanishing_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = EvdevSource::empty(dir.path());

        assert_eq!(source.rescan().unwrap(), 0);
        assert!(source.nodes.is_empty());

        let node = dir.path().join("event7");
        fs::write(&node, b"").unwrap();
        assert_eq!(source.rescan().unwrap(), 0);
        assert_eq!(source.nodes.get(&node), Some(&Node::Unreadable));

        fs::remove_file(&node).unwrap();
        source.rescan().unwrap();
        assert!(source.nodes.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_without_devices_waits_for_rescan() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = EvdevSource::empty(dir.path());

        let before = Instant::now();
        let events = source.poll_events(Duration::from_millis(200)).await.unwrap();
        assert!(events.is_empty());
        assert!(before.elapsed() >= Duration::from_millis(200));

        // A scan is due; a node that shows up now is found.
        tokio::time::advance(RESCAN_INTERVAL).await;
        fs::write(dir.path().join("event0"), b"").unwrap();
        source.poll_events(Duration::from_millis(200)).await.unwrap();
        assert!(source.nodes.contains_key(&dir.path().join("event0")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_vanished_input_dir_disconnects() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = EvdevSource::empty(&dir.path().join("input"));

        tokio::time::advance(RESCAN_INTERVAL).await;
        let result = source.poll_events(Duration::from_millis(200)).await;
        assert!(matches!(result, Err(InputError::Disconnected)));
    }
}
