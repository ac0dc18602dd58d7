//! Domain types shared by the blanking core and its collaborators.

use std::fmt;

/// Maximum number of exempt process names kept from configuration.
pub const MAX_EXEMPT_PROCESSES: usize = 32;

/// Kind of a raw input event, as far as activity tracking cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputKind {
    PointerMotion,
    Key,
    PointerButton,
    TouchDown,
    /// Anything else the device reports (sync frames, scroll, autorepeat...).
    Other,
}

impl InputKind {
    /// Whether this kind counts as user activity.
    pub fn is_activity(self) -> bool {
        !matches!(self, Self::Other)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PointerMotion => "pointer-motion",
            Self::Key => "key",
            Self::PointerButton => "pointer-button",
            Self::TouchDown => "touch-down",
            Self::Other => "other",
        }
    }
}

/// A single event yielded by an input source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputEvent {
    pub kind: InputKind,
}

impl InputEvent {
    pub fn new(kind: InputKind) -> Self {
        Self { kind }
    }
}

impl From<InputKind> for InputEvent {
    fn from(kind: InputKind) -> Self {
        Self::new(kind)
    }
}

/// Command emitted by a state machine for the surface manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Materialize the blank surfaces on every output.
    Blank,
    /// Tear all blank surfaces down.
    Unblank,
}

/// Process names whose presence suppresses auto-blanking.
///
/// Keeps configuration order for diagnostics; lookups are plain membership.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExemptionSet(Vec<String>);

/// Returned when an [`ExemptionSet`] already holds [`MAX_EXEMPT_PROCESSES`] names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExemptionSetFull(pub String);

impl ExemptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a name. Duplicates are accepted and ignored.
    pub fn insert(&mut self, name: impl Into<String>) -> Result<(), ExemptionSetFull> {
        let name = name.into();
        if self.contains(&name) {
            return Ok(());
        }
        if self.0.len() >= MAX_EXEMPT_PROCESSES {
            return Err(ExemptionSetFull(name));
        }
        self.0.push(name);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|n| n == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ExemptionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_kinds() {
        assert!(InputKind::PointerMotion.is_activity());
        assert!(InputKind::Key.is_activity());
        assert!(InputKind::PointerButton.is_activity());
        assert!(InputKind::TouchDown.is_activity());
        assert!(!InputKind::Other.is_activity());
    }

    #[test]
    fn test_exemption_set_preserves_order() {
        let mut set = ExemptionSet::new();
        set.insert("mpv").unwrap();
        set.insert("vlc").unwrap();
        set.insert("obs").unwrap();

        let names: Vec<&str> = set.iter().collect();
        assert_eq!(names, vec!["mpv", "vlc", "obs"]);
        assert!(set.contains("vlc"));
        assert!(!set.contains("firefox"));
    }

    #[test]
    fn test_exemption_set_ignores_duplicates() {
        let mut set = ExemptionSet::new();
        set.insert("mpv").unwrap();
        set.insert("mpv").unwrap();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_exemption_set_cap() {
        let mut set = ExemptionSet::new();
        for i in 0..MAX_EXEMPT_PROCESSES {
            set.insert(format!("proc{i}")).unwrap();
        }

        assert_eq!(
            set.insert("one-too-many"),
            Err(ExemptionSetFull("one-too-many".to_string()))
        );
        assert_eq!(set.len(), MAX_EXEMPT_PROCESSES);
        // An existing name is still a no-op, not an overflow.
        assert!(set.insert("proc0").is_ok());
    }

    #[test]
    fn test_exemption_set_display() {
        let mut set = ExemptionSet::new();
        set.insert("foo").unwrap();
        set.insert("bar").unwrap();
        assert_eq!(set.to_string(), "[foo, bar]");
    }
}
