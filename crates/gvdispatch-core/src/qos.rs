//! Quality-of-service classes and queue kinds

use core::fmt;

/// Quality-of-service class of a queue
///
/// Workers always prefer the highest class that has runnable work, so the
/// class only matters under contention. It never affects correctness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum QosClass {
    /// Work the user is interacting with right now (event handling, drawing)
    UserInteractive = 0,

    /// Work the user started and is waiting on
    UserInitiated = 1,

    /// Default class when nothing more specific is known
    Default = 2,

    /// Long-running work the user is not actively waiting for
    Utility = 3,

    /// Maintenance work the user is unaware of
    Background = 4,
}

impl QosClass {
    /// Number of classes
    pub const COUNT: usize = 5;

    /// Index of the class, 0 = highest
    #[inline]
    pub const fn as_index(&self) -> usize {
        *self as usize
    }

    /// Class from index
    #[inline]
    pub const fn from_index(idx: usize) -> Option<QosClass> {
        match idx {
            0 => Some(QosClass::UserInteractive),
            1 => Some(QosClass::UserInitiated),
            2 => Some(QosClass::Default),
            3 => Some(QosClass::Utility),
            4 => Some(QosClass::Background),
            _ => None,
        }
    }

    /// All classes, highest to lowest
    pub fn iter() -> impl Iterator<Item = QosClass> {
        [
            QosClass::UserInteractive,
            QosClass::UserInitiated,
            QosClass::Default,
            QosClass::Utility,
            QosClass::Background,
        ]
        .into_iter()
    }

    /// Short name used in thread and queue labels
    pub const fn name(&self) -> &'static str {
        match self {
            QosClass::UserInteractive => "user-interactive",
            QosClass::UserInitiated => "user-initiated",
            QosClass::Default => "default",
            QosClass::Utility => "utility",
            QosClass::Background => "background",
        }
    }
}

impl Default for QosClass {
    fn default() -> Self {
        QosClass::Default
    }
}

impl fmt::Display for QosClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Execution discipline of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// One task at a time, in submission order
    Serial,

    /// Tasks may run in parallel and in any order
    Concurrent,
}

impl Default for QueueKind {
    fn default() -> Self {
        QueueKind::Serial
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_ordering() {
        assert!(QosClass::UserInteractive < QosClass::UserInitiated);
        assert!(QosClass::UserInitiated < QosClass::Default);
        assert!(QosClass::Default < QosClass::Utility);
        assert!(QosClass::Utility < QosClass::Background);
    }

    #[test]
    fn test_qos_index_roundtrip() {
        for qos in QosClass::iter() {
            assert_eq!(QosClass::from_index(qos.as_index()), Some(qos));
        }
        assert_eq!(QosClass::from_index(QosClass::COUNT), None);
    }

    #[test]
    fn test_defaults() {
        assert_eq!(QosClass::default(), QosClass::Default);
        assert_eq!(QueueKind::default(), QueueKind::Serial);
        assert_eq!(format!("{}", QosClass::Utility), "utility");
    }
}
