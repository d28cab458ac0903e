//! Declared-resource change notifications.

/// Kind of change observed on a declared resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// The resource was created or updated (including soft deletion).
    Set,
    /// The resource is gone from the store.
    Del,
}

impl Operation {
    /// Returns true if this is a Set operation.
    pub fn is_set(&self) -> bool {
        matches!(self, Operation::Set)
    }

    /// Returns true if this is a Del operation.
    pub fn is_del(&self) -> bool {
        matches!(self, Operation::Del)
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Set => write!(f, "SET"),
            Operation::Del => write!(f, "DEL"),
        }
    }
}

/// A notification keyed by resource identity.
///
/// Notifications carry no payload: reconcilers always fetch the current
/// declared resource, so a stale or coalesced notification is harmless.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Notification {
    /// Resource identity, e.g. "default/peer-a".
    pub key: String,
    /// Observed operation.
    pub op: Operation,
}

impl Notification {
    /// Creates a new notification.
    pub fn new(key: impl Into<String>, op: Operation) -> Self {
        Self {
            key: key.into(),
            op,
        }
    }

    /// Creates a "resource changed" notification.
    pub fn changed(key: impl Into<String>) -> Self {
        Self::new(key, Operation::Set)
    }

    /// Creates a "resource removed" notification.
    pub fn removed(key: impl Into<String>) -> Self {
        Self::new(key, Operation::Del)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_constructors() {
        let n = Notification::changed("default/peer-a");
        assert_eq!(n.key, "default/peer-a");
        assert!(n.op.is_set());

        let n = Notification::removed("default/peer-a");
        assert!(n.op.is_del());
        assert_eq!(n.op.to_string(), "DEL");
    }
}
