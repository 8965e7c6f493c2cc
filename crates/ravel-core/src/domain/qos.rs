//! Quality-of-service hints.
//!
//! Every task carries one of these; queues forward it verbatim to the
//! worker pool as a scheduling-class hint. The pool is only required to
//! honour the hint monotonically (a higher class is never scheduled worse
//! than a lower one).

use serde::{Deserialize, Serialize};

/// Scheduling-class hint, ascending urgency.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum QosClass {
    Background,
    Utility,
    #[default]
    Default,
    UserInitiated,
    UserInteractive,
}

impl QosClass {
    /// Stable label for log fields.
    pub fn label(self) -> &'static str {
        match self {
            QosClass::Background => "background",
            QosClass::Utility => "utility",
            QosClass::Default => "default",
            QosClass::UserInitiated => "user_initiated",
            QosClass::UserInteractive => "user_interactive",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_order_by_urgency() {
        assert!(QosClass::Background < QosClass::Utility);
        assert!(QosClass::Utility < QosClass::Default);
        assert!(QosClass::Default < QosClass::UserInitiated);
        assert!(QosClass::UserInitiated < QosClass::UserInteractive);
    }

    #[test]
    fn default_is_the_default_class() {
        assert_eq!(QosClass::default(), QosClass::Default);
    }
}
