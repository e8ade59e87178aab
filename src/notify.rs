//! User-facing notifications and the status badge.

use std::time::Duration;
use tracing::debug;

use crate::error::{GenerationError, describe_duration};
use crate::state::{GenerationState, Phase};

pub const APP_TITLE: &str = "n8n Workflow Builder AI";
const MAX_ERROR_MESSAGE_CHARS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Success,
    Timeout,
    Error,
}

/// A transient message shown once per terminal transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub auto_dismiss: Duration,
}

impl Notification {
    pub fn success(label: &str) -> Self {
        Self {
            kind: NotificationKind::Success,
            title: APP_TITLE.to_string(),
            message: format!("{} generation complete!", label),
            auto_dismiss: Duration::from_secs(3),
        }
    }

    pub fn timeout(label: &str, limit: Duration) -> Self {
        Self {
            kind: NotificationKind::Timeout,
            title: "Generation Timeout".to_string(),
            message: format!(
                "Generation with {} timed out after {}. Please try again later.",
                label,
                describe_duration(limit)
            ),
            auto_dismiss: Duration::from_secs(5),
        }
    }

    pub fn error(message: &str) -> Self {
        Self {
            kind: NotificationKind::Error,
            title: "Generation Error".to_string(),
            message: truncate(message, MAX_ERROR_MESSAGE_CHARS),
            auto_dismiss: Duration::from_secs(5),
        }
    }

    /// Picks the notification for a failed generation. `message` is the
    /// text already written to the state document.
    pub fn for_failure(err: &GenerationError, label: &str, limit: Duration, message: &str) -> Self {
        match err {
            GenerationError::OverallTimeout { .. } => Self::timeout(label, limit),
            _ => Self::error(message),
        }
    }
}

fn truncate(message: &str, max_chars: usize) -> String {
    match message.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &message[..cut]),
        None => message.to_string(),
    }
}

/// Delivers notifications to the user.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: &Notification);
}

/// Prints notifications to stderr for interactive use.
pub struct ConsoleNotifier;

impl NotificationSink for ConsoleNotifier {
    fn notify(&self, notification: &Notification) {
        debug!(kind = ?notification.kind, title = %notification.title, "Showing notification");
        let icon = match notification.kind {
            NotificationKind::Success => "✅",
            NotificationKind::Timeout => "⏱️",
            NotificationKind::Error => "❌",
        };
        eprintln!("{} {}: {}", icon, notification.title, notification.message);
    }
}

/// Compact status indicator derived from the generation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Badge {
    Running,
    Success,
    Error,
}

impl Badge {
    /// `None` when idle.
    pub fn from_state(state: &GenerationState) -> Option<Self> {
        match state.phase() {
            Phase::Idle => None,
            Phase::Running => Some(Self::Running),
            Phase::Succeeded => Some(Self::Success),
            Phase::Failed => Some(Self::Error),
        }
    }

    pub fn text(&self) -> &'static str {
        match self {
            Self::Running => "...",
            Self::Success => "✓",
            Self::Error => "!",
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingNotifier {
        pub notifications: Mutex<Vec<Notification>>,
    }

    impl RecordingNotifier {
        pub fn all(&self) -> Vec<Notification> {
            self.notifications.lock().unwrap().clone()
        }
    }

    impl NotificationSink for RecordingNotifier {
        fn notify(&self, notification: &Notification) {
            self.notifications.lock().unwrap().push(notification.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_notification() {
        let n = Notification::success("Claude");
        assert_eq!(n.title, "n8n Workflow Builder AI");
        assert_eq!(n.message, "Claude generation complete!");
        assert_eq!(n.auto_dismiss, Duration::from_secs(3));
    }

    #[test]
    fn test_timeout_notification_names_limit() {
        let n = Notification::timeout("Claude", Duration::from_secs(180));
        assert_eq!(n.kind, NotificationKind::Timeout);
        assert_eq!(
            n.message,
            "Generation with Claude timed out after 3 minutes. Please try again later."
        );
    }

    #[test]
    fn test_error_notification_truncates_long_messages() {
        let long = "x".repeat(150);
        let n = Notification::error(&long);
        assert_eq!(n.message.len(), 103);
        assert!(n.message.ends_with("..."));

        let short = Notification::error("short");
        assert_eq!(short.message, "short");

        let exact = Notification::error(&"é".repeat(100));
        assert_eq!(exact.message.chars().count(), 100);
    }

    #[test]
    fn test_failure_kind_selection() {
        let limit = Duration::from_secs(180);
        let timeout = GenerationError::overall_timeout("Grok", limit);
        assert_eq!(
            Notification::for_failure(&timeout, "Grok", limit, "m").kind,
            NotificationKind::Timeout
        );

        let other = GenerationError::Provider("bad key".to_string());
        let n = Notification::for_failure(&other, "Grok", limit, "bad key");
        assert_eq!(n.kind, NotificationKind::Error);
        assert_eq!(n.message, "bad key");
    }

    #[test]
    fn test_badge_from_state() {
        assert_eq!(Badge::from_state(&GenerationState::default()), None);

        let running = GenerationState {
            generation_in_progress: true,
            ..Default::default()
        };
        assert_eq!(Badge::from_state(&running).map(|b| b.text()), Some("..."));

        let done = GenerationState {
            generation_complete: true,
            generated_json: Some("{}".to_string()),
            ..Default::default()
        };
        assert_eq!(Badge::from_state(&done), Some(Badge::Success));
        assert_eq!(Badge::Success.text(), "✓");

        let failed = GenerationState {
            generation_complete: true,
            generation_error: Some("boom".to_string()),
            ..Default::default()
        };
        assert_eq!(Badge::from_state(&failed).map(|b| b.text()), Some("!"));
    }
}
