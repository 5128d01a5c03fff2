//! Notifier seam for user-visible feedback.
//!
//! The core decides *when* something is worth surfacing (permanent send
//! failure, exhausted retries, session expiry); the host decides how to
//! render it. Expected empties and transient errors under retry are
//! never surfaced.

/// Severity of a user-visible notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

pub trait Notifier: Send + Sync {
    /// Surface a toast-style message to the user.
    fn notify(&self, level: NoticeLevel, message: &str);

    /// The session is no longer valid. Raised at most once per expiry;
    /// in-flight sends stop and the outbound queue is preserved.
    fn session_ended(&self);
}

/// Notifier that only logs. Default for embedders that wire their own
/// feedback later.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, level: NoticeLevel, message: &str) {
        match level {
            NoticeLevel::Info => {
                tracing::info!(target: "nabo::notifier", "{}", message)
            }
            NoticeLevel::Warning => {
                tracing::warn!(target: "nabo::notifier", "{}", message)
            }
            NoticeLevel::Error => {
                tracing::error!(target: "nabo::notifier", "{}", message)
            }
        }
    }

    fn session_ended(&self) {
        tracing::warn!(target: "nabo::notifier", "Session ended");
    }
}
