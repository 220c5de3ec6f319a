//! Grepable error codes shared by relay replies and REST responses.

use events::{SendFailure, ServerEvent};

/// Grepable error code and retryable flag for structured error replies.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

/// Build a relay `error` event from a typed error.
pub fn error_event(err: &(impl ErrorCode + ?Sized)) -> ServerEvent {
    ServerEvent::error(err.error_code(), err.to_string())
}

/// Build a `message_failed` reply for a rejected send. Retryable failures
/// are tagged so the sender can tell a transient outage from a refusal.
pub fn send_failure(id: String, chat_id: String, err: &(impl ErrorCode + ?Sized)) -> ServerEvent {
    let mut error = format!("{}: {err}", err.error_code());
    if err.retryable() {
        error.push_str(" (retryable)");
    }
    ServerEvent::MessageFailed(SendFailure { id, chat_id, error })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("chat not found")]
    struct NotFound;

    impl ErrorCode for NotFound {
        fn error_code(&self) -> &'static str {
            "E_NOT_FOUND"
        }
    }

    #[test]
    fn error_event_carries_code_and_message() {
        let ServerEvent::Error(payload) = error_event(&NotFound) else {
            panic!("expected error event");
        };
        assert_eq!(payload.code, "E_NOT_FOUND");
        assert_eq!(payload.message, "chat not found");
        assert!(!NotFound.retryable());
    }

    #[derive(Debug, thiserror::Error)]
    #[error("database unavailable")]
    struct Unavailable;

    impl ErrorCode for Unavailable {
        fn error_code(&self) -> &'static str {
            "E_DATABASE"
        }

        fn retryable(&self) -> bool {
            true
        }
    }

    #[test]
    fn send_failure_tags_retryable_errors() {
        let ServerEvent::MessageFailed(failure) = send_failure("m1".into(), "c1".into(), &Unavailable) else {
            panic!("expected message_failed");
        };
        assert_eq!(failure.id, "m1");
        assert_eq!(failure.chat_id, "c1");
        assert_eq!(failure.error, "E_DATABASE: database unavailable (retryable)");

        let ServerEvent::MessageFailed(failure) = send_failure("m2".into(), "c1".into(), &NotFound) else {
            panic!("expected message_failed");
        };
        assert_eq!(failure.error, "E_NOT_FOUND: chat not found");
    }
}
