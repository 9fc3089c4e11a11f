use std::fmt;

/// Process exit code for configuration errors.
pub const EXIT_CONFIG: i32 = 1;
/// Process exit code when the database is unreachable at startup.
pub const EXIT_STORE_UNAVAILABLE: i32 = 2;
/// Process exit code for broker/transport errors after startup.
pub const EXIT_BROKER: i32 = 3;

/// A connection-level failure surfaced out of the dispatcher loop.
///
/// Per-message failures (bad payloads, failed inserts) are logged and
/// dropped inside the loop; only errors that leave the connection unusable
/// are reported this way. The caller decides whether to terminate with the
/// suggested exit code.
#[derive(Debug)]
pub struct FatalError {
    pub message: String,
    pub exit_code: i32,
}

impl FatalError {
    pub fn new(message: impl Into<String>, exit_code: i32) -> Self {
        Self {
            message: message.into(),
            exit_code,
        }
    }
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for FatalError {}
