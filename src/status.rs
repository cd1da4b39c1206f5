//! Status codes returned by engine operations.

use std::fmt;

/// Result of a store operation, as seen by the caller.
///
/// `Pending` is not an error: the operation's context has been copied onto
/// the session's pending queue and will complete during `complete_pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Status {
    /// Operation completed successfully.
    #[default]
    Ok = 0,
    /// Operation went asynchronous; resolved via `complete_pending`.
    Pending = 1,
    /// Key was not found (or is tombstoned).
    NotFound = 2,
    /// Page or bucket allocation failed.
    OutOfMemory = 3,
    /// Device failure, surfaced verbatim; the session remains usable.
    IoError = 4,
    /// Invariant violation detected on recovery; fatal to the checkpoint.
    Corruption = 5,
    /// Operation interrupted (e.g. checkpoint raced a concurrent close).
    Aborted = 6,
    /// Caller-supplied configuration or argument was rejected.
    InvalidArgument = 7,
    /// Operation is not valid in the engine's current state.
    InvalidOperation = 8,
}

impl Status {
    /// True for `Ok`.
    #[inline]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }

    /// True for `Pending`.
    #[inline]
    pub const fn is_pending(&self) -> bool {
        matches!(self, Status::Pending)
    }

    /// True for `NotFound`.
    #[inline]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Status::NotFound)
    }

    /// True for any error code (everything but `Ok`/`Pending`/`NotFound`).
    #[inline]
    pub const fn is_error(&self) -> bool {
        !matches!(self, Status::Ok | Status::Pending | Status::NotFound)
    }

    const fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "Ok",
            Status::Pending => "Pending",
            Status::NotFound => "NotFound",
            Status::OutOfMemory => "OutOfMemory",
            Status::IoError => "IoError",
            Status::Corruption => "Corruption",
            Status::Aborted => "Aborted",
            Status::InvalidArgument => "InvalidArgument",
            Status::InvalidOperation => "InvalidOperation",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicates() {
        assert!(Status::Ok.is_ok());
        assert!(Status::Pending.is_pending());
        assert!(Status::NotFound.is_not_found());
        assert!(!Status::NotFound.is_error());
        assert!(Status::IoError.is_error());
        assert!(Status::Corruption.is_error());
        assert!(Status::InvalidArgument.is_error());
    }

    #[test]
    fn wire_values_are_stable() {
        assert_eq!(Status::Ok as u8, 0);
        assert_eq!(Status::Pending as u8, 1);
        assert_eq!(Status::NotFound as u8, 2);
        assert_eq!(Status::OutOfMemory as u8, 3);
        assert_eq!(Status::IoError as u8, 4);
        assert_eq!(Status::Corruption as u8, 5);
        assert_eq!(Status::Aborted as u8, 6);
    }

    #[test]
    fn display() {
        assert_eq!(Status::Ok.to_string(), "Ok");
        assert_eq!(Status::Corruption.to_string(), "Corruption");
    }
}
