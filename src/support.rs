use std::io;

pub type WasResult<T> = Result<T, WasError>;

/// Error plumbing for the session API. `Wait` is the would-block value and
/// never indicates failure; the other variants carry the three failure
/// classes the protocol distinguishes: a peer violation (the current
/// request is lost), an application calling an operation in an illegal
/// state (the request survives in its error state), and a transport
/// failure on one of the descriptors.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum WasError {
    Wait,
    Protocol(ProtocolError),
    Misuse(MisuseError),
    Io(io::ErrorKind),
}

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum ProtocolError {
    UnknownCommand,
    UnexpectedPacket,
    BadPayload,
    InvalidMethod,
    LengthMismatch,
}

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum MisuseError {
    NoRequest,
    RequestFailed,
    NoBody,
    StatusAlreadySet,
    InvalidStatus,
    InvalidHeader,
    ForbiddenHeader,
    HeadersSent,
    LengthAlreadySet,
    BodyStarted,
    BodyOverrun,
    BodyIncomplete,
    AccountingConflict,
    OversizedPayload,
    Finished,
}

impl From<io::Error> for WasError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => WasError::Wait,
            kind => WasError::Io(kind),
        }
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for WasResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(WasError::Wait) => false,
            _ => true,
        }
    }
}

/// Outcome of a bounded wait on one of the body descriptors.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum PollStatus {
    /// The descriptor is ready for I/O.
    Ready,
    /// The timeout elapsed first.
    Timeout,
    /// The body reached its boundary during the wait.
    End,
    /// The body was closed or cancelled during the wait.
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_would_block_folds_to_wait() {
        let err: WasError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(err, WasError::Wait);

        let err: WasError = io::Error::from(io::ErrorKind::BrokenPipe).into();
        assert_eq!(err, WasError::Io(io::ErrorKind::BrokenPipe));
    }

    #[test]
    fn test_wait_is_not_a_failure() {
        assert!(!WasResult::Ok(()).has_failed());
        assert!(!WasResult::<()>::Err(WasError::Wait).has_failed());
        assert!(WasResult::<()>::Err(WasError::Misuse(MisuseError::NoRequest)).has_failed());
    }
}
