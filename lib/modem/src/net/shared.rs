use std::io;

/// Failure categories that end a connection. Everything else on the read
/// path is either skippable (logged, frame dropped) or transient.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ErrorType {
    BufferOverflow { size: usize, attempts: u32 },
    CrcBudgetExhausted,
    WindowViolation,
    MalformedFrame,
    PeerClosed,
    Io(io::ErrorKind),
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum NetworkError {
    /// The operation cannot make progress right now; retry when the
    /// transport becomes ready again.
    Wait,
    /// The connection is beyond recovery and must be closed.
    Fatal(ErrorType),
}

impl From<io::Error> for NetworkError {
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => NetworkError::Wait,
            kind => NetworkError::Fatal(ErrorType::Io(kind)),
        }
    }
}

pub type NetworkResult<T> = ::std::result::Result<T, NetworkError>;

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetworkResult<T> {
    #[inline]
    fn has_failed(&self) -> bool {
        match self {
            Err(NetworkError::Fatal(_)) => true,
            _ => false,
        }
    }
}
