//! Result taxonomy shared by transactions and connection managers.

/// Why a transaction or connection did not succeed.
///
/// Every transaction completes with exactly one `Result<(), NetError>`;
/// connection-level failures are also handed to the context's error hook once.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetError {
    /// A server host name could not be resolved.
    #[error("name lookup failed")]
    NameLookupFailed,
    /// The TCP connect was refused, or the failed-connect ceiling was reached.
    #[error("connect failed")]
    ConnectFailed,
    /// The connection dropped while the transaction was bound to it.
    #[error("disconnected")]
    Disconnected,
    /// The server answered with something the transaction could not parse.
    #[error("malformed response")]
    ProtocolViolation,
    /// The deadline passed and the transaction accepted the timeout.
    #[error("timed out")]
    Timeout,
    /// The protocol was shut down locally while the transaction was pending.
    #[error("remote shutdown")]
    RemoteShutdown,
    /// Cancelled by the caller.
    #[error("cancelled")]
    Cancelled,
    /// The server processed the request and returned a non-zero result code.
    #[error("server result code {0}")]
    Server(u32),
    /// The pending-transaction table has no free slot.
    #[error("too many pending transactions")]
    Overloaded,
}

/// Coarse classification of a [`NetError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Address resolution, connect, or link loss.
    Connectivity,
    /// Malformed or out-of-protocol response.
    Protocol,
    /// Deadline exceeded.
    Timeout,
    /// Explicit cancellation, including local shutdown.
    Cancellation,
    /// Server-side result code.
    Server,
    /// Local resource exhaustion.
    Resource,
}

impl NetError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            NetError::NameLookupFailed | NetError::ConnectFailed | NetError::Disconnected => {
                ErrorKind::Connectivity
            }
            NetError::ProtocolViolation => ErrorKind::Protocol,
            NetError::Timeout => ErrorKind::Timeout,
            NetError::RemoteShutdown | NetError::Cancelled => ErrorKind::Cancellation,
            NetError::Server(_) => ErrorKind::Server,
            NetError::Overloaded => ErrorKind::Resource,
        }
    }

    /// Map a wire result code (0 = success) onto a transaction result.
    pub fn from_result_code(code: u32) -> TransResult {
        match code {
            0 => Ok(()),
            other => Err(NetError::Server(other)),
        }
    }
}

/// Outcome delivered to a transaction's completion hook.
pub type TransResult = Result<(), NetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(NetError::ConnectFailed.kind(), ErrorKind::Connectivity);
        assert_eq!(NetError::ProtocolViolation.kind(), ErrorKind::Protocol);
        assert_eq!(NetError::Timeout.kind(), ErrorKind::Timeout);
        assert_eq!(NetError::RemoteShutdown.kind(), ErrorKind::Cancellation);
        assert_eq!(NetError::Server(7).kind(), ErrorKind::Server);
    }

    #[test]
    fn test_result_code_mapping() {
        assert_eq!(NetError::from_result_code(0), Ok(()));
        assert_eq!(NetError::from_result_code(3), Err(NetError::Server(3)));
    }

    #[test]
    fn test_display() {
        assert_eq!(NetError::Server(12).to_string(), "server result code 12");
        assert_eq!(NetError::Timeout.to_string(), "timed out");
    }
}
