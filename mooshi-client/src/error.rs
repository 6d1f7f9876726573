use mooshi_proto::ProtoError;

/// Failures reported by a [`crate::Transport`]
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("no usable Bluetooth adapter")]
    NoAdapter,

    #[error("scan error: {0}")]
    Scan(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("GATT error: {0}")]
    Gatt(String),

    #[error("peer is not connected")]
    NotConnected,

    #[error("Bluetooth backend error: {0}")]
    Backend(String),
}

impl From<btleplug::Error> for TransportError {
    fn from(e: btleplug::Error) -> Self {
        TransportError::Backend(e.to_string())
    }
}

/// Process-level outcome, used as the CLI exit status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Success = 0,
    NoAdapterFound = 1,
    ScanFailed = 2,
    TransportConnectionFailed = 3,
    Usage = 4,
}

impl ErrorCode {
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::Success => "success",
            ErrorCode::NoAdapterFound => "no Bluetooth adapter found",
            ErrorCode::ScanFailed => "scan failed",
            ErrorCode::TransportConnectionFailed => "connection to the meter failed",
            ErrorCode::Usage => "usage error",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("no Bluetooth adapter found: {0}")]
    NoAdapterFound(TransportError),

    #[error("scan failed: {0}")]
    ScanFailed(TransportError),

    #[error("connection to the meter failed: {0}")]
    TransportConnectionFailed(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error("no node at path {0:?}")]
    UnknownPath(String),

    #[error("node {0} is not part of the current tree")]
    UnknownNode(usize),

    #[error("node {0} has no op-code")]
    NodeNotAddressable(String),

    #[error("node {0} is not a chooser option")]
    NotAChooser(String),

    #[error("chooser {path} has no option {index}")]
    NoSuchOption { path: String, index: u8 },

    #[error("session was already set up")]
    AlreadySetUp,

    #[error("invalid config: {0}")]
    Config(String),
}

impl SessionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::NoAdapterFound(_) => ErrorCode::NoAdapterFound,
            SessionError::ScanFailed(_) => ErrorCode::ScanFailed,
            SessionError::TransportConnectionFailed(_) | SessionError::Transport(_) => {
                ErrorCode::TransportConnectionFailed
            }
            _ => ErrorCode::Usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes() {
        assert_eq!(ErrorCode::Success as i32, 0);
        assert_eq!(
            SessionError::NoAdapterFound(TransportError::NoAdapter).code() as i32,
            1
        );
        assert_eq!(
            SessionError::ScanFailed(TransportError::Scan("busy".into())).code(),
            ErrorCode::ScanFailed
        );
        assert_eq!(
            SessionError::TransportConnectionFailed("gone".into()).code() as i32,
            3
        );
        assert_eq!(SessionError::UnknownNode(7).code(), ErrorCode::Usage);
    }
}
