/// Where the session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not set up, or the adapter is missing
    NoAdapter,
    Scanning,
    /// Scan ran out without finding a meter; waits for a rescan
    ScanTimedOut,
    Connecting,
    BindingCharacteristics,
    EnablingNotify,
    /// Connected and listening, waiting for the tree description
    DiscoveringTree,
    Ready,
    /// Link lost and reconnect disabled
    Disconnected,
    /// After shutdown
    Closed,
}

impl ConnectionState {
    pub fn is_scanning(self) -> bool {
        self == ConnectionState::Scanning
    }

    pub fn is_connected(self) -> bool {
        matches!(
            self,
            ConnectionState::BindingCharacteristics
                | ConnectionState::EnablingNotify
                | ConnectionState::DiscoveringTree
                | ConnectionState::Ready
        )
    }

    /// Notifications are enabled
    pub fn is_listening(self) -> bool {
        matches!(self, ConnectionState::DiscoveringTree | ConnectionState::Ready)
    }

    pub fn is_initialized(self) -> bool {
        self == ConnectionState::Ready
    }

    /// Nothing will happen without a call from the application
    pub fn is_idle(self) -> bool {
        matches!(
            self,
            ConnectionState::NoAdapter
                | ConnectionState::ScanTimedOut
                | ConnectionState::Disconnected
                | ConnectionState::Closed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::NoAdapter => "no-adapter",
            ConnectionState::Scanning => "scanning",
            ConnectionState::ScanTimedOut => "scan-timed-out",
            ConnectionState::Connecting => "connecting",
            ConnectionState::BindingCharacteristics => "binding-characteristics",
            ConnectionState::EnablingNotify => "enabling-notify",
            ConnectionState::DiscoveringTree => "discovering-tree",
            ConnectionState::Ready => "ready",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
