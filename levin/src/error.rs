use std::fmt;

pub type LevinResult<T> = Result<T, LevinError>;

/// Everything that can go wrong in the codec, parser, registry, handler or
/// table. Kept as one flat enum rather than per-module error types because
/// most call sites propagate these straight onto the wire as a [`ReturnCode`].
#[derive(Debug, thiserror::Error)]
pub enum LevinError {
    #[error("bad frame header: {0}")]
    Format(String),

    #[error("body of {size} bytes exceeds max_packet_size of {max}")]
    PacketTooBig { size: u64, max: u64 },

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("connection destroyed; outstanding invocations cancelled")]
    ConnectionDestroyed,

    #[error("connection {0} not found")]
    ConnectionNotFound(uuid::Uuid),

    #[error("invocation timed out")]
    Timeout,

    #[error("no dispatcher registered for this handler")]
    HandlerNotDefined,

    #[error("dispatcher raised an error handling command {command}: {source}")]
    Dispatcher {
        command: u32,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("registry: {0}")]
    Registry(String),
}

impl LevinError {
    /// Conservative mapping used whenever an error must be turned into a
    /// wire-level [`ReturnCode`] sent back to the peer. Any error whose
    /// precise cause the peer has no business learning (a local dispatcher
    /// panic/bug, a registry bookkeeping bug) collapses to `ConnectionTimedOut`,
    /// mirroring the catch-all in the original invoke dispatch map.
    pub fn as_return_code(&self) -> ReturnCode {
        match self {
            LevinError::ConnectionNotFound(_) => ReturnCode::ConnectionNotFound,
            LevinError::HandlerNotDefined => ReturnCode::ConnectionHandlerNotDefined,
            LevinError::ConnectionClosed | LevinError::Transport(_) => ReturnCode::Connection,
            LevinError::ConnectionDestroyed => ReturnCode::ConnectionDestroyed,
            LevinError::Format(_) | LevinError::PacketTooBig { .. } => ReturnCode::Format,
            LevinError::Timeout | LevinError::Dispatcher { .. } | LevinError::Registry(_) => {
                ReturnCode::ConnectionTimedOut
            }
        }
    }
}

/// Wire-level return code, carried in the frame header's `return_code` field
/// on every response frame. Values match `LEVIN_*` constants from the
/// reference implementation so a byte-for-byte compatible peer can interop.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum ReturnCode {
    Ok = 0,
    Connection = -1,
    ConnectionNotFound = -2,
    ConnectionDestroyed = -3,
    ConnectionTimedOut = -4,
    ConnectionNoDuplexProtocol = -5,
    ConnectionHandlerNotDefined = -6,
    Format = -7,
}

impl ReturnCode {
    pub fn from_i32(value: i32) -> Self {
        match value {
            0 => ReturnCode::Ok,
            -1 => ReturnCode::Connection,
            -2 => ReturnCode::ConnectionNotFound,
            -3 => ReturnCode::ConnectionDestroyed,
            -4 => ReturnCode::ConnectionTimedOut,
            -5 => ReturnCode::ConnectionNoDuplexProtocol,
            -6 => ReturnCode::ConnectionHandlerNotDefined,
            -7 => ReturnCode::Format,
            other => {
                log::warn!("unknown levin return code {other}, treating as Connection error");
                ReturnCode::Connection
            }
        }
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn is_ok(self) -> bool {
        matches!(self, ReturnCode::Ok)
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let descr = match self {
            ReturnCode::Ok => "OK",
            ReturnCode::Connection => "connection error",
            ReturnCode::ConnectionNotFound => "connection not found",
            ReturnCode::ConnectionDestroyed => "connection destroyed",
            ReturnCode::ConnectionTimedOut => "connection timed out",
            ReturnCode::ConnectionNoDuplexProtocol => "no duplex protocol",
            ReturnCode::ConnectionHandlerNotDefined => "handler not defined",
            ReturnCode::Format => "format error",
        };
        write!(f, "{descr}")
    }
}
