use std::io;

use thiserror::Error;

/// Errors surfaced by the protocol engines.
///
/// Dispatch-time problems (undecodable datagrams, unregistered identifiers, handlers that do not
///  reply) never show up here: the receive path drops them and the sending side observes a
///  [PrtError::Timeout] instead.
#[derive(Debug, Error)]
pub enum PrtError {
    #[error("content overflowed: encoded frame has {len} bytes, maximum is {max}")]
    ContentOverflowed { len: usize, max: usize },

    #[error("pyrite counterpart timed out")]
    Timeout,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("illegal operation: {0}")]
    IllegalOperation(String),

    #[error("identifier {0:?} uses the reserved protocol prefix")]
    ReservedIdentifier(String),

    #[error("a handler is already registered for identifier {0:?}")]
    DuplicateRoute(String),

    #[error("unknown session {0:?}")]
    UnknownSession(String),

    #[error("malformed frame: {0}")]
    Decode(String),

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
}

impl PrtError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, PrtError::Timeout)
    }
}
