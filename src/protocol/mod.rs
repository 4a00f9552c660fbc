//! Wire level definitions shared by client and server.
//!
//! Every datagram carries exactly one frame, a flat UTF-8 text with newline separated fields:
//!
//! ```ascii
//! <session>\n<identifier>\n<sequence>\n\n<body>
//! ```
//!
//! * `session` is the token assigned by the server during the handshake, empty before that
//! * `identifier` selects the handler on the receiving side, or one of the reserved protocol
//!    operations below
//! * `sequence` is a decimal signed integer correlating a request with its acknowledgment, `-1`
//!    if no acknowledgment is expected
//! * the fourth field is always empty, reserved for header extensions
//! * `body` is everything after the fourth newline, so it may contain newlines itself
//!
//! A frame is never split across datagrams. Frames exceeding the configured maximum transmit
//!  size are rejected before sending.
//!
//! ## Handshake
//!
//! ```ascii
//! client                                      server
//!   |--- prt-hello (session "", seq 0) -------->|  session CREATED, fresh token
//!   |<-- prt-hello (token, seq 0, max life) ----|
//!   |--- prt-established (token, seq -1) ------>|  session ESTABLISHED
//! ```

pub mod error;
pub mod message;

use error::PrtError;

/// Identifiers starting with this prefix are reserved for the protocol itself, application
///  handlers cannot be registered for them.
pub const RESERVED_PREFIX: &str = "prt-";

/// handshake initiation, and the server's offer in reply
pub const HELLO: &str = "prt-hello";
/// handshake completion, sent fire-and-forget by the client
pub const ESTABLISHED: &str = "prt-established";
/// acknowledgment carrying the reply body for a given sequence number
pub const ACK: &str = "prt-ack";

pub fn is_reserved(identifier: &str) -> bool {
    identifier.starts_with(RESERVED_PREFIX)
}

/// Rejects identifiers that applications may neither send nor register handlers for
pub fn check_application_identifier(identifier: &str) -> Result<(), PrtError> {
    if is_reserved(identifier) {
        return Err(PrtError::ReservedIdentifier(identifier.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::hello(HELLO, true)]
    #[case::established(ESTABLISHED, true)]
    #[case::ack(ACK, true)]
    #[case::bare_prefix("prt-", true)]
    #[case::application("echo", false)]
    #[case::prefix_inside("echo-prt-", false)]
    #[case::similar("prt_ack", false)]
    #[case::empty("", false)]
    fn test_is_reserved(#[case] identifier: &str, #[case] expected: bool) {
        assert_eq!(is_reserved(identifier), expected);
        assert_eq!(check_application_identifier(identifier).is_err(), expected);
    }
}
