//! Session oriented request / acknowledgment messaging on top of UDP.
//!
//! A [Client](client::Client) obtains a session from a [Server](server::Server) in a three way
//!  handshake, and after that either side can send messages to the other - fire-and-forget
//!  (`tell`) or waiting for an acknowledgment carrying a reply (`promise`). Inbound messages are
//!  dispatched to handlers by identifier, see [router]. See [protocol] for the wire format.

pub mod client;
pub mod config;
pub mod protocol;
pub mod router;
pub mod server;
pub mod session;
pub mod transport;
pub mod test_util;
