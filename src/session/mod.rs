//! Per-peer conversation state: sessions, their pending exchanges, and the server's session table

pub mod pending;
#[allow(clippy::module_inception)]
pub mod session;
pub mod session_table;
pub mod token;
