//! Utilities for testing code on top of the protocol engines. They are used for testing the
//!  engines themselves, but they are exported for application testing as well.

pub mod network;
