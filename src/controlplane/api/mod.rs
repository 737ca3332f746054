//! API Module
//!
//! REST surface of the daemon and the server that hosts it.

pub mod server;
pub mod rest;

pub use server::*;
pub use rest::*;
