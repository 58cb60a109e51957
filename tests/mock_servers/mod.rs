//! Mock servers for integration testing
//!
//! These simulate a real server's command-line interface, allowing full
//! connection and catalog tests without a running Lyrion Music Server.

pub mod lms_cli;

pub use lms_cli::{Fault, MockCliServer, MockCliState};
