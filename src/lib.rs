//! Client for the Squeezebox / Lyrion Music Server command-line interface.
//!
//! This library provides:
//! - A newline-framed channel and a request/reply session over TCP port 9090
//! - A connection state machine running login and the capability handshake
//! - Sparse, page-filled catalog lists (artists, albums, player queues...)
//! - Server discovery over UDP broadcast
//! - An event bus carrying connection, catalog and server-pushed events

pub mod bus;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod library;
pub mod protocol;

pub use error::{CliError, CliResult};
