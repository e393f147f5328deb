//! IPC bridge between the UI process and the helper subprocess.
//!
//! This module provides the wire protocol and codec shared by both
//! sides of the pipe.
//!
//! # Architecture
//!
//! - **protocol**: Message types (Request, Reply, pseudo-command ids)
//! - **codec**: JSON-line framing codec for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
