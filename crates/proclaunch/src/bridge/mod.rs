//! IPC bridge between the launcher and its helper process.
//!
//! This module provides the wire protocol, codec and socket transport for the
//! single connection every process instance is multiplexed over.
//!
//! # Architecture
//!
//! - **protocol**: Message types (HelperRequest/HelperResponse, Token, StartRequest)
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite
//! - **transport**: Unix socket the helper connects back to

pub mod codec;
pub mod protocol;
pub mod transport;
