//! Link binding trait for the logical connection to the NFC controller.

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use thiserror::Error;

use crate::framing::FramingError;

/// Parameters negotiated when the logical connection is opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinkParams {
    /// Connection identifier assigned by the controller
    pub conn_id: u8,
    /// Maximum transport frame size in bytes, headers included
    pub max_frame: usize,
}

/// Connection-oriented byte-stream primitive to the controller.
///
/// One logical connection carries all HCP frames. Opening negotiates the
/// maximum frame size; `recv` delivers inbound frames in arrival order.
#[async_trait]
pub trait HciLink: Send + Sync {
    /// Open the logical connection to the secure-element target.
    async fn open(&self) -> Result<LinkParams, TransportError>;

    /// Send one transport frame.
    async fn send(&self, conn_id: u8, frame: Bytes) -> Result<(), TransportError>;

    /// Receive the next inbound transport frame (blocking).
    async fn recv(&self) -> Result<Bytes, TransportError>;

    /// Close the logical connection.
    async fn close(&self, conn_id: u8) -> Result<(), TransportError>;
}

/// Common transport error type
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport disconnected")]
    Disconnected,

    #[error("Operation timed out")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("Other error: {0}")]
    Other(String),
}
