// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! asya-wire
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod frame;
pub mod response;

pub use frame::{read_frame, read_json, write_frame, write_json, MAX_FRAME_LEN};
pub use response::{ErrorResponse, WireResponse};

use thiserror::Error;

/// Failures while framing, parsing, or interpreting wire traffic.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The peer announced a frame larger than [`MAX_FRAME_LEN`].
    #[error("frame length {len} exceeds cap {max}")]
    Oversize {
        /// Announced length.
        len: usize,
        /// Configured cap.
        max: usize,
    },

    /// Reading or writing the stream failed (includes the peer closing the
    /// connection mid-frame).
    #[error("socket i/o failed: {0}")]
    Io(#[from] std::io::Error),

    /// A frame body was not valid JSON for the expected shape.
    #[error("invalid json in frame: {0}")]
    Json(#[source] serde_json::Error),

    /// The response was valid JSON but none of the three legal shapes
    /// (array, null, error object).
    #[error("unexpected response shape: {0}")]
    UnexpectedShape(String),
}
