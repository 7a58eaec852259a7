// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! asya-sidecar
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod dispatch;
pub mod pump;
pub mod router;
pub mod shutdown;
pub mod tracker;

pub use dispatch::{DispatchError, RuntimeClient};
pub use pump::MessagePump;
pub use router::{Outcome, Router, RouterOptions};
pub use shutdown::ShutdownToken;
pub use tracker::{ProgressReporter, ProgressStatus, ProgressUpdate};

use thiserror::Error;

/// Top-level sidecar failures: the pump stops only for these.
#[derive(Debug, Error)]
pub enum SidecarError {
    /// The transport failed in a way receive cannot recover from.
    #[error(transparent)]
    Transport(#[from] asya_transport::TransportError),

    /// Configuration was unusable.
    #[error("configuration error: {0}")]
    Config(String),
}
