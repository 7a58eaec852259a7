// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! asya-operator
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crd;
pub mod inject;
pub mod keda;
pub mod queues;
pub mod reconciler;
pub mod scripts;
pub mod status;

pub use crd::{AsyncActor, AsyncActorSpec, AsyncActorStatus, Phase};
pub use reconciler::{Context, Error, OperatorSettings};
