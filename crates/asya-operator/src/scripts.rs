// SPDX-License-Identifier: MIT OR Apache-2.0
//! Distribution of the canonical runtime handler script.
//!
//! The operator reads the script once at startup (from a local path or a
//! release artifact) and publishes it as a ConfigMap in every namespace
//! that runs actors. Pods mount it read-only at a fixed path.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ObjectMeta;
use tracing::info;

use crate::inject::{SCRIPT_FILE, SCRIPT_VOLUME};

/// Where the script content comes from.
#[derive(Debug, Clone)]
pub enum ScriptSource {
    /// Read from the operator's filesystem.
    Path(PathBuf),
    /// Download from a release artifact URL.
    Url(String),
}

/// Failures while loading the script.
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    /// Local read failed.
    #[error("failed to read runtime script from {path}: {source}")]
    Read {
        /// Path that was attempted.
        path: String,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// Artifact download failed.
    #[error("failed to download runtime script from {url}: {source}")]
    Download {
        /// URL that was attempted.
        url: String,
        /// Underlying HTTP failure.
        #[source]
        source: reqwest::Error,
    },

    /// The loaded script was empty.
    #[error("runtime script is empty")]
    Empty,
}

/// The loaded canonical runtime script.
#[derive(Debug, Clone)]
pub struct RuntimeScript {
    /// Full script content.
    pub content: String,
}

impl RuntimeScript {
    /// Load the script from its configured source.
    pub async fn load(source: &ScriptSource) -> Result<Self, ScriptError> {
        let content = match source {
            ScriptSource::Path(path) => {
                tokio::fs::read_to_string(path)
                    .await
                    .map_err(|e| ScriptError::Read {
                        path: path.display().to_string(),
                        source: e,
                    })?
            }
            ScriptSource::Url(url) => {
                let response = reqwest::get(url).await.map_err(|e| ScriptError::Download {
                    url: url.clone(),
                    source: e,
                })?;
                response.text().await.map_err(|e| ScriptError::Download {
                    url: url.clone(),
                    source: e,
                })?
            }
        };
        if content.trim().is_empty() {
            return Err(ScriptError::Empty);
        }
        info!(target: "asya.operator", bytes = content.len(), "runtime script loaded");
        Ok(Self { content })
    }

    /// Load from a path synchronously-shaped helper for tests.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, ScriptError> {
        Self::load(&ScriptSource::Path(path.as_ref().to_path_buf())).await
    }

    /// The ConfigMap pods mount. Shared by every actor in `namespace`, so
    /// it carries no owner reference.
    pub fn config_map(&self, namespace: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(SCRIPT_VOLUME.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                SCRIPT_FILE.to_string(),
                self.content.clone(),
            )])),
            ..Default::default()
        }
    }
}
