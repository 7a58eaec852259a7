// SPDX-License-Identifier: MIT OR Apache-2.0
//! Resource-exhaustion classification and best-effort cleanup hooks.

use asya_model::ErrorCode;
use tracing::warn;

use crate::handler::HandlerError;

/// Message fragments that indicate GPU memory exhaustion.
const CUDA_OOM_PATTERNS: &[&str] = &[
    "cuda out of memory",
    "cuda error: out of memory",
    "cublas_status_alloc_failed",
    "cudnn_status_alloc_failed",
    "hip out of memory",
];

/// Message fragments that indicate host memory exhaustion.
const HOST_OOM_PATTERNS: &[&str] = &[
    "out of memory",
    "memoryerror",
    "cannot allocate memory",
    "allocation failed",
];

/// Map a handler failure to its wire error code.
///
/// Explicit `Oom`/`CudaOom` variants always classify as such. For plain
/// failures, substring detection runs only when `detection_enabled`; GPU
/// patterns are checked first because every CUDA OOM message also matches
/// the generic "out of memory" fragment.
pub fn classify(err: &HandlerError, detection_enabled: bool) -> ErrorCode {
    match err {
        HandlerError::Oom(_) => ErrorCode::OomError,
        HandlerError::CudaOom(_) => ErrorCode::CudaOomError,
        HandlerError::Failure { class, message } => {
            if !detection_enabled {
                return ErrorCode::ProcessingError;
            }
            let haystack = format!("{class} {message}").to_lowercase();
            if CUDA_OOM_PATTERNS.iter().any(|p| haystack.contains(p)) {
                ErrorCode::CudaOomError
            } else if HOST_OOM_PATTERNS.iter().any(|p| haystack.contains(p)) {
                ErrorCode::OomError
            } else {
                ErrorCode::ProcessingError
            }
        }
    }
}

/// Best-effort cleanup callbacks run after an OOM classification, before the
/// error response is written. The host hook is the garbage-collection
/// equivalent; the GPU hook is the cache purge.
#[derive(Default)]
pub struct CleanupHooks {
    /// Invoked after a host OOM.
    pub on_oom: Option<Box<dyn Fn() + Send + Sync>>,
    /// Invoked after a GPU OOM, when GPU cleanup is enabled.
    pub on_cuda_oom: Option<Box<dyn Fn() + Send + Sync>>,
}

impl CleanupHooks {
    /// Run the hook matching `code`, if one is installed.
    pub fn run(&self, code: ErrorCode, cuda_cleanup_enabled: bool) {
        match code {
            ErrorCode::OomError => {
                if let Some(hook) = &self.on_oom {
                    hook();
                } else {
                    warn!(target: "asya.runtime", "oom detected, no cleanup hook installed");
                }
            }
            ErrorCode::CudaOomError if cuda_cleanup_enabled => {
                if let Some(hook) = &self.on_cuda_oom {
                    hook();
                } else {
                    warn!(target: "asya.runtime", "cuda oom detected, no cleanup hook installed");
                }
            }
            _ => {}
        }
    }
}
