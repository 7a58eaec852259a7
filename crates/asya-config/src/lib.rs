// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! asya-config
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable names. The control plane injects these; the sidecar
/// and runtime read them. Keeping the names in one place is what makes the
/// set closed.
pub mod env {
    /// Handler locator string (`module.function` or `module.Class.method`).
    pub const HANDLER: &str = "ASYA_HANDLER";
    /// Handler mode: `payload` (default) or `envelope`.
    pub const HANDLER_MODE: &str = "ASYA_HANDLER_MODE";
    /// Full socket path the supervisor listens on.
    pub const SOCKET_PATH: &str = "ASYA_SOCKET_PATH";
    /// Socket directory; the default socket file name is appended.
    pub const SOCKET_DIR: &str = "ASYA_SOCKET_DIR";
    /// Octal permission bits applied to the socket file.
    pub const SOCKET_CHMOD: &str = "ASYA_SOCKET_CHMOD";
    /// Sidecar-side processing deadline, in seconds.
    pub const RUNTIME_TIMEOUT: &str = "ASYA_RUNTIME_TIMEOUT";
    /// Graceful-shutdown budget for the in-flight envelope, in seconds.
    pub const GRACEFUL_SHUTDOWN: &str = "ASYA_GRACEFUL_SHUTDOWN";
    /// Actor identity for the sidecar.
    pub const ACTOR_NAME: &str = "ASYA_ACTOR_NAME";
    /// Queue-name override; derived from the actor name when absent.
    pub const QUEUE_NAME: &str = "ASYA_QUEUE_NAME";
    /// Transport plug-in selector (`amqp`, `sqs`, `memory`).
    pub const TRANSPORT: &str = "ASYA_TRANSPORT";
    /// Marks the sidecar as a terminal sink (disables downstream routing).
    pub const IS_TERMINAL: &str = "ASYA_IS_TERMINAL";
    /// Enables memory-exhaustion classification in the runtime.
    pub const ENABLE_OOM_DETECTION: &str = "ASYA_ENABLE_OOM_DETECTION";
    /// Runs the GPU cache purge hook on CUDA OOM.
    pub const CUDA_CLEANUP_ON_OOM: &str = "ASYA_CUDA_CLEANUP_ON_OOM";
    /// Optional progress-tracker base URL.
    pub const GATEWAY_URL: &str = "ASYA_GATEWAY_URL";
    /// AMQP broker URL for the `amqp` transport.
    pub const AMQP_URL: &str = "ASYA_AMQP_URL";
    /// Queue base URL for the `sqs` transport.
    pub const SQS_BASE_URL: &str = "ASYA_SQS_BASE_URL";
    /// Transport in-flight window (prefetch); defaults to 1.
    pub const PREFETCH: &str = "ASYA_PREFETCH";
}

/// Default socket directory shared between the injected containers.
pub const DEFAULT_SOCKET_DIR: &str = "/var/run/asya";

/// Socket file name inside the socket directory.
pub const SOCKET_FILE: &str = "asya.sock";

/// Readiness marker file name, written next to the socket once the handler
/// is loaded and the socket is listening.
pub const READY_FILE: &str = "ready";

/// Default processing deadline when none is configured.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Default graceful-shutdown budget.
pub const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;

/// Path of the readiness marker for a given socket path.
pub fn readiness_marker(socket_path: &Path) -> PathBuf {
    socket_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(READY_FILE)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures while reading configuration from the environment.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A required variable was not set.
    #[error("missing required environment variable {name}")]
    Missing {
        /// The variable name.
        name: &'static str,
    },

    /// A variable was set to something unparseable.
    #[error("invalid value for {name}: {reason}")]
    Invalid {
        /// The variable name.
        name: &'static str,
        /// What was wrong with it.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// HandlerMode
// ---------------------------------------------------------------------------

/// What the handler receives and what it is responsible for returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandlerMode {
    /// Handler sees only `envelope.payload`; the supervisor advances the
    /// route and preserves headers.
    #[default]
    Payload,
    /// Handler sees the whole envelope and must produce complete result
    /// envelopes with the cursor already advanced.
    Envelope,
}

impl std::str::FromStr for HandlerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "payload" => Ok(Self::Payload),
            "envelope" => Ok(Self::Envelope),
            other => Err(format!("unknown handler mode '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// RuntimeConfig
// ---------------------------------------------------------------------------

/// Configuration for the runtime supervisor process.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Handler locator string.
    pub handler: String,
    /// Payload or envelope mode.
    pub handler_mode: HandlerMode,
    /// Socket path the supervisor listens on.
    pub socket_path: PathBuf,
    /// Permission bits for the socket file.
    pub socket_chmod: u32,
    /// Soft warning threshold; the sidecar owns the hard deadline.
    pub processing_timeout: Duration,
    /// Whether to classify memory exhaustion specially.
    pub enable_oom_detection: bool,
    /// Whether to run the GPU cache purge hook on CUDA OOM.
    pub cuda_cleanup_on_oom: bool,
}

impl RuntimeConfig {
    /// Read the supervisor configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Read the configuration through an arbitrary lookup function.
    pub fn from_lookup<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let handler = get(env::HANDLER).ok_or(ConfigError::Missing {
            name: env::HANDLER,
        })?;
        Ok(Self {
            handler,
            handler_mode: parse_mode(&get)?,
            socket_path: socket_path(&get),
            socket_chmod: parse_octal(&get, env::SOCKET_CHMOD, 0o660)?,
            processing_timeout: parse_secs(&get, env::RUNTIME_TIMEOUT, DEFAULT_TIMEOUT_SECS)?,
            enable_oom_detection: parse_bool(&get, env::ENABLE_OOM_DETECTION, true)?,
            cuda_cleanup_on_oom: parse_bool(&get, env::CUDA_CLEANUP_ON_OOM, false)?,
        })
    }
}

// ---------------------------------------------------------------------------
// SidecarConfig
// ---------------------------------------------------------------------------

/// Configuration for the sidecar router process.
#[derive(Debug, Clone)]
pub struct SidecarConfig {
    /// Name of the actor this sidecar serves.
    pub actor_name: String,
    /// Queue-name override. When `None`, derived from the actor name.
    pub queue_name: Option<String>,
    /// Transport plug-in selector.
    pub transport: String,
    /// Runtime socket path the sidecar connects to.
    pub socket_path: PathBuf,
    /// Hard processing deadline per envelope.
    pub processing_timeout: Duration,
    /// Budget for the in-flight envelope on SIGTERM.
    pub graceful_shutdown: Duration,
    /// Terminal-sink mode: consume and ack, never publish.
    pub is_terminal: bool,
    /// Transport in-flight window.
    pub prefetch: u16,
    /// Progress-tracker base URL, when reporting is enabled.
    pub gateway_url: Option<String>,
    /// AMQP broker URL.
    pub amqp_url: Option<String>,
    /// SQS queue base URL.
    pub sqs_base_url: Option<String>,
}

impl SidecarConfig {
    /// Read the sidecar configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Read the configuration through an arbitrary lookup function.
    pub fn from_lookup<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let actor_name = get(env::ACTOR_NAME).ok_or(ConfigError::Missing {
            name: env::ACTOR_NAME,
        })?;
        Ok(Self {
            actor_name,
            queue_name: get(env::QUEUE_NAME),
            transport: get(env::TRANSPORT).unwrap_or_else(|| "amqp".to_string()),
            socket_path: socket_path(&get),
            processing_timeout: parse_secs(&get, env::RUNTIME_TIMEOUT, DEFAULT_TIMEOUT_SECS)?,
            graceful_shutdown: parse_secs(
                &get,
                env::GRACEFUL_SHUTDOWN,
                DEFAULT_GRACEFUL_SHUTDOWN_SECS,
            )?,
            is_terminal: parse_bool(&get, env::IS_TERMINAL, false)?,
            prefetch: parse_u16(&get, env::PREFETCH, 1)?,
            gateway_url: get(env::GATEWAY_URL),
            amqp_url: get(env::AMQP_URL),
            sqs_base_url: get(env::SQS_BASE_URL),
        })
    }
}

// ---------------------------------------------------------------------------
// Parsers
// ---------------------------------------------------------------------------

fn socket_path<F>(get: &F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = get(env::SOCKET_PATH) {
        return PathBuf::from(path);
    }
    let dir = get(env::SOCKET_DIR).unwrap_or_else(|| DEFAULT_SOCKET_DIR.to_string());
    Path::new(&dir).join(SOCKET_FILE)
}

fn parse_mode<F>(get: &F) -> Result<HandlerMode, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match get(env::HANDLER_MODE) {
        None => Ok(HandlerMode::default()),
        Some(raw) => raw.parse().map_err(|reason| ConfigError::Invalid {
            name: env::HANDLER_MODE,
            reason,
        }),
    }
}

fn parse_secs<F>(get: &F, name: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match get(name) {
        None => Ok(Duration::from_secs(default)),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| ConfigError::Invalid {
                name,
                reason: e.to_string(),
            }),
    }
}

fn parse_u16<F>(get: &F, name: &'static str, default: u16) -> Result<u16, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match get(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<u16>().map_err(|e| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
    }
}

fn parse_bool<F>(get: &F, name: &'static str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match get(name).as_deref() {
        None => Ok(default),
        Some("1") | Some("true") | Some("yes") | Some("on") => Ok(true),
        Some("0") | Some("false") | Some("no") | Some("off") => Ok(false),
        Some(other) => Err(ConfigError::Invalid {
            name,
            reason: format!("expected boolean, got '{other}'"),
        }),
    }
}

fn parse_octal<F>(get: &F, name: &'static str, default: u32) -> Result<u32, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match get(name) {
        None => Ok(default),
        Some(raw) => u32::from_str_radix(raw.trim().trim_start_matches("0o"), 8).map_err(|e| {
            ConfigError::Invalid {
                name,
                reason: e.to_string(),
            }
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k: &str| map.get(k).cloned()
    }

    // --- runtime ---

    #[test]
    fn runtime_requires_handler() {
        let err = RuntimeConfig::from_lookup(lookup(&[])).unwrap_err();
        assert_eq!(err, ConfigError::Missing { name: env::HANDLER });
    }

    #[test]
    fn runtime_defaults() {
        let cfg =
            RuntimeConfig::from_lookup(lookup(&[("ASYA_HANDLER", "handlers.echo")])).unwrap();
        assert_eq!(cfg.handler, "handlers.echo");
        assert_eq!(cfg.handler_mode, HandlerMode::Payload);
        assert_eq!(cfg.socket_path, PathBuf::from("/var/run/asya/asya.sock"));
        assert_eq!(cfg.socket_chmod, 0o660);
        assert_eq!(cfg.processing_timeout, Duration::from_secs(300));
        assert!(cfg.enable_oom_detection);
        assert!(!cfg.cuda_cleanup_on_oom);
    }

    #[test]
    fn runtime_explicit_values() {
        let cfg = RuntimeConfig::from_lookup(lookup(&[
            ("ASYA_HANDLER", "models.Classifier.predict"),
            ("ASYA_HANDLER_MODE", "envelope"),
            ("ASYA_SOCKET_PATH", "/tmp/sock/custom.sock"),
            ("ASYA_SOCKET_CHMOD", "0666"),
            ("ASYA_RUNTIME_TIMEOUT", "15"),
            ("ASYA_ENABLE_OOM_DETECTION", "false"),
            ("ASYA_CUDA_CLEANUP_ON_OOM", "true"),
        ]))
        .unwrap();
        assert_eq!(cfg.handler_mode, HandlerMode::Envelope);
        assert_eq!(cfg.socket_path, PathBuf::from("/tmp/sock/custom.sock"));
        assert_eq!(cfg.socket_chmod, 0o666);
        assert_eq!(cfg.processing_timeout, Duration::from_secs(15));
        assert!(!cfg.enable_oom_detection);
        assert!(cfg.cuda_cleanup_on_oom);
    }

    #[test]
    fn socket_dir_fallback() {
        let cfg = RuntimeConfig::from_lookup(lookup(&[
            ("ASYA_HANDLER", "h.f"),
            ("ASYA_SOCKET_DIR", "/mnt/sockets"),
        ]))
        .unwrap();
        assert_eq!(cfg.socket_path, PathBuf::from("/mnt/sockets/asya.sock"));
    }

    #[test]
    fn invalid_mode_rejected() {
        let err = RuntimeConfig::from_lookup(lookup(&[
            ("ASYA_HANDLER", "h.f"),
            ("ASYA_HANDLER_MODE", "streaming"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name, .. } if name == env::HANDLER_MODE));
    }

    // --- sidecar ---

    #[test]
    fn sidecar_requires_actor_name() {
        let err = SidecarConfig::from_lookup(lookup(&[])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Missing {
                name: env::ACTOR_NAME
            }
        );
    }

    #[test]
    fn sidecar_defaults() {
        let cfg = SidecarConfig::from_lookup(lookup(&[("ASYA_ACTOR_NAME", "echo")])).unwrap();
        assert_eq!(cfg.actor_name, "echo");
        assert_eq!(cfg.queue_name, None);
        assert_eq!(cfg.transport, "amqp");
        assert_eq!(cfg.prefetch, 1);
        assert!(!cfg.is_terminal);
        assert_eq!(cfg.graceful_shutdown, Duration::from_secs(30));
    }

    #[test]
    fn sidecar_terminal_flag() {
        let cfg = SidecarConfig::from_lookup(lookup(&[
            ("ASYA_ACTOR_NAME", "success-sink"),
            ("ASYA_IS_TERMINAL", "true"),
        ]))
        .unwrap();
        assert!(cfg.is_terminal);
    }

    #[test]
    fn bad_bool_rejected() {
        let err = SidecarConfig::from_lookup(lookup(&[
            ("ASYA_ACTOR_NAME", "a"),
            ("ASYA_IS_TERMINAL", "maybe"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    // --- marker path ---

    #[test]
    fn marker_is_sibling_of_socket() {
        assert_eq!(
            readiness_marker(Path::new("/var/run/asya/asya.sock")),
            PathBuf::from("/var/run/asya/ready")
        );
    }
}
