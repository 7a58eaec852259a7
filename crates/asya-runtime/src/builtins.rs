// SPDX-License-Identifier: MIT OR Apache-2.0
//! Built-in handlers.
//!
//! Images ship their own handlers by building a registry, registering under
//! the locator names their actors are configured with, and calling
//! [`Supervisor::serve`](crate::Supervisor::serve). These built-ins cover
//! the sink actors and smoke testing.

use serde_json::Value;

use crate::handler::{FnHandler, HandlerRegistry, HandlerResult};

/// Registry pre-populated with the built-in handlers.
pub fn registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    // Returns the payload unchanged; useful for wiring smoke tests.
    registry.register(
        "builtin.echo",
        FnHandler(|payload: Value| Ok(HandlerResult::One(payload))),
    );
    // Consumes the payload; the default handler for sink actors.
    registry.register("builtin.consume", FnHandler(|_| Ok(HandlerResult::None)));
    registry
}
