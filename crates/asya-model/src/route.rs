// SPDX-License-Identifier: MIT OR Apache-2.0
//! Route state: an ordered list of actor names plus a cursor.

use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::is_reserved_actor;

// ---------------------------------------------------------------------------
// Route
// ---------------------------------------------------------------------------

/// Routing state for one envelope: the linear pipeline of actor names and
/// the cursor of the actor currently addressed.
///
/// The cursor is monotonic: it only ever advances. The processed prefix
/// `actors[0..current]` is write-locked; handlers running in envelope mode
/// may extend or replace the future suffix but never touch the prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Ordered, non-empty pipeline of actor names.
    pub actors: Vec<String>,
    /// Index of the actor the envelope is currently destined for, or equal
    /// to `actors.len()` once the pipeline is exhausted.
    pub current: usize,
}

/// Where the next hop of an envelope resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination<'a> {
    /// The queue of a named actor in the route.
    Actor(&'a str),
    /// The route is exhausted; the envelope terminates at the success sink.
    SuccessSink,
}

impl Route {
    /// Build a route over `actors`, starting at the first.
    pub fn new<I, S>(actors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            actors: actors.into_iter().map(Into::into).collect(),
            current: 0,
        }
    }

    /// Structural validation: non-empty actor list, no reserved sink names,
    /// cursor within `[0, len]`.
    ///
    /// The exhausted form (`current == len`) is accepted here because it is
    /// the legal shape of an envelope on the success-sink queue.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.actors.is_empty() {
            return Err(ModelError::EmptyRoute);
        }
        if let Some(name) = self.actors.iter().find(|a| is_reserved_actor(a)) {
            return Err(ModelError::ReservedActor { name: name.clone() });
        }
        if self.current > self.actors.len() {
            return Err(ModelError::CursorOutOfBounds {
                current: self.current,
                len: self.actors.len(),
            });
        }
        Ok(())
    }

    /// Validation for envelopes arriving on an actor queue: structural
    /// validity plus a dispatchable cursor (`current < len`).
    pub fn validate_active(&self) -> Result<(), ModelError> {
        self.validate()?;
        if self.current >= self.actors.len() {
            return Err(ModelError::RouteExhausted {
                current: self.current,
                len: self.actors.len(),
            });
        }
        Ok(())
    }

    /// Name of the actor the cursor points at, or `None` once exhausted.
    pub fn current_actor(&self) -> Option<&str> {
        self.actors.get(self.current).map(String::as_str)
    }

    /// `true` once the cursor has moved past the last actor.
    pub fn is_exhausted(&self) -> bool {
        self.current >= self.actors.len()
    }

    /// Advance the cursor one hop. Saturates at `actors.len()`; the cursor
    /// never runs past the exhausted position.
    pub fn advance(&mut self) {
        if self.current < self.actors.len() {
            self.current += 1;
        }
    }

    /// Copy of this route with the cursor advanced one hop.
    pub fn advanced(&self) -> Self {
        let mut next = self.clone();
        next.advance();
        next
    }

    /// Resolve where an envelope carrying this route should be delivered.
    pub fn destination(&self) -> Destination<'_> {
        match self.current_actor() {
            Some(actor) => Destination::Actor(actor),
            None => Destination::SuccessSink,
        }
    }

    /// Verify that `returned` preserves this route's processed prefix
    /// `actors[0..current]` and has not rewound the cursor.
    ///
    /// Called on every envelope coming back from an envelope-mode handler:
    /// the handler owns the future suffix but the history is write-locked.
    pub fn prefix_preserved(&self, returned: &Route) -> Result<(), ModelError> {
        if returned.current < self.current {
            return Err(ModelError::CursorOutOfBounds {
                current: returned.current,
                len: returned.actors.len(),
            });
        }
        if returned.actors.len() < self.current {
            return Err(ModelError::PrefixAltered {
                position: returned.actors.len(),
            });
        }
        for (i, original) in self.actors[..self.current].iter().enumerate() {
            if returned.actors[i] != *original {
                return Err(ModelError::PrefixAltered { position: i });
            }
        }
        Ok(())
    }
}
