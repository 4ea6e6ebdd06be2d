//! Activity scopes: parent/child correlation and duration measurement.
//!
//! `begin` makes the new activity the ambient operation, with the previous
//! operation id as its parent, and hands back a [`ScopeToken`] holding what it
//! replaced. `end` consumes the token, restores the prior operation and
//! returns the elapsed monotonic time. Callers pair begin/end in stack order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::clock::Clock;
use crate::model::TelemetryOperation;

/// Returned by `begin`, consumed by `end`. Not `Clone`: a scope ends once.
#[derive(Debug)]
#[must_use = "an activity scope must be ended with `end`"]
pub struct ScopeToken {
    activity_id: String,
    prior: TelemetryOperation,
    start_time: DateTime<Utc>,
    start: Instant,
}

impl ScopeToken {
    pub fn activity_id(&self) -> &str {
        &self.activity_id
    }

    /// Wall-clock start, for display on the resulting item.
    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// Monotonic start, the basis for the duration.
    pub fn start_timestamp(&self) -> Instant {
        self.start
    }

    pub fn prior_operation(&self) -> &TelemetryOperation {
        &self.prior
    }
}

/// 32 lowercase hex digits, no dashes.
pub fn new_activity_id() -> String {
    Uuid::new_v4().simple().to_string()
}

pub struct ActivityScopeTracker {
    ambient: RwLock<TelemetryOperation>,
    clock: Arc<dyn Clock>,
}

impl ActivityScopeTracker {
    pub fn new(initial: TelemetryOperation, clock: Arc<dyn Clock>) -> Self {
        Self {
            ambient: RwLock::new(initial),
            clock,
        }
    }

    /// Snapshot of the ambient operation.
    pub fn operation(&self) -> TelemetryOperation {
        self.ambient.read().clone()
    }

    pub fn set_operation(&self, operation: TelemetryOperation) {
        *self.ambient.write() = operation;
    }

    pub fn begin(&self, activity_id: impl Into<String>) -> ScopeToken {
        let start_time = self.clock.wall();
        let start = self.clock.monotonic();
        let activity_id = activity_id.into();

        let mut ambient = self.ambient.write();
        let next = TelemetryOperation {
            id: activity_id.clone(),
            name: ambient.name.clone(),
            parent_id: ambient.id.clone(),
        };
        let prior = std::mem::replace(&mut *ambient, next);

        tracing::trace!(activity_id = %activity_id, parent_id = %prior.id, "activity scope begin");
        ScopeToken {
            activity_id,
            prior,
            start_time,
            start,
        }
    }

    /// End a scope and return its duration.
    ///
    /// The prior operation is restored only while the ambient operation is
    /// still the one this token opened, so an out-of-order end cannot clobber
    /// a sibling scope that is still open.
    pub fn end(&self, token: ScopeToken) -> Duration {
        let duration = self
            .clock
            .monotonic()
            .saturating_duration_since(token.start);

        let mut ambient = self.ambient.write();
        if ambient.id == token.activity_id {
            *ambient = token.prior;
        } else {
            tracing::warn!(
                activity_id = %token.activity_id,
                ambient_id = %ambient.id,
                "activity scope ended out of order; ambient operation left unchanged"
            );
        }
        duration
    }
}

impl std::fmt::Debug for ActivityScopeTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityScopeTracker")
            .field("ambient", &*self.ambient.read())
            .finish_non_exhaustive()
    }
}
