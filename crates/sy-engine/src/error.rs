//! Structural engine errors
//!
//! These fail fast at route-build/advice time or surface to a caller of the
//! request API. They never travel on an exchange; in-flight failures are
//! `sy_common::MediationError`.

use sy_common::MediationError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("route '{0}' not found")]
    RouteNotFound(String),

    #[error("route '{0}' already exists")]
    DuplicateRoute(String),

    #[error("route '{0}' has no steps")]
    EmptyRoute(String),

    #[error("route '{route_id}' has no step matching {selector}")]
    StepNotFound { route_id: String, selector: String },

    #[error("no endpoint registered for uri '{0}'")]
    EndpointNotFound(String),

    #[error("route '{0}' has no advice to roll back")]
    NothingToRollback(String),

    #[error("engine is shutting down")]
    ShutdownInProgress,

    #[error("exchange {exchange_id} failed: {source}")]
    DeliveryFailed {
        exchange_id: Uuid,
        #[source]
        source: MediationError,
    },
}
