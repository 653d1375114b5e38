//! Switchyard shared data model
//!
//! This crate carries the types every part of the engine agrees on:
//! - Exchange/Message/Body: the unit of work flowing through a route
//! - UnitOfWork: completion callbacks and cancellation for a root exchange
//! - MediationError/ErrorKind: the runtime failure taxonomy policies match on
//! - EngineConfig: engine-wide defaults with TOML loading

pub mod config;
pub mod error;
pub mod exchange;
pub mod uow;

pub use config::{ConfigError, EngineConfig, FanOutConfig, RedeliveryConfig};
pub use error::{ErrorKind, MediationError};
pub use exchange::{Body, BodyStream, Exchange, Headers, Message};
pub use uow::{Synchronization, SynchronizationFn, UnitOfWork};

pub use exchange::{
    HEADER_FANOUT_INDEX, HEADER_REDELIVERED, HEADER_REDELIVERY_COUNTER, HEADER_SPLIT_INDEX,
    HEADER_SPLIT_SIZE, PROPERTY_CAUGHT_EXCEPTION, PROPERTY_CORRELATION_ID,
    PROPERTY_FAILURE_ROUTE_ID,
};
