//! Endpoint contract and built-in test/diagnostic endpoints
//!
//! The core only depends on the producer role: something a route step can
//! send an exchange to. Wire protocols live behind this trait in external
//! components. MockEndpoint is the recording double the test suites use;
//! LogEndpoint traces exchanges for diagnostics.

use crate::processor::Processor;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use sy_common::{Exchange, MediationError};
use tracing::info;

#[async_trait]
pub trait Endpoint: Send + Sync {
    fn uri(&self) -> &str;

    async fn send(&self, exchange: &mut Exchange) -> Result<(), MediationError>;
}

/// Registry of endpoints keyed by URI. Shared between the context and any
/// processor that resolves recipients at runtime.
pub type EndpointRegistry = DashMap<String, Arc<dyn Endpoint>>;

/// Records a copy of every exchange sent to it.
pub struct MockEndpoint {
    uri: String,
    received: Mutex<Vec<Exchange>>,
}

impl MockEndpoint {
    pub fn new(uri: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            uri: uri.into(),
            received: Mutex::new(Vec::new()),
        })
    }

    pub fn received_count(&self) -> usize {
        self.received.lock().len()
    }

    /// Copies of the exchanges received, in arrival order.
    pub fn received(&self) -> Vec<Exchange> {
        self.received.lock().clone()
    }

    /// Text bodies of received exchanges, in arrival order.
    pub fn received_bodies(&self) -> Vec<String> {
        self.received
            .lock()
            .iter()
            .map(|ex| ex.body().as_text().unwrap_or_default().to_string())
            .collect()
    }

    pub fn reset(&self) {
        self.received.lock().clear();
    }
}

#[async_trait]
impl Endpoint for MockEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn send(&self, exchange: &mut Exchange) -> Result<(), MediationError> {
        self.received.lock().push(exchange.clone());
        Ok(())
    }
}

/// Logs each exchange at info level and passes it through unchanged.
pub struct LogEndpoint {
    uri: String,
}

impl LogEndpoint {
    pub fn new(uri: impl Into<String>) -> Arc<Self> {
        Arc::new(Self { uri: uri.into() })
    }
}

#[async_trait]
impl Endpoint for LogEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn send(&self, exchange: &mut Exchange) -> Result<(), MediationError> {
        info!(
            endpoint = %self.uri,
            exchange_id = %exchange.id(),
            body = ?exchange.body(),
            "Exchange received"
        );
        Ok(())
    }
}

/// Processor that delivers the exchange to one endpoint.
pub struct SendProcessor {
    endpoint: Arc<dyn Endpoint>,
}

impl SendProcessor {
    pub fn new(endpoint: Arc<dyn Endpoint>) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl Processor for SendProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), MediationError> {
        self.endpoint.send(exchange).await
    }
}
