//! Mediation context - route registry and exchange entry points
//!
//! Owns the endpoint registry, the compiled routes and the engine
//! configuration. Routes are published as immutable compiled snapshots
//! behind an `RwLock<Arc<CompiledRoute>>`: every exchange grabs the Arc once
//! on entry, so an advice swap mid-flight never changes the steps an
//! in-flight exchange sees.

use crate::advice::AdviceWith;
use crate::endpoint::{Endpoint, EndpointRegistry};
use crate::error::EngineError;
use crate::pipeline::ChannelInterceptor;
use crate::policy::ExceptionPolicy;
use crate::route::{compile_route, CompileContext, CompiledRoute, RouteDefinition};
use dashmap::DashMap;
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sy_common::{Body, EngineConfig, Exchange, MediationError, PROPERTY_FAILURE_ROUTE_ID};
use tracing::{debug, info, warn};

/// Per-route state: the live compiled snapshot plus advice bookkeeping.
pub struct RouteEntry {
    definition: RwLock<RouteDefinition>,
    /// Pre-advice definition, kept for rollback. Set on the first advice.
    original: Mutex<Option<RouteDefinition>>,
    live: RwLock<Arc<CompiledRoute>>,
    version: AtomicU64,
    exchanges_total: AtomicU64,
    failures_total: AtomicU64,
}

impl RouteEntry {
    fn snapshot(&self) -> Arc<CompiledRoute> {
        self.live.read().clone()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn exchanges_total(&self) -> u64 {
        self.exchanges_total.load(Ordering::SeqCst)
    }

    pub fn failures_total(&self) -> u64 {
        self.failures_total.load(Ordering::SeqCst)
    }
}

pub struct MediationContext {
    endpoints: Arc<EndpointRegistry>,
    routes: DashMap<String, Arc<RouteEntry>>,
    interceptors: RwLock<Vec<Arc<dyn ChannelInterceptor>>>,
    global_policies: RwLock<Vec<ExceptionPolicy>>,
    config: EngineConfig,
    running: AtomicBool,
}

impl MediationContext {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            endpoints: Arc::new(EndpointRegistry::new()),
            routes: DashMap::new(),
            interceptors: RwLock::new(Vec::new()),
            global_policies: RwLock::new(Vec::new()),
            config,
            running: AtomicBool::new(true),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn add_endpoint(&self, endpoint: Arc<dyn Endpoint>) {
        self.endpoints
            .insert(endpoint.uri().to_string(), endpoint);
    }

    pub fn endpoint(&self, uri: &str) -> Option<Arc<dyn Endpoint>> {
        self.endpoints.get(uri).map(|entry| entry.value().clone())
    }

    /// Interceptors apply to routes compiled after registration.
    pub fn add_interceptor(&self, interceptor: Arc<dyn ChannelInterceptor>) {
        self.interceptors.write().push(interceptor);
    }

    /// Context-wide exception policy, consulted after route-scoped ones.
    /// Applies to routes compiled after registration.
    pub fn add_global_policy(&self, policy: ExceptionPolicy) {
        self.global_policies.write().push(policy);
    }

    pub fn add_route(&self, definition: RouteDefinition) -> Result<(), EngineError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(EngineError::ShutdownInProgress);
        }
        if self.routes.contains_key(definition.id()) {
            return Err(EngineError::DuplicateRoute(definition.id().to_string()));
        }

        let compiled = self.compile(&definition, 1)?;
        let route_id = definition.id().to_string();
        let steps = definition.steps().len();
        self.routes.insert(
            route_id.clone(),
            Arc::new(RouteEntry {
                definition: RwLock::new(definition),
                original: Mutex::new(None),
                live: RwLock::new(Arc::new(compiled)),
                version: AtomicU64::new(1),
                exchanges_total: AtomicU64::new(0),
                failures_total: AtomicU64::new(0),
            }),
        );
        info!(route_id = %route_id, steps, "Route added");
        Ok(())
    }

    pub fn route_ids(&self) -> Vec<String> {
        self.routes.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Snapshot of a route's current (possibly advised) definition.
    pub fn route_definition(&self, route_id: &str) -> Result<RouteDefinition, EngineError> {
        let entry = self.route_entry(route_id)?;
        let definition = entry.definition.read().clone();
        Ok(definition)
    }

    pub fn route_entry(&self, route_id: &str) -> Result<Arc<RouteEntry>, EngineError> {
        self.routes
            .get(route_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::RouteNotFound(route_id.to_string()))
    }

    /// Apply an advice batch to a route. The edited definition is validated
    /// and compiled before the live snapshot swaps, so a bad batch leaves the
    /// route untouched and exchanges only ever see the whole batch or none of
    /// it.
    pub fn advise(&self, route_id: &str, advice: &AdviceWith) -> Result<(), EngineError> {
        let entry = self.route_entry(route_id)?;
        let current = entry.definition.read().clone();
        let edited = advice.apply(&current)?;

        let version = entry.version.fetch_add(1, Ordering::SeqCst) + 1;
        let compiled = self.compile(&edited, version)?;

        entry.original.lock().get_or_insert(current);
        *entry.definition.write() = edited;
        *entry.live.write() = Arc::new(compiled);
        info!(route_id = %route_id, version, "Route advice applied");
        Ok(())
    }

    /// Restore the pre-advice definition and republish it.
    pub fn rollback_advice(&self, route_id: &str) -> Result<(), EngineError> {
        let entry = self.route_entry(route_id)?;
        let original = entry
            .original
            .lock()
            .take()
            .ok_or_else(|| EngineError::NothingToRollback(route_id.to_string()))?;

        let version = entry.version.fetch_add(1, Ordering::SeqCst) + 1;
        let compiled = self.compile(&original, version)?;
        *entry.definition.write() = original;
        *entry.live.write() = Arc::new(compiled);
        info!(route_id = %route_id, version, "Route advice rolled back");
        Ok(())
    }

    /// Push an exchange through a route and hand back its terminal state.
    /// The returned exchange may carry a failure; inspect `is_failed`.
    pub async fn send(
        &self,
        route_id: &str,
        mut exchange: Exchange,
    ) -> Result<Exchange, EngineError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(EngineError::ShutdownInProgress);
        }
        let entry = self.route_entry(route_id)?;
        // One snapshot per exchange: advice swaps don't affect us mid-run.
        let compiled = entry.snapshot();

        exchange.set_route_id(route_id);
        entry.exchanges_total.fetch_add(1, Ordering::SeqCst);
        counter!("sy_exchanges_total", "route" => route_id.to_string()).increment(1);
        debug!(
            route_id = %route_id,
            exchange_id = %exchange.id(),
            version = compiled.version(),
            "Exchange entering route"
        );

        let ready = if compiled.stream_caching() {
            match exchange.cache_stream() {
                Ok(()) => true,
                Err(error) => {
                    exchange.set_exception(error);
                    false
                }
            }
        } else {
            true
        };

        if ready {
            compiled.pipeline().run(&mut exchange).await;
        }

        if exchange.is_failed() {
            exchange.set_property(PROPERTY_FAILURE_ROUTE_ID, route_id);
            entry.failures_total.fetch_add(1, Ordering::SeqCst);
            counter!("sy_exchange_failures_total", "route" => route_id.to_string()).increment(1);
            warn!(
                route_id = %route_id,
                exchange_id = %exchange.id(),
                error = %exchange.exception().map(|e| e.to_string()).unwrap_or_default(),
                "Exchange failed"
            );
        }

        exchange.unit_of_work().done(&exchange);
        Ok(exchange)
    }

    /// Like [`send`](Self::send), but a failed exchange becomes an error.
    pub async fn request(
        &self,
        route_id: &str,
        exchange: Exchange,
    ) -> Result<Exchange, EngineError> {
        let exchange = self.send(route_id, exchange).await?;
        match exchange.exception() {
            Some(failure) => Err(EngineError::DeliveryFailed {
                exchange_id: exchange.id(),
                source: failure.clone(),
            }),
            None => Ok(exchange),
        }
    }

    pub async fn send_body(&self, route_id: &str, body: Body) -> Result<Exchange, EngineError> {
        self.send(route_id, Exchange::new(body)).await
    }

    /// Send with a deadline. On timeout the exchange's unit of work is
    /// cancelled, the in-flight run is awaited to settlement, and the result
    /// comes back failed with a timeout error.
    pub async fn send_with_timeout(
        self: &Arc<Self>,
        route_id: &str,
        exchange: Exchange,
        timeout: Duration,
    ) -> Result<Exchange, EngineError> {
        let exchange_id = exchange.id();
        let uow = exchange.unit_of_work().clone();
        let context = self.clone();
        let route = route_id.to_string();
        let mut task = tokio::spawn(async move { context.send(&route, exchange).await });

        tokio::select! {
            joined = &mut task => Self::unwrap_task(exchange_id, joined),
            _ = tokio::time::sleep(timeout) => {
                warn!(route_id, exchange_id = %exchange_id, "Send deadline passed, cancelling");
                uow.cancel();
                let mut result = Self::unwrap_task(exchange_id, task.await);
                if let Ok(settled) = &mut result {
                    if settled
                        .exception()
                        .is_some_and(|e| e.kind() == sy_common::ErrorKind::Cancelled)
                    {
                        settled.set_exception(MediationError::timeout(format!(
                            "exchange exceeded the {}ms send deadline",
                            timeout.as_millis()
                        )));
                    }
                }
                result
            }
        }
    }

    fn unwrap_task(
        exchange_id: uuid::Uuid,
        joined: Result<Result<Exchange, EngineError>, tokio::task::JoinError>,
    ) -> Result<Exchange, EngineError> {
        match joined {
            Ok(result) => result,
            Err(join_error) => Err(EngineError::DeliveryFailed {
                exchange_id,
                source: MediationError::processing(format!(
                    "send task failed: {}",
                    join_error
                )),
            }),
        }
    }

    /// Reject new exchanges and new routes. In-flight exchanges finish.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!(routes = self.routes.len(), "Mediation context stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn compile(
        &self,
        definition: &RouteDefinition,
        version: u64,
    ) -> Result<CompiledRoute, EngineError> {
        let interceptors = self.interceptors.read().clone();
        let global_policies = self.global_policies.read().clone();
        let ctx = CompileContext {
            endpoints: &self.endpoints,
            interceptors: &interceptors,
            config: &self.config,
            global_policies: &global_policies,
            version,
        };
        compile_route(definition, &ctx)
    }
}

impl Default for MediationContext {
    fn default() -> Self {
        Self::new()
    }
}
