//! Channel and pipeline execution
//!
//! A compiled route is a flat pipeline of channels. Each channel wraps one
//! processor with the cross-cutting machinery: interceptor hooks around the
//! stage, and the error handler when the channel sits at a handled level.
//! The pipeline runs channels in order, stops on the first failed stage, and
//! honours cancellation between stages.

use crate::error_handler::ErrorHandler;
use crate::processor::SharedProcessor;
use metrics::{counter, histogram};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sy_common::{Exchange, MediationError};
use tracing::debug;

/// Whether routing proceeds to the next channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Identity of one compiled step, for interceptors and advice diagnostics.
#[derive(Debug, Clone)]
pub struct StepInfo {
    pub route_id: String,
    pub step_id: Option<String>,
    pub repr: String,
}

impl fmt::Display for StepInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.step_id {
            Some(id) => write!(f, "{}[{}]", self.repr, id),
            None => write!(f, "{}", self.repr),
        }
    }
}

/// Observes every channel the exchange passes through.
pub trait ChannelInterceptor: Send + Sync {
    fn before(&self, step: &StepInfo, exchange: &Exchange);
    fn after(&self, step: &StepInfo, exchange: &Exchange, elapsed: Duration);
}

/// Logs stage entry/exit at debug level.
pub struct TracingInterceptor;

impl ChannelInterceptor for TracingInterceptor {
    fn before(&self, step: &StepInfo, exchange: &Exchange) {
        debug!(
            route_id = %step.route_id,
            step = %step,
            exchange_id = %exchange.id(),
            "Entering step"
        );
    }

    fn after(&self, step: &StepInfo, exchange: &Exchange, elapsed: Duration) {
        debug!(
            route_id = %step.route_id,
            step = %step,
            exchange_id = %exchange.id(),
            elapsed_ms = elapsed.as_millis() as u64,
            failed = exchange.is_failed(),
            "Leaving step"
        );
    }
}

/// Emits per-step counters and timing histograms.
pub struct MetricsInterceptor;

impl ChannelInterceptor for MetricsInterceptor {
    fn before(&self, _step: &StepInfo, _exchange: &Exchange) {}

    fn after(&self, step: &StepInfo, exchange: &Exchange, elapsed: Duration) {
        counter!("sy_steps_total", "route" => step.route_id.clone()).increment(1);
        if exchange.is_failed() {
            counter!("sy_step_failures_total", "route" => step.route_id.clone()).increment(1);
        }
        histogram!("sy_step_duration_seconds", "route" => step.route_id.clone())
            .record(elapsed.as_secs_f64());
    }
}

/// One compiled stage: processor plus interceptors, optionally guarded by the
/// error handler.
pub struct Channel {
    step: StepInfo,
    processor: SharedProcessor,
    error_handler: Option<Arc<ErrorHandler>>,
    interceptors: Vec<Arc<dyn ChannelInterceptor>>,
}

impl Channel {
    pub fn new(
        step: StepInfo,
        processor: SharedProcessor,
        error_handler: Option<Arc<ErrorHandler>>,
        interceptors: Vec<Arc<dyn ChannelInterceptor>>,
    ) -> Self {
        Self {
            step,
            processor,
            error_handler,
            interceptors,
        }
    }

    pub fn step(&self) -> &StepInfo {
        &self.step
    }

    pub async fn run(&self, exchange: &mut Exchange) -> Flow {
        for interceptor in &self.interceptors {
            interceptor.before(&self.step, exchange);
        }
        let started = Instant::now();

        let flow = match &self.error_handler {
            Some(handler) => handler.run(&self.processor, exchange).await,
            None => match self.processor.process(exchange).await {
                Ok(()) => Flow::Continue,
                Err(error) => {
                    exchange.set_exception(error);
                    Flow::Stop
                }
            },
        };

        let elapsed = started.elapsed();
        for interceptor in &self.interceptors {
            interceptor.after(&self.step, exchange, elapsed);
        }
        flow
    }
}

/// Ordered chain of channels.
pub struct Pipeline {
    channels: Vec<Channel>,
}

impl Pipeline {
    pub fn new(channels: Vec<Channel>) -> Self {
        Self { channels }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub async fn run(&self, exchange: &mut Exchange) -> Flow {
        for channel in &self.channels {
            if exchange.unit_of_work().is_cancelled() {
                exchange.set_exception(MediationError::cancelled("exchange cancelled"));
                return Flow::Stop;
            }
            if channel.run(exchange).await == Flow::Stop {
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    /// Run as a nested processor inside a composite step. A stop with a
    /// pending failure surfaces as an error so the enclosing level's error
    /// handling sees it; a clean stop completes normally.
    pub async fn run_as_processor(&self, exchange: &mut Exchange) -> Result<(), MediationError> {
        match self.run(exchange).await {
            Flow::Continue => Ok(()),
            Flow::Stop => match exchange.clear_exception() {
                Some(error) => Err(error),
                None => Ok(()),
            },
        }
    }
}
