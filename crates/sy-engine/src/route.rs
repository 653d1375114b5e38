//! Route definitions and the route compiler
//!
//! A `RouteDefinition` is the declarative shape of a route: an ordered list
//! of steps plus its error-handling configuration. Compilation resolves every
//! static endpoint up front, wraps top-level steps in error-handled channels
//! and produces an immutable `CompiledRoute` the context swaps in atomically.
//!
//! Nesting rules:
//! - filter/choice/do-try bodies compile into plain channels; a failure
//!   inside them surfaces to the enclosing top-level channel's handler
//! - do-try bodies additionally bypass the route handler entirely, so catch
//!   clauses see the failure before any redelivery machinery does
//! - split/multicast branch pipelines keep the route handler, giving each
//!   branch its own redelivery lifecycle

use crate::endpoint::{EndpointRegistry, SendProcessor};
use crate::error::EngineError;
use crate::error_handler::{ErrorHandler, RedeliveryPolicy};
use crate::expression::{Expression, Predicate};
use crate::fanout::{
    AggregationStrategy, FanOutSettings, MulticastProcessor, RecipientListProcessor,
    SplitterProcessor, UseLatestAggregation,
};
use crate::pipeline::{Channel, ChannelInterceptor, Pipeline, StepInfo};
use crate::policy::{ExceptionPolicy, ExceptionPolicyResolver, PolicyScope};
use crate::processor::{Processor, SetBodyProcessor, SetHeaderProcessor, SharedProcessor};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use sy_common::{
    EngineConfig, ErrorKind, Exchange, MediationError, RedeliveryConfig,
    PROPERTY_CAUGHT_EXCEPTION,
};

/// One branch of a choice step.
#[derive(Clone)]
pub struct WhenBranch {
    pub predicate: Arc<dyn Predicate>,
    pub steps: Vec<StepDefinition>,
}

/// One catch clause of a do-try step, matched in declaration order.
#[derive(Clone)]
pub struct CatchClause {
    pub kinds: Vec<ErrorKind>,
    pub predicate: Option<Arc<dyn Predicate>>,
    pub steps: Vec<StepDefinition>,
}

impl CatchClause {
    pub fn new(kinds: Vec<ErrorKind>, steps: Vec<StepDefinition>) -> Self {
        Self {
            kinds,
            predicate: None,
            steps,
        }
    }

    pub fn when(mut self, predicate: Arc<dyn Predicate>) -> Self {
        self.predicate = Some(predicate);
        self
    }
}

/// The declarative form of one route step.
#[derive(Clone)]
pub enum StepKind {
    Process {
        name: String,
        processor: SharedProcessor,
    },
    SetBody {
        expression: Arc<dyn Expression>,
    },
    SetHeader {
        name: String,
        expression: Arc<dyn Expression>,
    },
    Filter {
        predicate: Arc<dyn Predicate>,
        steps: Vec<StepDefinition>,
    },
    Choice {
        branches: Vec<WhenBranch>,
        otherwise: Option<Vec<StepDefinition>>,
    },
    Split {
        expression: Arc<dyn Expression>,
        settings: FanOutSettings,
        strategy: Arc<dyn AggregationStrategy>,
        steps: Vec<StepDefinition>,
    },
    Multicast {
        branches: Vec<Vec<StepDefinition>>,
        settings: FanOutSettings,
        strategy: Arc<dyn AggregationStrategy>,
    },
    RecipientList {
        expression: Arc<dyn Expression>,
        settings: FanOutSettings,
        strategy: Arc<dyn AggregationStrategy>,
    },
    DoTry {
        steps: Vec<StepDefinition>,
        catches: Vec<CatchClause>,
        finally: Option<Vec<StepDefinition>>,
    },
    To(String),
}

/// A step plus its optional author-assigned id, the unit advice targets.
#[derive(Clone)]
pub struct StepDefinition {
    pub(crate) id: Option<String>,
    pub(crate) kind: StepKind,
}

impl StepDefinition {
    pub fn of(kind: StepKind) -> Self {
        Self { id: None, kind }
    }

    pub fn identified(id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: Some(id.into()),
            kind,
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Stable textual form used by logs and advice matching.
    pub fn repr(&self) -> String {
        match &self.kind {
            StepKind::Process { name, .. } => format!("process({})", name),
            StepKind::SetBody { .. } => "set-body".to_string(),
            StepKind::SetHeader { name, .. } => format!("set-header({})", name),
            StepKind::Filter { .. } => "filter".to_string(),
            StepKind::Choice { .. } => "choice".to_string(),
            StepKind::Split { .. } => "split".to_string(),
            StepKind::Multicast { .. } => "multicast".to_string(),
            StepKind::RecipientList { .. } => "recipient-list".to_string(),
            StepKind::DoTry { .. } => "do-try".to_string(),
            StepKind::To(uri) => format!("to({})", uri),
        }
    }
}

impl fmt::Display for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.repr())
    }
}

impl fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StepDefinition({})", self.repr())
    }
}

/// Declarative route: steps plus error-handling configuration.
#[derive(Clone)]
pub struct RouteDefinition {
    pub(crate) id: String,
    pub(crate) source: Option<String>,
    pub(crate) steps: Vec<StepDefinition>,
    pub(crate) redelivery: Option<RedeliveryConfig>,
    pub(crate) dead_letter_uri: Option<String>,
    pub(crate) on_exception: Vec<ExceptionPolicy>,
    pub(crate) use_original_message: bool,
    pub(crate) stream_caching: Option<bool>,
}

impl RouteDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: None,
            steps: Vec::new(),
            redelivery: None,
            dead_letter_uri: None,
            on_exception: Vec::new(),
            use_original_message: false,
            stream_caching: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    /// Describes where exchanges for this route come from. Informational;
    /// consumers push exchanges in through the context.
    pub fn from(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    pub fn process(self, name: impl Into<String>, processor: SharedProcessor) -> Self {
        let name = name.into();
        self.step(StepDefinition::of(StepKind::Process { name, processor }))
    }

    pub fn to(self, uri: impl Into<String>) -> Self {
        self.step(StepDefinition::of(StepKind::To(uri.into())))
    }

    pub fn set_body(self, expression: Arc<dyn Expression>) -> Self {
        self.step(StepDefinition::of(StepKind::SetBody { expression }))
    }

    pub fn set_header(self, name: impl Into<String>, expression: Arc<dyn Expression>) -> Self {
        self.step(StepDefinition::of(StepKind::SetHeader {
            name: name.into(),
            expression,
        }))
    }

    /// Route-level redelivery overriding the engine default.
    pub fn redelivery(mut self, config: RedeliveryConfig) -> Self {
        self.redelivery = Some(config);
        self
    }

    /// Exhausted exchanges go to this endpoint instead of staying failed.
    pub fn dead_letter(mut self, uri: impl Into<String>) -> Self {
        self.dead_letter_uri = Some(uri.into());
        self
    }

    /// Route-scoped exception policy, consulted before global policies.
    pub fn on_exception(mut self, policy: ExceptionPolicy) -> Self {
        self.on_exception.push(policy);
        self
    }

    /// Hand the failure destinations the original incoming message rather
    /// than the possibly half-transformed one.
    pub fn use_original_message(mut self, enabled: bool) -> Self {
        self.use_original_message = enabled;
        self
    }

    /// Per-route stream caching override.
    pub fn stream_caching(mut self, enabled: bool) -> Self {
        self.stream_caching = Some(enabled);
        self
    }
}

/// Everything the compiler needs from the owning context.
pub struct CompileContext<'a> {
    pub endpoints: &'a Arc<EndpointRegistry>,
    pub interceptors: &'a [Arc<dyn ChannelInterceptor>],
    pub config: &'a EngineConfig,
    pub global_policies: &'a [ExceptionPolicy],
    pub version: u64,
}

/// An immutable compiled route. The context publishes a new one per
/// definition change; in-flight exchanges keep the version they started on.
pub struct CompiledRoute {
    id: String,
    version: u64,
    pipeline: Pipeline,
    stream_caching: bool,
}

impl CompiledRoute {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn stream_caching(&self) -> bool {
        self.stream_caching
    }
}

struct Compiler<'a> {
    route_id: String,
    ctx: &'a CompileContext<'a>,
    handler: Arc<ErrorHandler>,
}

pub fn compile_route(
    definition: &RouteDefinition,
    ctx: &CompileContext<'_>,
) -> Result<CompiledRoute, EngineError> {
    if definition.steps.is_empty() {
        return Err(EngineError::EmptyRoute(definition.id.clone()));
    }

    let redelivery = definition
        .redelivery
        .clone()
        .unwrap_or_else(|| ctx.config.redelivery.clone());
    let resolver = ExceptionPolicyResolver::new(vec![
        PolicyScope::new(definition.on_exception.clone()),
        PolicyScope::new(ctx.global_policies.to_vec()),
    ]);

    let mut handler = ErrorHandler::new(RedeliveryPolicy::from_config(&redelivery), resolver)
        .with_use_original_message(definition.use_original_message);
    if let Some(uri) = &definition.dead_letter_uri {
        let endpoint = ctx
            .endpoints
            .get(uri)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::EndpointNotFound(uri.clone()))?;
        handler = handler.with_dead_letter(Arc::new(SendProcessor::new(endpoint)));
    }

    let compiler = Compiler {
        route_id: definition.id.clone(),
        ctx,
        handler: Arc::new(handler),
    };
    let pipeline = compiler.compile_steps(&definition.steps, true)?;

    Ok(CompiledRoute {
        id: definition.id.clone(),
        version: ctx.version,
        pipeline,
        stream_caching: definition
            .stream_caching
            .unwrap_or(ctx.config.stream_caching),
    })
}

impl Compiler<'_> {
    fn compile_steps(
        &self,
        steps: &[StepDefinition],
        handled: bool,
    ) -> Result<Pipeline, EngineError> {
        let mut channels = Vec::with_capacity(steps.len());
        for step in steps {
            let info = StepInfo {
                route_id: self.route_id.clone(),
                step_id: step.id.clone(),
                repr: step.repr(),
            };
            let processor = self.compile_step(step)?;
            let handler = handled.then(|| self.handler.clone());
            channels.push(Channel::new(
                info,
                processor,
                handler,
                self.ctx.interceptors.to_vec(),
            ));
        }
        Ok(Pipeline::new(channels))
    }

    fn compile_step(&self, step: &StepDefinition) -> Result<SharedProcessor, EngineError> {
        let processor: SharedProcessor = match &step.kind {
            StepKind::Process { processor, .. } => processor.clone(),
            StepKind::SetBody { expression } => {
                Arc::new(SetBodyProcessor::new(expression.clone()))
            }
            StepKind::SetHeader { name, expression } => {
                Arc::new(SetHeaderProcessor::new(name.clone(), expression.clone()))
            }
            StepKind::To(uri) => {
                let endpoint = self
                    .ctx
                    .endpoints
                    .get(uri)
                    .map(|entry| entry.value().clone())
                    .ok_or_else(|| EngineError::EndpointNotFound(uri.clone()))?;
                Arc::new(SendProcessor::new(endpoint))
            }
            StepKind::Filter { predicate, steps } => Arc::new(FilterProcessor {
                predicate: predicate.clone(),
                body: self.compile_steps(steps, false)?,
            }),
            StepKind::Choice {
                branches,
                otherwise,
            } => {
                let mut compiled = Vec::with_capacity(branches.len());
                for branch in branches {
                    compiled.push((
                        branch.predicate.clone(),
                        self.compile_steps(&branch.steps, false)?,
                    ));
                }
                let otherwise = otherwise
                    .as_ref()
                    .map(|steps| self.compile_steps(steps, false))
                    .transpose()?;
                Arc::new(ChoiceProcessor {
                    branches: compiled,
                    otherwise,
                })
            }
            StepKind::Split {
                expression,
                settings,
                strategy,
                steps,
            } => Arc::new(SplitterProcessor::new(
                expression.clone(),
                Arc::new(self.compile_steps(steps, true)?),
                settings.clone(),
                strategy.clone(),
                self.ctx.config.fanout.max_parallel,
            )),
            StepKind::Multicast {
                branches,
                settings,
                strategy,
            } => {
                let mut compiled = Vec::with_capacity(branches.len());
                for branch in branches {
                    compiled.push(Arc::new(self.compile_steps(branch, true)?));
                }
                Arc::new(MulticastProcessor::new(
                    compiled,
                    settings.clone(),
                    strategy.clone(),
                    self.ctx.config.fanout.max_parallel,
                ))
            }
            StepKind::RecipientList {
                expression,
                settings,
                strategy,
            } => Arc::new(RecipientListProcessor::new(
                expression.clone(),
                self.ctx.endpoints.clone(),
                settings.clone(),
                strategy.clone(),
                self.ctx.config.fanout.max_parallel,
            )),
            StepKind::DoTry {
                steps,
                catches,
                finally,
            } => {
                let mut compiled_catches = Vec::with_capacity(catches.len());
                for clause in catches {
                    compiled_catches.push(CompiledCatch {
                        kinds: clause.kinds.clone(),
                        predicate: clause.predicate.clone(),
                        body: self.compile_steps(&clause.steps, false)?,
                    });
                }
                Arc::new(DoTryProcessor {
                    body: self.compile_steps(steps, false)?,
                    catches: compiled_catches,
                    finally: finally
                        .as_ref()
                        .map(|steps| self.compile_steps(steps, false))
                        .transpose()?,
                })
            }
        };
        Ok(processor)
    }
}

/// Default aggregation used when a fan-out step does not name one.
pub fn default_aggregation() -> Arc<dyn AggregationStrategy> {
    Arc::new(UseLatestAggregation)
}

struct FilterProcessor {
    predicate: Arc<dyn Predicate>,
    body: Pipeline,
}

#[async_trait]
impl Processor for FilterProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), MediationError> {
        if self.predicate.matches(exchange).await {
            self.body.run_as_processor(exchange).await
        } else {
            Ok(())
        }
    }
}

struct ChoiceProcessor {
    branches: Vec<(Arc<dyn Predicate>, Pipeline)>,
    otherwise: Option<Pipeline>,
}

#[async_trait]
impl Processor for ChoiceProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), MediationError> {
        for (predicate, body) in &self.branches {
            if predicate.matches(exchange).await {
                return body.run_as_processor(exchange).await;
            }
        }
        match &self.otherwise {
            Some(body) => body.run_as_processor(exchange).await,
            None => Ok(()),
        }
    }
}

struct CompiledCatch {
    kinds: Vec<ErrorKind>,
    predicate: Option<Arc<dyn Predicate>>,
    body: Pipeline,
}

impl CompiledCatch {
    fn covers(&self, error: &MediationError) -> bool {
        self.kinds.iter().any(|kind| error.kind().is_a(*kind))
    }
}

struct DoTryProcessor {
    body: Pipeline,
    catches: Vec<CompiledCatch>,
    finally: Option<Pipeline>,
}

impl DoTryProcessor {
    async fn handle_failure(
        &self,
        error: MediationError,
        exchange: &mut Exchange,
    ) -> Result<(), MediationError> {
        for clause in &self.catches {
            if !clause.covers(&error) {
                continue;
            }
            // Catch predicates inspect the failed exchange.
            exchange.set_exception(error.clone());
            let accepted = match &clause.predicate {
                Some(predicate) => predicate.matches(exchange).await,
                None => true,
            };
            exchange.clear_exception();
            if !accepted {
                continue;
            }
            exchange.set_property(PROPERTY_CAUGHT_EXCEPTION, error.to_value());
            return clause.body.run_as_processor(exchange).await;
        }
        Err(error)
    }
}

#[async_trait]
impl Processor for DoTryProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), MediationError> {
        let outcome = match self.body.run_as_processor(exchange).await {
            Ok(()) => Ok(()),
            Err(error) => self.handle_failure(error, exchange).await,
        };

        // The finally block always runs; its failure only surfaces when the
        // try/catch outcome was clean.
        if let Some(finally) = &self.finally {
            let finally_result = finally.run_as_processor(exchange).await;
            if outcome.is_ok() {
                return finally_result;
            }
        }
        outcome
    }
}
