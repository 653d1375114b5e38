//! Switchyard mediation engine
//!
//! The engine core:
//! - MediationContext: endpoint/route registry and the send entry points
//! - RouteDefinition + compiler: declarative steps into compiled pipelines
//! - Channel/Pipeline: per-step execution with interceptors
//! - ErrorHandler: redelivery, handled/continued policies, dead letter
//! - Fan-out: multicast, splitter, recipient list with aggregation
//! - AdviceWith: atomic structural edits to live routes

pub mod advice;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod error_handler;
pub mod expression;
pub mod fanout;
pub mod pipeline;
pub mod policy;
pub mod processor;
pub mod route;

pub use advice::{AdviceWith, StepSelector};
pub use context::{MediationContext, RouteEntry};
pub use endpoint::{Endpoint, EndpointRegistry, LogEndpoint, MockEndpoint, SendProcessor};
pub use error::EngineError;
pub use error_handler::{ErrorHandler, RedeliveryPolicy};
pub use expression::{constant, expression, predicate, Expression, Predicate};
pub use fanout::{
    aggregation, AggregationStrategy, FanOutSettings, MulticastProcessor, RecipientListProcessor,
    SplitterProcessor, UseLatestAggregation,
};
pub use pipeline::{
    Channel, ChannelInterceptor, Flow, MetricsInterceptor, Pipeline, StepInfo, TracingInterceptor,
};
pub use policy::{ExceptionPolicy, ExceptionPolicyResolver, PolicyScope};
pub use processor::{processor, Processor, SetBodyProcessor, SetHeaderProcessor, SharedProcessor};
pub use route::{
    compile_route, default_aggregation, CatchClause, CompileContext, CompiledRoute,
    RouteDefinition, StepDefinition, StepKind, WhenBranch,
};

/// Convenience alias for engine-level results.
pub type Result<T> = std::result::Result<T, EngineError>;
