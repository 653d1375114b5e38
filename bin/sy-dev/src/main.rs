//! Switchyard Development Playground
//!
//! Wires up a mediation context with a few representative routes and pushes
//! demo traffic through them:
//! - an order route with validation, content-based routing and a dead letter
//! - a splitter route fanning line items out to a log endpoint
//!
//! Useful for eyeballing the structured logs the engine emits.

use anyhow::Result;
use clap::Parser;
use serde_json::{json, Value};
use std::sync::Arc;
use sy_common::{Body, EngineConfig, ErrorKind, Exchange, MediationError, RedeliveryConfig};
use sy_engine::{
    expression, predicate, processor, ExceptionPolicy, FanOutSettings, LogEndpoint,
    MediationContext, RouteDefinition, StepDefinition, StepKind, TracingInterceptor,
    UseLatestAggregation,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Switchyard Development Server
#[derive(Parser, Debug)]
#[command(name = "sy-dev")]
#[command(about = "Switchyard development playground - demo routes in one binary")]
struct Args {
    /// Optional engine configuration file (TOML)
    #[arg(long, env = "SY_CONFIG")]
    config: Option<String>,

    /// How many demo orders to push through the routes
    #[arg(long, env = "SY_DEMO_ORDERS", default_value = "5")]
    orders: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => {
            info!(path, "Loading engine configuration");
            EngineConfig::from_toml_file(path)?
        }
        None => EngineConfig::default(),
    };

    info!("Starting Switchyard dev playground");
    let context = Arc::new(MediationContext::with_config(config));
    context.add_interceptor(Arc::new(TracingInterceptor));

    context.add_endpoint(LogEndpoint::new("log:accepted"));
    context.add_endpoint(LogEndpoint::new("log:review"));
    context.add_endpoint(LogEndpoint::new("log:items"));
    context.add_endpoint(LogEndpoint::new("log:dead-letter"));

    context.add_route(order_route())?;
    context.add_route(items_route())?;

    for sequence in 0..args.orders {
        let order = demo_order(sequence);

        let result = context
            .send("orders", Exchange::new(Body::Json(order.clone())))
            .await?;
        if result.is_failed() {
            warn!(
                exchange_id = %result.id(),
                error = %result.exception().map(ToString::to_string).unwrap_or_default(),
                "Order rejected"
            );
        }

        context
            .send("order-items", Exchange::new(Body::Json(order)))
            .await?;
    }

    for route_id in context.route_ids() {
        let entry = context.route_entry(&route_id)?;
        info!(
            route_id = %route_id,
            exchanges = entry.exchanges_total(),
            failures = entry.failures_total(),
            "Route totals"
        );
    }

    context.stop();
    Ok(())
}

/// Validates incoming orders, routes large ones for review, retries flaky
/// ones, and dead-letters anything that keeps failing.
fn order_route() -> RouteDefinition {
    RouteDefinition::new("orders")
        .from("demo:orders")
        .redelivery(RedeliveryConfig {
            maximum_redeliveries: 2,
            redelivery_delay_ms: 100,
            use_exponential_backoff: true,
            ..RedeliveryConfig::default()
        })
        .dead_letter("log:dead-letter")
        .on_exception(
            ExceptionPolicy::on(ErrorKind::Validation)
                .handled(true)
                .to(processor(|ex| {
                    ex.set_header("rejected", true);
                    Ok(())
                })),
        )
        .process(
            "validate",
            processor(|ex| {
                let total = ex
                    .body()
                    .as_json()
                    .and_then(|order| order.get("total"))
                    .and_then(Value::as_u64);
                match total {
                    Some(_) => Ok(()),
                    None => Err(MediationError::validation("order is missing a total")),
                }
            }),
        )
        .step(StepDefinition::of(StepKind::Choice {
            branches: vec![sy_engine::WhenBranch {
                predicate: predicate(|ex| {
                    ex.body()
                        .as_json()
                        .and_then(|order| order.get("total"))
                        .and_then(Value::as_u64)
                        .unwrap_or(0)
                        > 500
                }),
                steps: vec![StepDefinition::of(StepKind::To("log:review".to_string()))],
            }],
            otherwise: Some(vec![StepDefinition::of(StepKind::To(
                "log:accepted".to_string(),
            ))]),
        }))
}

/// Splits an order's line items and sends each one to the log endpoint.
fn items_route() -> RouteDefinition {
    RouteDefinition::new("order-items")
        .from("demo:orders")
        .step(StepDefinition::of(StepKind::Split {
            expression: expression(|ex| {
                Ok(ex
                    .body()
                    .as_json()
                    .and_then(|order| order.get("items"))
                    .cloned()
                    .unwrap_or_else(|| json!([])))
            }),
            settings: FanOutSettings {
                parallel: true,
                ..FanOutSettings::default()
            },
            strategy: Arc::new(UseLatestAggregation),
            steps: vec![StepDefinition::of(StepKind::To("log:items".to_string()))],
        }))
}

fn demo_order(sequence: usize) -> Value {
    let total = 120 * (sequence as u64 + 1);
    json!({
        "order_id": format!("ord-{sequence:04}"),
        "total": total,
        "items": [
            { "sku": "widget", "quantity": sequence + 1 },
            { "sku": "gadget", "quantity": 2 },
        ],
    })
}
