//! Fan-out steps: multicast, splitter, recipient list
//!
//! All three share one engine: make an independent sub-exchange per branch,
//! run each branch's pipeline, settle every launched branch, and fold the
//! settled results through an aggregation strategy. Sequential mode settles
//! in submission order; parallel mode runs branches on the runtime under a
//! bounded launch window and folds in completion order, or in submission
//! order when configured to preserve it. After a branch
//! failure no new branches launch when stop-on-exception is set, but branches
//! already in flight always run to settlement before the failure surfaces.

use crate::endpoint::{EndpointRegistry, SendProcessor};
use crate::expression::Expression;
use crate::pipeline::{Channel, Pipeline, StepInfo};
use crate::processor::Processor;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use sy_common::{
    Body, Exchange, MediationError, HEADER_FANOUT_INDEX, HEADER_SPLIT_INDEX, HEADER_SPLIT_SIZE,
};
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Execution knobs shared by every fan-out step.
#[derive(Debug, Clone, Default)]
pub struct FanOutSettings {
    /// Run branches concurrently instead of in submission order.
    pub parallel: bool,
    /// Concurrency bound for parallel mode; engine default when unset.
    pub max_parallel: Option<usize>,
    /// Fold parallel results in submission order instead of completion order.
    pub preserve_order: bool,
    /// Stop launching further branches after the first branch failure.
    pub stop_on_exception: bool,
    /// Children share the parent's unit of work instead of owning fresh ones.
    pub share_unit_of_work: bool,
}

/// Folds settled sub-exchanges into one result. Invoked exactly once per
/// settled branch, failed branches included.
pub trait AggregationStrategy: Send + Sync {
    fn aggregate(&self, accumulated: Option<Exchange>, incoming: Exchange) -> Exchange;
}

/// Keeps whichever sub-exchange settled last.
pub struct UseLatestAggregation;

impl AggregationStrategy for UseLatestAggregation {
    fn aggregate(&self, _accumulated: Option<Exchange>, incoming: Exchange) -> Exchange {
        incoming
    }
}

struct FnAggregation<F>(F);

impl<F> AggregationStrategy for FnAggregation<F>
where
    F: Fn(Option<Exchange>, Exchange) -> Exchange + Send + Sync,
{
    fn aggregate(&self, accumulated: Option<Exchange>, incoming: Exchange) -> Exchange {
        (self.0)(accumulated, incoming)
    }
}

/// Wrap a closure as an [`AggregationStrategy`].
pub fn aggregation<F>(f: F) -> Arc<dyn AggregationStrategy>
where
    F: Fn(Option<Exchange>, Exchange) -> Exchange + Send + Sync + 'static,
{
    Arc::new(FnAggregation(f))
}

struct Settlement {
    accumulated: Option<Exchange>,
    first_failure: Option<MediationError>,
}

impl Settlement {
    fn new() -> Self {
        Self {
            accumulated: None,
            first_failure: None,
        }
    }

    fn settle(
        &mut self,
        strategy: &Arc<dyn AggregationStrategy>,
        share_unit_of_work: bool,
        sub: Exchange,
    ) {
        if !share_unit_of_work {
            sub.unit_of_work().done(&sub);
        }
        if let Some(failure) = sub.exception() {
            if self.first_failure.is_none() {
                self.first_failure = Some(failure.clone());
            }
        }
        self.accumulated = Some(strategy.aggregate(self.accumulated.take(), sub));
    }
}

/// Run all branches, fold results onto the parent, surface the first branch
/// failure. Partial aggregation results stay on the parent either way.
async fn fan_out(
    parent: &mut Exchange,
    branches: Vec<(Exchange, Arc<Pipeline>)>,
    settings: &FanOutSettings,
    strategy: &Arc<dyn AggregationStrategy>,
    default_max_parallel: usize,
) -> Result<(), MediationError> {
    let total = branches.len();
    let mut settlement = Settlement::new();

    if settings.parallel {
        let window = settings
            .max_parallel
            .unwrap_or(default_max_parallel)
            .max(1);
        let mut pending = branches.into_iter().enumerate();
        let mut in_flight: JoinSet<(usize, Exchange)> = JoinSet::new();
        let mut halted = false;
        let mut held_back: Vec<(usize, Exchange)> = Vec::new();

        loop {
            while !halted && in_flight.len() < window {
                match pending.next() {
                    Some((index, (mut sub, pipeline))) => {
                        in_flight.spawn(async move {
                            pipeline.run(&mut sub).await;
                            (index, sub)
                        });
                    }
                    None => break,
                }
            }

            match in_flight.join_next().await {
                Some(Ok((index, sub))) => {
                    if settings.stop_on_exception && sub.exception().is_some() {
                        halted = true;
                    }
                    if settings.preserve_order {
                        held_back.push((index, sub));
                    } else {
                        settlement.settle(strategy, settings.share_unit_of_work, sub);
                    }
                }
                Some(Err(join_error)) => {
                    warn!(error = %join_error, "Fan-out branch task failed to join");
                    if settlement.first_failure.is_none() {
                        settlement.first_failure =
                            Some(MediationError::processing(join_error.to_string()));
                    }
                    if settings.stop_on_exception {
                        halted = true;
                    }
                }
                None => break,
            }
        }

        // Settled branches held back for ordering fold by submission index.
        held_back.sort_unstable_by_key(|(index, _)| *index);
        for (_, sub) in held_back {
            settlement.settle(strategy, settings.share_unit_of_work, sub);
        }
    } else {
        for (mut sub, pipeline) in branches {
            pipeline.run(&mut sub).await;
            settlement.settle(strategy, settings.share_unit_of_work, sub);
            if settings.stop_on_exception && settlement.first_failure.is_some() {
                break;
            }
        }
    }

    debug!(
        exchange_id = %parent.id(),
        branches = total,
        failed = settlement.first_failure.is_some(),
        "Fan-out settled"
    );

    if let Some(result) = settlement.accumulated {
        parent.set_out_message(result.message().clone());
    }
    match settlement.first_failure {
        Some(failure) => Err(failure),
        None => Ok(()),
    }
}

/// Sends a copy of the exchange down each of a fixed set of branch pipelines.
pub struct MulticastProcessor {
    branches: Vec<Arc<Pipeline>>,
    settings: FanOutSettings,
    strategy: Arc<dyn AggregationStrategy>,
    default_max_parallel: usize,
}

impl MulticastProcessor {
    pub fn new(
        branches: Vec<Arc<Pipeline>>,
        settings: FanOutSettings,
        strategy: Arc<dyn AggregationStrategy>,
        default_max_parallel: usize,
    ) -> Self {
        Self {
            branches,
            settings,
            strategy,
            default_max_parallel,
        }
    }
}

#[async_trait]
impl Processor for MulticastProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), MediationError> {
        let branches = self
            .branches
            .iter()
            .enumerate()
            .map(|(index, pipeline)| {
                let mut sub = exchange.copy_for_fanout(self.settings.share_unit_of_work);
                sub.set_header(HEADER_FANOUT_INDEX, index);
                (sub, pipeline.clone())
            })
            .collect();
        fan_out(
            exchange,
            branches,
            &self.settings,
            &self.strategy,
            self.default_max_parallel,
        )
        .await
    }
}

/// Splits the exchange into per-fragment sub-exchanges that all run the same
/// nested pipeline. A JSON array splits element-wise; any other value is a
/// single fragment.
pub struct SplitterProcessor {
    expression: Arc<dyn Expression>,
    fragment_pipeline: Arc<Pipeline>,
    settings: FanOutSettings,
    strategy: Arc<dyn AggregationStrategy>,
    default_max_parallel: usize,
}

impl SplitterProcessor {
    pub fn new(
        expression: Arc<dyn Expression>,
        fragment_pipeline: Arc<Pipeline>,
        settings: FanOutSettings,
        strategy: Arc<dyn AggregationStrategy>,
        default_max_parallel: usize,
    ) -> Self {
        Self {
            expression,
            fragment_pipeline,
            settings,
            strategy,
            default_max_parallel,
        }
    }
}

#[async_trait]
impl Processor for SplitterProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), MediationError> {
        let fragments = match self.expression.evaluate(exchange).await? {
            Value::Array(elements) => elements,
            other => vec![other],
        };
        let size = fragments.len();

        let branches = fragments
            .into_iter()
            .enumerate()
            .map(|(index, fragment)| {
                let mut sub = exchange.copy_for_fanout(self.settings.share_unit_of_work);
                sub.set_body(Body::Json(fragment));
                sub.set_header(HEADER_SPLIT_INDEX, index);
                sub.set_header(HEADER_SPLIT_SIZE, size);
                (sub, self.fragment_pipeline.clone())
            })
            .collect();
        fan_out(
            exchange,
            branches,
            &self.settings,
            &self.strategy,
            self.default_max_parallel,
        )
        .await
    }
}

/// Sends a copy of the exchange to each endpoint named by a runtime
/// expression: a JSON array of URIs or one comma-separated string.
pub struct RecipientListProcessor {
    expression: Arc<dyn Expression>,
    endpoints: Arc<EndpointRegistry>,
    settings: FanOutSettings,
    strategy: Arc<dyn AggregationStrategy>,
    default_max_parallel: usize,
}

impl RecipientListProcessor {
    pub fn new(
        expression: Arc<dyn Expression>,
        endpoints: Arc<EndpointRegistry>,
        settings: FanOutSettings,
        strategy: Arc<dyn AggregationStrategy>,
        default_max_parallel: usize,
    ) -> Self {
        Self {
            expression,
            endpoints,
            settings,
            strategy,
            default_max_parallel,
        }
    }

    fn recipient_uris(value: Value) -> Result<Vec<String>, MediationError> {
        match value {
            Value::Array(elements) => elements
                .into_iter()
                .map(|element| match element {
                    Value::String(uri) => Ok(uri),
                    other => Err(MediationError::transform(format!(
                        "recipient list entries must be strings, got {}",
                        other
                    ))),
                })
                .collect(),
            Value::String(joined) => Ok(joined
                .split(',')
                .map(str::trim)
                .filter(|uri| !uri.is_empty())
                .map(str::to_string)
                .collect()),
            other => Err(MediationError::transform(format!(
                "recipient list expression must yield a string or array, got {}",
                other
            ))),
        }
    }
}

#[async_trait]
impl Processor for RecipientListProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), MediationError> {
        let uris = Self::recipient_uris(self.expression.evaluate(exchange).await?)?;
        let route_id = exchange.route_id().unwrap_or_default().to_string();

        // Resolve every recipient before launching anything.
        let mut branches = Vec::with_capacity(uris.len());
        for (index, uri) in uris.into_iter().enumerate() {
            let endpoint = self
                .endpoints
                .get(&uri)
                .map(|entry| entry.value().clone())
                .ok_or_else(|| MediationError::no_such_endpoint(&uri))?;

            let mut sub = exchange.copy_for_fanout(self.settings.share_unit_of_work);
            sub.set_header(HEADER_FANOUT_INDEX, index);
            let step = StepInfo {
                route_id: route_id.clone(),
                step_id: None,
                repr: format!("to({})", uri),
            };
            let channel = Channel::new(
                step,
                Arc::new(SendProcessor::new(endpoint)),
                None,
                Vec::new(),
            );
            branches.push((sub, Arc::new(Pipeline::new(vec![channel]))));
        }

        fan_out(
            exchange,
            branches,
            &self.settings,
            &self.strategy,
            self.default_max_parallel,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::MockEndpoint;
    use crate::expression::{constant, expression};
    use crate::processor::processor;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn plain_pipeline(p: crate::processor::SharedProcessor) -> Arc<Pipeline> {
        let step = StepInfo {
            route_id: "fanout-test".to_string(),
            step_id: None,
            repr: "process".to_string(),
        };
        Arc::new(Pipeline::new(vec![Channel::new(step, p, None, Vec::new())]))
    }

    fn latest() -> Arc<dyn AggregationStrategy> {
        Arc::new(UseLatestAggregation)
    }

    #[tokio::test]
    async fn test_multicast_sequential_runs_branches_in_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let branches = (0..3)
            .map(|tag| {
                let order = order.clone();
                plain_pipeline(processor(move |_ex| {
                    order.lock().push(tag);
                    Ok(())
                }))
            })
            .collect();

        let multicast = MulticastProcessor::new(
            branches,
            FanOutSettings::default(),
            latest(),
            16,
        );
        let mut exchange = Exchange::with_text("payload");
        multicast.process(&mut exchange).await.unwrap();

        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_multicast_branches_see_independent_copies() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let branches = (0..2)
            .map(|_| {
                let seen = seen.clone();
                plain_pipeline(processor(move |ex| {
                    seen.lock().push(ex.id());
                    ex.set_body(Body::text("branch-local"));
                    Ok(())
                }))
            })
            .collect();

        let multicast = MulticastProcessor::new(
            branches,
            FanOutSettings::default(),
            latest(),
            16,
        );
        let mut exchange = Exchange::with_text("payload");
        let parent_id = exchange.id();
        multicast.process(&mut exchange).await.unwrap();

        let ids = seen.lock().clone();
        assert_eq!(ids.len(), 2);
        assert!(ids.iter().all(|id| *id != parent_id));
        assert_ne!(ids[0], ids[1]);
    }

    #[tokio::test]
    async fn test_aggregated_result_lands_on_parent() {
        let branches = vec![
            plain_pipeline(processor(|ex| {
                ex.set_body(Body::text("first"));
                Ok(())
            })),
            plain_pipeline(processor(|ex| {
                ex.set_body(Body::text("second"));
                Ok(())
            })),
        ];

        let multicast = MulticastProcessor::new(
            branches,
            FanOutSettings::default(),
            latest(),
            16,
        );
        let mut exchange = Exchange::with_text("payload");
        multicast.process(&mut exchange).await.unwrap();

        assert_eq!(exchange.body().as_text(), Some("second"));
    }

    #[tokio::test]
    async fn test_stop_on_exception_halts_sequential_launches() {
        let launched = Arc::new(AtomicUsize::new(0));
        let mut branches = Vec::new();
        for tag in 0..3 {
            let launched = launched.clone();
            branches.push(plain_pipeline(processor(move |_ex| {
                launched.fetch_add(1, Ordering::SeqCst);
                if tag == 0 {
                    Err(MediationError::processing("branch failed"))
                } else {
                    Ok(())
                }
            })));
        }

        let multicast = MulticastProcessor::new(
            branches,
            FanOutSettings {
                stop_on_exception: true,
                ..FanOutSettings::default()
            },
            latest(),
            16,
        );
        let mut exchange = Exchange::with_text("payload");
        let result = multicast.process(&mut exchange).await;

        assert!(result.is_err());
        assert_eq!(launched.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_parallel_multicast_settles_every_launched_branch() {
        let settled = Arc::new(AtomicUsize::new(0));
        let branches = (0..4)
            .map(|_| {
                let settled = settled.clone();
                plain_pipeline(processor(move |_ex| {
                    settled.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }))
            })
            .collect();

        let multicast = MulticastProcessor::new(
            branches,
            FanOutSettings {
                parallel: true,
                max_parallel: Some(2),
                ..FanOutSettings::default()
            },
            latest(),
            16,
        );
        let mut exchange = Exchange::with_text("payload");
        multicast.process(&mut exchange).await.unwrap();

        assert_eq!(settled.load(Ordering::SeqCst), 4);
    }

    struct SleepProcessor(std::time::Duration);

    #[async_trait]
    impl Processor for SleepProcessor {
        async fn process(&self, _exchange: &mut Exchange) -> Result<(), MediationError> {
            tokio::time::sleep(self.0).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_preserve_order_folds_by_submission_index() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let recorder = order.clone();
        let strategy = aggregation(move |_acc, incoming| {
            let index = incoming
                .header(HEADER_FANOUT_INDEX)
                .and_then(|v| v.as_u64())
                .unwrap();
            recorder.lock().push(index);
            incoming
        });

        // The slowest branch is submitted first, so completion order differs.
        let branches = [30u64, 5, 15]
            .iter()
            .map(|ms| {
                plain_pipeline(Arc::new(SleepProcessor(std::time::Duration::from_millis(
                    *ms,
                ))))
            })
            .collect();

        let multicast = MulticastProcessor::new(
            branches,
            FanOutSettings {
                parallel: true,
                preserve_order: true,
                ..FanOutSettings::default()
            },
            strategy,
            16,
        );
        let mut exchange = Exchange::with_text("payload");
        multicast.process(&mut exchange).await.unwrap();

        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_splitter_sets_fragment_headers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let fragment_pipeline = plain_pipeline(processor(move |ex| {
            recorder.lock().push((
                ex.header(HEADER_SPLIT_INDEX).unwrap().as_u64().unwrap(),
                ex.header(HEADER_SPLIT_SIZE).unwrap().as_u64().unwrap(),
                ex.body().as_json().unwrap().clone(),
            ));
            Ok(())
        }));

        let splitter = SplitterProcessor::new(
            expression(|ex| Ok(ex.body().as_json().cloned().unwrap_or(Value::Null))),
            fragment_pipeline,
            FanOutSettings::default(),
            latest(),
            16,
        );
        let mut exchange = Exchange::new(Body::Json(json!(["a", "b", "c"])));
        splitter.process(&mut exchange).await.unwrap();

        let fragments = seen.lock().clone();
        assert_eq!(fragments.len(), 3);
        assert_eq!(fragments[0], (0, 3, json!("a")));
        assert_eq!(fragments[2], (2, 3, json!("c")));
    }

    #[tokio::test]
    async fn test_recipient_list_delivers_to_each_endpoint() {
        let registry = Arc::new(EndpointRegistry::new());
        let first = MockEndpoint::new("mock:first");
        let second = MockEndpoint::new("mock:second");
        registry.insert("mock:first".to_string(), first.clone());
        registry.insert("mock:second".to_string(), second.clone());

        let recipients = RecipientListProcessor::new(
            constant("mock:first, mock:second"),
            registry,
            FanOutSettings::default(),
            latest(),
            16,
        );
        let mut exchange = Exchange::with_text("payload");
        recipients.process(&mut exchange).await.unwrap();

        assert_eq!(first.received_count(), 1);
        assert_eq!(second.received_count(), 1);
    }

    #[tokio::test]
    async fn test_recipient_list_unknown_uri_fails() {
        let registry = Arc::new(EndpointRegistry::new());
        let recipients = RecipientListProcessor::new(
            constant("mock:missing"),
            registry,
            FanOutSettings::default(),
            latest(),
            16,
        );
        let mut exchange = Exchange::with_text("payload");
        let error = recipients.process(&mut exchange).await.unwrap_err();
        assert_eq!(error.kind(), sy_common::ErrorKind::NoSuchEndpoint);
    }
}
