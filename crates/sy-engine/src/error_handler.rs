//! Error handler - redelivery loop, handled/continued policies, dead letter
//!
//! Wraps one processor and owns the failure lifecycle for it:
//! - a matched `continued` policy swallows the failure and resumes routing
//! - a matched `handled` policy (or the dead-letter destination) consumes the
//!   failure, stashing it in the caught-exception property
//! - a failure no policy consumes is redelivered with fixed or exponential
//!   backoff until the route ceiling; a consuming policy redelivers only up
//!   to its own override, never the route's
//! - otherwise the exchange stays failed and routing stops
//!
//! Redelivery waits are non-blocking and race the unit of work's cancellation
//! signal, so a cancelled exchange never sits out a full backoff window.

use crate::pipeline::Flow;
use crate::policy::{ExceptionPolicy, ExceptionPolicyResolver};
use crate::processor::SharedProcessor;
use rand::Rng;
use std::time::Duration;
use sy_common::{
    Exchange, MediationError, Message, RedeliveryConfig, HEADER_REDELIVERED,
    HEADER_REDELIVERY_COUNTER, PROPERTY_CAUGHT_EXCEPTION,
};
use tracing::{debug, error, trace, warn};

/// Where the handler is in the failure lifecycle, for log correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RedeliveryState {
    Attempting,
    WaitingForRedelivery,
    Redelivering,
    HandledByPolicy,
    ExhaustedToDeadLetter,
    ExhaustedUnhandled,
}

/// Computed redelivery schedule derived from configuration.
#[derive(Debug, Clone)]
pub struct RedeliveryPolicy {
    maximum_redeliveries: u32,
    delay: Duration,
    backoff_multiplier: f64,
    maximum_delay: Duration,
    use_exponential_backoff: bool,
    use_jitter: bool,
}

impl RedeliveryPolicy {
    pub fn from_config(config: &RedeliveryConfig) -> Self {
        Self {
            maximum_redeliveries: config.maximum_redeliveries,
            delay: config.redelivery_delay(),
            backoff_multiplier: config.backoff_multiplier,
            maximum_delay: config.maximum_redelivery_delay(),
            use_exponential_backoff: config.use_exponential_backoff,
            use_jitter: config.use_jitter,
        }
    }

    pub fn maximum_redeliveries(&self) -> u32 {
        self.maximum_redeliveries
    }

    /// Delay before redelivery attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = if self.use_exponential_backoff {
            let factor = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
            self.delay.mul_f64(factor)
        } else {
            self.delay
        };
        let capped = base.min(self.maximum_delay);
        if self.use_jitter {
            let jitter = rand::thread_rng().gen_range(0.0..0.25);
            capped.mul_f64(1.0 + jitter).min(self.maximum_delay)
        } else {
            capped
        }
    }
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self::from_config(&RedeliveryConfig::default())
    }
}

pub struct ErrorHandler {
    policy: RedeliveryPolicy,
    resolver: ExceptionPolicyResolver,
    dead_letter: Option<SharedProcessor>,
    use_original_message: bool,
}

impl ErrorHandler {
    pub fn new(policy: RedeliveryPolicy, resolver: ExceptionPolicyResolver) -> Self {
        Self {
            policy,
            resolver,
            dead_letter: None,
            use_original_message: false,
        }
    }

    pub fn with_dead_letter(mut self, destination: SharedProcessor) -> Self {
        self.dead_letter = Some(destination);
        self
    }

    pub fn with_use_original_message(mut self, enabled: bool) -> Self {
        self.use_original_message = enabled;
        self
    }

    /// Run the wrapped processor under this handler's failure lifecycle.
    pub async fn run(&self, processor: &SharedProcessor, exchange: &mut Exchange) -> Flow {
        let original = self
            .use_original_message
            .then(|| exchange.in_message().clone());
        loop {
            trace!(
                exchange_id = %exchange.id(),
                attempt = exchange.redelivery_count(),
                state = ?RedeliveryState::Attempting,
                "Attempting delivery"
            );
            let failure = match processor.process(exchange).await {
                Ok(()) => return Flow::Continue,
                Err(failure) => failure,
            };

            // Policies and their predicates see the failed exchange.
            exchange.set_exception(failure.clone());
            let matched = self.resolver.resolve(&failure, exchange).await.cloned();

            // A handled or continued policy consumes the failure outright.
            // The route-level ceiling never applies to it; only the policy's
            // own redelivery override does.
            let effective_max = match matched.as_ref() {
                Some(policy) if policy.is_handled() || policy.is_continued() => {
                    policy.max_redeliveries_override().unwrap_or(0)
                }
                Some(policy) => policy
                    .max_redeliveries_override()
                    .unwrap_or(self.policy.maximum_redeliveries),
                None => self.policy.maximum_redeliveries,
            };
            let attempted = exchange.redelivery_count();

            let retry_while_ok = match matched.as_ref().and_then(|p| p.retry_while_predicate()) {
                Some(predicate) => predicate.matches(exchange).await,
                None => true,
            };

            if attempted < effective_max as u64 && retry_while_ok {
                let attempt = (attempted + 1) as u32;
                let delay = matched
                    .as_ref()
                    .and_then(|p| p.delay_override())
                    .unwrap_or_else(|| self.policy.delay_for(attempt));

                let state = RedeliveryState::WaitingForRedelivery;
                warn!(
                    exchange_id = %exchange.id(),
                    error = %failure,
                    attempt,
                    max = effective_max,
                    delay_ms = delay.as_millis() as u64,
                    state = ?state,
                    "Delivery failed, scheduling redelivery"
                );

                exchange.clear_exception();
                exchange.set_header(HEADER_REDELIVERY_COUNTER, attempt);
                exchange.set_header(HEADER_REDELIVERED, true);

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = exchange.unit_of_work().cancelled() => {
                        debug!(exchange_id = %exchange.id(), "Redelivery wait cancelled");
                        exchange.set_exception(MediationError::cancelled(
                            "exchange cancelled while waiting for redelivery",
                        ));
                        return Flow::Stop;
                    }
                }

                debug!(
                    exchange_id = %exchange.id(),
                    attempt,
                    state = ?RedeliveryState::Redelivering,
                    "Redelivering"
                );
                continue;
            }

            if let Some(policy) = matched.as_ref().filter(|p| p.is_continued()) {
                debug!(
                    exchange_id = %exchange.id(),
                    error = %failure,
                    "Failure matched continued policy, resuming route"
                );
                if let Err(dest_error) = self.run_destination(policy, exchange).await {
                    exchange.set_exception(dest_error);
                    return Flow::Stop;
                }
                exchange.set_property(PROPERTY_CAUGHT_EXCEPTION, failure.to_value());
                exchange.clear_exception();
                return Flow::Continue;
            }

            if let Some(policy) = matched.as_ref().filter(|p| p.is_handled()) {
                let state = RedeliveryState::HandledByPolicy;
                debug!(
                    exchange_id = %exchange.id(),
                    error = %failure,
                    state = ?state,
                    "Failure handled by policy"
                );
                self.restore_original(original.as_ref(), exchange);
                if let Err(dest_error) = self.run_destination(policy, exchange).await {
                    exchange.set_exception(dest_error);
                    return Flow::Stop;
                }
                exchange.set_property(PROPERTY_CAUGHT_EXCEPTION, failure.to_value());
                exchange.clear_exception();
                return Flow::Stop;
            }

            if let Some(dead_letter) = &self.dead_letter {
                let state = RedeliveryState::ExhaustedToDeadLetter;
                warn!(
                    exchange_id = %exchange.id(),
                    error = %failure,
                    redeliveries = attempted,
                    state = ?state,
                    "Redeliveries exhausted, routing to dead letter"
                );
                self.restore_original(original.as_ref(), exchange);
                exchange.set_property(PROPERTY_CAUGHT_EXCEPTION, failure.to_value());
                exchange.clear_exception();
                if let Err(dlq_error) = dead_letter.process(exchange).await {
                    // The dead letter destination itself is never redelivered.
                    error!(
                        exchange_id = %exchange.id(),
                        error = %dlq_error,
                        "Dead letter delivery failed"
                    );
                    exchange.set_exception(dlq_error);
                }
                return Flow::Stop;
            }

            let state = RedeliveryState::ExhaustedUnhandled;
            error!(
                exchange_id = %exchange.id(),
                error = %failure,
                redeliveries = attempted,
                state = ?state,
                "Delivery failed and no policy handled it"
            );
            return Flow::Stop;
        }
    }

    async fn run_destination(
        &self,
        policy: &ExceptionPolicy,
        exchange: &mut Exchange,
    ) -> Result<(), MediationError> {
        match policy.destination() {
            Some(destination) => destination.process(exchange).await,
            None => Ok(()),
        }
    }

    fn restore_original(&self, original: Option<&Message>, exchange: &mut Exchange) {
        if let Some(message) = original {
            exchange.restore_in_message(message.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyScope;
    use crate::processor::processor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use sy_common::{Body, ErrorKind};

    fn handler_with(max: u32, scopes: Vec<Vec<ExceptionPolicy>>) -> ErrorHandler {
        let config = RedeliveryConfig {
            maximum_redeliveries: max,
            redelivery_delay_ms: 1,
            ..RedeliveryConfig::default()
        };
        ErrorHandler::new(
            RedeliveryPolicy::from_config(&config),
            ExceptionPolicyResolver::new(scopes.into_iter().map(PolicyScope::new).collect()),
        )
    }

    fn always_failing(attempts: Arc<AtomicUsize>) -> SharedProcessor {
        processor(move |_ex| {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(MediationError::processing("boom"))
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivers_up_to_maximum() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let failing = always_failing(attempts.clone());
        let handler = handler_with(2, vec![]);

        let mut exchange = Exchange::with_text("x");
        let flow = handler.run(&failing, &mut exchange).await;

        assert_eq!(flow, Flow::Stop);
        // Initial attempt plus two redeliveries.
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(exchange.is_failed());
        assert_eq!(exchange.redelivery_count(), 2);
        assert_eq!(exchange.header(HEADER_REDELIVERED).unwrap(), true);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_midway_through_redelivery() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let flaky = processor(move |_ex| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(MediationError::connection("refused"))
            } else {
                Ok(())
            }
        });
        let handler = handler_with(5, vec![]);

        let mut exchange = Exchange::with_text("x");
        let flow = handler.run(&flaky, &mut exchange).await;

        assert_eq!(flow, Flow::Continue);
        assert!(!exchange.is_failed());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(exchange.redelivery_count(), 2);
    }

    #[tokio::test]
    async fn test_handled_policy_consumes_failure() {
        let failing = processor(|_ex| Err(MediationError::validation("bad field")));
        let handler = handler_with(
            0,
            vec![vec![ExceptionPolicy::on(ErrorKind::Validation)
                .handled(true)
                .to(processor(|ex| {
                    ex.set_body(Body::text("apology"));
                    Ok(())
                }))]],
        );

        let mut exchange = Exchange::with_text("x");
        let flow = handler.run(&failing, &mut exchange).await;

        assert_eq!(flow, Flow::Stop);
        assert!(!exchange.is_failed());
        assert_eq!(exchange.body().as_text(), Some("apology"));
        assert!(exchange.property(PROPERTY_CAUGHT_EXCEPTION).is_some());
    }

    #[tokio::test]
    async fn test_handled_policy_skips_route_level_redelivery() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let failing = always_failing(attempts.clone());
        let handler = handler_with(
            2,
            vec![vec![ExceptionPolicy::on(ErrorKind::Any).handled(true)]],
        );

        let mut exchange = Exchange::with_text("x");
        let flow = handler.run(&failing, &mut exchange).await;

        assert_eq!(flow, Flow::Stop);
        assert!(!exchange.is_failed());
        // The route ceiling does not apply once a handled policy matches.
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(exchange.redelivery_count(), 0);
        assert!(exchange.property(PROPERTY_CAUGHT_EXCEPTION).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handled_policy_redelivers_up_to_its_own_override() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let failing = always_failing(attempts.clone());
        let handler = handler_with(
            5,
            vec![vec![ExceptionPolicy::on(ErrorKind::Any)
                .handled(true)
                .max_redeliveries(1)]],
        );

        let mut exchange = Exchange::with_text("x");
        let flow = handler.run(&failing, &mut exchange).await;

        assert_eq!(flow, Flow::Stop);
        assert!(!exchange.is_failed());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(exchange.redelivery_count(), 1);
    }

    #[tokio::test]
    async fn test_continued_policy_resumes_without_redelivery() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let failing = always_failing(attempts.clone());
        let handler = handler_with(
            5,
            vec![vec![ExceptionPolicy::on(ErrorKind::Any).continued(true)]],
        );

        let mut exchange = Exchange::with_text("x");
        let flow = handler.run(&failing, &mut exchange).await;

        assert_eq!(flow, Flow::Continue);
        assert!(!exchange.is_failed());
        // Continued short-circuits the redelivery loop entirely.
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(exchange.redelivery_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_letter_receives_exhausted_exchange() {
        let failing = processor(|_ex| Err(MediationError::processing("boom")));
        let dead_lettered = Arc::new(AtomicUsize::new(0));
        let counter = dead_lettered.clone();
        let handler = handler_with(1, vec![]).with_dead_letter(processor(move |_ex| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        let mut exchange = Exchange::with_text("x");
        let flow = handler.run(&failing, &mut exchange).await;

        assert_eq!(flow, Flow::Stop);
        assert!(!exchange.is_failed());
        assert_eq!(dead_lettered.load(Ordering::SeqCst), 1);
        assert!(exchange.property(PROPERTY_CAUGHT_EXCEPTION).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_use_original_message_restores_snapshot() {
        let failing = processor(|ex| {
            ex.set_body(Body::text("mangled"));
            Err(MediationError::processing("boom"))
        });
        let handler = handler_with(0, vec![])
            .with_dead_letter(processor(|_ex| Ok(())))
            .with_use_original_message(true);

        let mut exchange = Exchange::with_text("pristine");
        handler.run(&failing, &mut exchange).await;

        assert_eq!(exchange.body().as_text(), Some("pristine"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_while_overrides_ceiling() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let failing = always_failing(attempts.clone());
        let handler = handler_with(
            10,
            vec![vec![ExceptionPolicy::on(ErrorKind::Any)
                .retry_while(crate::expression::predicate(|ex| {
                    ex.redelivery_count() < 2
                }))]],
        );

        let mut exchange = Exchange::with_text("x");
        let flow = handler.run(&failing, &mut exchange).await;

        assert_eq!(flow, Flow::Stop);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_wakes_redelivery_wait() {
        let failing = processor(|_ex| Err(MediationError::processing("boom")));
        let config = RedeliveryConfig {
            maximum_redeliveries: 1,
            redelivery_delay_ms: 60_000,
            ..RedeliveryConfig::default()
        };
        let handler = ErrorHandler::new(
            RedeliveryPolicy::from_config(&config),
            ExceptionPolicyResolver::default(),
        );

        let mut exchange = Exchange::with_text("x");
        let uow = exchange.unit_of_work().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            uow.cancel();
        });

        let flow = handler.run(&failing, &mut exchange).await;
        assert_eq!(flow, Flow::Stop);
        assert_eq!(
            exchange.exception().unwrap().kind(),
            ErrorKind::Cancelled
        );
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let config = RedeliveryConfig {
            maximum_redeliveries: 10,
            redelivery_delay_ms: 100,
            backoff_multiplier: 10.0,
            maximum_redelivery_delay_ms: 5_000,
            use_exponential_backoff: true,
            use_jitter: false,
        };
        let policy = RedeliveryPolicy::from_config(&config);

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(5_000));
        assert_eq!(policy.delay_for(8), Duration::from_millis(5_000));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let config = RedeliveryConfig {
            redelivery_delay_ms: 1_000,
            use_jitter: true,
            ..RedeliveryConfig::default()
        };
        let policy = RedeliveryPolicy::from_config(&config);

        for _ in 0..50 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_millis(1_000));
            assert!(delay <= Duration::from_millis(1_250));
        }
    }
}
