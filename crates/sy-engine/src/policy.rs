//! Exception policies and the scope-aware resolver
//!
//! A policy declares which error kinds it covers and what to do with a match:
//! mark handled, continue routing, override redelivery, route to a
//! destination. The resolver walks scopes from innermost to outermost; inside
//! one scope the closest kind match by ancestry distance wins, with
//! declaration order breaking ties. A runtime predicate that rejects the
//! winning candidate falls through to the next candidate in the same scope
//! before the next scope is consulted.

use crate::expression::Predicate;
use crate::processor::SharedProcessor;
use std::sync::Arc;
use std::time::Duration;
use sy_common::{ErrorKind, Exchange, MediationError};

#[derive(Clone)]
pub struct ExceptionPolicy {
    kinds: Vec<ErrorKind>,
    predicate: Option<Arc<dyn Predicate>>,
    handled: bool,
    continued: bool,
    maximum_redeliveries: Option<u32>,
    redelivery_delay: Option<Duration>,
    retry_while: Option<Arc<dyn Predicate>>,
    destination: Option<SharedProcessor>,
}

impl ExceptionPolicy {
    /// Policy covering one error kind and all of its descendants.
    pub fn on(kind: ErrorKind) -> Self {
        Self::on_any_of(vec![kind])
    }

    /// Policy covering several error kinds at once.
    pub fn on_any_of(kinds: Vec<ErrorKind>) -> Self {
        Self {
            kinds,
            predicate: None,
            handled: false,
            continued: false,
            maximum_redeliveries: None,
            redelivery_delay: None,
            retry_while: None,
            destination: None,
        }
    }

    /// Mark matched failures as handled: the exchange completes without a
    /// failure after the destination (if any) runs.
    pub fn handled(mut self, handled: bool) -> Self {
        self.handled = handled;
        self
    }

    /// Swallow the failure and resume routing at the step after the one that
    /// failed.
    pub fn continued(mut self, continued: bool) -> Self {
        self.continued = continued;
        self
    }

    /// Runtime guard evaluated against the failed exchange. A policy whose
    /// guard rejects is skipped during resolution.
    pub fn when(mut self, predicate: Arc<dyn Predicate>) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Override the error handler's redelivery ceiling for matched failures.
    pub fn max_redeliveries(mut self, maximum: u32) -> Self {
        self.maximum_redeliveries = Some(maximum);
        self
    }

    /// Override the error handler's delay between redeliveries.
    pub fn redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay = Some(delay);
        self
    }

    /// Keep redelivering only while this predicate holds, regardless of the
    /// numeric ceiling.
    pub fn retry_while(mut self, predicate: Arc<dyn Predicate>) -> Self {
        self.retry_while = Some(predicate);
        self
    }

    /// Processor the failed exchange is routed to when this policy applies.
    pub fn to(mut self, destination: SharedProcessor) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn is_handled(&self) -> bool {
        self.handled
    }

    pub fn is_continued(&self) -> bool {
        self.continued
    }

    pub fn destination(&self) -> Option<&SharedProcessor> {
        self.destination.as_ref()
    }

    pub fn max_redeliveries_override(&self) -> Option<u32> {
        self.maximum_redeliveries
    }

    pub fn delay_override(&self) -> Option<Duration> {
        self.redelivery_delay
    }

    pub fn retry_while_predicate(&self) -> Option<&Arc<dyn Predicate>> {
        self.retry_while.as_ref()
    }

    /// Smallest ancestry distance from the error's kind to any kind this
    /// policy covers. `None` when no covered kind is an ancestor.
    fn match_distance(&self, error: &MediationError) -> Option<u32> {
        self.kinds
            .iter()
            .filter_map(|kind| error.kind().distance_to(*kind))
            .min()
    }
}

impl std::fmt::Debug for ExceptionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExceptionPolicy")
            .field("kinds", &self.kinds)
            .field("handled", &self.handled)
            .field("continued", &self.continued)
            .field("maximum_redeliveries", &self.maximum_redeliveries)
            .field("has_predicate", &self.predicate.is_some())
            .field("has_destination", &self.destination.is_some())
            .finish()
    }
}

/// One lexical level of policy declarations, inner scopes first in the
/// resolver's scope list.
#[derive(Clone, Debug, Default)]
pub struct PolicyScope {
    policies: Vec<ExceptionPolicy>,
}

impl PolicyScope {
    pub fn new(policies: Vec<ExceptionPolicy>) -> Self {
        Self { policies }
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

/// Resolves the governing policy for a failure, innermost scope first.
#[derive(Clone, Debug, Default)]
pub struct ExceptionPolicyResolver {
    scopes: Vec<PolicyScope>,
}

impl ExceptionPolicyResolver {
    /// Build from scopes ordered innermost to outermost.
    pub fn new(scopes: Vec<PolicyScope>) -> Self {
        Self { scopes }
    }

    pub async fn resolve(
        &self,
        error: &MediationError,
        exchange: &Exchange,
    ) -> Option<&ExceptionPolicy> {
        for scope in &self.scopes {
            // Candidates within a scope, ordered by (distance, declaration).
            let mut candidates: Vec<(u32, usize, &ExceptionPolicy)> = scope
                .policies
                .iter()
                .enumerate()
                .filter_map(|(idx, policy)| {
                    policy.match_distance(error).map(|d| (d, idx, policy))
                })
                .collect();
            candidates.sort_by_key(|(distance, idx, _)| (*distance, *idx));

            for (_, _, policy) in candidates {
                match &policy.predicate {
                    Some(predicate) if !predicate.matches(exchange).await => continue,
                    _ => return Some(policy),
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::predicate;

    fn resolver(scopes: Vec<Vec<ExceptionPolicy>>) -> ExceptionPolicyResolver {
        ExceptionPolicyResolver::new(scopes.into_iter().map(PolicyScope::new).collect())
    }

    #[tokio::test]
    async fn test_most_specific_kind_wins_within_scope() {
        let r = resolver(vec![vec![
            ExceptionPolicy::on(ErrorKind::Any).max_redeliveries(1),
            ExceptionPolicy::on(ErrorKind::Validation).max_redeliveries(9),
            ExceptionPolicy::on(ErrorKind::Processing).max_redeliveries(5),
        ]]);

        let error = MediationError::validation("bad field");
        let exchange = Exchange::with_text("x");
        let hit = r.resolve(&error, &exchange).await.unwrap();
        assert_eq!(hit.max_redeliveries_override(), Some(9));
    }

    #[tokio::test]
    async fn test_declaration_order_breaks_distance_ties() {
        let r = resolver(vec![vec![
            ExceptionPolicy::on(ErrorKind::Transport).max_redeliveries(1),
            ExceptionPolicy::on(ErrorKind::Transport).max_redeliveries(2),
        ]]);

        let error = MediationError::connection("refused");
        let exchange = Exchange::with_text("x");
        let hit = r.resolve(&error, &exchange).await.unwrap();
        assert_eq!(hit.max_redeliveries_override(), Some(1));
    }

    #[tokio::test]
    async fn test_inner_scope_beats_more_specific_outer() {
        let r = resolver(vec![
            vec![ExceptionPolicy::on(ErrorKind::Any).max_redeliveries(1)],
            vec![ExceptionPolicy::on(ErrorKind::Validation).max_redeliveries(9)],
        ]);

        let error = MediationError::validation("bad field");
        let exchange = Exchange::with_text("x");
        let hit = r.resolve(&error, &exchange).await.unwrap();
        assert_eq!(hit.max_redeliveries_override(), Some(1));
    }

    #[tokio::test]
    async fn test_rejected_predicate_falls_to_next_scope() {
        let r = resolver(vec![
            vec![ExceptionPolicy::on(ErrorKind::Any)
                .when(predicate(|_| false))
                .max_redeliveries(1)],
            vec![ExceptionPolicy::on(ErrorKind::Any).max_redeliveries(2)],
        ]);

        let error = MediationError::processing("boom");
        let exchange = Exchange::with_text("x");
        let hit = r.resolve(&error, &exchange).await.unwrap();
        assert_eq!(hit.max_redeliveries_override(), Some(2));
    }

    #[tokio::test]
    async fn test_no_match_yields_none() {
        let r = resolver(vec![vec![ExceptionPolicy::on(ErrorKind::Timeout)]]);
        let error = MediationError::validation("bad field");
        let exchange = Exchange::with_text("x");
        assert!(r.resolve(&error, &exchange).await.is_none());
    }
}
