//! Processor - the executable unit of one pipeline stage
//!
//! Every route step compiles down to a processor. A processor that completes
//! without suspending is a synchronous completion; one that awaits is an
//! asynchronous completion resumed on the runtime's worker pool. Wrappers
//! simply await their delegate, so the completion contract holds transitively
//! by construction.

use crate::expression::Expression;
use async_trait::async_trait;
use std::sync::Arc;
use sy_common::{Body, Exchange, MediationError};

#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), MediationError>;
}

pub type SharedProcessor = Arc<dyn Processor>;

struct FnProcessor<F>(F);

#[async_trait]
impl<F> Processor for FnProcessor<F>
where
    F: Fn(&mut Exchange) -> Result<(), MediationError> + Send + Sync,
{
    async fn process(&self, exchange: &mut Exchange) -> Result<(), MediationError> {
        (self.0)(exchange)
    }
}

/// Wrap a closure as a [`Processor`].
pub fn processor<F>(f: F) -> SharedProcessor
where
    F: Fn(&mut Exchange) -> Result<(), MediationError> + Send + Sync + 'static,
{
    Arc::new(FnProcessor(f))
}

/// Sets the current message body from an expression result.
pub struct SetBodyProcessor {
    expression: Arc<dyn Expression>,
}

impl SetBodyProcessor {
    pub fn new(expression: Arc<dyn Expression>) -> Self {
        Self { expression }
    }
}

#[async_trait]
impl Processor for SetBodyProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), MediationError> {
        let value = self.expression.evaluate(exchange).await?;
        exchange.set_body(Body::Json(value));
        Ok(())
    }
}

/// Sets one header on the current message from an expression result.
pub struct SetHeaderProcessor {
    name: String,
    expression: Arc<dyn Expression>,
}

impl SetHeaderProcessor {
    pub fn new(name: impl Into<String>, expression: Arc<dyn Expression>) -> Self {
        Self {
            name: name.into(),
            expression,
        }
    }
}

#[async_trait]
impl Processor for SetHeaderProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), MediationError> {
        let value = self.expression.evaluate(exchange).await?;
        exchange.set_header(self.name.clone(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::constant;

    #[tokio::test]
    async fn test_set_body() {
        let stage = SetBodyProcessor::new(constant("replaced"));
        let mut exchange = Exchange::with_text("original");
        stage.process(&mut exchange).await.unwrap();
        assert_eq!(exchange.body().as_text(), Some("replaced"));
    }

    #[tokio::test]
    async fn test_set_header() {
        let stage = SetHeaderProcessor::new("tag", constant(7));
        let mut exchange = Exchange::with_text("x");
        stage.process(&mut exchange).await.unwrap();
        assert_eq!(exchange.header("tag").unwrap(), 7);
    }

    #[tokio::test]
    async fn test_closure_processor_error_propagates() {
        let failing = processor(|_ex| Err(MediationError::processing("boom")));
        let mut exchange = Exchange::with_text("x");
        let result = failing.process(&mut exchange).await;
        assert!(result.is_err());
    }
}
