//! Expression and Predicate contracts
//!
//! The engine treats these as opaque value/boolean producers supplied by the
//! route author: choice/filter conditions, split expressions, retry-while
//! predicates. Closure adapters cover the common case.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use sy_common::{Exchange, MediationError};

/// Produces a value from the current state of an exchange.
#[async_trait]
pub trait Expression: Send + Sync {
    async fn evaluate(&self, exchange: &Exchange) -> Result<Value, MediationError>;
}

/// Produces a boolean from the current state of an exchange.
#[async_trait]
pub trait Predicate: Send + Sync {
    async fn matches(&self, exchange: &Exchange) -> bool;
}

struct FnExpression<F>(F);

#[async_trait]
impl<F> Expression for FnExpression<F>
where
    F: Fn(&Exchange) -> Result<Value, MediationError> + Send + Sync,
{
    async fn evaluate(&self, exchange: &Exchange) -> Result<Value, MediationError> {
        (self.0)(exchange)
    }
}

struct FnPredicate<F>(F);

#[async_trait]
impl<F> Predicate for FnPredicate<F>
where
    F: Fn(&Exchange) -> bool + Send + Sync,
{
    async fn matches(&self, exchange: &Exchange) -> bool {
        (self.0)(exchange)
    }
}

struct ConstantExpression(Value);

#[async_trait]
impl Expression for ConstantExpression {
    async fn evaluate(&self, _exchange: &Exchange) -> Result<Value, MediationError> {
        Ok(self.0.clone())
    }
}

/// Wrap a closure as an [`Expression`].
pub fn expression<F>(f: F) -> Arc<dyn Expression>
where
    F: Fn(&Exchange) -> Result<Value, MediationError> + Send + Sync + 'static,
{
    Arc::new(FnExpression(f))
}

/// Wrap a closure as a [`Predicate`].
pub fn predicate<F>(f: F) -> Arc<dyn Predicate>
where
    F: Fn(&Exchange) -> bool + Send + Sync + 'static,
{
    Arc::new(FnPredicate(f))
}

/// An expression that always yields the given value.
pub fn constant(value: impl Into<Value>) -> Arc<dyn Expression> {
    Arc::new(ConstantExpression(value.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sy_common::Body;

    #[tokio::test]
    async fn test_closure_expression_sees_exchange() {
        let expr = expression(|ex| {
            Ok(Value::String(
                ex.body().as_text().unwrap_or_default().to_uppercase(),
            ))
        });
        let exchange = Exchange::with_text("hello");
        assert_eq!(expr.evaluate(&exchange).await.unwrap(), "HELLO");
    }

    #[tokio::test]
    async fn test_constant_expression() {
        let expr = constant(42);
        let exchange = Exchange::new(Body::Empty);
        assert_eq!(expr.evaluate(&exchange).await.unwrap(), 42);
    }
}
