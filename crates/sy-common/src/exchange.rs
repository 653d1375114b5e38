//! Exchange - the in-flight unit of work
//!
//! An exchange carries an "in" message through the compiled route chain and
//! optionally accumulates an "out" message. Headers are message-scoped and
//! ordered; properties are exchange-scoped. Fan-out creates independent
//! copies, except that an un-cached stream body stays single-read across
//! copies by design.

use crate::error::MediationError;
use crate::uow::UnitOfWork;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

// Well-known header names attached by the engine.
pub const HEADER_REDELIVERY_COUNTER: &str = "sy.redeliveryCounter";
pub const HEADER_REDELIVERED: &str = "sy.redelivered";
pub const HEADER_SPLIT_INDEX: &str = "sy.splitIndex";
pub const HEADER_SPLIT_SIZE: &str = "sy.splitSize";
pub const HEADER_FANOUT_INDEX: &str = "sy.fanoutIndex";

// Well-known exchange property names.
pub const PROPERTY_CORRELATION_ID: &str = "sy.correlationId";
pub const PROPERTY_CAUGHT_EXCEPTION: &str = "sy.caughtException";
pub const PROPERTY_FAILURE_ROUTE_ID: &str = "sy.failureRouteId";

pub type Headers = IndexMap<String, Value>;

/// Message payload. Buffered forms (`Json`, `Bytes`) are independently
/// cloneable; `Stream` is a single-read source unless cached first.
#[derive(Debug, Clone, Default)]
pub enum Body {
    #[default]
    Empty,
    Json(Value),
    Bytes(Bytes),
    Stream(BodyStream),
}

impl Body {
    pub fn text(text: impl Into<String>) -> Self {
        Body::Json(Value::String(text.into()))
    }

    pub fn json(value: Value) -> Self {
        Body::Json(value)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Body::Json(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Body::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Empty)
    }

    /// Buffer a stream body into re-readable `Bytes` in place. No-op for
    /// buffered bodies. Fails if the stream was already consumed.
    pub fn cache(&mut self) -> Result<(), MediationError> {
        if let Body::Stream(stream) = self {
            let buffered = stream.read_all()?;
            *self = Body::Bytes(buffered);
        }
        Ok(())
    }
}

/// Single-read chunked body. Copies created for fan-out share the underlying
/// source, so exactly one reader succeeds; a later read fails
/// deterministically with a stream-consumed error.
#[derive(Clone)]
pub struct BodyStream {
    state: Arc<Mutex<StreamState>>,
}

enum StreamState {
    Ready(Vec<Bytes>),
    Consumed,
}

impl BodyStream {
    pub fn from_chunks(chunks: Vec<Bytes>) -> Self {
        Self {
            state: Arc::new(Mutex::new(StreamState::Ready(chunks))),
        }
    }

    /// Drain the stream into a single buffer. Second call fails.
    pub fn read_all(&self) -> Result<Bytes, MediationError> {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, StreamState::Consumed) {
            StreamState::Ready(chunks) => {
                let mut buf = BytesMut::new();
                for chunk in chunks {
                    buf.extend_from_slice(&chunk);
                }
                Ok(buf.freeze())
            }
            StreamState::Consumed => Err(MediationError::stream_consumed()),
        }
    }

    pub fn is_consumed(&self) -> bool {
        matches!(*self.state.lock(), StreamState::Consumed)
    }
}

impl fmt::Debug for BodyStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match *self.state.lock() {
            StreamState::Ready(ref chunks) => format!("ready({} chunks)", chunks.len()),
            StreamState::Consumed => "consumed".to_string(),
        };
        write!(f, "BodyStream({})", state)
    }
}

/// A message: ordered headers plus a body.
#[derive(Debug, Clone, Default)]
pub struct Message {
    headers: Headers,
    body: Body,
}

impl Message {
    pub fn new(body: Body) -> Self {
        Self {
            headers: Headers::new(),
            body,
        }
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut Body {
        &mut self.body
    }

    pub fn set_body(&mut self, body: Body) {
        self.body = body;
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&Value> {
        self.headers.get(name)
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.headers.insert(name.into(), value.into());
    }

    pub fn remove_header(&mut self, name: &str) -> Option<Value> {
        self.headers.shift_remove(name)
    }
}

/// The unit of work flowing through a route.
///
/// At most one of in/out is the "current" message a downstream stage reads:
/// out supersedes in once a stage produces a distinct result, while in stays
/// untouched for the use-original-message error-handling mode.
#[derive(Debug, Clone)]
pub struct Exchange {
    id: Uuid,
    in_message: Message,
    out_message: Option<Message>,
    properties: IndexMap<String, Value>,
    exception: Option<MediationError>,
    route_id: Option<String>,
    created_at: DateTime<Utc>,
    unit_of_work: Arc<UnitOfWork>,
}

impl Exchange {
    pub fn new(body: Body) -> Self {
        Self {
            id: Uuid::new_v4(),
            in_message: Message::new(body),
            out_message: None,
            properties: IndexMap::new(),
            exception: None,
            route_id: None,
            created_at: Utc::now(),
            unit_of_work: Arc::new(UnitOfWork::new()),
        }
    }

    pub fn with_text(text: impl Into<String>) -> Self {
        Self::new(Body::text(text))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn route_id(&self) -> Option<&str> {
        self.route_id.as_deref()
    }

    pub fn set_route_id(&mut self, route_id: impl Into<String>) {
        self.route_id = Some(route_id.into());
    }

    /// The message a downstream stage should read: out if present, else in.
    pub fn message(&self) -> &Message {
        self.out_message.as_ref().unwrap_or(&self.in_message)
    }

    pub fn message_mut(&mut self) -> &mut Message {
        self.out_message.as_mut().unwrap_or(&mut self.in_message)
    }

    pub fn in_message(&self) -> &Message {
        &self.in_message
    }

    pub fn in_message_mut(&mut self) -> &mut Message {
        &mut self.in_message
    }

    pub fn out_message(&self) -> Option<&Message> {
        self.out_message.as_ref()
    }

    pub fn set_out_message(&mut self, message: Message) {
        self.out_message = Some(message);
    }

    pub fn has_out(&self) -> bool {
        self.out_message.is_some()
    }

    /// Replace the in message, discarding any out message. Used by the error
    /// handler's use-original-message restore.
    pub fn restore_in_message(&mut self, message: Message) {
        self.in_message = message;
        self.out_message = None;
    }

    pub fn body(&self) -> &Body {
        self.message().body()
    }

    pub fn set_body(&mut self, body: Body) {
        self.message_mut().set_body(body);
    }

    pub fn header(&self, name: &str) -> Option<&Value> {
        self.message().header(name)
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.message_mut().set_header(name, value);
    }

    pub fn properties(&self) -> &IndexMap<String, Value> {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    pub fn set_property(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(name.into(), value.into());
    }

    pub fn exception(&self) -> Option<&MediationError> {
        self.exception.as_ref()
    }

    pub fn set_exception(&mut self, error: MediationError) {
        self.exception = Some(error);
    }

    pub fn clear_exception(&mut self) -> Option<MediationError> {
        self.exception.take()
    }

    pub fn is_failed(&self) -> bool {
        self.exception.is_some()
    }

    pub fn unit_of_work(&self) -> &Arc<UnitOfWork> {
        &self.unit_of_work
    }

    /// Create an independent copy for one fan-out branch. The copy gets a
    /// fresh id, the parent's current message as its in message, copied
    /// properties and a correlation property pointing back at the parent.
    /// Buffered bodies copy deeply; an un-cached stream body keeps sharing its
    /// single-read source.
    pub fn copy_for_fanout(&self, share_unit_of_work: bool) -> Exchange {
        let mut copy = Exchange {
            id: Uuid::new_v4(),
            in_message: self.message().clone(),
            out_message: None,
            properties: self.properties.clone(),
            exception: None,
            route_id: self.route_id.clone(),
            created_at: Utc::now(),
            unit_of_work: if share_unit_of_work {
                self.unit_of_work.clone()
            } else {
                Arc::new(UnitOfWork::new())
            },
        };
        copy.set_property(PROPERTY_CORRELATION_ID, self.id.to_string());
        copy
    }

    /// Buffer any stream body on the current message so it becomes
    /// re-readable. Called by the pipeline when stream caching is enabled.
    pub fn cache_stream(&mut self) -> Result<(), MediationError> {
        self.message_mut().body_mut().cache()
    }

    /// Current redelivery counter as seen by downstream stages.
    pub fn redelivery_count(&self) -> u64 {
        self.message()
            .header(HEADER_REDELIVERY_COUNTER)
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_supersedes_in() {
        let mut exchange = Exchange::with_text("original");
        assert_eq!(exchange.body().as_text(), Some("original"));

        exchange.set_out_message(Message::new(Body::text("result")));
        assert_eq!(exchange.body().as_text(), Some("result"));
        assert_eq!(exchange.in_message().body().as_text(), Some("original"));
    }

    #[test]
    fn test_fanout_copy_is_independent() {
        let mut parent = Exchange::with_text("payload");
        parent.set_header("shared", "before");

        let mut child = parent.copy_for_fanout(false);
        child.set_header("shared", "after");
        child.set_body(Body::text("mutated"));

        assert_eq!(parent.header("shared").unwrap(), "before");
        assert_eq!(parent.body().as_text(), Some("payload"));
        assert_ne!(parent.id(), child.id());
        assert_eq!(
            child.property(PROPERTY_CORRELATION_ID).unwrap(),
            &Value::String(parent.id().to_string())
        );
    }

    #[test]
    fn test_stream_body_single_read() {
        let stream = BodyStream::from_chunks(vec![Bytes::from("ab"), Bytes::from("cd")]);
        let first = stream.read_all().unwrap();
        assert_eq!(&first[..], b"abcd");

        let second = stream.read_all();
        assert!(second.is_err());
        assert!(stream.is_consumed());
    }

    #[test]
    fn test_shared_stream_only_one_reader_wins() {
        let parent = Exchange::new(Body::Stream(BodyStream::from_chunks(vec![Bytes::from(
            "payload",
        )])));
        let child = parent.copy_for_fanout(false);

        let child_read = match child.body() {
            Body::Stream(s) => s.read_all(),
            _ => panic!("expected stream body"),
        };
        assert!(child_read.is_ok());

        let parent_read = match parent.body() {
            Body::Stream(s) => s.read_all(),
            _ => panic!("expected stream body"),
        };
        assert!(parent_read.is_err());
    }

    #[test]
    fn test_cached_stream_is_rereadable() {
        let mut exchange = Exchange::new(Body::Stream(BodyStream::from_chunks(vec![
            Bytes::from("hello"),
        ])));
        exchange.cache_stream().unwrap();

        for _ in 0..2 {
            match exchange.body() {
                Body::Bytes(b) => assert_eq!(&b[..], b"hello"),
                other => panic!("expected bytes body, got {:?}", other),
            }
        }
    }
}
