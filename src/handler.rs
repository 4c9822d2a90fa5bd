//! Pluggable business logic run once per delivery attempt.
//!
//! Handlers are looked up by event type; unknown types go to the fallback
//! handler, so dispatch never fails because a type is unrecognized.
//! Handlers may run more than once for the same event (redelivery after a
//! lease expires) and must tolerate that.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::HandlerError;

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event_type: &str, payload: &Value) -> Result<(), HandlerError>;
}

/// Adapter turning an async closure into an [`EventHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(String, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, event_type: &str, payload: &Value) -> Result<(), HandlerError> {
        (self.0)(event_type.to_string(), payload.clone()).await
    }
}

/// Maps event types to handlers, with a fallback for everything else.
#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
    fallback: Arc<dyn EventHandler>,
}

impl HandlerRegistry {
    /// Empty registry; every event goes to `fallback`.
    pub fn new(fallback: impl EventHandler + 'static) -> Self {
        Self {
            handlers: HashMap::new(),
            fallback: Arc::new(fallback),
        }
    }

    /// Logging handlers for `payment.succeeded`, `order.created`,
    /// `user.created` and a generic fallback.
    pub fn with_default_handlers() -> Self {
        Self::new(GenericHandler)
            .with_handler("payment.succeeded", PaymentSucceededHandler)
            .with_handler("order.created", OrderCreatedHandler)
            .with_handler("user.created", UserCreatedHandler)
    }

    pub fn with_handler(mut self, event_type: impl Into<String>, handler: impl EventHandler + 'static) -> Self {
        self.register(event_type, handler);
        self
    }

    pub fn register(&mut self, event_type: impl Into<String>, handler: impl EventHandler + 'static) {
        self.handlers.insert(event_type.into(), Arc::new(handler));
    }

    pub fn register_fn<F, Fut>(&mut self, event_type: impl Into<String>, f: F)
    where
        F: Fn(String, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.register(event_type, FnHandler(f));
    }

    pub fn set_fallback(&mut self, handler: impl EventHandler + 'static) {
        self.fallback = Arc::new(handler);
    }

    pub fn resolve(&self, event_type: &str) -> &Arc<dyn EventHandler> {
        self.handlers.get(event_type).unwrap_or(&self.fallback)
    }

    pub async fn dispatch(&self, event_type: &str, payload: &Value) -> Result<(), HandlerError> {
        self.resolve(event_type).handle(event_type, payload).await
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_default_handlers()
    }
}

static NULL: Value = Value::Null;

fn field<'a>(payload: &'a Value, key: &str) -> &'a Value {
    payload
        .get(key)
        .or_else(|| payload.get("data").and_then(|d| d.get(key)))
        .unwrap_or(&NULL)
}

pub struct PaymentSucceededHandler;

#[async_trait]
impl EventHandler for PaymentSucceededHandler {
    async fn handle(&self, _event_type: &str, payload: &Value) -> Result<(), HandlerError> {
        tracing::info!(amount = %field(payload, "amount"), "processing payment success");
        Ok(())
    }
}

pub struct OrderCreatedHandler;

#[async_trait]
impl EventHandler for OrderCreatedHandler {
    async fn handle(&self, _event_type: &str, payload: &Value) -> Result<(), HandlerError> {
        tracing::info!(order_id = %field(payload, "orderId"), "processing order creation");
        Ok(())
    }
}

pub struct UserCreatedHandler;

#[async_trait]
impl EventHandler for UserCreatedHandler {
    async fn handle(&self, _event_type: &str, payload: &Value) -> Result<(), HandlerError> {
        tracing::info!(user_id = %field(payload, "userId"), "processing user creation");
        Ok(())
    }
}

pub struct GenericHandler;

#[async_trait]
impl EventHandler for GenericHandler {
    async fn handle(&self, event_type: &str, _payload: &Value) -> Result<(), HandlerError> {
        tracing::info!(event_type, "processing generic event");
        Ok(())
    }
}
