//! Server-side dispatch of method calls to an implementation.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::context::CallContext;
use crate::error::{Error, Result, code};
use crate::protocol::{BodyCodec, Payload};

/// A named service object served by a [`Server`](crate::Server).
///
/// Errors returned here are sent to the caller as `(code, desc)`; use
/// [`Error::application`] to choose the code.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Handle one call.
    async fn call(
        &self,
        ctx: CallContext,
        codec: BodyCodec,
        method: &str,
        body: Vec<u8>,
    ) -> Result<Vec<u8>>;
}

type Handler<T> = Box<
    dyn Fn(Arc<T>, CallContext, BodyCodec, Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>>>
        + Send
        + Sync,
>;

/// Dispatch table mapping method names to async functions over a shared
/// implementation.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use wirecall_rpc::{CallContext, MethodRouter, Result};
/// # #[derive(Clone, PartialEq, prost::Message, serde::Serialize, serde::Deserialize)]
/// # struct Hello { #[prost(string, tag = "1")] name: String }
/// struct Greeter;
///
/// let router = MethodRouter::new(Greeter).unary(
///     "SayHello",
///     |_greeter: Arc<Greeter>, _ctx: CallContext, req: Hello| async move {
///         Result::Ok(Hello { name: format!("hello {}", req.name) })
///     },
/// );
/// ```
pub struct MethodRouter<T> {
    implementation: Arc<T>,
    methods: HashMap<String, Handler<T>>,
}

impl<T> MethodRouter<T>
where
    T: Send + Sync + 'static,
{
    /// Create an empty router over `implementation`.
    #[must_use]
    pub fn new(implementation: T) -> Self {
        Self::from_arc(Arc::new(implementation))
    }

    /// Create an empty router over a shared implementation.
    #[must_use]
    pub fn from_arc(implementation: Arc<T>) -> Self {
        Self {
            implementation,
            methods: HashMap::new(),
        }
    }

    /// Register a method working on raw bodies.
    #[must_use]
    pub fn raw<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Arc<T>, CallContext, BodyCodec, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<u8>>> + Send + 'static,
    {
        let boxed: Handler<T> = Box::new(
            move |implementation: Arc<T>,
                  ctx: CallContext,
                  codec: BodyCodec,
                  body: Vec<u8>|
                  -> BoxFuture<'static, Result<Vec<u8>>> {
                Box::pin(handler(implementation, ctx, codec, body))
            },
        );
        self.methods.insert(name.into(), boxed);
        self
    }

    /// Register a method with a typed request and response, decoded and
    /// encoded with the codec the caller asked for.
    #[must_use]
    pub fn unary<Req, Resp, F, Fut>(self, name: impl Into<String>, handler: F) -> Self
    where
        Req: Payload,
        Resp: Payload,
        F: Fn(Arc<T>, CallContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
    {
        let handler = Arc::new(handler);

        self.raw(name, move |implementation, ctx, codec, body| {
            let handler = Arc::clone(&handler);
            async move {
                let request: Req = codec.unmarshal(&body)?;
                let response = handler(implementation, ctx, request).await?;
                codec.marshal(&response)
            }
        })
    }

    /// Registered method names.
    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }
}

#[async_trait]
impl<T> Service for MethodRouter<T>
where
    T: Send + Sync + 'static,
{
    async fn call(
        &self,
        ctx: CallContext,
        codec: BodyCodec,
        method: &str,
        body: Vec<u8>,
    ) -> Result<Vec<u8>> {
        let Some(handler) = self.methods.get(method) else {
            return Err(Error::application(
                code::METHOD_NOT_FOUND,
                format!("method not found: {method}"),
            ));
        };

        handler(Arc::clone(&self.implementation), ctx, codec, body).await
    }
}
