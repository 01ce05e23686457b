//! Client handles.

use std::sync::Arc;

use async_trait::async_trait;
use rmpv::Value;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::context::Context;
use crate::dispatch::{SendNotifier, TagsFunc};
use crate::error::{Result, RpcError};
use crate::message::{decode_value, encode_value, CompressionType};
use crate::transport::Transport;

/// Turns the error field of a `Response` into an error.
pub trait ErrorUnwrapper: Send + Sync {
    /// `Ok(None)` when the value means success and `Ok(Some(e))` for an
    /// application error. `Err` means the value itself could not be
    /// understood.
    fn unwrap_error(&self, value: Value) -> Result<Option<RpcError>>;
}

/// Nil means success; a string becomes [`RpcError::Remote`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StringErrorUnwrapper;

impl ErrorUnwrapper for StringErrorUnwrapper {
    fn unwrap_error(&self, value: Value) -> Result<Option<RpcError>> {
        match value {
            Value::Nil => Ok(None),
            Value::String(s) => Ok(Some(RpcError::Remote(
                s.into_str().unwrap_or_else(|| "invalid utf-8 in error".to_string()),
            ))),
            other => Err(RpcError::FieldDecode {
                index: 2,
                reason: format!("cannot unwrap error value {}", other),
            }),
        }
    }
}

/// Object-safe calling surface shared by [`Client`] and the retrying
/// client of a [`Connection`](crate::connection::Connection).
#[async_trait]
pub trait GenericClient: Send + Sync {
    async fn call_value(
        &self,
        ctx: &Context,
        method: &str,
        arg: Value,
        compression: CompressionType,
    ) -> Result<Value>;

    async fn notify_value(&self, ctx: &Context, method: &str, arg: Value) -> Result<()>;
}

/// Typed helpers over any [`GenericClient`].
#[async_trait]
pub trait GenericClientExt: GenericClient {
    async fn call<A, R>(&self, ctx: &Context, method: &str, arg: &A) -> Result<R>
    where
        A: Serialize + Sync + ?Sized,
        R: DeserializeOwned + Send,
    {
        let arg = encode_value(arg)?;
        decode_value(self.call_value(ctx, method, arg, CompressionType::None).await?)
    }

    async fn call_compressed<A, R>(
        &self,
        ctx: &Context,
        method: &str,
        arg: &A,
        compression: CompressionType,
    ) -> Result<R>
    where
        A: Serialize + Sync + ?Sized,
        R: DeserializeOwned + Send,
    {
        let arg = encode_value(arg)?;
        decode_value(self.call_value(ctx, method, arg, compression).await?)
    }

    async fn notify<A>(&self, ctx: &Context, method: &str, arg: &A) -> Result<()>
    where
        A: Serialize + Sync + ?Sized,
    {
        let arg = encode_value(arg)?;
        self.notify_value(ctx, method, arg).await
    }
}

impl<T: GenericClient + ?Sized> GenericClientExt for T {}

/// Lightweight handle bound to one transport's dispatcher.
#[derive(Clone)]
pub struct Client {
    transport: Transport,
    unwrapper: Arc<dyn ErrorUnwrapper>,
    tags: Option<TagsFunc>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Builds a client and starts the transport's receive loop.
    pub fn new(
        transport: &Transport,
        unwrapper: Option<Arc<dyn ErrorUnwrapper>>,
        tags: Option<TagsFunc>,
    ) -> Self {
        transport.start_receiving();
        Self {
            transport: transport.clone(),
            unwrapper: unwrapper.unwrap_or_else(|| Arc::new(StringErrorUnwrapper)),
            tags,
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Calls `method`, invoking `sent` once the frame is on the wire.
    pub async fn call_with_notifier(
        &self,
        ctx: &Context,
        method: &str,
        arg: Value,
        compression: CompressionType,
        sent: Option<SendNotifier>,
    ) -> Result<Value> {
        self.transport
            .dispatcher()
            .call(
                ctx,
                method,
                arg,
                compression,
                self.unwrapper.as_ref(),
                self.tags.as_ref(),
                sent,
            )
            .await
    }

    pub async fn notify_with_notifier(
        &self,
        ctx: &Context,
        method: &str,
        arg: Value,
        sent: Option<SendNotifier>,
    ) -> Result<()> {
        self.transport
            .dispatcher()
            .notify(ctx, method, arg, self.tags.as_ref(), sent)
            .await
    }
}

#[async_trait]
impl GenericClient for Client {
    async fn call_value(
        &self,
        ctx: &Context,
        method: &str,
        arg: Value,
        compression: CompressionType,
    ) -> Result<Value> {
        self.call_with_notifier(ctx, method, arg, compression, None)
            .await
    }

    async fn notify_value(&self, ctx: &Context, method: &str, arg: Value) -> Result<()> {
        self.notify_with_notifier(ctx, method, arg, None).await
    }
}
