//! Protocols, handler descriptions and the registry that resolves
//! `"protocol.method"` names.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};

use rmpv::Value;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::context::Context;
use crate::error::{Result, RpcError};
use crate::message::{decode_value, encode_value};

/// Future returned by a type-erased handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;

/// Maps a handler error to the value sent in the `Response` error field.
pub type WrapErrorFunc = Arc<dyn Fn(&RpcError) -> Value + Send + Sync>;

type MakeArgFn = Arc<dyn Fn() -> Box<dyn DecodeTarget> + Send + Sync>;
type HandlerFn = Arc<dyn Fn(Context, Box<dyn Any + Send>) -> HandlerFuture + Send + Sync>;

/// Renders an error as its message string.
pub fn default_wrap_error(err: &RpcError) -> Value {
    Value::from(err.to_string())
}

/// Whether a method answers with a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodType {
    Call,
    Notify,
}

impl fmt::Display for MethodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodType::Call => write!(f, "call"),
            MethodType::Notify => write!(f, "notify"),
        }
    }
}

/// A pre-typed destination for an incoming argument.
pub trait DecodeTarget: Send {
    fn decode(&mut self, value: Value) -> Result<()>;

    /// The decoded argument, handed to the handler.
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

struct Typed<T>(Option<T>);

impl<T: DeserializeOwned + Send + 'static> DecodeTarget for Typed<T> {
    fn decode(&mut self, value: Value) -> Result<()> {
        self.0 = Some(decode_value(value)?);
        Ok(())
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        match self.0 {
            Some(v) => Box::new(v),
            None => Box::new(()),
        }
    }
}

/// Argument factory, handler and call kind for one method.
#[derive(Clone)]
pub struct HandlerDescription {
    make_arg: MakeArgFn,
    handler: HandlerFn,
    method_type: MethodType,
}

impl fmt::Debug for HandlerDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerDescription")
            .field("method_type", &self.method_type)
            .finish_non_exhaustive()
    }
}

impl HandlerDescription {
    /// Builds from raw parts. The handler must accept whatever `make_arg`'s
    /// target yields from `into_any`.
    pub fn from_parts<M, H>(make_arg: M, handler: H, method_type: MethodType) -> Self
    where
        M: Fn() -> Box<dyn DecodeTarget> + Send + Sync + 'static,
        H: Fn(Context, Box<dyn Any + Send>) -> HandlerFuture + Send + Sync + 'static,
    {
        Self {
            make_arg: Arc::new(make_arg),
            handler: Arc::new(handler),
            method_type,
        }
    }

    /// A method that answers with the serialized result of `f`.
    pub fn call<A, R, F, Fut>(f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(Context, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        Self::from_parts(
            || -> Box<dyn DecodeTarget> { Box::new(Typed::<A>(None)) },
            move |ctx: Context, arg: Box<dyn Any + Send>| -> HandlerFuture {
                match arg.downcast::<A>() {
                    Ok(arg) => {
                        let fut = f(ctx, *arg);
                        Box::pin(async move { encode_value(&fut.await?) })
                    }
                    Err(_) => Box::pin(async { Err(type_mismatch::<A>()) }),
                }
            },
            MethodType::Call,
        )
    }

    /// A fire-and-forget method.
    pub fn notify<A, F, Fut>(f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        F: Fn(Context, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self::from_parts(
            || -> Box<dyn DecodeTarget> { Box::new(Typed::<A>(None)) },
            move |ctx: Context, arg: Box<dyn Any + Send>| -> HandlerFuture {
                match arg.downcast::<A>() {
                    Ok(arg) => {
                        let fut = f(ctx, *arg);
                        Box::pin(async move {
                            fut.await?;
                            Ok(Value::Nil)
                        })
                    }
                    Err(_) => Box::pin(async { Err(type_mismatch::<A>()) }),
                }
            },
            MethodType::Notify,
        )
    }

    pub fn method_type(&self) -> MethodType {
        self.method_type
    }

    /// A fresh decode target for this method's argument.
    pub fn make_arg(&self) -> Box<dyn DecodeTarget> {
        (self.make_arg)()
    }

    /// Runs the handler on a decoded argument.
    pub fn invoke(&self, ctx: Context, arg: Box<dyn DecodeTarget>) -> HandlerFuture {
        (self.handler)(ctx, arg.into_any())
    }
}

fn type_mismatch<A>() -> RpcError {
    RpcError::TypeMismatch {
        expected: std::any::type_name::<A>(),
    }
}

/// A named set of methods.
#[derive(Clone)]
pub struct Protocol {
    name: String,
    methods: HashMap<String, HandlerDescription>,
    wrap_error: Option<WrapErrorFunc>,
}

impl fmt::Debug for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut methods: Vec<&String> = self.methods.keys().collect();
        methods.sort();
        f.debug_struct("Protocol")
            .field("name", &self.name)
            .field("methods", &methods)
            .finish()
    }
}

impl Protocol {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: HashMap::new(),
            wrap_error: None,
        }
    }

    pub fn with_method(mut self, method: impl Into<String>, handler: HandlerDescription) -> Self {
        self.methods.insert(method.into(), handler);
        self
    }

    /// Overrides the server's error wrapping for this protocol's methods.
    pub fn with_wrap_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&RpcError) -> Value + Send + Sync + 'static,
    {
        self.wrap_error = Some(Arc::new(f));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn method(&self, method: &str) -> Option<&HandlerDescription> {
        self.methods.get(method)
    }

    pub fn wrap_error(&self) -> Option<&WrapErrorFunc> {
        self.wrap_error.as_ref()
    }
}

/// Splits `"a.b.method"` into `("a.b", "method")`. A name without a dot
/// has an empty protocol.
pub fn split_method_name(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(i) => (&name[..i], &name[i + 1..]),
        None => ("", name),
    }
}

/// Registered protocols of one transport.
#[derive(Debug, Default)]
pub struct ProtocolRegistry {
    protocols: RwLock<HashMap<String, Arc<Protocol>>>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, protocol: Protocol) -> Result<()> {
        let mut protocols = self
            .protocols
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if protocols.contains_key(&protocol.name) {
            return Err(RpcError::AlreadyRegistered(protocol.name));
        }
        protocols.insert(protocol.name.clone(), Arc::new(protocol));
        Ok(())
    }

    /// Resolves a full method name to its handler and the protocol's
    /// error wrapper, if it set one.
    pub fn find_handler(&self, name: &str) -> Result<(HandlerDescription, Option<WrapErrorFunc>)> {
        let (protocol, method) = split_method_name(name);
        let protocols = self
            .protocols
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let p = protocols
            .get(protocol)
            .ok_or_else(|| RpcError::ProtocolNotFound(protocol.to_string()))?;
        let handler = p.method(method).ok_or_else(|| RpcError::MethodNotFound {
            protocol: protocol.to_string(),
            method: method.to_string(),
        })?;
        Ok((handler.clone(), p.wrap_error.clone()))
    }

    /// Builds the decode target for `name`'s argument.
    pub fn make_argument(&self, name: &str) -> Result<Box<dyn DecodeTarget>> {
        let (handler, _) = self.find_handler(name)?;
        Ok(handler.make_arg())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.protocols
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Hello {
        name: String,
    }

    fn hello_protocol() -> Protocol {
        Protocol::new("keybase.1.test")
            .with_method(
                "hello",
                HandlerDescription::call(|_ctx, arg: Hello| async move {
                    Ok(format!("hello {}", arg.name))
                }),
            )
            .with_method(
                "ping",
                HandlerDescription::notify(|_ctx, _arg: Value| async { Ok(()) }),
            )
    }

    #[test]
    fn test_split_on_last_dot() {
        assert_eq!(split_method_name("keybase.1.test.hello"), ("keybase.1.test", "hello"));
        assert_eq!(split_method_name("abc.x"), ("abc", "x"));
        assert_eq!(split_method_name("nodot"), ("", "nodot"));
    }

    #[test]
    fn test_register_twice_fails() {
        let registry = ProtocolRegistry::new();
        registry.register(hello_protocol()).unwrap();
        let err = registry.register(hello_protocol()).unwrap_err();
        assert!(matches!(err, RpcError::AlreadyRegistered(ref n) if n == "keybase.1.test"));
    }

    #[test]
    fn test_find_handler_errors_name_the_missing_part() {
        let registry = ProtocolRegistry::new();
        registry.register(hello_protocol()).unwrap();
        assert!(matches!(
            registry.find_handler("other.hello"),
            Err(RpcError::ProtocolNotFound(ref p)) if p == "other"
        ));
        match registry.find_handler("keybase.1.test.missing") {
            Err(RpcError::MethodNotFound { protocol, method }) => {
                assert_eq!(protocol, "keybase.1.test");
                assert_eq!(method, "missing");
            }
            other => panic!("unexpected {:?}", other.map(|(h, _)| h)),
        }
        assert!(registry.make_argument("nope.x").is_err());
    }

    #[test]
    fn test_method_types() {
        let registry = ProtocolRegistry::new();
        registry.register(hello_protocol()).unwrap();
        let (call, _) = registry.find_handler("keybase.1.test.hello").unwrap();
        let (notify, _) = registry.find_handler("keybase.1.test.ping").unwrap();
        assert_eq!(call.method_type(), MethodType::Call);
        assert_eq!(notify.method_type(), MethodType::Notify);
    }

    #[tokio::test]
    async fn test_typed_call_decodes_and_invokes() {
        let registry = ProtocolRegistry::new();
        registry.register(hello_protocol()).unwrap();
        let (handler, wrap) = registry.find_handler("keybase.1.test.hello").unwrap();
        assert!(wrap.is_none());
        let mut arg = handler.make_arg();
        arg.decode(Value::Map(vec![(Value::from("name"), Value::from("bob"))]))
            .unwrap();
        let out = handler.invoke(Context::background(), arg).await.unwrap();
        assert_eq!(out, Value::from("hello bob"));
    }

    #[test]
    fn test_decode_failure_is_field_error() {
        let registry = ProtocolRegistry::new();
        registry.register(hello_protocol()).unwrap();
        let mut arg = registry.make_argument("keybase.1.test.hello").unwrap();
        let err = arg.decode(Value::from(12)).unwrap_err();
        assert!(matches!(err, RpcError::FieldDecode { .. }));
    }

    #[tokio::test]
    async fn test_undecoded_argument_is_type_mismatch() {
        let registry = ProtocolRegistry::new();
        registry.register(hello_protocol()).unwrap();
        let (handler, _) = registry.find_handler("keybase.1.test.hello").unwrap();
        let err = handler
            .invoke(Context::background(), handler.make_arg())
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::TypeMismatch { .. }));
    }

    #[test]
    fn test_protocol_wrap_error_is_returned() {
        let registry = ProtocolRegistry::new();
        registry
            .register(hello_protocol().with_wrap_error(|_| Value::from("wrapped")))
            .unwrap();
        let (_, wrap) = registry.find_handler("keybase.1.test.hello").unwrap();
        assert_eq!(wrap.unwrap()(&RpcError::Eof), Value::from("wrapped"));
    }
}
