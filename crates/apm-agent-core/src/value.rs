// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Dynamic values exchanged with instrumented library adapters.
//!
//! Intercepted operations receive positional [`Args`] and return a [`Value`]. A `Value` can
//! carry plain data, an error, a callable [`Function`] (so callbacks can be wrapped in
//! place) or a [`Promise`] (so asynchronous completion can be observed).

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;

use crate::target::{Interceptable, Target, WeakInterceptable};

pub type Args = Vec<Value>;

pub type CallResult = Result<Value, ErrorValue>;

type NativeFn = dyn Fn(&Value, Args) -> CallResult + Send + Sync;

#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Json(serde_json::Value),
    Error(ErrorValue),
    Function(Function),
    Promise(Promise),
    Object(Target),
}

impl Value {
    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// Mirrors the runtime's truthiness: `undefined`, `null`, `false`, `0`, `NaN` and the
    /// empty string are falsy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            _ => true,
        }
    }

    pub fn as_function(&self) -> Option<&Function> {
        match self {
            Value::Function(function) => Some(function),
            _ => None,
        }
    }

    pub fn as_promise(&self) -> Option<&Promise> {
        match self {
            Value::Promise(promise) => Some(promise),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Json(json) => write!(f, "{json}"),
            Value::Error(err) => write!(f, "Error({})", err.message),
            Value::Function(function) => write!(f, "[Function: {}]", function.name()),
            Value::Promise(_) => write!(f, "Promise"),
            Value::Object(target) => write!(f, "[Object: {}]", target.name()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Json(a), Value::Json(b)) => a == b,
            (Value::Error(a), Value::Error(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => a.ptr_eq(b),
            (Value::Promise(a), Value::Promise(b)) => a.ptr_eq(b),
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<ErrorValue> for Value {
    fn from(err: ErrorValue) -> Self {
        Value::Error(err)
    }
}

impl From<Function> for Value {
    fn from(function: Function) -> Self {
        Value::Function(function)
    }
}

impl From<Promise> for Value {
    fn from(promise: Promise) -> Self {
        Value::Promise(promise)
    }
}

/// An error raised or rejected by instrumented code.
#[derive(Debug, Clone, PartialEq, Default, thiserror::Error)]
#[error("{name}: {message}")]
pub struct ErrorValue {
    pub name: String,
    pub message: String,
    pub status_code: Option<u16>,
    pub stack: Option<String>,
}

impl ErrorValue {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            name: "Error".to_string(),
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_status_code(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

/// Where an intercepted method came from, so that [`crate::proxy::Proxy::release`] can put
/// the pre-instrumentation function back. The target is held weakly: it owns the wrapper.
#[derive(Clone)]
pub struct ProxyInfo {
    pub target: Arc<dyn WeakInterceptable>,
    pub method: String,
    pub original: Function,
}

struct FunctionInner {
    name: String,
    arity: usize,
    body: Box<NativeFn>,
    proxied: OnceLock<Function>,
    proxy_info: OnceLock<ProxyInfo>,
}

/// A callable with a name and a declared parameter count.
///
/// Cloning is cheap and clones compare equal under [`Function::ptr_eq`]; identity is what
/// listener registries match on.
#[derive(Clone)]
pub struct Function(Arc<FunctionInner>);

impl Function {
    pub fn new<F>(name: impl Into<String>, arity: usize, body: F) -> Self
    where
        F: Fn(&Value, Args) -> CallResult + Send + Sync + 'static,
    {
        Function(Arc::new(FunctionInner {
            name: name.into(),
            arity,
            body: Box::new(body),
            proxied: OnceLock::new(),
            proxy_info: OnceLock::new(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn arity(&self) -> usize {
        self.0.arity
    }

    pub fn call(&self, this: &Value, args: Args) -> CallResult {
        (self.0.body)(this, args)
    }

    pub fn ptr_eq(&self, other: &Function) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// The user function this wrapper stands in for, if it is a callback wrapper.
    pub fn proxied_original(&self) -> Option<&Function> {
        self.0.proxied.get()
    }

    /// True when `other` is this function or the function it wraps.
    pub fn matches(&self, other: &Function) -> bool {
        self.ptr_eq(other)
            || self
                .proxied_original()
                .is_some_and(|original| original.ptr_eq(other))
            || other
                .proxied_original()
                .is_some_and(|original| original.ptr_eq(self))
    }

    pub fn proxy_info(&self) -> Option<&ProxyInfo> {
        self.0.proxy_info.get()
    }

    pub(crate) fn set_proxied_original(&self, original: Function) {
        let _ = self.0.proxied.set(original);
    }

    pub(crate) fn set_proxy_info(&self, info: ProxyInfo) {
        let _ = self.0.proxy_info.set(info);
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.0.name)
            .field("arity", &self.0.arity)
            .finish()
    }
}

/// A shareable, awaitable eventual result.
#[derive(Clone)]
pub struct Promise(Shared<BoxFuture<'static, CallResult>>);

impl Promise {
    pub fn new<F>(fut: F) -> Self
    where
        F: Future<Output = CallResult> + Send + 'static,
    {
        Promise(fut.boxed().shared())
    }

    pub fn resolved(value: Value) -> Self {
        Self::new(futures::future::ready(Ok(value)))
    }

    pub fn rejected(err: ErrorValue) -> Self {
        Self::new(futures::future::ready(Err(err)))
    }

    pub fn ptr_eq(&self, other: &Promise) -> bool {
        self.0.ptr_eq(&other.0)
    }
}

impl Future for Promise {
    type Output = CallResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.0.poll_unpin(cx)
    }
}
