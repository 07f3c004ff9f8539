// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Interception targets.
//!
//! Library adapters expose the operations they allow to be observed through
//! [`Interceptable`]: a table of named methods and property getters that the proxy can swap
//! out and later restore. [`Target`] is the ready-made table most adapters use.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use crate::value::{Args, CallResult, ErrorValue, Function, Value};

pub trait Interceptable: Send + Sync {
    fn name(&self) -> &str;

    fn method(&self, name: &str) -> Option<Function>;

    fn set_method(&self, name: &str, function: Function);

    fn getter(&self, prop: &str) -> Option<Function>;

    fn set_getter(&self, prop: &str, function: Function);

    /// A handle that does not keep the target alive. Installed wrappers hold one to find
    /// their way back on release.
    fn downgrade(&self) -> Arc<dyn WeakInterceptable>;
}

/// Non-owning counterpart of an [`Interceptable`].
pub trait WeakInterceptable: Send + Sync {
    /// The target, if it is still alive.
    fn upgrade(&self) -> Option<Box<dyn Interceptable>>;
}

#[derive(Default)]
struct TargetInner {
    name: String,
    methods: Mutex<HashMap<String, Function>>,
    getters: Mutex<HashMap<String, Function>>,
}

/// A named method table. Clones share the same table.
#[derive(Clone, Default)]
pub struct Target(Arc<TargetInner>);

impl Target {
    pub fn new(name: impl Into<String>) -> Self {
        Target(Arc::new(TargetInner {
            name: name.into(),
            ..Default::default()
        }))
    }

    pub fn define<F>(self, method: &str, arity: usize, body: F) -> Self
    where
        F: Fn(&Value, Args) -> CallResult + Send + Sync + 'static,
    {
        self.set_method(method, Function::new(method, arity, body));
        self
    }

    pub fn define_getter<F>(self, prop: &str, body: F) -> Self
    where
        F: Fn(&Value) -> CallResult + Send + Sync + 'static,
    {
        self.set_getter(prop, Function::new(prop, 0, move |this, _| body(this)));
        self
    }

    /// Invokes `method` with this target as the receiver.
    pub fn call(&self, method: &str, args: Args) -> CallResult {
        let function = self
            .method(method)
            .ok_or_else(|| ErrorValue::new(format!("{}.{method} is not a function", self.0.name)))?;
        function.call(&Value::Object(self.clone()), args)
    }

    /// Reads `prop` through its getter.
    pub fn get(&self, prop: &str) -> CallResult {
        match self.getter(prop) {
            Some(getter) => getter.call(&Value::Object(self.clone()), Vec::new()),
            None => Ok(Value::Undefined),
        }
    }

    pub fn ptr_eq(&self, other: &Target) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

struct WeakTarget(Weak<TargetInner>);

impl WeakInterceptable for WeakTarget {
    fn upgrade(&self) -> Option<Box<dyn Interceptable>> {
        self.0
            .upgrade()
            .map(|inner| Box::new(Target(inner)) as Box<dyn Interceptable>)
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target").field("name", &self.0.name).finish()
    }
}

impl Interceptable for Target {
    fn name(&self) -> &str {
        &self.0.name
    }

    fn method(&self, name: &str) -> Option<Function> {
        #[allow(clippy::expect_used)]
        self.0
            .methods
            .lock()
            .expect("lock poisoned")
            .get(name)
            .cloned()
    }

    fn set_method(&self, name: &str, function: Function) {
        #[allow(clippy::expect_used)]
        self.0
            .methods
            .lock()
            .expect("lock poisoned")
            .insert(name.to_string(), function);
    }

    fn getter(&self, prop: &str) -> Option<Function> {
        #[allow(clippy::expect_used)]
        self.0
            .getters
            .lock()
            .expect("lock poisoned")
            .get(prop)
            .cloned()
    }

    fn set_getter(&self, prop: &str, function: Function) {
        #[allow(clippy::expect_used)]
        self.0
            .getters
            .lock()
            .expect("lock poisoned")
            .insert(prop.to_string(), function);
    }

    fn downgrade(&self) -> Arc<dyn WeakInterceptable> {
        Arc::new(WeakTarget(Arc::downgrade(&self.0)))
    }
}

/// Application-side event emitter.
///
/// Listeners registered through a callback wrapper are found again by the function the
/// application originally passed, so `remove_listener(original)` works after wrapping.
#[derive(Clone, Default)]
pub struct EventEmitter {
    listeners: Arc<Mutex<HashMap<String, Vec<Function>>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, event: &str, listener: Function) {
        #[allow(clippy::expect_used)]
        self.listeners
            .lock()
            .expect("lock poisoned")
            .entry(event.to_string())
            .or_default()
            .push(listener);
    }

    /// Calls every listener for `event`. Returns whether there were any; the first listener
    /// error stops delivery and is returned.
    pub fn emit(&self, event: &str, args: Args) -> Result<bool, ErrorValue> {
        #[allow(clippy::expect_used)]
        let listeners = self
            .listeners
            .lock()
            .expect("lock poisoned")
            .get(event)
            .cloned()
            .unwrap_or_default();
        for listener in &listeners {
            listener.call(&Value::Undefined, args.clone())?;
        }
        Ok(!listeners.is_empty())
    }

    /// Removes the most recently added listener matching `listener`, either directly or
    /// through the original function of a callback wrapper.
    pub fn remove_listener(&self, event: &str, listener: &Function) -> bool {
        #[allow(clippy::expect_used)]
        let mut listeners = self.listeners.lock().expect("lock poisoned");
        let Some(registered) = listeners.get_mut(event) else {
            return false;
        };
        match registered.iter().rposition(|f| f.matches(listener)) {
            Some(index) => {
                registered.remove(index);
                if registered.is_empty() {
                    listeners.remove(event);
                }
                true
            }
            None => false,
        }
    }

    pub fn listener_count(&self, event: &str) -> usize {
        #[allow(clippy::expect_used)]
        self.listeners
            .lock()
            .expect("lock poisoned")
            .get(event)
            .map_or(0, Vec::len)
    }
}
