// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Interception engine.
//!
//! Every wrapper installed here obeys the same rules:
//!
//! - it has the same arity as the function it wraps;
//! - it saves the current logical context on entry and restores it on every exit path,
//!   including errors and panics raised by the original;
//! - hook failures (errors or panics) are logged and never reach the caller, and never
//!   prevent the original from being called. [`Proxy::before_callback`] is the one
//!   exception, since its hook owns the call to the original.

pub mod thread_proxy;

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use tracing::{debug, error, warn};

use crate::error::HookError;
use crate::events::BtDetails;
use crate::profiler::{ExitCall, Time};
use crate::target::Interceptable;
use crate::thread::{ThreadId, ThreadTracker};
use crate::value::{Args, CallResult, ErrorValue, Function, Promise, ProxyInfo, Value};

use self::thread_proxy::{make_thread_proxy, CallContextEntry, CallContextState};

/// Highest arity with a dedicated wrapper shape. Wrappers above it are still produced.
const MAX_FIXED_ARITY: usize = 10;

type BeforeFn = dyn Fn(&Value, &mut Args) -> Result<(), HookError> + Send + Sync;
type AfterFn = dyn Fn(&Value, &Args, &Value) -> Result<(), HookError> + Send + Sync;

/// Per-invocation state shared by the two halves of an [`Proxy::around`] interception.
#[derive(Debug, Default)]
pub struct Locals {
    pub time: Option<Time>,
    pub stack_trace: Option<Vec<String>>,
    pub params: Option<Value>,
    pub opts: Option<Value>,
    pub group: Option<String>,
    pub req: Option<Value>,
    pub res: Option<Value>,
    pub error: Option<ErrorValue>,
    /// Logical context of the transaction the call belongs to.
    pub transaction: Option<ThreadId>,
    pub exit_call: Option<ExitCall>,
    pub method_has_cb: bool,
}

/// What the wrapped original produced, as seen by an `around` after-hook.
#[derive(Debug, Clone, Copy)]
pub enum Outcome<'a> {
    /// The original returned a plain value.
    Returned(&'a Value),
    /// The original returned a promise, which has now settled.
    Promise {
        error: Option<&'a ErrorValue>,
        data: Option<&'a Value>,
    },
}

impl Outcome<'_> {
    pub fn is_promise_result(&self) -> bool {
        matches!(self, Outcome::Promise { .. })
    }

    pub fn error(&self) -> Option<&ErrorValue> {
        match self {
            Outcome::Returned(Value::Error(err)) => Some(err),
            Outcome::Promise { error, .. } => *error,
            Outcome::Returned(_) => None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct InterceptOptions {
    /// Context to activate for the duration of each intercepted call.
    pub invocation_context: Option<ThreadId>,
}

/// Continuation handed to a [`Proxy::before_callback`] hook.
pub struct Next<'a> {
    this: &'a Value,
    original: &'a Function,
}

impl Next<'_> {
    pub fn call(&self, args: Args) -> CallResult {
        self.original.call(self.this, args)
    }
}

/// Hooks run around a wrapped callback argument.
#[derive(Clone, Default)]
pub struct CallbackHooks {
    before: Option<Arc<dyn Fn(&Value, &Args) -> Result<(), HookError> + Send + Sync>>,
    after: Option<Arc<AfterFn>>,
    invocation_context: Option<ThreadId>,
}

impl CallbackHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn before<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Value, &Args) -> Result<(), HookError> + Send + Sync + 'static,
    {
        self.before = Some(Arc::new(hook));
        self
    }

    pub fn after<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Value, &Args, &Value) -> Result<(), HookError> + Send + Sync + 'static,
    {
        self.after = Some(Arc::new(hook));
        self
    }

    pub fn in_context(mut self, thread_id: Option<ThreadId>) -> Self {
        self.invocation_context = thread_id;
        self
    }
}

/// Runs hook code, logging and swallowing its errors and panics.
fn guarded<T>(what: &str, hook: impl FnOnce() -> Result<T, HookError>) -> Option<T> {
    let result = match std::panic::catch_unwind(AssertUnwindSafe(hook)) {
        Ok(result) => result,
        Err(payload) => Err(HookError::from_panic(payload)),
    };
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            error!("{what} hook failed: {e}");
            None
        }
    }
}

/// Normalizes the first argument of an error-first callback.
///
/// Objects, strings and errors are returned as they are, any other truthy value becomes
/// `"unspecified"`, and a falsy first argument means there was no error.
pub fn get_error_object(args: &[Value]) -> Option<Value> {
    let first = args.first().filter(|value| value.is_truthy())?;
    match first {
        Value::String(_) | Value::Json(_) | Value::Error(_) | Value::Object(_) | Value::Promise(_) => {
            Some(first.clone())
        }
        _ => Some(Value::from("unspecified")),
    }
}

pub struct Proxy {
    thread: Arc<ThreadTracker>,
    call_context: Mutex<CallContextState>,
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("call_context_enabled", &self.is_call_context_enabled())
            .finish()
    }
}

impl Proxy {
    pub fn new(thread: Arc<ThreadTracker>) -> Self {
        Self {
            thread,
            call_context: Mutex::new(CallContextState::default()),
        }
    }

    pub fn thread(&self) -> &Arc<ThreadTracker> {
        &self.thread
    }

    /// Runs `hook` before each of `methods`. The hook may rewrite the arguments; if it fails,
    /// the original runs with the arguments it was called with.
    pub fn before<T, F>(&self, obj: &T, methods: &[&str], hook: F)
    where
        T: Interceptable + Clone + 'static,
        F: Fn(&Value, &mut Args) -> Result<(), HookError> + Send + Sync + 'static,
    {
        self.before_with(obj, methods, hook, InterceptOptions::default());
    }

    pub fn before_with<T, F>(&self, obj: &T, methods: &[&str], hook: F, options: InterceptOptions)
    where
        T: Interceptable + Clone + 'static,
        F: Fn(&Value, &mut Args) -> Result<(), HookError> + Send + Sync + 'static,
    {
        let hook: Arc<BeforeFn> = Arc::new(hook);
        for method in methods {
            let Some(orig) = obj.method(method) else {
                continue;
            };
            let thread = Arc::clone(&self.thread);
            let hook = Arc::clone(&hook);
            let original = orig.clone();
            self.install(obj, method, &orig, move |this, mut args| {
                let _guard = thread.guard(options.invocation_context);
                let saved = args.clone();
                if guarded("before", || hook(this, &mut args)).is_none() {
                    args = saved;
                }
                original.call(this, args)
            });
        }
    }

    /// Hands the call of each of `methods` to `hook` entirely. The hook receives a [`Next`]
    /// that invokes the original and is trusted to handle its own errors.
    pub fn before_callback<T, F>(&self, obj: &T, methods: &[&str], hook: F, options: InterceptOptions)
    where
        T: Interceptable + Clone + 'static,
        F: Fn(&Value, Args, Next<'_>) -> CallResult + Send + Sync + 'static,
    {
        let hook = Arc::new(hook);
        for method in methods {
            let Some(orig) = obj.method(method) else {
                continue;
            };
            let thread = Arc::clone(&self.thread);
            let hook = Arc::clone(&hook);
            let original = orig.clone();
            self.install(obj, method, &orig, move |this, args| {
                let _guard = thread.guard(options.invocation_context);
                hook(
                    this,
                    args,
                    Next {
                        this,
                        original: &original,
                    },
                )
            });
        }
    }

    /// Runs `hook` after each of `methods` returns. A hook result of `Some` replaces the
    /// return value. Errors raised by the original propagate and skip the hook.
    pub fn after<T, F>(&self, obj: &T, methods: &[&str], hook: F)
    where
        T: Interceptable + Clone + 'static,
        F: Fn(&Value, &Args, &Value) -> Result<Option<Value>, HookError> + Send + Sync + 'static,
    {
        self.after_with(obj, methods, hook, InterceptOptions::default());
    }

    pub fn after_with<T, F>(&self, obj: &T, methods: &[&str], hook: F, options: InterceptOptions)
    where
        T: Interceptable + Clone + 'static,
        F: Fn(&Value, &Args, &Value) -> Result<Option<Value>, HookError> + Send + Sync + 'static,
    {
        let hook = Arc::new(hook);
        for method in methods {
            let Some(orig) = obj.method(method) else {
                continue;
            };
            let thread = Arc::clone(&self.thread);
            let hook = Arc::clone(&hook);
            let original = orig.clone();
            self.install(obj, method, &orig, move |this, args| {
                let _guard = thread.guard(options.invocation_context);
                let ret = original.call(this, args.clone())?;
                match guarded("after", || hook(this, &args, &ret)) {
                    Some(Some(replacement)) => Ok(replacement),
                    _ => Ok(ret),
                }
            });
        }
    }

    /// Wraps each of `methods` with a before and an after hook sharing one [`Locals`].
    ///
    /// When the original returns a [`Value::Promise`], the caller gets a promise that settles
    /// the same way, and `hook_after` runs once it settles with [`Outcome::Promise`]. Inside
    /// a tokio runtime a spawned task drives the settlement, so the hook fires even if the
    /// caller drops the promise. Outside one it fires when the promise is first polled.
    /// Otherwise `hook_after` runs right away with [`Outcome::Returned`] and may replace the
    /// return value.
    ///
    /// If `hook_before` leaves a timer in `locals.time` and no invocation context was
    /// given, the original and `hook_after` run under the timer's context.
    pub fn around<T, B, A>(&self, obj: &T, methods: &[&str], hook_before: B, hook_after: A)
    where
        T: Interceptable + Clone + 'static,
        B: Fn(&Value, &mut Args, &mut Locals) -> Result<(), HookError> + Send + Sync + 'static,
        A: Fn(&Value, &Args, Outcome<'_>, &mut Locals) -> Result<Option<Value>, HookError>
            + Send
            + Sync
            + 'static,
    {
        self.around_with(obj, methods, hook_before, hook_after, InterceptOptions::default());
    }

    pub fn around_with<T, B, A>(
        &self,
        obj: &T,
        methods: &[&str],
        hook_before: B,
        hook_after: A,
        options: InterceptOptions,
    ) where
        T: Interceptable + Clone + 'static,
        B: Fn(&Value, &mut Args, &mut Locals) -> Result<(), HookError> + Send + Sync + 'static,
        A: Fn(&Value, &Args, Outcome<'_>, &mut Locals) -> Result<Option<Value>, HookError>
            + Send
            + Sync
            + 'static,
    {
        let hook_before = Arc::new(hook_before);
        let hook_after = Arc::new(hook_after);
        for method in methods {
            let Some(orig) = obj.method(method) else {
                continue;
            };
            let thread = Arc::clone(&self.thread);
            let hook_before = Arc::clone(&hook_before);
            let hook_after = Arc::clone(&hook_after);
            let original = orig.clone();
            self.install(obj, method, &orig, move |this, mut args| {
                let _guard = thread.guard(options.invocation_context);
                let mut locals = Locals::default();

                let saved = args.clone();
                if guarded("around before", || hook_before(this, &mut args, &mut locals)).is_none()
                {
                    args = saved;
                }

                let mut invocation = options.invocation_context;
                if invocation.is_none() {
                    invocation = locals.time.as_ref().and_then(Time::thread_id);
                    if invocation.is_some() {
                        thread.resume(invocation);
                    }
                }

                let ret = original.call(this, args.clone())?;

                if let Value::Promise(promise) = &ret {
                    let promise = promise.clone();
                    let this = this.clone();
                    let settling_thread = Arc::clone(&thread);
                    let hook_after = Arc::clone(&hook_after);
                    let settled = Promise::new(async move {
                        let result = promise.await;
                        let _guard = settling_thread.guard(invocation);
                        let outcome = match &result {
                            Ok(data) => Outcome::Promise {
                                error: None,
                                data: Some(data),
                            },
                            Err(err) => Outcome::Promise {
                                error: Some(err),
                                data: None,
                            },
                        };
                        guarded("around after", || hook_after(&this, &args, outcome, &mut locals));
                        result
                    });
                    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                        let continuation = settled.clone();
                        runtime.spawn(thread.store().bind(
                            async move {
                                let _ = continuation.await;
                            }
                            .boxed(),
                        ));
                    }
                    return Ok(Value::Promise(settled));
                }

                match guarded("around after", || {
                    hook_after(this, &args, Outcome::Returned(&ret), &mut locals)
                }) {
                    Some(Some(replacement)) => Ok(replacement),
                    _ => Ok(ret),
                }
            });
        }
    }

    /// Wraps the function at `position` in `args` (negative positions count from the end)
    /// so that `hooks` run around its invocation. Returns whether a function was wrapped.
    ///
    /// The wrapper remembers the function it replaced, so listener registries can still
    /// find it by the original.
    pub fn callback(&self, args: &mut Args, position: isize, hooks: CallbackHooks) -> bool {
        let index = if position < 0 {
            args.len().checked_sub(position.unsigned_abs())
        } else {
            Some(position.unsigned_abs())
        };
        let Some(index) = index.filter(|index| *index < args.len()) else {
            return false;
        };
        let Some(orig) = args[index].as_function().cloned() else {
            return false;
        };

        let thread = Arc::clone(&self.thread);
        let original = orig.clone();
        let CallbackHooks {
            before,
            after,
            invocation_context,
        } = hooks;
        let wrapper = Function::new("apm_proxy", orig.arity(), move |this, args| {
            let _guard = thread.guard(invocation_context);
            if let Some(before) = &before {
                guarded("callback before", || before(this, &args));
            }
            let Some(after) = &after else {
                return original.call(this, args);
            };
            let ret = original.call(this, args.clone())?;
            guarded("callback after", || after(this, &args, &ret));
            Ok(ret)
        });

        let wrapper = self.wrap_with_thread_proxy_if_enabled(wrapper);
        wrapper.set_proxied_original(orig);
        args[index] = Value::Function(wrapper);
        true
    }

    /// Lets `hook` observe every read of `props`. The value read is never altered.
    pub fn getter<T, F>(&self, obj: &T, props: &[&str], hook: F)
    where
        T: Interceptable,
        F: Fn(&Value, &Value) -> Result<(), HookError> + Send + Sync + 'static,
    {
        let hook = Arc::new(hook);
        for prop in props {
            let Some(orig) = obj.getter(prop) else {
                continue;
            };
            let hook = Arc::clone(&hook);
            let original = orig.clone();
            let wrapper = Function::new(orig.name(), orig.arity(), move |this, args| {
                let ret = original.call(this, args)?;
                guarded("getter", || hook(this, &ret));
                Ok(ret)
            });
            obj.set_getter(prop, wrapper);
        }
    }

    /// Puts the pre-instrumentation function back on its target, dropping every wrapper
    /// layered on top of it. Returns false for functions this proxy never installed.
    pub fn release(&self, proxied: &Function) -> bool {
        let Some(info) = proxied.proxy_info() else {
            return false;
        };
        let Some(target) = info.target.upgrade() else {
            debug!("target of {} is gone, nothing to release", info.method);
            return false;
        };
        target.set_method(&info.method, info.original.clone());
        debug!("released {}.{}", target.name(), info.method);
        true
    }

    fn install<T, F>(&self, obj: &T, method: &str, orig: &Function, body: F)
    where
        T: Interceptable + Clone + 'static,
        F: Fn(&Value, Args) -> CallResult + Send + Sync + 'static,
    {
        let arity = orig.arity();
        if arity > MAX_FIXED_ARITY {
            warn!("Experienced a high arity function with arity of {arity}");
        }
        let wrapper = Function::new(orig.name(), arity, body);

        let pristine = orig
            .proxy_info()
            .filter(|info| info.method == method)
            .map_or_else(|| orig.clone(), |info| info.original.clone());
        wrapper.set_proxy_info(ProxyInfo {
            target: obj.downgrade(),
            method: method.to_string(),
            original: pristine,
        });
        obj.set_method(method, wrapper);
    }

    pub fn is_call_context_enabled(&self) -> bool {
        self.state().enabled
    }

    /// Clears all correlation state and starts assigning thread proxies.
    pub fn enable_call_context(&self) {
        let mut state = self.state();
        state.reset();
        state.enabled = true;
    }

    pub fn disable_call_context(&self) {
        self.state().reset();
    }

    /// Copy of the wrapper-name to business-transaction map.
    pub fn call_context_map(&self) -> std::collections::HashMap<String, CallContextEntry> {
        self.state().map.clone()
    }

    /// Marker function for the current logical context wrapping `function`, or `None` when
    /// there is no current context or the pool is exhausted.
    pub fn get_thread_proxy(&self, function: &Function) -> Option<Function> {
        let thread_id = self.thread.current()?;
        let slot = self.state().slot_for(thread_id)?;
        Some(make_thread_proxy(function, slot))
    }

    pub fn wrap_with_thread_proxy_if_enabled(&self, function: Function) -> Function {
        if !self.is_call_context_enabled() {
            return function;
        }
        self.get_thread_proxy(&function).unwrap_or(function)
    }

    /// Records the business transaction reported for `thread_id`.
    pub fn on_bt_details(&self, details: &BtDetails, thread_id: ThreadId) {
        let mut state = self.state();
        if !state.enabled {
            return;
        }
        if let Some(bt_id) = details.bt_id {
            state.record(
                thread_id,
                CallContextEntry {
                    bt_id,
                    snapshot_guid: details.snapshot_guid.clone(),
                },
            );
        }
    }

    pub fn update_call_context_map(&self, thread_id: ThreadId, bt_id: i64, guid: Option<String>) {
        let mut state = self.state();
        if !state.enabled || bt_id <= 0 {
            return;
        }
        state.record(
            thread_id,
            CallContextEntry {
                bt_id,
                snapshot_guid: guid,
            },
        );
    }

    fn state(&self) -> std::sync::MutexGuard<'_, CallContextState> {
        #[allow(clippy::expect_used)]
        self.call_context.lock().expect("lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tracing_test::traced_test;

    use super::*;
    use crate::target::Target;

    fn proxy() -> Proxy {
        Proxy::new(Arc::new(ThreadTracker::default()))
    }

    fn adder() -> Target {
        Target::new("math").define("add", 2, |_, args| {
            Ok(Value::from(
                args.iter().filter_map(Value::as_f64).sum::<f64>(),
            ))
        })
    }

    #[test]
    fn test_before_rewrites_arguments() {
        let proxy = proxy();
        let target = adder();
        proxy.before(&target, &["add"], |_, args| {
            args.push(Value::from(10.0));
            Ok(())
        });
        let result = target
            .call("add", vec![Value::from(1.0), Value::from(2.0)])
            .unwrap();
        assert_eq!(result, Value::from(13.0));
    }

    #[test]
    #[traced_test]
    fn test_failing_before_hook_keeps_original_arguments() {
        let proxy = proxy();
        let target = adder();
        proxy.before(&target, &["add"], |_, args| {
            args.clear();
            Err(HookError::msg("hook bug"))
        });
        let result = target
            .call("add", vec![Value::from(1.0), Value::from(2.0)])
            .unwrap();
        assert_eq!(result, Value::from(3.0));
        assert!(logs_contain("before hook failed: hook bug"));
    }

    #[test]
    #[traced_test]
    fn test_panicking_after_hook_falls_back_to_return_value() {
        let proxy = proxy();
        let target = adder();
        proxy.after(&target, &["add"], |_, _, _| panic!("after exploded"));
        let result = target
            .call("add", vec![Value::from(4.0), Value::from(5.0)])
            .unwrap();
        assert_eq!(result, Value::from(9.0));
        assert!(logs_contain("hook panicked: after exploded"));
    }

    #[test]
    #[traced_test]
    fn test_high_arity_wrapper_is_still_installed() {
        let proxy = proxy();
        let target = Target::new("wide")
            .define("ten", 10, |_, args| Ok(Value::from(args.len() as f64)))
            .define("eleven", 11, |_, args| Ok(Value::from(args.len() as f64)));
        proxy.before(&target, &["ten", "eleven"], |_, _| Ok(()));

        assert_eq!(target.method("eleven").unwrap().arity(), 11);
        assert_eq!(
            target.call("eleven", vec![Value::Null; 11]).unwrap(),
            Value::from(11.0)
        );
        assert!(logs_contain(
            "Experienced a high arity function with arity of 11"
        ));
        assert!(!logs_contain("arity of 10"));
    }

    #[test]
    fn test_after_may_override_return_value() {
        let proxy = proxy();
        let target = adder();
        proxy.after(&target, &["add"], |_, _, ret| {
            Ok(ret.as_f64().map(|n| Value::from(n * 2.0)))
        });
        assert_eq!(
            target.call("add", vec![Value::from(2.0)]).unwrap(),
            Value::from(4.0)
        );
    }

    #[test]
    fn test_before_callback_owns_the_call() {
        let proxy = proxy();
        let target = adder();
        proxy.before_callback(
            &target,
            &["add"],
            |_, args, next| {
                let doubled = args.iter().map(|v| Value::from(v.as_f64().unwrap_or(0.0) * 2.0));
                next.call(doubled.collect())
            },
            InterceptOptions::default(),
        );
        assert_eq!(
            target
                .call("add", vec![Value::from(1.0), Value::from(2.0)])
                .unwrap(),
            Value::from(6.0)
        );
    }

    #[test]
    fn test_invocation_context_is_active_during_call_and_restored() {
        let proxy = proxy();
        let thread = Arc::clone(proxy.thread());
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_call = Arc::clone(&seen);
        let target = Target::new("ctx").define("run", 0, move |_, _| {
            seen_in_call.store(thread.current().unwrap_or(0) as usize, Ordering::SeqCst);
            Ok(Value::Undefined)
        });
        proxy.before_with(
            &target,
            &["run"],
            |_, _| Ok(()),
            InterceptOptions {
                invocation_context: Some(9),
            },
        );
        proxy.thread().resume(Some(4));
        target.call("run", vec![]).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 9);
        assert_eq!(proxy.thread().current(), Some(4));
    }

    #[test]
    fn test_release_restores_pristine_function() {
        let proxy = proxy();
        let target = adder();
        let pristine = target.method("add").unwrap();
        proxy.before(&target, &["add"], |_, _| Ok(()));
        proxy.after(&target, &["add"], |_, _, _| Ok(None));
        let outer = target.method("add").unwrap();
        assert!(!outer.ptr_eq(&pristine));

        assert!(proxy.release(&outer));
        assert!(target.method("add").unwrap().ptr_eq(&pristine));
        assert!(!proxy.release(&pristine));
    }

    #[test]
    fn test_wrapped_target_is_freed() {
        let proxy = proxy();
        let target = adder();
        let handle = target.downgrade();
        proxy.before(&target, &["add"], |_, _| Ok(()));
        proxy.after(&target, &["add"], |_, _, _| Ok(None));
        let released = target.method("add").unwrap();
        assert!(proxy.release(&released));

        proxy.around(&target, &["add"], |_, _, _| Ok(()), |_, _, _, _| Ok(None));
        let wrapper = target.method("add").unwrap();
        drop(target);

        assert!(handle.upgrade().is_none());
        // The wrapper outlives its target and release has nothing to restore.
        assert!(!proxy.release(&wrapper));
        assert_eq!(
            wrapper
                .call(&Value::Undefined, vec![Value::from(1.0), Value::from(2.0)])
                .unwrap(),
            Value::from(3.0)
        );
    }

    #[test]
    fn test_callback_wraps_last_argument() {
        let proxy = proxy();
        let calls = Arc::new(AtomicUsize::new(0));
        let after_calls = Arc::clone(&calls);
        let original = Function::new("done", 2, |_, _| Ok(Value::from("ok")));
        let mut args = vec![Value::from("query"), Value::Function(original.clone())];

        let wrapped = proxy.callback(
            &mut args,
            -1,
            CallbackHooks::new().after(move |_, _, ret| {
                assert_eq!(ret, &Value::from("ok"));
                after_calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        assert!(wrapped);

        let wrapper = args[1].as_function().unwrap();
        assert_eq!(wrapper.name(), "apm_proxy");
        assert_eq!(wrapper.arity(), 2);
        assert!(wrapper.matches(&original));
        wrapper.call(&Value::Undefined, vec![Value::Null]).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_ignores_missing_or_non_function_argument() {
        let proxy = proxy();
        let mut args = vec![Value::from(1.0)];
        assert!(!proxy.callback(&mut args, 0, CallbackHooks::new()));
        assert!(!proxy.callback(&mut args, 3, CallbackHooks::new()));
        assert!(!proxy.callback(&mut args, -2, CallbackHooks::new()));
        assert!(!proxy.callback(&mut Vec::new(), -1, CallbackHooks::new()));
    }

    #[test]
    fn test_callback_uses_thread_proxy_when_enabled() {
        let proxy = proxy();
        proxy.enable_call_context();
        proxy.thread().enter();
        let mut args = vec![Value::Function(Function::new("cb", 0, |_, _| {
            Ok(Value::Undefined)
        }))];
        assert!(proxy.callback(&mut args, 0, CallbackHooks::new()));
        assert_eq!(args[0].as_function().unwrap().name(), "apm_proxy_0");
    }

    #[test]
    fn test_getter_observes_value() {
        let proxy = proxy();
        let observed = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&observed);
        let target = Target::new("conn").define_getter("host", |_| Ok(Value::from("db1")));
        proxy.getter(&target, &["host", "missing"], move |_, value| {
            *sink.lock().unwrap() = Some(value.clone());
            Err(HookError::msg("ignored"))
        });
        assert_eq!(target.get("host").unwrap(), Value::from("db1"));
        assert_eq!(*observed.lock().unwrap(), Some(Value::from("db1")));
    }

    #[test]
    fn test_get_error_object() {
        assert_eq!(get_error_object(&[]), None);
        assert_eq!(get_error_object(&[Value::Null]), None);
        assert_eq!(get_error_object(&[Value::from("boom")]), Some(Value::from("boom")));
        assert_eq!(
            get_error_object(&[Value::from(true)]),
            Some(Value::from("unspecified"))
        );
        let err = Value::Error(ErrorValue::new("bad"));
        assert_eq!(get_error_object(&[err.clone()]), Some(err));
    }

    #[test]
    fn test_call_context_map_updates() {
        let proxy = proxy();
        proxy.update_call_context_map(1, 5, None);
        assert!(proxy.call_context_map().is_empty());

        proxy.enable_call_context();
        proxy.thread().resume(Some(1));
        let cb = Function::new("cb", 0, |_, _| Ok(Value::Undefined));
        assert!(proxy.get_thread_proxy(&cb).is_some());

        proxy.update_call_context_map(1, 0, None);
        assert!(proxy.call_context_map().is_empty());

        proxy.on_bt_details(
            &BtDetails {
                bt_id: Some(42),
                snapshot_guid: Some("snap".to_string()),
            },
            1,
        );
        let map = proxy.call_context_map();
        assert_eq!(map["apm_proxy_0"].bt_id, 42);
        assert_eq!(map["apm_proxy_0"].snapshot_guid.as_deref(), Some("snap"));

        proxy.disable_call_context();
        assert!(proxy.call_context_map().is_empty());
        assert!(!proxy.is_call_context_enabled());
    }
}
