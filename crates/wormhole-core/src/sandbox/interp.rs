//! Tree-walking evaluator over the cached syntax tree.
//!
//! One [`Interp`] is built per invocation and dropped afterwards; it owns the
//! only namespace the function ever sees. Errors come in two layers: an
//! [`Exception`] the body may catch with `try/except`, and a [`Fatal`] it
//! never can (limits, cancellation, transient store faults).

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use wormhole_state::StateError;

use super::modules;
use super::value::{
    exception_class, is_subclass, range_len, Body, Builtin, Closure, Env, Exception, Key, Num,
    Value,
};
use crate::bridge::{BridgeError, QueryBridge};
use crate::config::SandboxConfig;
use crate::lang::ast::{
    BinOp, BoolOp, CmpOp, Comprehension, ExceptHandler, Expr, ExprKind, FunctionDef, ImportName, Literal,
    Param, Stmt, StmtKind, UnaryOp,
};
use crate::retry::CancelHandle;

/// Length cap for sequences built by concatenation or repetition.
pub const MAX_SEQUENCE_LEN: usize = 10_000_000;

/// Steps between deadline and cancellation polls.
const POLL_INTERVAL: u64 = 1024;

/// A failure sandboxed code cannot catch.
#[derive(Debug)]
pub enum Fatal {
    Limit(String),
    Store(StateError),
    Cancelled,
}

#[derive(Debug)]
pub enum Flow {
    Raise(Exception),
    Fatal(Fatal),
}

impl From<Exception> for Flow {
    fn from(exc: Exception) -> Self {
        Flow::Raise(exc)
    }
}

pub type Exec<T> = Result<T, Flow>;

enum Signal<'p> {
    Next,
    Return(Value<'p>),
    Break,
    Continue,
}

pub struct Interp<'a, 'p> {
    limits: &'a SandboxConfig,
    bridge: &'a QueryBridge<'a>,
    binding: &'a str,
    cancel: Option<&'a CancelHandle>,
    globals: Rc<Env<'p>>,
    /// Scopes captured by closures; cleared on drop to break cycles.
    arena: Vec<Rc<Env<'p>>>,
    /// Exceptions being handled, innermost last, for bare `raise`.
    handling: Vec<Exception>,
    steps: u64,
    depth: usize,
    deadline: Option<Instant>,
}

impl Drop for Interp<'_, '_> {
    fn drop(&mut self) {
        for env in self.arena.drain(..) {
            env.clear();
        }
        self.globals.clear();
    }
}

impl<'a, 'p> Interp<'a, 'p> {
    /// Build a fresh namespace: safe builtins plus the bridge binding.
    pub fn new(
        limits: &'a SandboxConfig,
        bridge: &'a QueryBridge<'a>,
        binding: &'a str,
        cancel: Option<&'a CancelHandle>,
    ) -> Self {
        let builtins = Env::root();
        for (name, builtin) in Builtin::FUNCTIONS {
            builtins.set(name, Value::Builtin(*builtin));
        }
        for class in Builtin::EXCEPTIONS {
            builtins.set(class, Value::Builtin(Builtin::Exception(*class)));
        }
        builtins.set(binding, Value::Bridge);
        let globals = Env::child(&builtins);

        Self {
            limits,
            bridge,
            binding,
            cancel,
            globals,
            arena: vec![builtins],
            handling: Vec::new(),
            steps: 0,
            depth: 0,
            deadline: Instant::now().checked_add(Duration::from_millis(limits.timeout_ms)),
        }
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Run the module's top-level statements in the global scope.
    pub fn run_module(&mut self, body: &'p [Stmt]) -> Exec<()> {
        let globals = self.globals.clone();
        match self.exec_block(body, &globals)? {
            Signal::Next => Ok(()),
            Signal::Return(_) => {
                Err(Exception::new("RuntimeError", "'return' outside function").into())
            }
            Signal::Break | Signal::Continue => {
                Err(Exception::new("RuntimeError", "'break' or 'continue' outside loop").into())
            }
        }
    }

    pub fn global(&self, name: &str) -> Option<Value<'p>> {
        self.globals.get(name)
    }

    // -----------------------------------------------------------------------
    // Limits
    // -----------------------------------------------------------------------

    pub(super) fn tick(&mut self) -> Exec<()> {
        self.steps += 1;
        if self.steps > self.limits.max_steps {
            return Err(self.step_limit());
        }
        if self.steps % POLL_INTERVAL == 0 {
            self.poll()?;
        }
        Ok(())
    }

    fn poll(&self) -> Exec<()> {
        if self.cancel.is_some_and(CancelHandle::is_cancelled) {
            return Err(Flow::Fatal(Fatal::Cancelled));
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(Flow::Fatal(Fatal::Limit(format!(
                "time limit of {} ms exceeded",
                self.limits.timeout_ms
            ))));
        }
        Ok(())
    }

    fn step_limit(&self) -> Flow {
        Flow::Fatal(Fatal::Limit(format!(
            "step limit of {} exceeded",
            self.limits.max_steps
        )))
    }

    // -----------------------------------------------------------------------
    // Statements
    // -----------------------------------------------------------------------

    fn exec_block(&mut self, body: &'p [Stmt], env: &Rc<Env<'p>>) -> Exec<Signal<'p>> {
        for stmt in body {
            match self.exec_stmt(stmt, env)? {
                Signal::Next => {}
                signal => return Ok(signal),
            }
        }
        Ok(Signal::Next)
    }

    fn exec_stmt(&mut self, stmt: &'p Stmt, env: &Rc<Env<'p>>) -> Exec<Signal<'p>> {
        self.tick()?;
        match &stmt.kind {
            StmtKind::Def(def) => {
                self.define(def, env)?;
                Ok(Signal::Next)
            }
            StmtKind::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr, env)?,
                    None => Value::None,
                };
                Ok(Signal::Return(value))
            }
            StmtKind::If { branches, orelse } => {
                for (test, body) in branches {
                    if self.eval(test, env)?.truthy() {
                        return self.exec_block(body, env);
                    }
                }
                self.exec_block(orelse, env)
            }
            StmtKind::For { target, iter, body } => self.exec_for(target, iter, body, env),
            StmtKind::While { test, body } => self.exec_while(test, body, env),
            StmtKind::Break => Ok(Signal::Break),
            StmtKind::Continue => Ok(Signal::Continue),
            StmtKind::Pass => Ok(Signal::Next),
            StmtKind::Import(names) => {
                for import in names {
                    self.import(import, env)?;
                }
                Ok(Signal::Next)
            }
            StmtKind::ImportFrom { module, names } => {
                self.import_from(module, names, env)?;
                Ok(Signal::Next)
            }
            StmtKind::Raise(value) => Err(self.raise(value.as_ref(), env)),
            StmtKind::Try {
                body,
                handlers,
                finally,
            } => self.exec_try(body, handlers, finally, env),
            StmtKind::Assign { targets, value } => {
                let value = self.eval(value, env)?;
                for target in targets {
                    self.assign(target, value.clone(), env)?;
                }
                Ok(Signal::Next)
            }
            StmtKind::AugAssign { target, op, value } => {
                self.aug_assign(target, *op, value, env)?;
                Ok(Signal::Next)
            }
            StmtKind::Expr(expr) => {
                self.eval(expr, env)?;
                Ok(Signal::Next)
            }
        }
    }

    fn exec_for(
        &mut self,
        target: &'p Expr,
        iter: &'p Expr,
        body: &'p [Stmt],
        env: &Rc<Env<'p>>,
    ) -> Exec<Signal<'p>> {
        let iterable = self.eval(iter, env)?;
        for item in self.iterate(&iterable)? {
            self.tick()?;
            self.assign(target, item, env)?;
            match self.exec_block(body, env)? {
                Signal::Break => break,
                Signal::Next | Signal::Continue => {}
                signal @ Signal::Return(_) => return Ok(signal),
            }
        }
        Ok(Signal::Next)
    }

    fn exec_while(
        &mut self,
        test: &'p Expr,
        body: &'p [Stmt],
        env: &Rc<Env<'p>>,
    ) -> Exec<Signal<'p>> {
        while self.eval(test, env)?.truthy() {
            self.tick()?;
            match self.exec_block(body, env)? {
                Signal::Break => break,
                Signal::Next | Signal::Continue => {}
                signal @ Signal::Return(_) => return Ok(signal),
            }
        }
        Ok(Signal::Next)
    }

    fn exec_try(
        &mut self,
        body: &'p [Stmt],
        handlers: &'p [ExceptHandler],
        finally: &'p [Stmt],
        env: &Rc<Env<'p>>,
    ) -> Exec<Signal<'p>> {
        let result = match self.exec_block(body, env) {
            Err(Flow::Raise(exc)) => self.handle(exc, handlers, env),
            other => other,
        };
        // No user code runs once a fatal condition is hit.
        if let Err(Flow::Fatal(_)) = result {
            return result;
        }
        match self.exec_block(finally, env)? {
            Signal::Next => result,
            signal => Ok(signal),
        }
    }

    fn handle(
        &mut self,
        exc: Exception,
        handlers: &'p [ExceptHandler],
        env: &Rc<Env<'p>>,
    ) -> Exec<Signal<'p>> {
        for handler in handlers {
            if let Some(class) = &handler.class {
                let base = exception_class(class).ok_or_else(|| {
                    Exception::new("NameError", format!("name '{class}' is not defined"))
                })?;
                if !is_subclass(exc.class, base) {
                    continue;
                }
            }
            if let Some(name) = &handler.name {
                env.set(name, Value::Exception(Rc::new(exc.clone())));
            }
            self.handling.push(exc);
            let result = self.exec_block(&handler.body, env);
            self.handling.pop();
            return result;
        }
        Err(Flow::Raise(exc))
    }

    fn raise(&mut self, value: Option<&'p Expr>, env: &Rc<Env<'p>>) -> Flow {
        let Some(expr) = value else {
            return match self.handling.last() {
                Some(exc) => Flow::Raise(exc.clone()),
                None => Exception::new("RuntimeError", "No active exception to reraise").into(),
            };
        };
        match self.eval(expr, env) {
            Ok(Value::Exception(exc)) => Flow::Raise(exc.as_ref().clone()),
            Ok(Value::Builtin(Builtin::Exception(class))) => Flow::Raise(Exception::new(class, "")),
            Ok(other) => Exception::type_error(format!(
                "exceptions must derive from BaseException, not {}",
                other.type_name()
            ))
            .into(),
            Err(flow) => flow,
        }
    }

    fn define(&mut self, def: &'p FunctionDef, env: &Rc<Env<'p>>) -> Exec<()> {
        let function = self.closure(def.name.clone(), &def.params, Body::Block(def), env)?;
        env.set(&def.name, function);
        Ok(())
    }

    fn closure(
        &mut self,
        name: String,
        params: &'p [Param],
        body: Body<'p>,
        env: &Rc<Env<'p>>,
    ) -> Exec<Value<'p>> {
        let mut defaults = Vec::with_capacity(params.len());
        for param in params {
            defaults.push(match &param.default {
                Some(expr) => Some(self.eval(expr, env)?),
                None => None,
            });
        }
        if !self.arena.last().is_some_and(|last| Rc::ptr_eq(last, env)) {
            self.arena.push(env.clone());
        }
        Ok(Value::Function(Rc::new(Closure {
            name,
            params,
            defaults,
            body,
            env: env.clone(),
        })))
    }

    fn import(&mut self, import: &'p ImportName, env: &Rc<Env<'p>>) -> Exec<()> {
        let module = match import.path.as_slice() {
            [name] => modules::module(name),
            _ => None,
        }
        .ok_or_else(|| {
            Exception::new(
                "ImportError",
                format!("No module named '{}'", import.path.join(".")),
            )
        })?;
        env.set(import.binding(), Value::Module(module));
        Ok(())
    }

    fn import_from(
        &mut self,
        path: &'p [String],
        names: &'p [(String, Option<String>)],
        env: &Rc<Env<'p>>,
    ) -> Exec<()> {
        let dotted = path.join(".");
        let module = match path {
            [name] => modules::module(name),
            _ => None,
        }
        .ok_or_else(|| Exception::new("ImportError", format!("No module named '{dotted}'")))?;
        for (name, alias) in names {
            let value = modules::attribute(module, name).ok_or_else(|| {
                Exception::new(
                    "ImportError",
                    format!("cannot import name '{name}' from '{dotted}'"),
                )
            })?;
            env.set(alias.as_deref().unwrap_or(name), value);
        }
        Ok(())
    }

    fn assign(&mut self, target: &'p Expr, value: Value<'p>, env: &Rc<Env<'p>>) -> Exec<()> {
        match &target.kind {
            ExprKind::Name(name) => {
                env.set(name, value);
                Ok(())
            }
            ExprKind::Tuple(targets) | ExprKind::List(targets) => {
                let items = self.iterate(&value)?;
                if items.len() != targets.len() {
                    let message = if items.len() > targets.len() {
                        format!("too many values to unpack (expected {})", targets.len())
                    } else {
                        format!(
                            "not enough values to unpack (expected {}, got {})",
                            targets.len(),
                            items.len()
                        )
                    };
                    return Err(Exception::value_error(message).into());
                }
                for (target, item) in targets.iter().zip(items) {
                    self.assign(target, item, env)?;
                }
                Ok(())
            }
            ExprKind::Subscript {
                value: container,
                index,
            } => {
                if matches!(index.kind, ExprKind::Slice { .. }) {
                    return Err(Exception::type_error("slice assignment is not supported").into());
                }
                let container = self.eval(container, env)?;
                let index = self.eval(index, env)?;
                Ok(set_item(&container, index, value)?)
            }
            ExprKind::Attribute { value: object, attr } => {
                let object = self.eval(object, env)?;
                Err(Exception::new(
                    "AttributeError",
                    format!("'{}' object attribute '{attr}' is read-only", object.type_name()),
                )
                .into())
            }
            _ => Err(Exception::type_error("cannot assign to expression").into()),
        }
    }

    fn aug_assign(
        &mut self,
        target: &'p Expr,
        op: BinOp,
        value: &'p Expr,
        env: &Rc<Env<'p>>,
    ) -> Exec<()> {
        match &target.kind {
            ExprKind::Name(name) => {
                let current = env.get(name).ok_or_else(|| name_error(name))?;
                let rhs = self.eval(value, env)?;
                let result = self.in_place(op, current, rhs)?;
                env.set(name, result);
                Ok(())
            }
            ExprKind::Subscript {
                value: container,
                index,
            } => {
                if matches!(index.kind, ExprKind::Slice { .. }) {
                    return Err(Exception::type_error("slice assignment is not supported").into());
                }
                let container = self.eval(container, env)?;
                let index = self.eval(index, env)?;
                let current = get_item(&container, &index)?;
                let rhs = self.eval(value, env)?;
                let result = self.in_place(op, current, rhs)?;
                Ok(set_item(&container, index, result)?)
            }
            _ => self.assign(target, Value::None, env),
        }
    }

    /// `a += b` extends lists in place; everything else rebinds.
    fn in_place(&mut self, op: BinOp, current: Value<'p>, rhs: Value<'p>) -> Exec<Value<'p>> {
        if let (BinOp::Add, Value::List(items)) = (op, &current) {
            let extra = self.iterate(&rhs)?;
            check_len(items.borrow().len().saturating_add(extra.len()))?;
            items.borrow_mut().extend(extra);
            return Ok(current);
        }
        binary(op, current, rhs)
    }

    // -----------------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------------

    pub(super) fn eval(&mut self, expr: &'p Expr, env: &Rc<Env<'p>>) -> Exec<Value<'p>> {
        self.tick()?;
        match &expr.kind {
            ExprKind::Name(name) => env.get(name).ok_or_else(|| name_error(name)),
            ExprKind::Const(literal) => Ok(literal_value(literal)),
            ExprKind::List(items) => Ok(Value::list(self.eval_all(items, env)?)),
            ExprKind::Tuple(items) => Ok(Value::tuple(self.eval_all(items, env)?)),
            ExprKind::Dict(entries) => {
                let mut map = BTreeMap::new();
                for (key, value) in entries {
                    let key = Key::from_value(&self.eval(key, env)?)?;
                    map.insert(key, self.eval(value, env)?);
                }
                Ok(Value::dict(map))
            }
            ExprKind::ListComp {
                element,
                generators,
            } => {
                let scope = Env::child(env);
                let mut out = Vec::new();
                self.run_generators(
                    generators,
                    &scope,
                    &mut |this: &mut Self, scope: &Rc<Env<'p>>| -> Exec<()> {
                        out.push(this.eval(element, scope)?);
                        Ok(())
                    },
                )?;
                Ok(Value::list(out))
            }
            ExprKind::DictComp {
                key,
                value,
                generators,
            } => {
                let scope = Env::child(env);
                let mut out = BTreeMap::new();
                self.run_generators(
                    generators,
                    &scope,
                    &mut |this: &mut Self, scope: &Rc<Env<'p>>| -> Exec<()> {
                        let k = Key::from_value(&this.eval(key, scope)?)?;
                        out.insert(k, this.eval(value, scope)?);
                        Ok(())
                    },
                )?;
                Ok(Value::dict(out))
            }
            ExprKind::Attribute { value, attr } => {
                let object = self.eval(value, env)?;
                Ok(super::builtins::get_attribute(object, attr)?)
            }
            ExprKind::Subscript { value, index } => self.eval_subscript(value, index, env),
            ExprKind::Slice { .. } => {
                Err(Exception::type_error("slice outside of a subscript").into())
            }
            ExprKind::Call { func, args, kwargs } => {
                let callee = self.eval(func, env)?;
                let args = self.eval_all(args, env)?;
                let mut keywords = Vec::with_capacity(kwargs.len());
                for (name, value) in kwargs {
                    keywords.push((name.clone(), self.eval(value, env)?));
                }
                self.call_value(callee, args, keywords)
            }
            ExprKind::BinOp { op, left, right } => {
                let left = self.eval(left, env)?;
                let right = self.eval(right, env)?;
                binary(*op, left, right)
            }
            ExprKind::Unary { op, operand } => {
                let operand = self.eval(operand, env)?;
                Ok(unary(*op, operand)?)
            }
            ExprKind::BoolOp { op, left, right } => {
                let left = self.eval(left, env)?;
                match (op, left.truthy()) {
                    (BoolOp::And, false) | (BoolOp::Or, true) => Ok(left),
                    _ => self.eval(right, env),
                }
            }
            ExprKind::Compare { left, rest } => {
                let mut current = self.eval(left, env)?;
                for (op, right) in rest {
                    let right = self.eval(right, env)?;
                    if !compare(*op, &current, &right)? {
                        return Ok(Value::Bool(false));
                    }
                    current = right;
                }
                Ok(Value::Bool(true))
            }
            ExprKind::IfExp { test, body, orelse } => {
                if self.eval(test, env)?.truthy() {
                    self.eval(body, env)
                } else {
                    self.eval(orelse, env)
                }
            }
            ExprKind::Lambda { params, body } => {
                self.closure("<lambda>".to_string(), params, Body::Lambda(&**body), env)
            }
        }
    }

    fn eval_all(&mut self, exprs: &'p [Expr], env: &Rc<Env<'p>>) -> Exec<Vec<Value<'p>>> {
        let mut values = Vec::with_capacity(exprs.len());
        for expr in exprs {
            values.push(self.eval(expr, env)?);
        }
        Ok(values)
    }

    fn run_generators(
        &mut self,
        generators: &'p [Comprehension],
        scope: &Rc<Env<'p>>,
        emit: &mut dyn FnMut(&mut Self, &Rc<Env<'p>>) -> Exec<()>,
    ) -> Exec<()> {
        let Some((first, rest)) = generators.split_first() else {
            return emit(self, scope);
        };
        let iterable = self.eval(&first.iter, scope)?;
        'items: for item in self.iterate(&iterable)? {
            self.tick()?;
            self.assign(&first.target, item, scope)?;
            for condition in &first.conditions {
                if !self.eval(condition, scope)?.truthy() {
                    continue 'items;
                }
            }
            self.run_generators(rest, scope, emit)?;
        }
        Ok(())
    }

    fn eval_subscript(
        &mut self,
        value: &'p Expr,
        index: &'p Expr,
        env: &Rc<Env<'p>>,
    ) -> Exec<Value<'p>> {
        let container = self.eval(value, env)?;
        if let ExprKind::Slice { lower, upper } = &index.kind {
            let lower = self.eval_bound(lower.as_deref(), env)?;
            let upper = self.eval_bound(upper.as_deref(), env)?;
            return Ok(slice(&container, lower, upper)?);
        }
        let index = self.eval(index, env)?;
        Ok(get_item(&container, &index)?)
    }

    fn eval_bound(&mut self, bound: Option<&'p Expr>, env: &Rc<Env<'p>>) -> Exec<Option<i64>> {
        let Some(expr) = bound else {
            return Ok(None);
        };
        match self.eval(expr, env)? {
            Value::None => Ok(None),
            value => value.as_int().map(Some).ok_or_else(|| {
                Exception::type_error("slice indices must be integers or None").into()
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Calls
    // -----------------------------------------------------------------------

    pub(super) fn call_value(
        &mut self,
        callee: Value<'p>,
        args: Vec<Value<'p>>,
        kwargs: Vec<(String, Value<'p>)>,
    ) -> Exec<Value<'p>> {
        match callee {
            Value::Function(function) => {
                let frame = bind_arguments(&function, args, kwargs)?;
                self.call_bound(&function, frame)
            }
            Value::Builtin(builtin) => self.call_builtin(builtin, args, kwargs),
            Value::HostFn(host) => Ok(modules::call(host, &args, &kwargs)?),
            Value::Method(method) => self.call_method(&method.receiver, method.name, args, kwargs),
            Value::Bridge => self.call_bridge(args, kwargs),
            other => Err(Exception::type_error(format!(
                "'{}' object is not callable",
                other.type_name()
            ))
            .into()),
        }
    }

    /// Run a function body in an already-bound frame.
    pub fn call_bound(&mut self, function: &Rc<Closure<'p>>, frame: Rc<Env<'p>>) -> Exec<Value<'p>> {
        if self.depth >= self.limits.max_call_depth {
            return Err(Flow::Fatal(Fatal::Limit(format!(
                "call depth limit of {} exceeded",
                self.limits.max_call_depth
            ))));
        }
        self.depth += 1;
        let result = match function.body {
            Body::Block(def) => match self.exec_block(&def.body, &frame) {
                Ok(Signal::Return(value)) => Ok(value),
                Ok(Signal::Next) => Ok(Value::None),
                Ok(Signal::Break | Signal::Continue) => {
                    Err(Exception::new("RuntimeError", "'break' or 'continue' outside loop").into())
                }
                Err(flow) => Err(flow),
            },
            Body::Lambda(expr) => self.eval(expr, &frame),
        };
        self.depth -= 1;
        result
    }

    fn call_bridge(
        &mut self,
        args: Vec<Value<'p>>,
        kwargs: Vec<(String, Value<'p>)>,
    ) -> Exec<Value<'p>> {
        self.poll()?;
        let mut positional = args.into_iter();
        let mut statement = positional.next();
        let mut params = positional.next();
        if positional.next().is_some() {
            return Err(Exception::type_error(format!(
                "{}() takes at most 2 positional arguments",
                self.binding
            ))
            .into());
        }
        for (name, value) in kwargs {
            match name.as_str() {
                "statement" if statement.is_none() => statement = Some(value),
                "params" if params.is_none() => params = Some(value),
                _ => {
                    return Err(Exception::type_error(format!(
                        "{}() got an unexpected keyword argument '{name}'",
                        self.binding
                    ))
                    .into())
                }
            }
        }

        let statement = match statement {
            Some(Value::Str(s)) => s,
            Some(other) => {
                return Err(bridge_exception(format!(
                    "statement must be str, not {}",
                    other.type_name()
                )))
            }
            None => {
                return Err(Exception::type_error(format!(
                    "{}() missing required argument 'statement'",
                    self.binding
                ))
                .into())
            }
        };
        let params = match params {
            None | Some(Value::None) => Vec::new(),
            Some(Value::List(items)) => items.borrow().clone(),
            Some(Value::Tuple(items)) => items.to_vec(),
            Some(other) => {
                return Err(bridge_exception(format!(
                    "params must be a list or tuple, not {}",
                    other.type_name()
                )))
            }
        };
        let mut scalars = Vec::with_capacity(params.len());
        for param in &params {
            scalars.push(param.to_scalar().ok_or_else(|| {
                bridge_exception(format!(
                    "query parameters must be scalars, got {}",
                    param.type_name()
                ))
            })?);
        }

        match self.bridge.run(&statement, &scalars) {
            Ok(envelope) => Ok(Value::list(
                envelope
                    .rows
                    .iter()
                    .map(|row| {
                        Value::dict(
                            row.iter()
                                .map(|(column, scalar)| {
                                    (Key::Str(column.as_str().into()), Value::from_scalar(scalar))
                                })
                                .collect(),
                        )
                    })
                    .collect(),
            )),
            Err(BridgeError::Transient(err)) => Err(Flow::Fatal(Fatal::Store(err))),
            Err(err) => Err(bridge_exception(err.to_string())),
        }
    }

    /// Materialize an iterable. Ranges are charged against the step budget
    /// before they are expanded.
    pub(super) fn iterate(&mut self, value: &Value<'p>) -> Exec<Vec<Value<'p>>> {
        Ok(match value {
            Value::List(items) => items.borrow().clone(),
            Value::Tuple(items) => items.to_vec(),
            Value::Str(s) => s.chars().map(|c| Value::str(String::from(c))).collect(),
            Value::Dict(entries) => entries.borrow().keys().map(Key::to_value).collect(),
            Value::Range { start, stop, step } => {
                let len = range_len(*start, *stop, *step);
                if len > self.limits.max_steps.saturating_sub(self.steps) {
                    return Err(self.step_limit());
                }
                let (start, step) = (i128::from(*start), i128::from(*step));
                (0..len)
                    .map(|i| Value::Int((start + step * i128::from(i)) as i64))
                    .collect()
            }
            other => {
                return Err(Exception::type_error(format!(
                    "'{}' object is not iterable",
                    other.type_name()
                ))
                .into())
            }
        })
    }
}

/// Bind call arguments to a fresh frame for `function`.
pub fn bind_arguments<'p>(
    function: &Rc<Closure<'p>>,
    args: Vec<Value<'p>>,
    kwargs: Vec<(String, Value<'p>)>,
) -> Result<Rc<Env<'p>>, Exception> {
    let params = function.params;
    if args.len() > params.len() {
        return Err(Exception::type_error(format!(
            "{}() takes {} positional argument(s) but {} were given",
            function.name,
            params.len(),
            args.len()
        )));
    }
    let mut slots: Vec<Option<Value<'p>>> = vec![None; params.len()];
    for (slot, arg) in slots.iter_mut().zip(args) {
        *slot = Some(arg);
    }
    for (name, value) in kwargs {
        let index = params
            .iter()
            .position(|param| param.name == name)
            .ok_or_else(|| {
                Exception::type_error(format!(
                    "{}() got an unexpected keyword argument '{name}'",
                    function.name
                ))
            })?;
        if slots[index].is_some() {
            return Err(Exception::type_error(format!(
                "{}() got multiple values for argument '{name}'",
                function.name
            )));
        }
        slots[index] = Some(value);
    }

    let frame = Env::child(&function.env);
    for ((param, slot), default) in params.iter().zip(slots).zip(&function.defaults) {
        let value = match slot.or_else(|| default.clone()) {
            Some(value) => value,
            None => {
                return Err(Exception::type_error(format!(
                    "{}() missing required argument: '{}'",
                    function.name, param.name
                )))
            }
        };
        frame.set(&param.name, value);
    }
    Ok(frame)
}

fn name_error(name: &str) -> Flow {
    Exception::new("NameError", format!("name '{name}' is not defined")).into()
}

fn bridge_exception(message: String) -> Flow {
    Exception::new("BridgeError", message).into()
}

fn literal_value<'p>(literal: &Literal) -> Value<'p> {
    match literal {
        Literal::None => Value::None,
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Int(i) => Value::Int(*i),
        Literal::Float(f) => Value::Float(*f),
        Literal::Str(s) => Value::str(s.as_str()),
    }
}

pub(super) fn check_len(len: usize) -> Exec<()> {
    if len > MAX_SEQUENCE_LEN {
        return Err(Flow::Fatal(Fatal::Limit(format!(
            "sequence length limit of {MAX_SEQUENCE_LEN} exceeded"
        ))));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Operators
// ---------------------------------------------------------------------------

fn overflow() -> Exception {
    Exception::new("OverflowError", "integer overflow")
}

fn zero_division(message: &str) -> Exception {
    Exception::new("ZeroDivisionError", message)
}

pub(super) fn binary<'p>(op: BinOp, left: Value<'p>, right: Value<'p>) -> Exec<Value<'p>> {
    match (op, &left, &right) {
        (BinOp::Add, Value::Str(a), Value::Str(b)) => {
            check_len(a.len().saturating_add(b.len()))?;
            Ok(Value::str(format!("{a}{b}")))
        }
        (BinOp::Add, Value::List(a), Value::List(b)) => {
            let mut items = a.borrow().clone();
            items.extend(b.borrow().iter().cloned());
            check_len(items.len())?;
            Ok(Value::list(items))
        }
        (BinOp::Add, Value::Tuple(a), Value::Tuple(b)) => {
            check_len(a.len().saturating_add(b.len()))?;
            Ok(Value::tuple(a.iter().chain(b.iter()).cloned().collect()))
        }
        (BinOp::Mul, Value::Str(_) | Value::List(_) | Value::Tuple(_), count)
        | (BinOp::Mul, count, Value::Str(_) | Value::List(_) | Value::Tuple(_))
            if count.as_int().is_some() =>
        {
            let times = count.as_int().unwrap_or(0);
            let sequence = if right.as_int().is_some() { &left } else { &right };
            repeat(sequence, times)
        }
        _ => Ok(arithmetic(op, &left, &right)?),
    }
}

fn repeat<'p>(sequence: &Value<'p>, times: i64) -> Exec<Value<'p>> {
    let times = usize::try_from(times).unwrap_or(0);
    let len = match sequence {
        Value::Str(s) => s.len(),
        Value::List(items) => items.borrow().len(),
        Value::Tuple(items) => items.len(),
        _ => 0,
    };
    check_len(len.saturating_mul(times))?;
    Ok(match sequence {
        Value::Str(s) => Value::str(s.repeat(times)),
        Value::List(items) => {
            let items = items.borrow();
            Value::list((0..times).flat_map(|_| items.iter().cloned()).collect())
        }
        Value::Tuple(items) => {
            Value::tuple((0..times).flat_map(|_| items.iter().cloned()).collect())
        }
        other => other.clone(),
    })
}

fn arithmetic<'p>(op: BinOp, a: &Value<'p>, b: &Value<'p>) -> Result<Value<'p>, Exception> {
    let (Some(x), Some(y)) = (a.as_num(), b.as_num()) else {
        return Err(Exception::type_error(format!(
            "unsupported operand type(s) for {}: '{}' and '{}'",
            op.symbol(),
            a.type_name(),
            b.type_name()
        )));
    };
    match (x, y) {
        (Num::Int(x), Num::Int(y)) => int_arithmetic(op, x, y),
        (x, y) => float_arithmetic(op, x.as_f64(), y.as_f64()),
    }
}

fn int_arithmetic<'p>(op: BinOp, x: i64, y: i64) -> Result<Value<'p>, Exception> {
    let checked = |result: Option<i64>| result.map(Value::Int).ok_or_else(overflow);
    match op {
        BinOp::Add => checked(x.checked_add(y)),
        BinOp::Sub => checked(x.checked_sub(y)),
        BinOp::Mul => checked(x.checked_mul(y)),
        BinOp::Div => {
            if y == 0 {
                return Err(zero_division("division by zero"));
            }
            Ok(Value::Float(x as f64 / y as f64))
        }
        BinOp::FloorDiv => {
            if y == 0 {
                return Err(zero_division("integer division or modulo by zero"));
            }
            let quotient = x.checked_div(y).ok_or_else(overflow)?;
            let floored = if x % y != 0 && ((x < 0) != (y < 0)) {
                quotient - 1
            } else {
                quotient
            };
            Ok(Value::Int(floored))
        }
        BinOp::Mod => {
            if y == 0 {
                return Err(zero_division("integer division or modulo by zero"));
            }
            let remainder = x.checked_rem(y).ok_or_else(overflow)?;
            Ok(Value::Int(if remainder != 0 && ((remainder < 0) != (y < 0)) {
                remainder + y
            } else {
                remainder
            }))
        }
        BinOp::Pow => {
            if y < 0 {
                return float_arithmetic(op, x as f64, y as f64);
            }
            match x {
                0 | 1 => Ok(Value::Int(if y == 0 { 1 } else { x })),
                -1 => Ok(Value::Int(if y % 2 == 0 { 1 } else { -1 })),
                _ => {
                    let exponent = u32::try_from(y).map_err(|_| overflow())?;
                    checked(x.checked_pow(exponent))
                }
            }
        }
    }
}

fn float_arithmetic<'p>(op: BinOp, x: f64, y: f64) -> Result<Value<'p>, Exception> {
    let result = match op {
        BinOp::Add => x + y,
        BinOp::Sub => x - y,
        BinOp::Mul => x * y,
        BinOp::Div => {
            if y == 0.0 {
                return Err(zero_division("float division by zero"));
            }
            x / y
        }
        BinOp::FloorDiv => {
            if y == 0.0 {
                return Err(zero_division("float floor division by zero"));
            }
            (x / y).floor()
        }
        BinOp::Mod => {
            if y == 0.0 {
                return Err(zero_division("float modulo"));
            }
            let remainder = x % y;
            if remainder != 0.0 && ((remainder < 0.0) != (y < 0.0)) {
                remainder + y
            } else {
                remainder
            }
        }
        BinOp::Pow => {
            if x == 0.0 && y < 0.0 {
                return Err(zero_division("0.0 cannot be raised to a negative power"));
            }
            let result = x.powf(y);
            if result.is_nan() && !x.is_nan() && !y.is_nan() {
                return Err(Exception::value_error(
                    "negative number cannot be raised to a fractional power",
                ));
            }
            if result.is_infinite() && x.is_finite() && y.is_finite() {
                return Err(Exception::new("OverflowError", "numerical result out of range"));
            }
            result
        }
    };
    Ok(Value::Float(result))
}

fn unary<'p>(op: UnaryOp, operand: Value<'p>) -> Result<Value<'p>, Exception> {
    let symbol = match op {
        UnaryOp::Not => return Ok(Value::Bool(!operand.truthy())),
        UnaryOp::Neg => "-",
        UnaryOp::Pos => "+",
    };
    match (op, operand.as_num()) {
        (UnaryOp::Neg, Some(Num::Int(i))) => i.checked_neg().map(Value::Int).ok_or_else(overflow),
        (UnaryOp::Neg, Some(Num::Float(f))) => Ok(Value::Float(-f)),
        (_, Some(Num::Int(i))) => Ok(Value::Int(i)),
        (_, Some(Num::Float(f))) => Ok(Value::Float(f)),
        (_, None) => Err(Exception::type_error(format!(
            "bad operand type for unary {symbol}: '{}'",
            operand.type_name()
        ))),
    }
}

fn compare<'p>(op: CmpOp, a: &Value<'p>, b: &Value<'p>) -> Result<bool, Exception> {
    let ordered = |symbol: &str| -> Result<Option<Ordering>, Exception> {
        match a.py_cmp(b) {
            Some(ordering) => Ok(Some(ordering)),
            // NaN compares false without raising.
            None if a.as_num().is_some() && b.as_num().is_some() => Ok(None),
            None => Err(Exception::type_error(format!(
                "'{symbol}' not supported between instances of '{}' and '{}'",
                a.type_name(),
                b.type_name()
            ))),
        }
    };
    Ok(match op {
        CmpOp::Eq => a.py_eq(b),
        CmpOp::NotEq => !a.py_eq(b),
        CmpOp::Lt => ordered("<")?.is_some_and(Ordering::is_lt),
        CmpOp::LtE => ordered("<=")?.is_some_and(Ordering::is_le),
        CmpOp::Gt => ordered(">")?.is_some_and(Ordering::is_gt),
        CmpOp::GtE => ordered(">=")?.is_some_and(Ordering::is_ge),
        CmpOp::In => contains(b, a)?,
        CmpOp::NotIn => !contains(b, a)?,
        CmpOp::Is => a.is_same(b),
        CmpOp::IsNot => !a.is_same(b),
    })
}

pub(super) fn contains<'p>(container: &Value<'p>, item: &Value<'p>) -> Result<bool, Exception> {
    match container {
        Value::Str(haystack) => match item {
            Value::Str(needle) => Ok(haystack.contains(needle.as_ref())),
            other => Err(Exception::type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        Value::List(items) => Ok(items.borrow().iter().any(|v| v.py_eq(item))),
        Value::Tuple(items) => Ok(items.iter().any(|v| v.py_eq(item))),
        Value::Dict(entries) => Ok(entries.borrow().contains_key(&Key::from_value(item)?)),
        Value::Range { start, stop, step } => Ok(match item.as_int() {
            Some(i) => {
                let in_bounds = if *step > 0 {
                    *start <= i && i < *stop
                } else {
                    *stop < i && i <= *start
                };
                in_bounds && (i128::from(i) - i128::from(*start)) % i128::from(*step) == 0
            }
            None => false,
        }),
        other => Err(Exception::type_error(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

// ---------------------------------------------------------------------------
// Indexing
// ---------------------------------------------------------------------------

fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = i64::try_from(len).ok()?;
    let index = if index < 0 { index.checked_add(len)? } else { index };
    if (0..len).contains(&index) {
        usize::try_from(index).ok()
    } else {
        None
    }
}

fn index_int(index: &Value<'_>, what: &str) -> Result<i64, Exception> {
    index.as_int().ok_or_else(|| {
        Exception::type_error(format!(
            "{what} indices must be integers, not {}",
            index.type_name()
        ))
    })
}

pub(super) fn get_item<'p>(container: &Value<'p>, index: &Value<'p>) -> Result<Value<'p>, Exception> {
    let out_of_range = |what: &str| Exception::new("IndexError", format!("{what} index out of range"));
    match container {
        Value::List(items) => {
            let items = items.borrow();
            let i = normalize_index(index_int(index, "list")?, items.len())
                .ok_or_else(|| out_of_range("list"))?;
            Ok(items[i].clone())
        }
        Value::Tuple(items) => {
            let i = normalize_index(index_int(index, "tuple")?, items.len())
                .ok_or_else(|| out_of_range("tuple"))?;
            Ok(items[i].clone())
        }
        Value::Str(s) => {
            let i = normalize_index(index_int(index, "string")?, s.chars().count())
                .ok_or_else(|| out_of_range("string"))?;
            Ok(Value::str(s.chars().nth(i).map(String::from).unwrap_or_default()))
        }
        Value::Dict(entries) => {
            let key = Key::from_value(index)?;
            entries
                .borrow()
                .get(&key)
                .cloned()
                .ok_or_else(|| Exception::new("KeyError", index.repr()))
        }
        Value::Range { start, stop, step } => {
            let len = usize::try_from(range_len(*start, *stop, *step)).unwrap_or(usize::MAX);
            let i = normalize_index(index_int(index, "range")?, len)
                .ok_or_else(|| out_of_range("range object"))?;
            let value = i128::from(*start) + i128::from(*step) * i128::try_from(i).unwrap_or(0);
            i64::try_from(value).map(Value::Int).map_err(|_| overflow())
        }
        Value::Match(data) => modules::match_group(data, index),
        other => Err(Exception::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

pub(super) fn set_item<'p>(
    container: &Value<'p>,
    index: Value<'p>,
    value: Value<'p>,
) -> Result<(), Exception> {
    match container {
        Value::List(items) => {
            let mut items = items.borrow_mut();
            let len = items.len();
            let i = normalize_index(index_int(&index, "list")?, len).ok_or_else(|| {
                Exception::new("IndexError", "list assignment index out of range")
            })?;
            items[i] = value;
            Ok(())
        }
        Value::Dict(entries) => {
            let key = Key::from_value(&index)?;
            entries.borrow_mut().insert(key, value);
            Ok(())
        }
        other => Err(Exception::type_error(format!(
            "'{}' object does not support item assignment",
            other.type_name()
        ))),
    }
}

fn slice_bounds(lower: Option<i64>, upper: Option<i64>, len: usize) -> (usize, usize) {
    let len_i = i64::try_from(len).unwrap_or(i64::MAX);
    let clamp = |bound: i64| -> usize {
        let bound = if bound < 0 {
            bound.saturating_add(len_i).max(0)
        } else {
            bound.min(len_i)
        };
        usize::try_from(bound).unwrap_or(0)
    };
    let start = lower.map_or(0, clamp);
    let end = upper.map_or(len, clamp);
    (start, end.max(start))
}

fn slice<'p>(container: &Value<'p>, lower: Option<i64>, upper: Option<i64>) -> Result<Value<'p>, Exception> {
    match container {
        Value::List(items) => {
            let items = items.borrow();
            let (start, end) = slice_bounds(lower, upper, items.len());
            Ok(Value::list(items[start..end].to_vec()))
        }
        Value::Tuple(items) => {
            let (start, end) = slice_bounds(lower, upper, items.len());
            Ok(Value::tuple(items[start..end].to_vec()))
        }
        Value::Str(s) => {
            let (start, end) = slice_bounds(lower, upper, s.chars().count());
            Ok(Value::str(
                s.chars().skip(start).take(end - start).collect::<String>(),
            ))
        }
        Value::Range { start, stop, step } => {
            let len = usize::try_from(range_len(*start, *stop, *step)).unwrap_or(usize::MAX);
            let (from, to) = slice_bounds(lower, upper, len);
            let at = |i: usize| -> Result<i64, Exception> {
                let value = i128::from(*start) + i128::from(*step) * i128::try_from(i).unwrap_or(0);
                i64::try_from(value).map_err(|_| overflow())
            };
            Ok(Value::Range {
                start: at(from)?,
                stop: at(to)?,
                step: *step,
            })
        }
        other => Err(Exception::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}
