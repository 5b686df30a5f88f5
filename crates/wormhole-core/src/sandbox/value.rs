//! Runtime values of the sandbox.
//!
//! Values borrow function bodies from the cached program (`'p`) instead of
//! copying them. Containers are reference counted with interior mutability
//! so aliasing behaves like the surface language expects; everything is
//! dropped together with the per-call namespace.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use wormhole_state::Scalar;

use crate::lang::ast::{Expr, FunctionDef, Param};

/// Depth beyond which printing, comparing and JSON shaping give up.
pub const MAX_VALUE_DEPTH: usize = 100;

/// Exception classes the sandbox knows about.
pub const EXCEPTION_CLASSES: &[&str] = &[
    "Exception",
    "ArithmeticError",
    "LookupError",
    "ValueError",
    "TypeError",
    "KeyError",
    "IndexError",
    "RuntimeError",
    "ZeroDivisionError",
    "OverflowError",
    "NameError",
    "AttributeError",
    "ImportError",
    "BridgeError",
];

/// Resolve an exception class name to its static spelling.
pub fn exception_class(name: &str) -> Option<&'static str> {
    EXCEPTION_CLASSES.iter().copied().find(|c| *c == name)
}

/// Whether `class` is caught by an `except base` clause.
pub fn is_subclass(class: &str, base: &str) -> bool {
    class == base
        || base == "Exception"
        || (base == "LookupError" && matches!(class, "KeyError" | "IndexError"))
        || (base == "ArithmeticError" && matches!(class, "ZeroDivisionError" | "OverflowError"))
}

/// A raised error that sandboxed code may catch.
#[derive(Debug, Clone, PartialEq)]
pub struct Exception {
    pub class: &'static str,
    pub message: String,
}

impl Exception {
    pub fn new(class: &'static str, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new("ValueError", message)
    }
}

impl std::fmt::Display for Exception {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.class)
        } else {
            write!(f, "{}: {}", self.class, self.message)
        }
    }
}

/// Hashable dict keys, ordered so dicts iterate by key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Key {
    None,
    Bool(bool),
    Int(i64),
    Str(Rc<str>),
    Tuple(Vec<Key>),
}

impl Key {
    pub fn from_value(value: &Value<'_>) -> Result<Self, Exception> {
        match value {
            Value::None => Ok(Key::None),
            Value::Bool(b) => Ok(Key::Bool(*b)),
            Value::Int(i) => Ok(Key::Int(*i)),
            Value::Str(s) => Ok(Key::Str(s.clone())),
            Value::Tuple(items) => items
                .iter()
                .map(Key::from_value)
                .collect::<Result<_, _>>()
                .map(Key::Tuple),
            other => Err(Exception::type_error(format!(
                "unhashable dict key type: '{}'",
                other.type_name()
            ))),
        }
    }

    pub fn to_value<'p>(&self) -> Value<'p> {
        match self {
            Key::None => Value::None,
            Key::Bool(b) => Value::Bool(*b),
            Key::Int(i) => Value::Int(*i),
            Key::Str(s) => Value::Str(s.clone()),
            Key::Tuple(items) => Value::tuple(items.iter().map(Key::to_value).collect()),
        }
    }
}

/// A lexical scope. Function calls, lambdas and comprehensions each get one.
#[derive(Debug, Default)]
pub struct Env<'p> {
    vars: RefCell<HashMap<String, Value<'p>>>,
    parent: Option<Rc<Env<'p>>>,
}

impl<'p> Env<'p> {
    pub fn root() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn child(parent: &Rc<Self>) -> Rc<Self> {
        Rc::new(Self {
            vars: RefCell::new(HashMap::new()),
            parent: Some(parent.clone()),
        })
    }

    pub fn get(&self, name: &str) -> Option<Value<'p>> {
        if let Some(value) = self.vars.borrow().get(name) {
            return Some(value.clone());
        }
        self.parent.as_ref().and_then(|parent| parent.get(name))
    }

    /// Bind in this scope only.
    pub fn set(&self, name: &str, value: Value<'p>) {
        self.vars.borrow_mut().insert(name.to_string(), value);
    }

    /// Drop every binding, breaking reference cycles through closures.
    pub fn clear(&self) {
        let drained: Vec<_> = self.vars.borrow_mut().drain().collect();
        drop(drained);
    }
}

/// What a user-defined function evaluates.
#[derive(Debug, Clone, Copy)]
pub enum Body<'p> {
    Block(&'p FunctionDef),
    Lambda(&'p Expr),
}

/// A user-defined function or lambda with its defining scope.
#[derive(Debug)]
pub struct Closure<'p> {
    pub name: String,
    pub params: &'p [Param],
    /// Default values, evaluated once when the function was defined.
    pub defaults: Vec<Option<Value<'p>>>,
    pub body: Body<'p>,
    pub env: Rc<Env<'p>>,
}

/// Safe builtins available in every namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Len,
    Range,
    Str,
    Int,
    Float,
    Bool,
    Abs,
    Min,
    Max,
    Sum,
    Round,
    Sorted,
    Reversed,
    List,
    Dict,
    Tuple,
    Enumerate,
    Zip,
    Any,
    All,
    /// Exception constructor.
    Exception(&'static str),
}

impl Builtin {
    /// Builtins bound by name in every fresh namespace.
    pub const FUNCTIONS: &'static [(&'static str, Builtin)] = &[
        ("len", Builtin::Len),
        ("range", Builtin::Range),
        ("str", Builtin::Str),
        ("int", Builtin::Int),
        ("float", Builtin::Float),
        ("bool", Builtin::Bool),
        ("abs", Builtin::Abs),
        ("min", Builtin::Min),
        ("max", Builtin::Max),
        ("sum", Builtin::Sum),
        ("round", Builtin::Round),
        ("sorted", Builtin::Sorted),
        ("reversed", Builtin::Reversed),
        ("list", Builtin::List),
        ("dict", Builtin::Dict),
        ("tuple", Builtin::Tuple),
        ("enumerate", Builtin::Enumerate),
        ("zip", Builtin::Zip),
        ("any", Builtin::Any),
        ("all", Builtin::All),
    ];

    /// Exception classes constructible by name.
    pub const EXCEPTIONS: &'static [&'static str] = &[
        "Exception",
        "ValueError",
        "TypeError",
        "KeyError",
        "IndexError",
        "RuntimeError",
        "ZeroDivisionError",
        "ArithmeticError",
        "LookupError",
        "OverflowError",
    ];

    pub fn name(self) -> &'static str {
        match self {
            Builtin::Exception(class) => class,
            other => Self::FUNCTIONS
                .iter()
                .find(|(_, b)| *b == other)
                .map(|(name, _)| *name)
                .unwrap_or("builtin"),
        }
    }
}

/// A function exported by a host module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostFn {
    pub module: &'static str,
    pub name: &'static str,
}

/// A method looked up on a value, waiting to be called.
#[derive(Debug)]
pub struct BoundMethod<'p> {
    pub receiver: Value<'p>,
    pub name: &'static str,
}

/// Result of a successful `re` match.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchData {
    /// Group 0 is the whole match.
    pub groups: Vec<Option<String>>,
    /// Character offsets of the whole match.
    pub span: (usize, usize),
}

#[derive(Debug, Clone)]
pub enum Value<'p> {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    List(Rc<RefCell<Vec<Value<'p>>>>),
    Tuple(Rc<Vec<Value<'p>>>),
    Dict(Rc<RefCell<BTreeMap<Key, Value<'p>>>>),
    Range { start: i64, stop: i64, step: i64 },
    Function(Rc<Closure<'p>>),
    Builtin(Builtin),
    HostFn(HostFn),
    Module(&'static str),
    Method(Rc<BoundMethod<'p>>),
    Exception(Rc<Exception>),
    Match(Rc<MatchData>),
    /// The bridge entry point.
    Bridge,
}

/// A number operand, with bools promoted to ints.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    pub fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }
}

impl<'p> Value<'p> {
    pub fn str(s: impl Into<Rc<str>>) -> Self {
        Value::Str(s.into())
    }

    pub fn list(items: Vec<Value<'p>>) -> Self {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn tuple(items: Vec<Value<'p>>) -> Self {
        Value::Tuple(Rc::new(items))
    }

    pub fn dict(entries: BTreeMap<Key, Value<'p>>) -> Self {
        Value::Dict(Rc::new(RefCell::new(entries)))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::Range { .. } => "range",
            Value::Function(_) => "function",
            Value::Builtin(Builtin::Exception(_)) => "type",
            Value::Builtin(_) | Value::HostFn(_) | Value::Bridge => "builtin_function_or_method",
            Value::Module(_) => "module",
            Value::Method(_) => "method",
            Value::Exception(e) => e.class,
            Value::Match(_) => "re.Match",
        }
    }

    pub fn is_callable(&self) -> bool {
        matches!(
            self,
            Value::Function(_)
                | Value::Builtin(_)
                | Value::HostFn(_)
                | Value::Method(_)
                | Value::Bridge
        )
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.borrow().is_empty(),
            Value::Tuple(items) => !items.is_empty(),
            Value::Dict(entries) => !entries.borrow().is_empty(),
            Value::Range { start, stop, step } => range_len(*start, *stop, *step) > 0,
            _ => true,
        }
    }

    pub fn as_num(&self) -> Option<Num> {
        match self {
            Value::Bool(b) => Some(Num::Int(i64::from(*b))),
            Value::Int(i) => Some(Num::Int(*i)),
            Value::Float(f) => Some(Num::Float(*f)),
            _ => None,
        }
    }

    /// Integer view for indices and counts; bools count as ints.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// `str(value)`
    pub fn to_display(&self) -> String {
        match self {
            Value::Str(s) => s.to_string(),
            Value::Exception(e) => e.message.clone(),
            other => other.repr(),
        }
    }

    /// `repr(value)`
    pub fn repr(&self) -> String {
        let mut out = String::new();
        self.write_repr(&mut out, 0);
        out
    }

    fn write_repr(&self, out: &mut String, depth: usize) {
        if depth > MAX_VALUE_DEPTH {
            out.push_str("...");
            return;
        }
        match self {
            Value::None => out.push_str("None"),
            Value::Bool(true) => out.push_str("True"),
            Value::Bool(false) => out.push_str("False"),
            Value::Int(i) => out.push_str(&i.to_string()),
            Value::Float(f) => out.push_str(&format_float(*f)),
            Value::Str(s) => out.push_str(&quote(s)),
            Value::List(items) => {
                out.push('[');
                write_items(out, &items.borrow(), depth);
                out.push(']');
            }
            Value::Tuple(items) => {
                out.push('(');
                write_items(out, items, depth);
                if items.len() == 1 {
                    out.push(',');
                }
                out.push(')');
            }
            Value::Dict(entries) => {
                out.push('{');
                for (i, (key, value)) in entries.borrow().iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    key.to_value().write_repr(out, depth + 1);
                    out.push_str(": ");
                    value.write_repr(out, depth + 1);
                }
                out.push('}');
            }
            Value::Range { start, stop, step } => {
                if *step == 1 {
                    out.push_str(&format!("range({start}, {stop})"));
                } else {
                    out.push_str(&format!("range({start}, {stop}, {step})"));
                }
            }
            Value::Function(f) => out.push_str(&format!("<function {}>", f.name)),
            Value::Builtin(Builtin::Exception(class)) => {
                out.push_str(&format!("<class '{class}'>"))
            }
            Value::Builtin(b) => out.push_str(&format!("<built-in function {}>", b.name())),
            Value::HostFn(h) => {
                out.push_str(&format!("<built-in function {}.{}>", h.module, h.name))
            }
            Value::Module(name) => out.push_str(&format!("<module '{name}'>")),
            Value::Method(m) => out.push_str(&format!(
                "<method {} of {} object>",
                m.name,
                m.receiver.type_name()
            )),
            Value::Exception(e) => out.push_str(&format!("{}({})", e.class, quote(&e.message))),
            Value::Match(m) => out.push_str(&format!(
                "<re.Match object; span=({}, {}), match={}>",
                m.span.0,
                m.span.1,
                quote(m.groups.first().cloned().flatten().as_deref().unwrap_or(""))
            )),
            Value::Bridge => out.push_str("<built-in function query>"),
        }
    }

    /// `==`
    pub fn py_eq(&self, other: &Value<'p>) -> bool {
        self.eq_at(other, 0)
    }

    fn eq_at(&self, other: &Value<'p>, depth: usize) -> bool {
        if depth > MAX_VALUE_DEPTH {
            return false;
        }
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                Rc::ptr_eq(a, b) || seq_eq(&a.borrow(), &b.borrow(), depth)
            }
            (Value::Tuple(a), Value::Tuple(b)) => seq_eq(a, b, depth),
            (Value::Dict(a), Value::Dict(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|((ka, va), (kb, vb))| ka == kb && va.eq_at(vb, depth + 1))
            }
            (Value::Range { .. }, Value::Range { .. }) => self.repr() == other.repr(),
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            (Value::HostFn(a), Value::HostFn(b)) => a == b,
            (Value::Module(a), Value::Module(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Exception(a), Value::Exception(b)) => Rc::ptr_eq(a, b),
            (Value::Match(a), Value::Match(b)) => Rc::ptr_eq(a, b),
            (Value::Bridge, Value::Bridge) => true,
            (a, b) => match (a.as_num(), b.as_num()) {
                (Some(Num::Int(x)), Some(Num::Int(y))) => x == y,
                (Some(x), Some(y)) => x.as_f64() == y.as_f64(),
                _ => false,
            },
        }
    }

    /// `is`
    pub fn is_same(&self, other: &Value<'p>) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => Rc::ptr_eq(a, b) || a == b,
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
            (Value::Tuple(a), Value::Tuple(b)) => Rc::ptr_eq(a, b),
            (Value::Dict(a), Value::Dict(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Exception(a), Value::Exception(b)) => Rc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            (Value::Module(a), Value::Module(b)) => a == b,
            (Value::Bridge, Value::Bridge) => true,
            _ => false,
        }
    }

    /// Ordering for `<`, `sorted`, `min` and `max`. `None` when the two
    /// values are not comparable.
    pub fn py_cmp(&self, other: &Value<'p>) -> Option<Ordering> {
        self.cmp_at(other, 0)
    }

    fn cmp_at(&self, other: &Value<'p>, depth: usize) -> Option<Ordering> {
        if depth > MAX_VALUE_DEPTH {
            return None;
        }
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::List(a), Value::List(b)) => seq_cmp(&a.borrow(), &b.borrow(), depth),
            (Value::Tuple(a), Value::Tuple(b)) => seq_cmp(a, b, depth),
            (a, b) => match (a.as_num()?, b.as_num()?) {
                (Num::Int(x), Num::Int(y)) => Some(x.cmp(&y)),
                (x, y) => x.as_f64().partial_cmp(&y.as_f64()),
            },
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::None,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::str(s.as_str()),
            serde_json::Value::Array(items) => {
                Value::list(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::dict(
                map.iter()
                    .map(|(k, v)| (Key::Str(k.as_str().into()), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Shape a value as JSON. Functions, modules and other runtime objects
    /// are not serializable.
    pub fn to_json(&self) -> Result<serde_json::Value, Exception> {
        self.json_at(0)
    }

    fn json_at(&self, depth: usize) -> Result<serde_json::Value, Exception> {
        if depth > MAX_VALUE_DEPTH {
            return Err(Exception::value_error("value nested too deeply to serialize"));
        }
        Ok(match self {
            Value::None => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .ok_or_else(|| {
                    Exception::value_error(format!("float {} is not JSON serializable", format_float(*f)))
                })?,
            Value::Str(s) => serde_json::Value::String(s.to_string()),
            Value::List(items) => serde_json::Value::Array(
                items
                    .borrow()
                    .iter()
                    .map(|v| v.json_at(depth + 1))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Tuple(items) => serde_json::Value::Array(
                items
                    .iter()
                    .map(|v| v.json_at(depth + 1))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Dict(entries) => {
                let mut map = serde_json::Map::new();
                for (key, value) in entries.borrow().iter() {
                    map.insert(json_key(key)?, value.json_at(depth + 1)?);
                }
                serde_json::Value::Object(map)
            }
            other => {
                return Err(Exception::type_error(format!(
                    "Object of type {} is not JSON serializable",
                    other.type_name()
                )))
            }
        })
    }

    /// Bridge parameter view: scalars only.
    pub fn to_scalar(&self) -> Option<Scalar> {
        match self {
            Value::None => Some(Scalar::Null),
            Value::Bool(b) => Some(Scalar::Bool(*b)),
            Value::Int(i) => Some(Scalar::Int(*i)),
            Value::Float(f) => Some(Scalar::Float(*f)),
            Value::Str(s) => Some(Scalar::Text(s.to_string())),
            _ => None,
        }
    }

    pub fn from_scalar(scalar: &Scalar) -> Self {
        match scalar {
            Scalar::Null => Value::None,
            Scalar::Bool(b) => Value::Bool(*b),
            Scalar::Int(i) => Value::Int(*i),
            Scalar::Float(f) => Value::Float(*f),
            Scalar::Text(s) => Value::str(s.as_str()),
        }
    }
}

fn json_key(key: &Key) -> Result<String, Exception> {
    match key {
        Key::Str(s) => Ok(s.to_string()),
        Key::Int(i) => Ok(i.to_string()),
        Key::Bool(b) => Ok(b.to_string()),
        Key::None => Ok("null".to_string()),
        Key::Tuple(_) => Err(Exception::type_error(
            "keys must be str, int, float, bool or None, not tuple",
        )),
    }
}

fn write_items(out: &mut String, items: &[Value<'_>], depth: usize) {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        item.write_repr(out, depth + 1);
    }
}

fn seq_eq<'p>(a: &[Value<'p>], b: &[Value<'p>], depth: usize) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.eq_at(y, depth + 1))
}

fn seq_cmp<'p>(a: &[Value<'p>], b: &[Value<'p>], depth: usize) -> Option<Ordering> {
    for (x, y) in a.iter().zip(b) {
        if x.eq_at(y, depth + 1) {
            continue;
        }
        return x.cmp_at(y, depth + 1);
    }
    Some(a.len().cmp(&b.len()))
}

/// Number of elements in `range(start, stop, step)`; `step` is never 0.
pub fn range_len(start: i64, stop: i64, step: i64) -> u64 {
    let (start, stop, step) = (i128::from(start), i128::from(stop), i128::from(step));
    let span = if step > 0 { stop - start } else { start - stop };
    if span <= 0 {
        return 0;
    }
    let step = step.abs();
    u64::try_from((span + step - 1) / step).unwrap_or(u64::MAX)
}

/// Single-quoted string literal with escapes.
pub fn quote(s: &str) -> String {
    let delimiter = if s.contains('\'') && !s.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(delimiter);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == delimiter => {
                out.push('\\');
                out.push(c);
            }
            c if c.is_control() => out.push_str(&format!("\\x{:02x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push(delimiter);
    out
}

/// Float text the way the surface language prints it: `1.0`, `0.1`,
/// `1e+20`, `inf`, `nan`.
pub fn format_float(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let abs = f.abs();
    if abs != 0.0 && !(1e-4..1e16).contains(&abs) {
        let text = format!("{f:e}");
        let (mantissa, exponent) = text.split_once('e').unwrap_or((&text, "0"));
        let (sign, digits) = match exponent.strip_prefix('-') {
            Some(digits) => ('-', digits),
            None => ('+', exponent),
        };
        return format!("{mantissa}e{sign}{digits:0>2}");
    }
    let text = f.to_string();
    if text.contains('.') {
        text
    } else {
        format!("{text}.0")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_formatting() {
        assert_eq!(format_float(1.0), "1.0");
        assert_eq!(format_float(0.1), "0.1");
        assert_eq!(format_float(-2.5), "-2.5");
        assert_eq!(format_float(1e20), "1e+20");
        assert_eq!(format_float(1.5e-7), "1.5e-07");
        assert_eq!(format_float(f64::INFINITY), "inf");
        assert_eq!(format_float(0.0), "0.0");
    }

    #[test]
    fn repr_of_containers() {
        let value = Value::list(vec![
            Value::Int(1),
            Value::str("a'b"),
            Value::tuple(vec![Value::None]),
            Value::dict(BTreeMap::from([(Key::Str("k".into()), Value::Bool(true))])),
        ]);
        assert_eq!(value.repr(), "[1, \"a'b\", (None,), {'k': True}]");
        assert_eq!(Value::str("x").to_display(), "x");
    }

    #[test]
    fn numeric_equality_and_ordering_cross_types() {
        assert!(Value::Int(1).py_eq(&Value::Float(1.0)));
        assert!(Value::Bool(true).py_eq(&Value::Int(1)));
        assert_eq!(Value::Int(2).py_cmp(&Value::Float(1.5)), Some(Ordering::Greater));
        assert_eq!(Value::str("a").py_cmp(&Value::Int(1)), None);
        let a = Value::tuple(vec![Value::Int(1), Value::str("b")]);
        let b = Value::tuple(vec![Value::Int(1), Value::str("c")]);
        assert_eq!(a.py_cmp(&b), Some(Ordering::Less));
    }

    #[test]
    fn json_shaping() {
        let value = Value::dict(BTreeMap::from([
            (Key::Str("n".into()), Value::Int(3)),
            (Key::Int(7), Value::list(vec![Value::Float(0.5), Value::None])),
        ]));
        assert_eq!(
            value.to_json().unwrap(),
            serde_json::json!({"n": 3, "7": [0.5, null]})
        );
        let err = Value::Module("math").to_json().unwrap_err();
        assert_eq!(err.class, "TypeError");
        assert!(Value::Float(f64::NAN).to_json().is_err());
    }

    #[test]
    fn self_referencing_list_is_bounded() {
        let list = Value::list(vec![]);
        if let Value::List(items) = &list {
            items.borrow_mut().push(list.clone());
        }
        assert!(list.repr().contains("..."));
        assert!(list.to_json().is_err());
        if let Value::List(items) = &list {
            items.borrow_mut().clear();
        }
    }

    #[test]
    fn exception_hierarchy() {
        assert!(is_subclass("KeyError", "LookupError"));
        assert!(is_subclass("ZeroDivisionError", "Exception"));
        assert!(!is_subclass("ValueError", "TypeError"));
        assert_eq!(exception_class("BridgeError"), Some("BridgeError"));
        assert_eq!(exception_class("SystemExit"), None);
    }

    #[test]
    fn range_lengths() {
        assert_eq!(range_len(0, 10, 1), 10);
        assert_eq!(range_len(0, 10, 3), 4);
        assert_eq!(range_len(10, 0, -2), 5);
        assert_eq!(range_len(5, 5, 1), 0);
        assert_eq!(range_len(i64::MIN, i64::MAX, 1), u64::MAX);
    }
}
