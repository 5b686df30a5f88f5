//! Safe builtins and the methods of builtin types.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::rc::Rc;

use super::interp::{binary, check_len, Exec, Interp};
use super::modules::{self, float_to_int};
use super::value::{
    quote, range_len, BoundMethod, Builtin, Exception, Key, MatchData, Num, Value,
};
use crate::lang::ast::BinOp;

const STR_METHODS: &[&str] = &[
    "upper",
    "lower",
    "title",
    "capitalize",
    "strip",
    "lstrip",
    "rstrip",
    "split",
    "splitlines",
    "join",
    "replace",
    "startswith",
    "endswith",
    "find",
    "index",
    "count",
    "isdigit",
    "isalpha",
    "isalnum",
    "isspace",
];

const LIST_METHODS: &[&str] = &[
    "append", "extend", "pop", "insert", "remove", "index", "count", "sort", "reverse", "copy",
    "clear",
];

const TUPLE_METHODS: &[&str] = &["index", "count"];

const DICT_METHODS: &[&str] = &[
    "get",
    "keys",
    "values",
    "items",
    "pop",
    "update",
    "setdefault",
    "copy",
    "clear",
];

const MATCH_METHODS: &[&str] = &["group", "groups", "start", "end", "span"];

fn methods_of(value: &Value<'_>) -> &'static [&'static str] {
    match value {
        Value::Str(_) => STR_METHODS,
        Value::List(_) => LIST_METHODS,
        Value::Tuple(_) => TUPLE_METHODS,
        Value::Dict(_) => DICT_METHODS,
        Value::Match(_) => MATCH_METHODS,
        _ => &[],
    }
}

/// `value.attr`: module members, exception args and bound methods.
pub(super) fn get_attribute<'p>(value: Value<'p>, attr: &str) -> Result<Value<'p>, Exception> {
    match &value {
        Value::Module(module) => {
            return modules::attribute(module, attr).ok_or_else(|| {
                Exception::new(
                    "AttributeError",
                    format!("module '{module}' has no attribute '{attr}'"),
                )
            })
        }
        Value::Exception(exc) if attr == "args" => {
            let args = if exc.message.is_empty() {
                Vec::new()
            } else {
                vec![Value::str(exc.message.as_str())]
            };
            return Ok(Value::tuple(args));
        }
        _ => {}
    }
    match methods_of(&value).iter().copied().find(|name| *name == attr) {
        Some(name) => Ok(Value::Method(Rc::new(BoundMethod {
            receiver: value,
            name,
        }))),
        None => Err(Exception::new(
            "AttributeError",
            format!("'{}' object has no attribute '{attr}'", value.type_name()),
        )),
    }
}

fn arity(name: &str, args: &[Value<'_>], min: usize, max: usize) -> Result<(), Exception> {
    let n = args.len();
    if n < min || n > max {
        let expected = match (min, max) {
            (min, max) if min == max => min.to_string(),
            (min, usize::MAX) => format!("at least {min}"),
            (min, max) => format!("{min} to {max}"),
        };
        return Err(Exception::type_error(format!(
            "{name}() takes {expected} positional argument(s) but {n} were given"
        )));
    }
    Ok(())
}

/// Keyword arguments checked against what a callable accepts.
struct Keywords<'p>(Vec<(String, Value<'p>)>);

impl<'p> Keywords<'p> {
    fn accept(
        name: &str,
        kwargs: Vec<(String, Value<'p>)>,
        allowed: &[&str],
    ) -> Result<Self, Exception> {
        if let Some((key, _)) = kwargs.iter().find(|(k, _)| !allowed.contains(&k.as_str())) {
            return Err(Exception::type_error(format!(
                "{name}() got an unexpected keyword argument '{key}'"
            )));
        }
        Ok(Self(kwargs))
    }

    fn take(&mut self, key: &str) -> Option<Value<'p>> {
        let index = self.0.iter().position(|(k, _)| k == key)?;
        Some(self.0.swap_remove(index).1)
    }
}

/// Positional argument `index`, falling back to keyword `key`.
fn arg_or<'p>(args: &[Value<'p>], index: usize, kw: &mut Keywords<'p>, key: &str) -> Option<Value<'p>> {
    args.get(index).cloned().or_else(|| kw.take(key))
}

fn int_arg(name: &str, value: &Value<'_>) -> Result<i64, Exception> {
    value.as_int().ok_or_else(|| {
        Exception::type_error(format!(
            "{name}(): '{}' object cannot be interpreted as an integer",
            value.type_name()
        ))
    })
}

fn str_arg<'v>(name: &str, value: &'v Value<'_>) -> Result<&'v str, Exception> {
    value.as_str().ok_or_else(|| {
        Exception::type_error(format!(
            "{name}() argument must be str, not {}",
            value.type_name()
        ))
    })
}

fn overflow() -> Exception {
    Exception::new("OverflowError", "integer overflow")
}

impl<'a, 'p> Interp<'a, 'p> {
    pub(super) fn call_builtin(
        &mut self,
        builtin: Builtin,
        args: Vec<Value<'p>>,
        kwargs: Vec<(String, Value<'p>)>,
    ) -> Exec<Value<'p>> {
        let name = builtin.name();
        match builtin {
            Builtin::Exception(class) => {
                Keywords::accept(name, kwargs, &[])?;
                let message = match args.as_slice() {
                    [] => String::new(),
                    [one] => one.to_display(),
                    many => Value::tuple(many.to_vec()).repr(),
                };
                Ok(Value::Exception(Rc::new(Exception::new(class, message))))
            }
            Builtin::Len => {
                Keywords::accept(name, kwargs, &[])?;
                arity(name, &args, 1, 1)?;
                Ok(Value::Int(length(&args[0])?))
            }
            Builtin::Range => {
                Keywords::accept(name, kwargs, &[])?;
                arity(name, &args, 1, 3)?;
                Ok(make_range(&args)?)
            }
            Builtin::Str => {
                Keywords::accept(name, kwargs, &[])?;
                arity(name, &args, 0, 1)?;
                Ok(Value::str(
                    args.first().map(Value::to_display).unwrap_or_default(),
                ))
            }
            Builtin::Int => {
                let mut kw = Keywords::accept(name, kwargs, &["base"])?;
                arity(name, &args, 0, 2)?;
                let base = arg_or(&args, 1, &mut kw, "base");
                Ok(to_int(args.first(), base)?)
            }
            Builtin::Float => {
                Keywords::accept(name, kwargs, &[])?;
                arity(name, &args, 0, 1)?;
                Ok(to_float(args.first())?)
            }
            Builtin::Bool => {
                Keywords::accept(name, kwargs, &[])?;
                arity(name, &args, 0, 1)?;
                Ok(Value::Bool(args.first().is_some_and(Value::truthy)))
            }
            Builtin::Abs => {
                Keywords::accept(name, kwargs, &[])?;
                arity(name, &args, 1, 1)?;
                Ok(abs(&args[0])?)
            }
            Builtin::Min | Builtin::Max => {
                let kw = Keywords::accept(name, kwargs, &["key", "default"])?;
                self.extreme(name, builtin == Builtin::Max, args, kw)
            }
            Builtin::Sum => {
                let mut kw = Keywords::accept(name, kwargs, &["start"])?;
                arity(name, &args, 1, 2)?;
                let start = arg_or(&args, 1, &mut kw, "start").unwrap_or(Value::Int(0));
                if matches!(start, Value::Str(_)) {
                    return Err(Exception::type_error(
                        "sum() can't sum strings [use ''.join(seq) instead]",
                    )
                    .into());
                }
                let mut total = start;
                for item in self.iterate(&args[0])? {
                    self.tick()?;
                    total = binary(BinOp::Add, total, item)?;
                }
                Ok(total)
            }
            Builtin::Round => {
                let mut kw = Keywords::accept(name, kwargs, &["ndigits"])?;
                arity(name, &args, 1, 2)?;
                let ndigits = arg_or(&args, 1, &mut kw, "ndigits");
                Ok(round(&args[0], ndigits)?)
            }
            Builtin::Sorted => {
                let mut kw = Keywords::accept(name, kwargs, &["key", "reverse"])?;
                arity(name, &args, 1, 1)?;
                let items = self.iterate(&args[0])?;
                let key = kw.take("key");
                let reverse = kw.take("reverse").is_some_and(|v| v.truthy());
                Ok(Value::list(self.sort_values(items, key, reverse)?))
            }
            Builtin::Reversed => {
                Keywords::accept(name, kwargs, &[])?;
                arity(name, &args, 1, 1)?;
                let mut items = self.iterate(&args[0])?;
                items.reverse();
                Ok(Value::list(items))
            }
            Builtin::List | Builtin::Tuple => {
                Keywords::accept(name, kwargs, &[])?;
                arity(name, &args, 0, 1)?;
                let items = match args.first() {
                    Some(iterable) => self.iterate(iterable)?,
                    None => Vec::new(),
                };
                Ok(if builtin == Builtin::List {
                    Value::list(items)
                } else {
                    Value::tuple(items)
                })
            }
            Builtin::Dict => {
                arity(name, &args, 0, 1)?;
                let mut map = BTreeMap::new();
                if let Some(source) = args.first() {
                    map.extend(self.pairs(source)?);
                }
                for (key, value) in kwargs {
                    map.insert(Key::Str(key.into()), value);
                }
                Ok(Value::dict(map))
            }
            Builtin::Enumerate => {
                let mut kw = Keywords::accept(name, kwargs, &["start"])?;
                arity(name, &args, 1, 2)?;
                let start = match arg_or(&args, 1, &mut kw, "start") {
                    Some(value) => int_arg(name, &value)?,
                    None => 0,
                };
                let items = self.iterate(&args[0])?;
                let mut out = Vec::with_capacity(items.len());
                for (offset, item) in (0_i64..).zip(items) {
                    let index = start.checked_add(offset).ok_or_else(overflow)?;
                    out.push(Value::tuple(vec![Value::Int(index), item]));
                }
                Ok(Value::list(out))
            }
            Builtin::Zip => {
                Keywords::accept(name, kwargs, &[])?;
                let mut columns = Vec::with_capacity(args.len());
                for iterable in &args {
                    columns.push(self.iterate(iterable)?);
                }
                let rows = columns.iter().map(Vec::len).min().unwrap_or(0);
                let mut columns: Vec<_> = columns.into_iter().map(Vec::into_iter).collect();
                Ok(Value::list(
                    (0..rows)
                        .map(|_| Value::tuple(columns.iter_mut().filter_map(Iterator::next).collect()))
                        .collect(),
                ))
            }
            Builtin::Any | Builtin::All => {
                Keywords::accept(name, kwargs, &[])?;
                arity(name, &args, 1, 1)?;
                let items = self.iterate(&args[0])?;
                Ok(Value::Bool(if builtin == Builtin::Any {
                    items.iter().any(Value::truthy)
                } else {
                    items.iter().all(Value::truthy)
                }))
            }
        }
    }

    fn extreme(
        &mut self,
        name: &str,
        want_max: bool,
        args: Vec<Value<'p>>,
        mut kw: Keywords<'p>,
    ) -> Exec<Value<'p>> {
        let key = kw.take("key").filter(|k| !matches!(k, Value::None));
        let default = kw.take("default");
        let items = match args.len() {
            0 => {
                return Err(Exception::type_error(format!(
                    "{name} expected at least 1 argument, got 0"
                ))
                .into())
            }
            1 => self.iterate(&args[0])?,
            _ if default.is_some() => {
                return Err(Exception::type_error(format!(
                    "Cannot specify a default for {name}() with multiple positional arguments"
                ))
                .into())
            }
            _ => args,
        };

        let mut best: Option<(Value<'p>, Value<'p>)> = None;
        for item in items {
            let rank = match &key {
                Some(f) => self.call_value(f.clone(), vec![item.clone()], Vec::new())?,
                None => item.clone(),
            };
            let better = match &best {
                None => true,
                Some((best_rank, _)) => {
                    let ordering = rank.py_cmp(best_rank).ok_or_else(|| {
                        Exception::type_error(format!(
                            "'{}' not supported between instances of '{}' and '{}'",
                            if want_max { ">" } else { "<" },
                            rank.type_name(),
                            best_rank.type_name()
                        ))
                    })?;
                    if want_max {
                        ordering.is_gt()
                    } else {
                        ordering.is_lt()
                    }
                }
            };
            if better {
                best = Some((rank, item));
            }
        }
        match (best, default) {
            (Some((_, item)), _) => Ok(item),
            (None, Some(default)) => Ok(default),
            (None, None) => {
                Err(Exception::value_error(format!("{name}() arg is an empty sequence")).into())
            }
        }
    }

    /// Stable sort by precomputed keys.
    pub(super) fn sort_values(
        &mut self,
        items: Vec<Value<'p>>,
        key: Option<Value<'p>>,
        reverse: bool,
    ) -> Exec<Vec<Value<'p>>> {
        let keys = match key {
            Some(f) if !matches!(f, Value::None) => {
                let mut keys = Vec::with_capacity(items.len());
                for item in &items {
                    keys.push(self.call_value(f.clone(), vec![item.clone()], Vec::new())?);
                }
                keys
            }
            _ => items.clone(),
        };

        let mut order: Vec<usize> = (0..items.len()).collect();
        let mut failure = None;
        order.sort_by(|&a, &b| match keys[a].py_cmp(&keys[b]) {
            Some(ordering) if reverse => ordering.reverse(),
            Some(ordering) => ordering,
            None => {
                failure.get_or_insert_with(|| {
                    Exception::type_error(format!(
                        "'<' not supported between instances of '{}' and '{}'",
                        keys[a].type_name(),
                        keys[b].type_name()
                    ))
                });
                Ordering::Equal
            }
        });
        if let Some(exc) = failure {
            return Err(exc.into());
        }

        let mut slots: Vec<Option<Value<'p>>> = items.into_iter().map(Some).collect();
        Ok(order.into_iter().filter_map(|i| slots[i].take()).collect())
    }

    /// Key/value pairs from a dict or an iterable of 2-sequences.
    fn pairs(&mut self, source: &Value<'p>) -> Exec<Vec<(Key, Value<'p>)>> {
        if let Value::Dict(entries) = source {
            return Ok(entries
                .borrow()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect());
        }
        let mut out = Vec::new();
        for (i, element) in self.iterate(source)?.into_iter().enumerate() {
            let pair = self.iterate(&element)?;
            let [key, value]: [Value<'p>; 2] = pair.try_into().map_err(|pair: Vec<Value<'p>>| {
                Exception::value_error(format!(
                    "dictionary update sequence element #{i} has length {}; 2 is required",
                    pair.len()
                ))
            })?;
            out.push((Key::from_value(&key)?, value));
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Methods
    // -----------------------------------------------------------------------

    pub(super) fn call_method(
        &mut self,
        receiver: &Value<'p>,
        name: &'static str,
        args: Vec<Value<'p>>,
        kwargs: Vec<(String, Value<'p>)>,
    ) -> Exec<Value<'p>> {
        match receiver {
            Value::Str(s) if name == "join" => {
                Keywords::accept("str.join", kwargs, &[])?;
                arity("str.join", &args, 1, 1)?;
                let mut parts = Vec::new();
                for (i, item) in self.iterate(&args[0])?.iter().enumerate() {
                    match item {
                        Value::Str(part) => parts.push(part.to_string()),
                        other => {
                            return Err(Exception::type_error(format!(
                                "sequence item {i}: expected str instance, {} found",
                                other.type_name()
                            ))
                            .into())
                        }
                    }
                }
                let joined = parts.join(&**s);
                check_len(joined.len())?;
                Ok(Value::str(joined))
            }
            Value::Str(s) => {
                let label = format!("str.{name}");
                let allowed: &[&str] = if name == "split" { &["sep", "maxsplit"] } else { &[] };
                let kw = Keywords::accept(&label, kwargs, allowed)?;
                str_method(s, name, &label, &args, kw)
            }
            Value::List(items) => {
                let label = format!("list.{name}");
                let allowed: &[&str] = if name == "sort" { &["key", "reverse"] } else { &[] };
                let kw = Keywords::accept(&label, kwargs, allowed)?;
                self.list_method(items, name, &label, args, kw)
            }
            Value::Tuple(items) => {
                let label = format!("tuple.{name}");
                Keywords::accept(&label, kwargs, &[])?;
                Ok(sequence_search(&items[..], name, &label, &args, "tuple")?)
            }
            Value::Dict(entries) => {
                let label = format!("dict.{name}");
                let kwargs = if name == "update" {
                    kwargs
                } else {
                    Keywords::accept(&label, kwargs, &[])?.0
                };
                self.dict_method(entries, name, &label, args, kwargs)
            }
            Value::Match(data) => {
                let label = format!("Match.{name}");
                Keywords::accept(&label, kwargs, &[])?;
                Ok(match_method(data, name, &label, &args)?)
            }
            other => Err(Exception::new(
                "AttributeError",
                format!("'{}' object has no attribute '{name}'", other.type_name()),
            )
            .into()),
        }
    }

    fn list_method(
        &mut self,
        items: &Rc<RefCell<Vec<Value<'p>>>>,
        name: &str,
        label: &str,
        args: Vec<Value<'p>>,
        mut kw: Keywords<'p>,
    ) -> Exec<Value<'p>> {
        match name {
            "append" => {
                arity(label, &args, 1, 1)?;
                check_len(items.borrow().len() + 1)?;
                items.borrow_mut().extend(args.into_iter().take(1));
                Ok(Value::None)
            }
            "extend" => {
                arity(label, &args, 1, 1)?;
                let extra = self.iterate(&args[0])?;
                check_len(items.borrow().len().saturating_add(extra.len()))?;
                items.borrow_mut().extend(extra);
                Ok(Value::None)
            }
            "pop" => {
                arity(label, &args, 0, 1)?;
                let index = match args.first() {
                    Some(value) => int_arg(label, value)?,
                    None => -1,
                };
                let mut items = items.borrow_mut();
                if items.is_empty() {
                    return Err(Exception::new("IndexError", "pop from empty list").into());
                }
                let len = i64::try_from(items.len()).unwrap_or(i64::MAX);
                let position = if index < 0 { index + len } else { index };
                match usize::try_from(position).ok().filter(|p| *p < items.len()) {
                    Some(position) => Ok(items.remove(position)),
                    None => Err(Exception::new("IndexError", "pop index out of range").into()),
                }
            }
            "insert" => {
                arity(label, &args, 2, 2)?;
                let index = int_arg(label, &args[0])?;
                let mut items = items.borrow_mut();
                check_len(items.len() + 1)?;
                let len = i64::try_from(items.len()).unwrap_or(i64::MAX);
                let position = if index < 0 {
                    index.saturating_add(len).max(0)
                } else {
                    index.min(len)
                };
                items.insert(usize::try_from(position).unwrap_or(0), args[1].clone());
                Ok(Value::None)
            }
            "remove" => {
                arity(label, &args, 1, 1)?;
                let position = items.borrow().iter().position(|v| v.py_eq(&args[0]));
                match position {
                    Some(position) => {
                        let removed = items.borrow_mut().remove(position);
                        drop(removed);
                        Ok(Value::None)
                    }
                    None => Err(Exception::value_error("list.remove(x): x not in list").into()),
                }
            }
            "index" | "count" => {
                let snapshot = items.borrow().clone();
                Ok(sequence_search(&snapshot, name, label, &args, "list")?)
            }
            "sort" => {
                arity(label, &args, 0, 0)?;
                let key = kw.take("key");
                let reverse = kw.take("reverse").is_some_and(|v| v.truthy());
                let snapshot = items.borrow().clone();
                let sorted = self.sort_values(snapshot, key, reverse)?;
                *items.borrow_mut() = sorted;
                Ok(Value::None)
            }
            "reverse" => {
                arity(label, &args, 0, 0)?;
                items.borrow_mut().reverse();
                Ok(Value::None)
            }
            "copy" => {
                arity(label, &args, 0, 0)?;
                Ok(Value::list(items.borrow().clone()))
            }
            "clear" => {
                arity(label, &args, 0, 0)?;
                let cleared = std::mem::take(&mut *items.borrow_mut());
                drop(cleared);
                Ok(Value::None)
            }
            _ => Err(no_method("list", name).into()),
        }
    }

    fn dict_method(
        &mut self,
        entries: &Rc<RefCell<BTreeMap<Key, Value<'p>>>>,
        name: &str,
        label: &str,
        args: Vec<Value<'p>>,
        kwargs: Vec<(String, Value<'p>)>,
    ) -> Exec<Value<'p>> {
        match name {
            "get" => {
                arity(label, &args, 1, 2)?;
                let key = Key::from_value(&args[0])?;
                let found = entries.borrow().get(&key).cloned();
                Ok(found.or_else(|| args.get(1).cloned()).unwrap_or(Value::None))
            }
            "keys" => {
                arity(label, &args, 0, 0)?;
                Ok(Value::list(entries.borrow().keys().map(Key::to_value).collect()))
            }
            "values" => {
                arity(label, &args, 0, 0)?;
                Ok(Value::list(entries.borrow().values().cloned().collect()))
            }
            "items" => {
                arity(label, &args, 0, 0)?;
                Ok(Value::list(
                    entries
                        .borrow()
                        .iter()
                        .map(|(k, v)| Value::tuple(vec![k.to_value(), v.clone()]))
                        .collect(),
                ))
            }
            "pop" => {
                arity(label, &args, 1, 2)?;
                let key = Key::from_value(&args[0])?;
                let removed = entries.borrow_mut().remove(&key);
                match (removed, args.get(1)) {
                    (Some(value), _) => Ok(value),
                    (None, Some(default)) => Ok(default.clone()),
                    (None, None) => Err(Exception::new("KeyError", args[0].repr()).into()),
                }
            }
            "update" => {
                arity(label, &args, 0, 1)?;
                let mut pairs = match args.first() {
                    Some(source) => self.pairs(source)?,
                    None => Vec::new(),
                };
                pairs.extend(kwargs.into_iter().map(|(k, v)| (Key::Str(k.into()), v)));
                entries.borrow_mut().extend(pairs);
                Ok(Value::None)
            }
            "setdefault" => {
                arity(label, &args, 1, 2)?;
                let key = Key::from_value(&args[0])?;
                let default = args.get(1).cloned().unwrap_or(Value::None);
                Ok(entries.borrow_mut().entry(key).or_insert(default).clone())
            }
            "copy" => {
                arity(label, &args, 0, 0)?;
                Ok(Value::dict(entries.borrow().clone()))
            }
            "clear" => {
                arity(label, &args, 0, 0)?;
                let cleared = std::mem::take(&mut *entries.borrow_mut());
                drop(cleared);
                Ok(Value::None)
            }
            _ => Err(no_method("dict", name).into()),
        }
    }
}

fn no_method(type_name: &str, name: &str) -> Exception {
    Exception::new(
        "AttributeError",
        format!("'{type_name}' object has no attribute '{name}'"),
    )
}

fn length(value: &Value<'_>) -> Result<i64, Exception> {
    let len = match value {
        Value::Str(s) => s.chars().count(),
        Value::List(items) => items.borrow().len(),
        Value::Tuple(items) => items.len(),
        Value::Dict(entries) => entries.borrow().len(),
        Value::Range { start, stop, step } => {
            return i64::try_from(range_len(*start, *stop, *step)).map_err(|_| overflow())
        }
        other => {
            return Err(Exception::type_error(format!(
                "object of type '{}' has no len()",
                other.type_name()
            )))
        }
    };
    i64::try_from(len).map_err(|_| overflow())
}

fn make_range<'p>(args: &[Value<'p>]) -> Result<Value<'p>, Exception> {
    let ints = args
        .iter()
        .map(|v| int_arg("range", v))
        .collect::<Result<Vec<_>, _>>()?;
    let (start, stop, step) = match ints.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step, ..] => (*start, *stop, *step),
        [] => (0, 0, 1),
    };
    if step == 0 {
        return Err(Exception::value_error("range() arg 3 must not be zero"));
    }
    Ok(Value::Range { start, stop, step })
}

fn parse_int<'p>(text: &str, base: u32) -> Result<Value<'p>, Exception> {
    let cleaned: String = text.trim().chars().filter(|c| *c != '_').collect();
    i64::from_str_radix(&cleaned, base)
        .map(Value::Int)
        .map_err(|_| {
            Exception::value_error(format!(
                "invalid literal for int() with base {base}: {}",
                quote(text)
            ))
        })
}

fn to_int<'p>(value: Option<&Value<'p>>, base: Option<Value<'p>>) -> Result<Value<'p>, Exception> {
    let Some(value) = value else {
        return Ok(Value::Int(0));
    };
    if let Some(base) = base {
        let Value::Str(text) = value else {
            return Err(Exception::type_error(
                "int() can't convert non-string with explicit base",
            ));
        };
        let base = base
            .as_int()
            .and_then(|b| u32::try_from(b).ok())
            .filter(|b| (2..=36).contains(b))
            .ok_or_else(|| Exception::value_error("int() base must be >= 2 and <= 36"))?;
        return parse_int(text, base);
    }
    match value {
        Value::Int(i) => Ok(Value::Int(*i)),
        Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
        Value::Float(f) => float_to_int(f.trunc()).map(Value::Int),
        Value::Str(text) => parse_int(text, 10),
        other => Err(Exception::type_error(format!(
            "int() argument must be a string or a number, not '{}'",
            other.type_name()
        ))),
    }
}

fn to_float<'p>(value: Option<&Value<'p>>) -> Result<Value<'p>, Exception> {
    match value {
        None => Ok(Value::Float(0.0)),
        Some(Value::Str(text)) => text
            .trim()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| {
                Exception::value_error(format!(
                    "could not convert string to float: {}",
                    quote(text)
                ))
            }),
        Some(other) => match other.as_num() {
            Some(n) => Ok(Value::Float(n.as_f64())),
            None => Err(Exception::type_error(format!(
                "float() argument must be a string or a number, not '{}'",
                other.type_name()
            ))),
        },
    }
}

fn abs<'p>(value: &Value<'p>) -> Result<Value<'p>, Exception> {
    match value.as_num() {
        Some(Num::Int(i)) => i.checked_abs().map(Value::Int).ok_or_else(overflow),
        Some(Num::Float(f)) => Ok(Value::Float(f.abs())),
        None => Err(Exception::type_error(format!(
            "bad operand type for abs(): '{}'",
            value.type_name()
        ))),
    }
}

/// Round half to even, like the surface language.
fn round<'p>(value: &Value<'p>, ndigits: Option<Value<'p>>) -> Result<Value<'p>, Exception> {
    let digits = match ndigits {
        None | Some(Value::None) => None,
        Some(n) => Some(int_arg("round", &n)?),
    };
    match (value.as_num(), digits) {
        (Some(Num::Int(i)), None) => Ok(Value::Int(i)),
        (Some(Num::Int(i)), Some(d)) if d >= 0 => Ok(Value::Int(i)),
        (Some(Num::Int(i)), Some(d)) => {
            let factor = 10f64.powi(i32::try_from(-d).unwrap_or(i32::MAX));
            if !factor.is_finite() {
                return Ok(Value::Int(0));
            }
            float_to_int((i as f64 / factor).round_ties_even() * factor).map(Value::Int)
        }
        (Some(Num::Float(f)), None) => float_to_int(f.round_ties_even()).map(Value::Int),
        (Some(Num::Float(f)), Some(d)) => {
            if !f.is_finite() || d > 300 {
                return Ok(Value::Float(f));
            }
            if d < -300 {
                return Ok(Value::Float(0.0_f64.copysign(f)));
            }
            let factor = 10f64.powi(d as i32);
            let scaled = f * factor;
            if !scaled.is_finite() {
                return Ok(Value::Float(f));
            }
            Ok(Value::Float(scaled.round_ties_even() / factor))
        }
        (None, _) => Err(Exception::type_error(format!(
            "type {} doesn't define __round__ method",
            value.type_name()
        ))),
    }
}

fn split_whitespace(s: &str, maxsplit: i64) -> Vec<String> {
    if maxsplit < 0 {
        return s.split_whitespace().map(String::from).collect();
    }
    let mut parts = Vec::new();
    let mut rest = s.trim_start();
    while !rest.is_empty() {
        if i64::try_from(parts.len()).unwrap_or(i64::MAX) == maxsplit {
            parts.push(rest.to_string());
            break;
        }
        match rest.find(char::is_whitespace) {
            Some(end) => {
                parts.push(rest[..end].to_string());
                rest = rest[end..].trim_start();
            }
            None => {
                parts.push(rest.to_string());
                break;
            }
        }
    }
    parts
}

fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut previous_cased = false;
    for c in s.chars() {
        if previous_cased {
            out.extend(c.to_lowercase());
        } else {
            out.extend(c.to_uppercase());
        }
        previous_cased = c.is_alphabetic();
    }
    out
}

fn str_method<'p>(
    s: &Rc<str>,
    name: &str,
    label: &str,
    args: &[Value<'p>],
    mut kw: Keywords<'p>,
) -> Exec<Value<'p>> {
    let result = match name {
        "upper" | "lower" | "title" | "capitalize" | "splitlines" | "isdigit" | "isalpha"
        | "isalnum" | "isspace" => {
            arity(label, args, 0, 0)?;
            match name {
                "upper" => Value::str(s.to_uppercase()),
                "lower" => Value::str(s.to_lowercase()),
                "title" => Value::str(title_case(s)),
                "capitalize" => {
                    let mut chars = s.chars();
                    Value::str(match chars.next() {
                        Some(first) => first
                            .to_uppercase()
                            .chain(chars.flat_map(char::to_lowercase))
                            .collect::<String>(),
                        None => String::new(),
                    })
                }
                "splitlines" => Value::list(s.lines().map(Value::str).collect()),
                "isdigit" => Value::Bool(!s.is_empty() && s.chars().all(char::is_numeric)),
                "isalpha" => Value::Bool(!s.is_empty() && s.chars().all(char::is_alphabetic)),
                "isalnum" => Value::Bool(!s.is_empty() && s.chars().all(char::is_alphanumeric)),
                _ => Value::Bool(!s.is_empty() && s.chars().all(char::is_whitespace)),
            }
        }
        "strip" | "lstrip" | "rstrip" => {
            arity(label, args, 0, 1)?;
            let set: Option<Vec<char>> = match args.first() {
                None | Some(Value::None) => None,
                Some(chars) => Some(str_arg(label, chars)?.chars().collect()),
            };
            let strip = |c: char| match &set {
                Some(set) => set.contains(&c),
                None => c.is_whitespace(),
            };
            Value::str(match name {
                "strip" => s.trim_matches(strip),
                "lstrip" => s.trim_start_matches(strip),
                _ => s.trim_end_matches(strip),
            })
        }
        "split" => {
            arity(label, args, 0, 2)?;
            let maxsplit = match arg_or(args, 1, &mut kw, "maxsplit") {
                Some(value) => int_arg(label, &value)?,
                None => -1,
            };
            let parts: Vec<String> = match arg_or(args, 0, &mut kw, "sep") {
                None | Some(Value::None) => split_whitespace(s, maxsplit),
                Some(sep) => {
                    let sep = str_arg(label, &sep)?.to_string();
                    if sep.is_empty() {
                        return Err(Exception::value_error("empty separator").into());
                    }
                    match usize::try_from(maxsplit) {
                        Ok(limit) => s
                            .splitn(limit.saturating_add(1), sep.as_str())
                            .map(String::from)
                            .collect(),
                        Err(_) => s.split(sep.as_str()).map(String::from).collect(),
                    }
                }
            };
            Value::list(parts.into_iter().map(Value::str).collect())
        }
        "replace" => {
            arity(label, args, 2, 3)?;
            let old = str_arg(label, &args[0])?;
            let new = str_arg(label, &args[1])?;
            let count = match args.get(2) {
                Some(value) => int_arg(label, value)?,
                None => -1,
            };
            let replaced = match usize::try_from(count) {
                Ok(count) => s.replacen(old, new, count),
                Err(_) => s.replace(old, new),
            };
            check_len(replaced.len())?;
            Value::str(replaced)
        }
        "startswith" | "endswith" => {
            arity(label, args, 1, 1)?;
            let candidates: Vec<Value<'p>> = match &args[0] {
                Value::Tuple(items) => items.to_vec(),
                other => vec![other.clone()],
            };
            let mut matched = false;
            for candidate in &candidates {
                let affix = str_arg(label, candidate)?;
                matched |= if name == "startswith" {
                    s.starts_with(affix)
                } else {
                    s.ends_with(affix)
                };
            }
            Value::Bool(matched)
        }
        "find" | "index" => {
            arity(label, args, 1, 1)?;
            let needle = str_arg(label, &args[0])?;
            match s.find(needle) {
                Some(byte) => Value::Int(i64::try_from(s[..byte].chars().count()).unwrap_or(-1)),
                None if name == "find" => Value::Int(-1),
                None => return Err(Exception::value_error("substring not found").into()),
            }
        }
        "count" => {
            arity(label, args, 1, 1)?;
            let needle = str_arg(label, &args[0])?;
            let count = if needle.is_empty() {
                s.chars().count() + 1
            } else {
                s.matches(needle).count()
            };
            Value::Int(i64::try_from(count).unwrap_or(i64::MAX))
        }
        _ => return Err(no_method("str", name).into()),
    };
    Ok(result)
}

/// `index` and `count` shared by lists and tuples.
fn sequence_search<'p>(
    items: &[Value<'p>],
    name: &str,
    label: &str,
    args: &[Value<'p>],
    type_name: &str,
) -> Result<Value<'p>, Exception> {
    arity(label, args, 1, 1)?;
    let needle = &args[0];
    match name {
        "index" => items
            .iter()
            .position(|v| v.py_eq(needle))
            .map(|i| Value::Int(i64::try_from(i).unwrap_or(i64::MAX)))
            .ok_or_else(|| {
                Exception::value_error(format!("{} is not in {type_name}", needle.repr()))
            }),
        "count" => Ok(Value::Int(
            i64::try_from(items.iter().filter(|v| v.py_eq(needle)).count()).unwrap_or(i64::MAX),
        )),
        _ => Err(no_method(type_name, name)),
    }
}

fn match_method<'p>(
    data: &MatchData,
    name: &str,
    label: &str,
    args: &[Value<'p>],
) -> Result<Value<'p>, Exception> {
    match name {
        "group" => match args {
            [] => modules::match_group(data, &Value::Int(0)),
            [index] => modules::match_group(data, index),
            many => Ok(Value::tuple(
                many.iter()
                    .map(|index| modules::match_group(data, index))
                    .collect::<Result<_, _>>()?,
            )),
        },
        "groups" => {
            arity(label, args, 0, 1)?;
            let default = args.first().cloned().unwrap_or(Value::None);
            Ok(Value::tuple(
                data.groups
                    .iter()
                    .skip(1)
                    .map(|group| group.as_deref().map_or_else(|| default.clone(), Value::str))
                    .collect(),
            ))
        }
        "start" | "end" | "span" => {
            arity(label, args, 0, 0)?;
            let (start, end) = data.span;
            let start = Value::Int(i64::try_from(start).unwrap_or(i64::MAX));
            let end = Value::Int(i64::try_from(end).unwrap_or(i64::MAX));
            Ok(match name {
                "start" => start,
                "end" => end,
                _ => Value::tuple(vec![start, end]),
            })
        }
        _ => Err(no_method("re.Match", name)),
    }
}
