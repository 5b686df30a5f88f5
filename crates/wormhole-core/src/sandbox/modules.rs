//! Host modules importable from sandboxed code.
//!
//! Each module is a fixed table of Rust functions and constants. None of
//! them touches the filesystem, the network, the process or the store.

use std::io;

use chrono::{Local, Utc};
use regex::{Regex, RegexBuilder};

use super::value::{Exception, HostFn, MatchData, Value};

/// Modules the sandbox can provide, if policy admitted the import.
pub const MODULES: &[&str] = &["math", "json", "re", "datetime"];

const MATH_FUNCTIONS: &[&str] = &[
    "sqrt", "floor", "ceil", "pow", "fabs", "log", "log10", "exp", "fsum", "trunc", "isnan",
    "isinf",
];
const JSON_FUNCTIONS: &[&str] = &["dumps", "loads"];
const RE_FUNCTIONS: &[&str] = &["match", "search", "fullmatch", "findall", "sub", "split"];
const DATETIME_FUNCTIONS: &[&str] = &["now", "utcnow", "today"];

const RE_IGNORECASE: i64 = 2;
const RE_MULTILINE: i64 = 8;
const RE_DOTALL: i64 = 16;

/// Compiled pattern size cap, in bytes.
const REGEX_SIZE_LIMIT: usize = 1 << 20;

pub fn module(name: &str) -> Option<&'static str> {
    MODULES.iter().copied().find(|m| *m == name)
}

fn function<'p>(module: &'static str, table: &[&'static str], attr: &str) -> Option<Value<'p>> {
    table
        .iter()
        .copied()
        .find(|f| *f == attr)
        .map(|name| Value::HostFn(HostFn { module, name }))
}

/// Look up `module.attr`.
pub fn attribute<'p>(module: &'static str, attr: &str) -> Option<Value<'p>> {
    Some(match (module, attr) {
        ("math", "pi") => Value::Float(std::f64::consts::PI),
        ("math", "e") => Value::Float(std::f64::consts::E),
        ("math", "inf") => Value::Float(f64::INFINITY),
        ("math", "nan") => Value::Float(f64::NAN),
        ("math", _) => function("math", MATH_FUNCTIONS, attr)?,
        ("json", _) => function("json", JSON_FUNCTIONS, attr)?,
        ("re", "I" | "IGNORECASE") => Value::Int(RE_IGNORECASE),
        ("re", "M" | "MULTILINE") => Value::Int(RE_MULTILINE),
        ("re", "S" | "DOTALL") => Value::Int(RE_DOTALL),
        ("re", _) => function("re", RE_FUNCTIONS, attr)?,
        // `datetime.datetime.now()` and `from datetime import datetime`
        ("datetime", "datetime" | "date") => Value::Module("datetime"),
        ("datetime", _) => function("datetime", DATETIME_FUNCTIONS, attr)?,
        _ => return None,
    })
}

/// Positional and keyword arguments of one host call.
struct Args<'v, 'p> {
    func: HostFn,
    positional: &'v [Value<'p>],
    keywords: &'v [(String, Value<'p>)],
}

impl<'v, 'p> Args<'v, 'p> {
    fn arity(&self, min: usize, max: usize) -> Result<(), Exception> {
        let n = self.positional.len();
        if n < min || n > max {
            let expected = if min == max {
                format!("{min}")
            } else {
                format!("{min} to {max}")
            };
            return Err(Exception::type_error(format!(
                "{}.{}() takes {expected} positional argument(s) but {n} were given",
                self.func.module, self.func.name
            )));
        }
        Ok(())
    }

    fn only_keywords(&self, allowed: &[&str]) -> Result<(), Exception> {
        match self.keywords.iter().find(|(k, _)| !allowed.contains(&k.as_str())) {
            Some((k, _)) => Err(Exception::type_error(format!(
                "{}.{}() got an unexpected keyword argument '{k}'",
                self.func.module, self.func.name
            ))),
            None => Ok(()),
        }
    }

    fn keyword(&self, name: &str) -> Option<&'v Value<'p>> {
        self.keywords
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }

    /// Positional argument `index`, or keyword `name`.
    fn get(&self, index: usize, name: &str) -> Option<&'v Value<'p>> {
        self.positional.get(index).or_else(|| self.keyword(name))
    }

    fn float(&self, index: usize) -> Result<f64, Exception> {
        match self.positional.get(index).and_then(Value::as_num) {
            Some(n) => Ok(n.as_f64()),
            None => Err(Exception::type_error(format!(
                "{}.{}() expects a number",
                self.func.module, self.func.name
            ))),
        }
    }

    fn text(&self, index: usize, name: &str) -> Result<&'v str, Exception> {
        match self.get(index, name) {
            Some(Value::Str(s)) => Ok(s),
            Some(other) => Err(Exception::type_error(format!(
                "{}.{}() argument '{name}' must be str, not {}",
                self.func.module,
                self.func.name,
                other.type_name()
            ))),
            None => Err(Exception::type_error(format!(
                "{}.{}() missing required argument '{name}'",
                self.func.module, self.func.name
            ))),
        }
    }

    fn int_or(&self, index: usize, name: &str, default: i64) -> Result<i64, Exception> {
        match self.get(index, name) {
            None | Some(Value::None) => Ok(default),
            Some(value) => value.as_int().ok_or_else(|| {
                Exception::type_error(format!("argument '{name}' must be an integer"))
            }),
        }
    }
}

/// Call a host function.
pub fn call<'p>(
    func: HostFn,
    positional: &[Value<'p>],
    keywords: &[(String, Value<'p>)],
) -> Result<Value<'p>, Exception> {
    let args = Args {
        func,
        positional,
        keywords,
    };
    match func.module {
        "math" => math(&args),
        "json" => json(&args),
        "re" => re(&args),
        "datetime" => datetime(&args),
        other => Err(Exception::new(
            "ImportError",
            format!("No module named '{other}'"),
        )),
    }
}

// ---------------------------------------------------------------------------
// math
// ---------------------------------------------------------------------------

fn math_domain() -> Exception {
    Exception::value_error("math domain error")
}

fn math_range() -> Exception {
    Exception::new("OverflowError", "math range error")
}

fn finite<'p>(result: f64, inputs_finite: bool) -> Result<Value<'p>, Exception> {
    if result.is_infinite() && inputs_finite {
        return Err(math_range());
    }
    Ok(Value::Float(result))
}

/// Convert an integral float to an int, failing on overflow or NaN.
pub fn float_to_int(f: f64) -> Result<i64, Exception> {
    if f.is_nan() {
        return Err(Exception::value_error("cannot convert float NaN to integer"));
    }
    // 2^63 is exactly representable; anything at or above it overflows.
    if f.is_infinite() || f >= 9_223_372_036_854_775_808.0 || f < -9_223_372_036_854_775_808.0 {
        return Err(Exception::new(
            "OverflowError",
            "cannot convert float infinity or out-of-range value to integer",
        ));
    }
    Ok(f as i64)
}

fn math<'p>(args: &Args<'_, 'p>) -> Result<Value<'p>, Exception> {
    args.only_keywords(&[])?;
    match args.func.name {
        "sqrt" => {
            args.arity(1, 1)?;
            let x = args.float(0)?;
            if x < 0.0 {
                return Err(math_domain());
            }
            Ok(Value::Float(x.sqrt()))
        }
        "floor" | "ceil" | "trunc" => {
            args.arity(1, 1)?;
            if let Some(i) = args.positional[0].as_int() {
                return Ok(Value::Int(i));
            }
            let x = args.float(0)?;
            let rounded = match args.func.name {
                "floor" => x.floor(),
                "ceil" => x.ceil(),
                _ => x.trunc(),
            };
            float_to_int(rounded).map(Value::Int)
        }
        "pow" => {
            args.arity(2, 2)?;
            let (x, y) = (args.float(0)?, args.float(1)?);
            if x == 0.0 && y < 0.0 {
                return Err(math_domain());
            }
            let result = x.powf(y);
            if result.is_nan() && !x.is_nan() && !y.is_nan() {
                return Err(math_domain());
            }
            finite(result, x.is_finite() && y.is_finite())
        }
        "fabs" => {
            args.arity(1, 1)?;
            Ok(Value::Float(args.float(0)?.abs()))
        }
        "log" => {
            args.arity(1, 2)?;
            let x = args.float(0)?;
            if x <= 0.0 {
                return Err(math_domain());
            }
            if args.positional.len() == 2 {
                let base = args.float(1)?;
                if base <= 0.0 || base == 1.0 {
                    return Err(math_domain());
                }
                return Ok(Value::Float(x.ln() / base.ln()));
            }
            Ok(Value::Float(x.ln()))
        }
        "log10" => {
            args.arity(1, 1)?;
            let x = args.float(0)?;
            if x <= 0.0 {
                return Err(math_domain());
            }
            Ok(Value::Float(x.log10()))
        }
        "exp" => {
            args.arity(1, 1)?;
            let x = args.float(0)?;
            finite(x.exp(), x.is_finite())
        }
        "fsum" => {
            args.arity(1, 1)?;
            let items: Vec<Value<'p>> = match &args.positional[0] {
                Value::List(items) => items.borrow().clone(),
                Value::Tuple(items) => items.as_ref().clone(),
                other => {
                    return Err(Exception::type_error(format!(
                        "'{}' object is not iterable",
                        other.type_name()
                    )))
                }
            };
            // Neumaier compensated summation.
            let (mut sum, mut compensation) = (0.0_f64, 0.0_f64);
            for item in &items {
                let x = item
                    .as_num()
                    .ok_or_else(|| Exception::type_error("must be real number"))?
                    .as_f64();
                let t = sum + x;
                if sum.abs() >= x.abs() {
                    compensation += (sum - t) + x;
                } else {
                    compensation += (x - t) + sum;
                }
                sum = t;
            }
            Ok(Value::Float(sum + compensation))
        }
        "isnan" => {
            args.arity(1, 1)?;
            Ok(Value::Bool(args.float(0)?.is_nan()))
        }
        "isinf" => {
            args.arity(1, 1)?;
            Ok(Value::Bool(args.float(0)?.is_infinite()))
        }
        other => Err(Exception::new(
            "AttributeError",
            format!("module 'math' has no attribute '{other}'"),
        )),
    }
}

// ---------------------------------------------------------------------------
// json
// ---------------------------------------------------------------------------

/// `", "` and `": "` separators, matching the surface language's default
/// output.
struct SpacedFormatter;

impl serde_json::ser::Formatter for SpacedFormatter {
    fn begin_array_value<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        writer.write_all(b": ")
    }
}

pub fn dumps(value: &serde_json::Value, indent: Option<usize>) -> Result<String, Exception> {
    use serde::Serialize;

    let mut out = Vec::new();
    let written = match indent {
        Some(width) => {
            let indent = vec![b' '; width];
            let formatter = serde_json::ser::PrettyFormatter::with_indent(&indent);
            let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
            value.serialize(&mut ser)
        }
        None => {
            let mut ser = serde_json::Serializer::with_formatter(&mut out, SpacedFormatter);
            value.serialize(&mut ser)
        }
    };
    written.map_err(|e| Exception::value_error(e.to_string()))?;
    String::from_utf8(out).map_err(|e| Exception::value_error(e.to_string()))
}

fn json<'p>(args: &Args<'_, 'p>) -> Result<Value<'p>, Exception> {
    match args.func.name {
        "dumps" => {
            args.only_keywords(&["indent", "sort_keys"])?;
            args.arity(1, 1)?;
            let value = args.positional[0].to_json()?;
            let indent = match args.keyword("indent") {
                None | Some(Value::None) => None,
                Some(v) => Some(
                    v.as_int()
                        .and_then(|i| usize::try_from(i).ok())
                        .ok_or_else(|| Exception::type_error("indent must be a non-negative int"))?,
                ),
            };
            // Keys are always emitted in sorted order.
            dumps(&value, indent).map(Value::str)
        }
        "loads" => {
            args.only_keywords(&[])?;
            args.arity(1, 1)?;
            let text = args.text(0, "s")?;
            let parsed: serde_json::Value = serde_json::from_str(text)
                .map_err(|e| Exception::value_error(format!("invalid JSON: {e}")))?;
            Ok(Value::from_json(&parsed))
        }
        other => Err(Exception::new(
            "AttributeError",
            format!("module 'json' has no attribute '{other}'"),
        )),
    }
}

// ---------------------------------------------------------------------------
// re
// ---------------------------------------------------------------------------

fn compile(pattern: &str, flags: i64) -> Result<Regex, Exception> {
    RegexBuilder::new(pattern)
        .case_insensitive(flags & RE_IGNORECASE != 0)
        .multi_line(flags & RE_MULTILINE != 0)
        .dot_matches_new_line(flags & RE_DOTALL != 0)
        .size_limit(REGEX_SIZE_LIMIT)
        .build()
        .map_err(|e| Exception::value_error(format!("invalid pattern: {e}")))
}

/// Rewrite a replacement template (`\1`, `\g<name>`, `\n`) into the
/// regex crate's `${1}` syntax, escaping literal `$`.
pub fn translate_replacement(template: &str) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '$' => out.push_str("$$"),
            '\\' => match chars.next() {
                Some(d) if d.is_ascii_digit() => {
                    let mut group = d.to_string();
                    if let Some(&next) = chars.peek() {
                        if next.is_ascii_digit() {
                            group.push(next);
                            chars.next();
                        }
                    }
                    out.push_str(&format!("${{{group}}}"));
                }
                Some('g') if chars.peek() == Some(&'<') => {
                    chars.next();
                    let name: String = chars.by_ref().take_while(|c| *c != '>').collect();
                    out.push_str(&format!("${{{name}}}"));
                }
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('\\') => out.push('\\'),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            },
            c => out.push(c),
        }
    }
    out
}

fn match_data(text: &str, caps: &regex::Captures<'_>) -> MatchData {
    let whole = caps.get(0);
    let span = whole.map_or((0, 0), |m| {
        let start = text[..m.start()].chars().count();
        (start, start + m.as_str().chars().count())
    });
    MatchData {
        groups: caps
            .iter()
            .map(|g| g.map(|m| m.as_str().to_string()))
            .collect(),
        span,
    }
}

fn optional_str<'p>(group: Option<regex::Match<'_>>) -> Value<'p> {
    group.map_or(Value::None, |m| Value::str(m.as_str()))
}

fn re<'p>(args: &Args<'_, 'p>) -> Result<Value<'p>, Exception> {
    let name = args.func.name;
    match name {
        "match" | "search" | "fullmatch" => {
            args.only_keywords(&["flags"])?;
            args.arity(2, 3)?;
            let pattern = args.text(0, "pattern")?;
            let text = args.text(1, "string")?;
            let anchored = match name {
                "match" => format!(r"\A(?:{pattern})"),
                "fullmatch" => format!(r"\A(?:{pattern})\z"),
                _ => pattern.to_string(),
            };
            let regex = compile(&anchored, args.int_or(2, "flags", 0)?)?;
            Ok(regex
                .captures(text)
                .map_or(Value::None, |caps| Value::Match(match_data(text, &caps).into())))
        }
        "findall" => {
            args.only_keywords(&["flags"])?;
            args.arity(2, 3)?;
            let regex = compile(args.text(0, "pattern")?, args.int_or(2, "flags", 0)?)?;
            let text = args.text(1, "string")?;
            let groups = regex.captures_len() - 1;
            let found = regex
                .captures_iter(text)
                .map(|caps| match groups {
                    0 => optional_str(caps.get(0)),
                    1 => caps.get(1).map_or(Value::str(""), |m| Value::str(m.as_str())),
                    _ => Value::tuple(
                        (1..=groups)
                            .map(|i| caps.get(i).map_or(Value::str(""), |m| Value::str(m.as_str())))
                            .collect(),
                    ),
                })
                .collect();
            Ok(Value::list(found))
        }
        "sub" => {
            args.only_keywords(&["count", "flags"])?;
            args.arity(3, 5)?;
            let regex = compile(args.text(0, "pattern")?, args.int_or(4, "flags", 0)?)?;
            let replacement = translate_replacement(args.text(1, "repl")?);
            let text = args.text(2, "string")?;
            let count = usize::try_from(args.int_or(3, "count", 0)?).unwrap_or(0);
            Ok(Value::str(
                regex.replacen(text, count, replacement.as_str()).as_ref(),
            ))
        }
        "split" => {
            args.only_keywords(&["maxsplit", "flags"])?;
            args.arity(2, 4)?;
            let regex = compile(args.text(0, "pattern")?, args.int_or(3, "flags", 0)?)?;
            let text = args.text(1, "string")?;
            let maxsplit = usize::try_from(args.int_or(2, "maxsplit", 0)?).unwrap_or(0);
            let mut parts = Vec::new();
            let mut last = 0;
            for (n, caps) in regex.captures_iter(text).enumerate() {
                if maxsplit > 0 && n >= maxsplit {
                    break;
                }
                let Some(whole) = caps.get(0) else { continue };
                parts.push(Value::str(&text[last..whole.start()]));
                parts.extend(caps.iter().skip(1).map(optional_str));
                last = whole.end();
            }
            parts.push(Value::str(&text[last..]));
            Ok(Value::list(parts))
        }
        other => Err(Exception::new(
            "AttributeError",
            format!("module 're' has no attribute '{other}'"),
        )),
    }
}

// ---------------------------------------------------------------------------
// datetime
// ---------------------------------------------------------------------------

const ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

fn datetime<'p>(args: &Args<'_, 'p>) -> Result<Value<'p>, Exception> {
    args.only_keywords(&[])?;
    args.arity(0, 0)?;
    let text = match args.func.name {
        "now" => Local::now().naive_local().format(ISO_FORMAT).to_string(),
        "utcnow" => Utc::now().naive_utc().format(ISO_FORMAT).to_string(),
        "today" => Local::now().date_naive().format("%Y-%m-%d").to_string(),
        other => {
            return Err(Exception::new(
                "AttributeError",
                format!("module 'datetime' has no attribute '{other}'"),
            ))
        }
    };
    Ok(Value::str(text))
}

/// Group value of a match object: by number or by name.
pub fn match_group<'p>(data: &MatchData, index: &Value<'p>) -> Result<Value<'p>, Exception> {
    let i = index
        .as_int()
        .and_then(|i| usize::try_from(i).ok())
        .filter(|i| *i < data.groups.len())
        .ok_or_else(|| Exception::new("IndexError", "no such group"))?;
    Ok(data.groups[i]
        .as_deref()
        .map_or(Value::None, Value::str))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(module: &'static str, name: &'static str) -> HostFn {
        HostFn { module, name }
    }

    fn call0<'p>(module: &'static str, name: &'static str, args: Vec<Value<'p>>) -> Result<Value<'p>, Exception> {
        call(host(module, name), &args, &[])
    }

    #[test]
    fn math_functions() {
        assert!(matches!(call0("math", "sqrt", vec![Value::Int(16)]), Ok(Value::Float(f)) if f == 4.0));
        assert!(matches!(call0("math", "floor", vec![Value::Float(-1.5)]), Ok(Value::Int(-2))));
        assert!(matches!(call0("math", "ceil", vec![Value::Float(1.2)]), Ok(Value::Int(2))));
        let err = call0("math", "sqrt", vec![Value::Int(-1)]).unwrap_err();
        assert_eq!(err.message, "math domain error");
        let err = call0("math", "exp", vec![Value::Int(1000)]).unwrap_err();
        assert_eq!(err.class, "OverflowError");
        let sum = call0(
            "math",
            "fsum",
            vec![Value::list(vec![Value::Float(0.1); 10])],
        )
        .unwrap();
        assert!(matches!(sum, Value::Float(f) if (f - 1.0).abs() < 1e-15));
    }

    #[test]
    fn constants_and_unknown_members() {
        assert!(matches!(attribute("math", "pi"), Some(Value::Float(_))));
        assert!(matches!(attribute("datetime", "datetime"), Some(Value::Module("datetime"))));
        assert!(attribute("math", "system").is_none());
        assert!(attribute("os", "path").is_none());
    }

    #[test]
    fn json_dumps_matches_default_separators() {
        let value = serde_json::json!({"b": [1, 2], "a": null});
        assert_eq!(dumps(&value, None).unwrap(), r#"{"a": null, "b": [1, 2]}"#);
        assert_eq!(dumps(&value, Some(2)).unwrap(), "{\n  \"a\": null,\n  \"b\": [\n    1,\n    2\n  ]\n}");
    }

    #[test]
    fn json_loads_errors_are_value_errors() {
        let err = call0("json", "loads", vec![Value::str("{nope")]).unwrap_err();
        assert_eq!(err.class, "ValueError");
    }

    #[test]
    fn regex_functions() {
        let found = call0(
            "re",
            "findall",
            vec![Value::str(r"(\w)=(\d)"), Value::str("a=1 b=2")],
        )
        .unwrap();
        assert_eq!(found.repr(), "[('a', '1'), ('b', '2')]");

        let m = call0("re", "match", vec![Value::str(r"\d+"), Value::str("x123")]).unwrap();
        assert!(matches!(m, Value::None));
        let m = call0("re", "search", vec![Value::str(r"\d+"), Value::str("x123")]).unwrap();
        match m {
            Value::Match(data) => {
                assert_eq!(data.groups[0].as_deref(), Some("123"));
                assert_eq!(data.span, (1, 4));
            }
            other => panic!("unexpected {other:?}"),
        }

        let replaced = call0(
            "re",
            "sub",
            vec![Value::str(r"(\w+)@(\w+)"), Value::str(r"\2 at \1 $"), Value::str("me@host")],
        )
        .unwrap();
        assert_eq!(replaced.to_display(), "host at me $");

        let parts = call0("re", "split", vec![Value::str(r"(,)"), Value::str("a,b")]).unwrap();
        assert_eq!(parts.repr(), "['a', ',', 'b']");
    }

    #[test]
    fn invalid_patterns_are_value_errors() {
        let err = call0("re", "search", vec![Value::str("("), Value::str("x")]).unwrap_err();
        assert_eq!(err.class, "ValueError");
    }

    #[test]
    fn datetime_is_iso_text() {
        let now = call0("datetime", "utcnow", vec![]).unwrap().to_display();
        assert_eq!(now.len(), "2026-01-01T00:00:00.000000".len());
        assert_eq!(&now[4..5], "-");
        assert_eq!(&now[10..11], "T");
    }
}
