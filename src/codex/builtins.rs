//! Whitelisted functions callable from codex source.

use super::entity_value;
use super::scope::CodexHost;
use crate::core::value::{as_f64, as_i64, display, float_value, type_name, values_equal};
use crate::core::{Attributes, KernelError, Result, Value};
use crate::storage::Filter;
use lazy_static::lazy_static;
use lru::LruCache;
use regex::{Regex, RegexBuilder};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use tracing::{Level, event};

const REGEX_SIZE_LIMIT: usize = 1 << 20;

pub(crate) struct BuiltinContext<'a> {
    pub codex_id: &'a str,
    pub host: &'a mut dyn CodexHost,
    /// Upper bound on entities returned by `find`.
    pub max_results: usize,
}

type BuiltinFn = fn(&mut BuiltinContext<'_>, Vec<Value>) -> Result<Value>;

struct Builtin {
    min_args: usize,
    /// `None` for variadic functions
    max_args: Option<usize>,
    func: BuiltinFn,
}

impl Builtin {
    fn fixed(arity: usize, func: BuiltinFn) -> Self {
        Self { min_args: arity, max_args: Some(arity), func }
    }

    fn range(min_args: usize, max_args: usize, func: BuiltinFn) -> Self {
        Self { min_args, max_args: Some(max_args), func }
    }

    fn variadic(min_args: usize, func: BuiltinFn) -> Self {
        Self { min_args, max_args: None, func }
    }
}

lazy_static! {
    static ref BUILTINS: HashMap<&'static str, Builtin> = {
        let mut table = HashMap::new();
        table.insert("now", Builtin::fixed(0, now));
        table.insert("now_unix", Builtin::fixed(0, now_unix));
        table.insert("format", Builtin::variadic(1, format_fn));
        table.insert("len", Builtin::fixed(1, len));
        table.insert("upper", Builtin::fixed(1, upper));
        table.insert("lower", Builtin::fixed(1, lower));
        table.insert("trim", Builtin::fixed(1, trim));
        table.insert("str", Builtin::fixed(1, to_str));
        table.insert("int", Builtin::fixed(1, to_int));
        table.insert("float", Builtin::fixed(1, to_float));
        table.insert("contains", Builtin::fixed(2, contains));
        table.insert("keys", Builtin::fixed(1, keys));
        table.insert("matches", Builtin::fixed(2, matches));
        table.insert("concat", Builtin::variadic(1, concat));
        table.insert("log", Builtin::variadic(1, log));
        table.insert("get", Builtin::fixed(1, get));
        table.insert("exists", Builtin::fixed(1, exists));
        table.insert("find", Builtin::range(1, 2, find));
        table.insert("create", Builtin::range(1, 2, create));
        table.insert("update", Builtin::fixed(2, update));
        table.insert("delete", Builtin::fixed(1, delete));
        table.insert("link", Builtin::fixed(3, link));
        table.insert("unlink", Builtin::fixed(3, unlink));
        table
    };

    static ref REGEX_CACHE: Mutex<LruCache<String, Arc<Regex>>> =
        Mutex::new(LruCache::new(NonZeroUsize::new(128).expect("non-zero cache size")));
}

pub(crate) fn is_builtin(name: &str) -> bool {
    BUILTINS.contains_key(name)
}

pub(crate) fn call(ctx: &mut BuiltinContext<'_>, name: &str, args: Vec<Value>) -> Result<Value> {
    let builtin = BUILTINS
        .get(name)
        .ok_or_else(|| KernelError::ExecutionError(format!("unknown function '{}'", name)))?;

    let arity_ok = args.len() >= builtin.min_args
        && builtin.max_args.map(|max| args.len() <= max).unwrap_or(true);
    if !arity_ok {
        let expected = match builtin.max_args {
            Some(max) if max == builtin.min_args => max.to_string(),
            Some(max) => format!("{}..{}", builtin.min_args, max),
            None => format!("at least {}", builtin.min_args),
        };
        return Err(KernelError::ExecutionError(format!(
            "{}() takes {} argument(s), got {}",
            name,
            expected,
            args.len()
        )));
    }

    (builtin.func)(ctx, args)
}

fn type_error(function: &str, expected: &str, got: &Value) -> KernelError {
    KernelError::ExecutionError(format!(
        "{}() expects {}, got {}",
        function,
        expected,
        type_name(got)
    ))
}

fn string_arg<'v>(function: &str, value: &'v Value) -> Result<&'v str> {
    value.as_str().ok_or_else(|| type_error(function, "a string", value))
}

fn object_arg(function: &str, value: Value) -> Result<Attributes> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(type_error(function, "an object", &other)),
    }
}

fn now(ctx: &mut BuiltinContext<'_>, _args: Vec<Value>) -> Result<Value> {
    Ok(Value::String(ctx.host.now().to_rfc3339()))
}

fn now_unix(ctx: &mut BuiltinContext<'_>, _args: Vec<Value>) -> Result<Value> {
    Ok(Value::from(ctx.host.now().timestamp()))
}

/// `format("{} voted {}", who, choice)`
fn format_fn(_ctx: &mut BuiltinContext<'_>, args: Vec<Value>) -> Result<Value> {
    let template = string_arg("format", &args[0])?;
    let mut values = args[1..].iter();
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find("{}") {
        out.push_str(&rest[..pos]);
        let value = values.next().ok_or_else(|| {
            KernelError::ExecutionError("format() has more placeholders than arguments".to_string())
        })?;
        out.push_str(&display(value));
        rest = &rest[pos + 2..];
    }
    out.push_str(rest);

    if values.next().is_some() {
        return Err(KernelError::ExecutionError(
            "format() has more arguments than placeholders".to_string(),
        ));
    }
    Ok(Value::String(out))
}

fn len(_ctx: &mut BuiltinContext<'_>, args: Vec<Value>) -> Result<Value> {
    let n = match &args[0] {
        Value::String(s) => s.chars().count(),
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
        other => return Err(type_error("len", "a string, array or object", other)),
    };
    Ok(Value::from(n as u64))
}

fn upper(_ctx: &mut BuiltinContext<'_>, args: Vec<Value>) -> Result<Value> {
    Ok(Value::String(string_arg("upper", &args[0])?.to_uppercase()))
}

fn lower(_ctx: &mut BuiltinContext<'_>, args: Vec<Value>) -> Result<Value> {
    Ok(Value::String(string_arg("lower", &args[0])?.to_lowercase()))
}

fn trim(_ctx: &mut BuiltinContext<'_>, args: Vec<Value>) -> Result<Value> {
    Ok(Value::String(string_arg("trim", &args[0])?.trim().to_string()))
}

fn to_str(_ctx: &mut BuiltinContext<'_>, args: Vec<Value>) -> Result<Value> {
    Ok(Value::String(display(&args[0])))
}

fn to_int(_ctx: &mut BuiltinContext<'_>, args: Vec<Value>) -> Result<Value> {
    let value = &args[0];
    let n = match value {
        Value::Number(_) => as_i64(value),
        Value::Bool(b) => Some(*b as i64),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    n.map(Value::from).ok_or_else(|| {
        KernelError::ExecutionError(format!("cannot convert {} to int", display(value)))
    })
}

fn to_float(_ctx: &mut BuiltinContext<'_>, args: Vec<Value>) -> Result<Value> {
    let value = &args[0];
    let f = match value {
        Value::Number(_) => as_f64(value),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match f {
        Some(f) => float_value(f),
        None => Err(KernelError::ExecutionError(format!(
            "cannot convert {} to float",
            display(value)
        ))),
    }
}

fn contains(_ctx: &mut BuiltinContext<'_>, args: Vec<Value>) -> Result<Value> {
    let found = match (&args[0], &args[1]) {
        (Value::String(hay), Value::String(needle)) => hay.contains(needle.as_str()),
        (Value::Array(items), needle) => items.iter().any(|item| values_equal(item, needle)),
        (Value::Object(map), Value::String(key)) => map.contains_key(key),
        (other, _) => return Err(type_error("contains", "a string, array or object", other)),
    };
    Ok(Value::Bool(found))
}

fn keys(_ctx: &mut BuiltinContext<'_>, args: Vec<Value>) -> Result<Value> {
    match &args[0] {
        Value::Object(map) => Ok(Value::Array(map.keys().cloned().map(Value::String).collect())),
        other => Err(type_error("keys", "an object", other)),
    }
}

fn matches(_ctx: &mut BuiltinContext<'_>, args: Vec<Value>) -> Result<Value> {
    let text = string_arg("matches", &args[0])?;
    let pattern = string_arg("matches", &args[1])?;
    let regex = cached_regex(pattern)?;
    Ok(Value::Bool(regex.is_match(text)))
}

fn cached_regex(pattern: &str) -> Result<Arc<Regex>> {
    {
        let mut cache = REGEX_CACHE.lock()?;
        if let Some(regex) = cache.get(pattern) {
            return Ok(Arc::clone(regex));
        }
    }

    let compiled = RegexBuilder::new(pattern)
        .size_limit(REGEX_SIZE_LIMIT)
        .build()
        .map(Arc::new)
        .map_err(|e| KernelError::ExecutionError(format!("invalid pattern: {}", e)))?;

    REGEX_CACHE.lock()?.put(pattern.to_string(), Arc::clone(&compiled));
    Ok(compiled)
}

fn concat(_ctx: &mut BuiltinContext<'_>, args: Vec<Value>) -> Result<Value> {
    if args.iter().all(Value::is_array) {
        let mut items = Vec::new();
        for arg in args {
            if let Value::Array(part) = arg {
                items.extend(part);
            }
        }
        return Ok(Value::Array(items));
    }
    Ok(Value::String(args.iter().map(display).collect()))
}

fn log(ctx: &mut BuiltinContext<'_>, args: Vec<Value>) -> Result<Value> {
    let message: Vec<String> = args.iter().map(display).collect();
    event!(Level::INFO, codex_id = %ctx.codex_id, "{}", message.join(" "));
    Ok(Value::Null)
}

fn get(ctx: &mut BuiltinContext<'_>, args: Vec<Value>) -> Result<Value> {
    let id = string_arg("get", &args[0])?;
    Ok(entity_value(&ctx.host.get(id)?))
}

fn exists(ctx: &mut BuiltinContext<'_>, args: Vec<Value>) -> Result<Value> {
    let id = string_arg("exists", &args[0])?;
    Ok(Value::Bool(ctx.host.exists(id)?))
}

/// `find("proposal", {"op": "gt", "attr": "votes", "value": 10})`
fn find(ctx: &mut BuiltinContext<'_>, args: Vec<Value>) -> Result<Value> {
    let filter = match args.get(1) {
        Some(value) => serde_json::from_value::<Filter>(value.clone())
            .map_err(|e| KernelError::ExecutionError(format!("invalid filter: {}", e)))?,
        None => Filter::All,
    };
    let kind = string_arg("find", &args[0])?;
    let found = ctx.host.find(kind, filter, ctx.max_results)?;
    Ok(Value::Array(found.iter().map(entity_value).collect()))
}

fn create(ctx: &mut BuiltinContext<'_>, mut args: Vec<Value>) -> Result<Value> {
    let attributes = if args.len() == 2 {
        object_arg("create", args.pop().unwrap_or(Value::Null))?
    } else {
        Attributes::new()
    };
    let kind = string_arg("create", &args[0])?;
    Ok(Value::String(ctx.host.create(kind, attributes)?))
}

fn update(ctx: &mut BuiltinContext<'_>, mut args: Vec<Value>) -> Result<Value> {
    let patch = object_arg("update", args.pop().unwrap_or(Value::Null))?;
    let id = string_arg("update", &args[0])?;
    Ok(entity_value(&ctx.host.update(id, &patch)?))
}

fn delete(ctx: &mut BuiltinContext<'_>, args: Vec<Value>) -> Result<Value> {
    let id = string_arg("delete", &args[0])?;
    ctx.host.delete(id)?;
    Ok(Value::Bool(true))
}

fn link(ctx: &mut BuiltinContext<'_>, args: Vec<Value>) -> Result<Value> {
    let id = string_arg("link", &args[0])?;
    let relation = string_arg("link", &args[1])?;
    let target = string_arg("link", &args[2])?;
    Ok(Value::Bool(ctx.host.link(id, relation, target)?))
}

fn unlink(ctx: &mut BuiltinContext<'_>, args: Vec<Value>) -> Result<Value> {
    let id = string_arg("unlink", &args[0])?;
    let relation = string_arg("unlink", &args[1])?;
    let target = string_arg("unlink", &args[2])?;
    Ok(Value::Bool(ctx.host.unlink(id, relation, target)?))
}
