// SPDX-License-Identifier: GPL-2.0-or-later

//! Interpreter for the list-shaped boot automation language.
//!
//! Programs are plain JSON: scalars are self-evaluating (except strings,
//! which are symbols), lists are applications or special forms, and an
//! object with exactly one key is shorthand for calling the named binding.
//! Closures capture their defining scope as a handle into a scope arena;
//! scopes chain to a parent, macros expand in a fresh scope and the
//! expansion is re-interpreted in the caller's scope.

use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum InterpError {
    #[error("unbound symbol: {0}")]
    Unbound(String),

    #[error("not callable: {0}")]
    NotCallable(String),

    #[error("{name}: expected {expected} argument(s), got {got}")]
    Arity {
        name: String,
        expected: usize,
        got: usize,
    },

    #[error("{0}")]
    Type(String),

    #[error("malformed form: {0}")]
    Form(String),

    #[error("{0}")]
    Host(String),

    #[error("interrupted")]
    Interrupted,
}

/// A host-side binding injected into the environment (console I/O, regex
/// compilation, terminal hand-off).
pub trait HostFn {
    fn name(&self) -> &str;
    fn call(&self, args: Vec<Value>) -> Result<Value, InterpError>;
}

pub struct Closure {
    pub params: Vec<String>,
    pub body: Value,
    pub scope: ScopeId,
}

#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Dict(IndexMap<String, Value>),
    Proc(Rc<Closure>),
    Macro(Rc<Closure>),
    Builtin(&'static str),
    Host(Rc<dyn HostFn>),
    Regex(Rc<regex::bytes::Regex>),
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(n) => write!(f, "{n}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::List(items) => f.debug_list().entries(items).finish(),
            Value::Dict(map) => f.debug_map().entries(map.iter()).finish(),
            Value::Proc(_) => write!(f, "<proc>"),
            Value::Macro(_) => write!(f, "<macro>"),
            Value::Builtin(name) => write!(f, "<builtin {name}>"),
            Value::Host(h) => write!(f, "<host {}>", h.name()),
            Value::Regex(re) => write!(f, "<regex {}>", re.as_str()),
        }
    }
}

impl Value {
    pub fn from_json(v: &serde_json::Value) -> Value {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(items) => {
                Value::List(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Dict(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(n) => *n != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Dict(map) => !map.is_empty(),
            _ => true,
        }
    }

    pub fn is_callable(&self) -> bool {
        matches!(
            self,
            Value::Proc(_) | Value::Builtin(_) | Value::Host(_)
        )
    }

    /// Rendering used by `str`, `print` and `format`.
    pub fn display(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(n) => n.to_string(),
            Value::Float(n) => n.to_string(),
            Value::Str(s) => s.clone(),
            other => format!("{other:?}"),
        }
    }
}

/// Structural equality; numbers compare across int/float.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::List(x), Value::List(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b))
        }
        (Value::Dict(x), Value::Dict(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).map(|w| values_equal(v, w)).unwrap_or(false))
        }
        (Value::Proc(x), Value::Proc(y)) => Rc::ptr_eq(x, y),
        (Value::Macro(x), Value::Macro(y)) => Rc::ptr_eq(x, y),
        (Value::Builtin(x), Value::Builtin(y)) => x == y,
        _ => match (numeric(a), numeric(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
    }
}

fn numeric(v: &Value) -> Option<f64> {
    match v {
        Value::Int(n) => Some(*n as f64),
        Value::Float(n) => Some(*n),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

pub type ScopeId = usize;

struct Scope {
    vars: IndexMap<String, Value>,
    parent: Option<ScopeId>,
}

pub struct Interp {
    scopes: Vec<Scope>,
}

const BUILTIN_NAMES: &[&str] = &[
    "*", "+", "-", "/", "<", "<=", "=", ">", ">=", "^", "and", "contains", "in", "is", "is-not",
    "not", "or", "xor", "dict?", "list?", "macro?", "null?", "number?", "proc?", "symbol?",
    "begin", "cons", "head", "len", "list", "map", "range", "tail", "dict", "dict-del",
    "dict-get", "dict-items", "dict-set", "apply", "print", "literal", "str", "format",
];

const KEY_CONSTANTS: &[(&str, &str)] = &[
    ("key_up", "\x1b[A"),
    ("key_down", "\x1b[B"),
    ("key_right", "\x1b[C"),
    ("key_left", "\x1b[D"),
    ("key_home", "\x1b[H"),
    ("key_end", "\x1b[F"),
    ("key_ctrl_space", "\x00"),
    ("key_escape", "\x1b"),
    ("key_tab", "\t"),
    ("key_enter", "\n"),
    ("key_backspace", "\x7f"),
];

/// `defmacro` and `defproc`, defined in the language itself.
const PRELUDE: &str = r#"
["list",
 ["def", "defmacro",
  ["macro", ["name", "params", "body"],
   ["list", ["quote", "def"], "name",
    ["list", ["quote", "macro"], "params", "body"]]]],
 ["defmacro", "defproc", ["name", "params", "body"],
  ["list", ["quote", "def"], "name",
   ["list", ["quote", "lambda"], "params", "body"]]]]
"#;

impl Interp {
    /// Fresh interpreter with builtins, key constants and the prelude bound
    /// in the root scope.
    pub fn new() -> Interp {
        let mut interp = Interp {
            scopes: vec![Scope {
                vars: IndexMap::new(),
                parent: None,
            }],
        };

        for &name in BUILTIN_NAMES {
            interp.define(0, name, Value::Builtin(name));
        }
        for &(name, seq) in KEY_CONSTANTS {
            interp.define(0, name, Value::Str(seq.to_string()));
        }

        let prelude: serde_json::Value =
            serde_json::from_str(PRELUDE).unwrap_or(serde_json::Value::Null);
        // the prelude is a constant program; failure here is a programming
        // error surfaced in tests
        if let Err(err) = interp.eval(&Value::from_json(&prelude), 0) {
            debug!("prelude failed to evaluate: {err}");
        }

        interp
    }

    pub fn root(&self) -> ScopeId {
        0
    }

    pub fn define(&mut self, scope: ScopeId, name: &str, value: Value) {
        self.scopes[scope].vars.insert(name.to_string(), value);
    }

    fn lookup(&self, mut scope: ScopeId, name: &str) -> Option<Value> {
        loop {
            if let Some(v) = self.scopes[scope].vars.get(name) {
                return Some(v.clone());
            }
            scope = self.scopes[scope].parent?;
        }
    }

    fn push_scope(&mut self, parent: ScopeId) -> ScopeId {
        self.scopes.push(Scope {
            vars: IndexMap::new(),
            parent: Some(parent),
        });
        self.scopes.len() - 1
    }

    pub fn eval(&mut self, expr: &Value, scope: ScopeId) -> Result<Value, InterpError> {
        // one-key object shorthand: the key names a binding, the value is
        // the argument (or argument list)
        if let Value::Dict(map) = expr {
            if map.len() == 1 {
                let (key, raw) = map.iter().next().map(|(k, v)| (k.clone(), v.clone()))
                    .ok_or_else(|| InterpError::Form("empty call object".to_string()))?;

                let f = self
                    .lookup(scope, &key)
                    .ok_or_else(|| InterpError::Unbound(key.clone()))?;

                let evaluated = match &raw {
                    Value::List(_) | Value::Dict(_) => self.eval(&raw, scope)?,
                    other => other.clone(),
                };
                let args = match evaluated {
                    Value::List(items) => items,
                    single => vec![single],
                };

                debug!("call {key} {args:?}");
                return self.call(f, args, scope, &key);
            }
            return Ok(expr.clone());
        }

        if let Value::Str(s) = expr {
            if s.starts_with("key_") && s.len() == 5 {
                return Ok(Value::Str(s[4..].to_string()));
            }
            return self
                .lookup(scope, s)
                .ok_or_else(|| InterpError::Unbound(s.clone()));
        }

        let items = match expr {
            Value::List(items) => items,
            other => return Ok(other.clone()),
        };

        if items.is_empty() {
            return Ok(Value::List(vec![]));
        }

        if let Value::Str(head) = &items[0] {
            match head.as_str() {
                "quote" | "'" => {
                    let exp = items
                        .get(1)
                        .ok_or_else(|| InterpError::Form("quote needs an argument".to_string()))?;
                    return Ok(exp.clone());
                }
                "flat_quote" | "_'" => {
                    return Ok(Value::List(items[1..].to_vec()));
                }
                "if" => {
                    if items.len() != 4 {
                        return Err(InterpError::Form("if needs test, conseq, alt".to_string()));
                    }
                    let test = self.eval(&items[1], scope)?;
                    let branch = if test.is_truthy() { &items[2] } else { &items[3] };
                    return self.eval(branch, scope);
                }
                "def" => {
                    if items.len() != 3 {
                        return Err(InterpError::Form("def needs a name and a value".to_string()));
                    }
                    let name = match &items[1] {
                        Value::Str(s) => s.clone(),
                        other => {
                            return Err(InterpError::Form(format!(
                                "def name must be a symbol, got {other:?}"
                            )))
                        }
                    };
                    let val = self.eval(&items[2], scope)?;
                    self.define(scope, &name, val.clone());
                    return Ok(val);
                }
                "lambda" | "macro" => {
                    if items.len() != 3 {
                        return Err(InterpError::Form(format!(
                            "{head} needs params and a body"
                        )));
                    }
                    let params = param_names(&items[1])?;
                    let closure = Rc::new(Closure {
                        params,
                        body: items[2].clone(),
                        scope,
                    });
                    return Ok(if head == "lambda" {
                        Value::Proc(closure)
                    } else {
                        Value::Macro(closure)
                    });
                }
                _ => {}
            }
        }

        let head_label = match &items[0] {
            Value::Str(s) => s.clone(),
            other => format!("{other:?}"),
        };
        let head = self.eval(&items[0], scope)?;

        if let Value::Macro(mac) = head {
            // bind the unevaluated arguments in a fresh scope, evaluate the
            // macro body there, then interpret the expansion where we are
            let expand_scope = self.push_scope(mac.scope);
            for (param, arg) in mac.params.iter().zip(items[1..].iter()) {
                self.define(expand_scope, param, arg.clone());
            }
            let expansion = self.eval(&mac.body.clone(), expand_scope)?;
            return self.eval(&expansion, scope);
        }

        let mut args = Vec::with_capacity(items.len() - 1);
        for item in &items[1..] {
            args.push(self.eval(item, scope)?);
        }

        self.call(head, args, scope, &head_label)
    }

    pub fn call(
        &mut self,
        f: Value,
        args: Vec<Value>,
        _caller: ScopeId,
        label: &str,
    ) -> Result<Value, InterpError> {
        match f {
            Value::Proc(closure) => {
                let call_scope = self.push_scope(closure.scope);
                for (param, arg) in closure.params.iter().zip(args) {
                    self.define(call_scope, param, arg);
                }
                self.eval(&closure.body.clone(), call_scope)
            }
            Value::Builtin(name) => self.builtin(name, args),
            Value::Host(host) => host.call(args),
            other => Err(InterpError::NotCallable(format!("{label}: {other:?}"))),
        }
    }

    fn builtin(&mut self, name: &'static str, args: Vec<Value>) -> Result<Value, InterpError> {
        match name {
            "+" => binop(name, args, add),
            "-" => binop(name, args, |a, b| num_op(a, b, "-", |x, y| x - y, |x, y| x - y)),
            "*" => binop(name, args, |a, b| num_op(a, b, "*", |x, y| x * y, |x, y| x * y)),
            "/" => binop(name, args, |a, b| {
                let (x, y) = both_nums(&a, &b, "/")?;
                Ok(Value::Float(x / y))
            }),
            "<" => compare(name, args, |o| o == std::cmp::Ordering::Less),
            "<=" => compare(name, args, |o| o != std::cmp::Ordering::Greater),
            ">" => compare(name, args, |o| o == std::cmp::Ordering::Greater),
            ">=" => compare(name, args, |o| o != std::cmp::Ordering::Less),
            "=" => binop(name, args, |a, b| Ok(Value::Bool(values_equal(&a, &b)))),
            "^" => binop(name, args, |a, b| bit_op(a, b, "^", |x, y| x ^ y, |x, y| x ^ y)),
            "and" => binop(name, args, |a, b| bit_op(a, b, "and", |x, y| x & y, |x, y| x && y)),
            "or" => binop(name, args, |a, b| bit_op(a, b, "or", |x, y| x | y, |x, y| x || y)),
            "xor" => binop(name, args, |a, b| {
                Ok(Value::Bool(a.is_truthy() != b.is_truthy()))
            }),
            "not" => {
                arity(name, &args, 1)?;
                Ok(Value::Bool(!args[0].is_truthy()))
            }
            "in" => binop(name, args, |item, container| contains(&container, &item)),
            "contains" => binop(name, args, |container, item| contains(&container, &item)),
            "is" => binop(name, args, |a, b| Ok(Value::Bool(values_equal(&a, &b)))),
            "is-not" => binop(name, args, |a, b| Ok(Value::Bool(!values_equal(&a, &b)))),
            "dict?" => type_check(name, args, |v| matches!(v, Value::Dict(_))),
            "list?" => type_check(name, args, |v| matches!(v, Value::List(_))),
            "macro?" => type_check(name, args, |v| matches!(v, Value::Macro(_))),
            "null?" => type_check(name, args, |v| matches!(v, Value::Null)),
            "number?" => type_check(name, args, |v| {
                matches!(v, Value::Int(_) | Value::Float(_))
            }),
            "proc?" => type_check(name, args, Value::is_callable),
            "symbol?" => type_check(name, args, |v| matches!(v, Value::Str(_))),
            "begin" => Ok(args.into_iter().last().unwrap_or(Value::Null)),
            "cons" => binop(name, args, |x, y| match y {
                Value::List(mut items) => {
                    items.insert(0, x);
                    Ok(Value::List(items))
                }
                other => Err(InterpError::Type(format!("cons: not a list: {other:?}"))),
            }),
            "head" => {
                arity(name, &args, 1)?;
                match &args[0] {
                    Value::List(items) if !items.is_empty() => Ok(items[0].clone()),
                    other => Err(InterpError::Type(format!("head: {other:?}"))),
                }
            }
            "tail" => {
                arity(name, &args, 1)?;
                match &args[0] {
                    Value::List(items) => Ok(Value::List(
                        items.iter().skip(1).cloned().collect(),
                    )),
                    other => Err(InterpError::Type(format!("tail: {other:?}"))),
                }
            }
            "len" => {
                arity(name, &args, 1)?;
                let n = match &args[0] {
                    Value::List(items) => items.len(),
                    Value::Str(s) => s.chars().count(),
                    Value::Dict(map) => map.len(),
                    other => return Err(InterpError::Type(format!("len: {other:?}"))),
                };
                Ok(Value::Int(n as i64))
            }
            "list" => Ok(Value::List(args)),
            "map" => self.map_builtin(args),
            "range" => range_builtin(args),
            "dict" => {
                arity(name, &args, 1)?;
                let pairs = match &args[0] {
                    Value::List(items) => items,
                    other => return Err(InterpError::Type(format!("dict: {other:?}"))),
                };
                let mut map = IndexMap::new();
                for pair in pairs {
                    match pair {
                        Value::List(kv) if kv.len() == 2 => {
                            let key = match &kv[0] {
                                Value::Str(s) => s.clone(),
                                other => other.display(),
                            };
                            map.insert(key, kv[1].clone());
                        }
                        other => {
                            return Err(InterpError::Type(format!("dict: not a pair: {other:?}")))
                        }
                    }
                }
                Ok(Value::Dict(map))
            }
            "dict-get" => binop(name, args, |d, k| match (&d, &k) {
                (Value::Dict(map), Value::Str(key)) => {
                    Ok(map.get(key).cloned().unwrap_or(Value::Null))
                }
                _ => Err(InterpError::Type("dict-get: expects dict and key".to_string())),
            }),
            "dict-set" => {
                arity(name, &args, 3)?;
                match (&args[0], &args[1]) {
                    (Value::Dict(map), Value::Str(key)) => {
                        let mut map = map.clone();
                        map.insert(key.clone(), args[2].clone());
                        Ok(Value::Dict(map))
                    }
                    _ => Err(InterpError::Type("dict-set: expects dict and key".to_string())),
                }
            }
            "dict-del" => binop(name, args, |d, k| match (&d, &k) {
                (Value::Dict(map), Value::Str(key)) => {
                    let mut map = map.clone();
                    map.shift_remove(key);
                    Ok(Value::Dict(map))
                }
                _ => Err(InterpError::Type("dict-del: expects dict and key".to_string())),
            }),
            "dict-items" => {
                arity(name, &args, 1)?;
                match &args[0] {
                    Value::Dict(map) => Ok(Value::List(
                        map.iter()
                            .map(|(k, v)| {
                                Value::List(vec![Value::Str(k.clone()), v.clone()])
                            })
                            .collect(),
                    )),
                    other => Err(InterpError::Type(format!("dict-items: {other:?}"))),
                }
            }
            "apply" => {
                arity(name, &args, 2)?;
                let mut args = args;
                let call_args = match args.remove(1) {
                    Value::List(items) => items,
                    other => return Err(InterpError::Type(format!("apply: {other:?}"))),
                };
                let f = args.remove(0);
                self.call(f, call_args, 0, "apply")
            }
            "print" => {
                let line = args
                    .iter()
                    .map(Value::display)
                    .collect::<Vec<_>>()
                    .join(" ");
                println!("{line}");
                Ok(Value::Null)
            }
            "literal" => {
                arity(name, &args, 1)?;
                match &args[0] {
                    Value::Str(s) => serde_json::from_str::<serde_json::Value>(s)
                        .map(|v| Value::from_json(&v))
                        .map_err(|e| InterpError::Type(format!("literal: {e}"))),
                    other => Err(InterpError::Type(format!("literal: {other:?}"))),
                }
            }
            "str" => {
                arity(name, &args, 1)?;
                Ok(Value::Str(args[0].display()))
            }
            "format" => format_builtin(args),
            _ => Err(InterpError::Unbound(name.to_string())),
        }
    }

    fn map_builtin(&mut self, args: Vec<Value>) -> Result<Value, InterpError> {
        if args.len() < 2 {
            return Err(InterpError::Arity {
                name: "map".to_string(),
                expected: 2,
                got: args.len(),
            });
        }
        let mut args = args;
        let lists = args
            .split_off(1)
            .into_iter()
            .map(|v| match v {
                Value::List(items) => Ok(items),
                other => Err(InterpError::Type(format!("map: not a list: {other:?}"))),
            })
            .collect::<Result<Vec<_>, _>>()?;
        let f = args.remove(0);

        let shortest = lists.iter().map(Vec::len).min().unwrap_or(0);
        let mut out = Vec::with_capacity(shortest);
        for i in 0..shortest {
            let call_args: Vec<Value> = lists.iter().map(|l| l[i].clone()).collect();
            out.push(self.call(f.clone(), call_args, 0, "map")?);
        }
        Ok(Value::List(out))
    }
}

impl Default for Interp {
    fn default() -> Self {
        Interp::new()
    }
}

fn param_names(params: &Value) -> Result<Vec<String>, InterpError> {
    match params {
        Value::List(items) => items
            .iter()
            .map(|p| match p {
                Value::Str(s) => Ok(s.clone()),
                other => Err(InterpError::Form(format!(
                    "parameter must be a symbol, got {other:?}"
                ))),
            })
            .collect(),
        other => Err(InterpError::Form(format!(
            "parameters must be a list, got {other:?}"
        ))),
    }
}

fn arity(name: &str, args: &[Value], expected: usize) -> Result<(), InterpError> {
    if args.len() != expected {
        return Err(InterpError::Arity {
            name: name.to_string(),
            expected,
            got: args.len(),
        });
    }
    Ok(())
}

fn binop(
    name: &str,
    args: Vec<Value>,
    f: impl FnOnce(Value, Value) -> Result<Value, InterpError>,
) -> Result<Value, InterpError> {
    arity(name, &args, 2)?;
    let mut args = args;
    let b = args.pop().unwrap_or(Value::Null);
    let a = args.pop().unwrap_or(Value::Null);
    f(a, b)
}

fn type_check(
    name: &str,
    args: Vec<Value>,
    pred: impl FnOnce(&Value) -> bool,
) -> Result<Value, InterpError> {
    arity(name, &args, 1)?;
    Ok(Value::Bool(pred(&args[0])))
}

fn both_nums(a: &Value, b: &Value, op: &str) -> Result<(f64, f64), InterpError> {
    match (numeric(a), numeric(b)) {
        (Some(x), Some(y)) => Ok((x, y)),
        _ => Err(InterpError::Type(format!("{op}: {a:?} and {b:?}"))),
    }
}

fn num_op(
    a: Value,
    b: Value,
    op: &str,
    int_op: impl FnOnce(i64, i64) -> i64,
    float_op: impl FnOnce(f64, f64) -> f64,
) -> Result<Value, InterpError> {
    match (&a, &b) {
        (Value::Int(x), Value::Int(y)) => Ok(Value::Int(int_op(*x, *y))),
        _ => {
            let (x, y) = both_nums(&a, &b, op)?;
            Ok(Value::Float(float_op(x, y)))
        }
    }
}

fn add(a: Value, b: Value) -> Result<Value, InterpError> {
    match (&a, &b) {
        (Value::Str(x), Value::Str(y)) => Ok(Value::Str(format!("{x}{y}"))),
        (Value::List(x), Value::List(y)) => {
            let mut out = x.clone();
            out.extend(y.iter().cloned());
            Ok(Value::List(out))
        }
        _ => num_op(a, b, "+", |x, y| x + y, |x, y| x + y),
    }
}

fn bit_op(
    a: Value,
    b: Value,
    op: &str,
    int_op: impl FnOnce(i64, i64) -> i64,
    bool_op: impl FnOnce(bool, bool) -> bool,
) -> Result<Value, InterpError> {
    match (&a, &b) {
        (Value::Bool(x), Value::Bool(y)) => Ok(Value::Bool(bool_op(*x, *y))),
        (Value::Int(x), Value::Int(y)) => Ok(Value::Int(int_op(*x, *y))),
        _ => Err(InterpError::Type(format!("{op}: {a:?} and {b:?}"))),
    }
}

fn compare(
    name: &str,
    args: Vec<Value>,
    accept: impl FnOnce(std::cmp::Ordering) -> bool,
) -> Result<Value, InterpError> {
    binop(name, args, |a, b| {
        let ordering = match (&a, &b) {
            (Value::Str(x), Value::Str(y)) => x.cmp(y),
            _ => {
                let (x, y) = both_nums(&a, &b, name)?;
                x.partial_cmp(&y)
                    .ok_or_else(|| InterpError::Type(format!("{name}: incomparable")))?
            }
        };
        Ok(Value::Bool(accept(ordering)))
    })
}

fn contains(container: &Value, item: &Value) -> Result<Value, InterpError> {
    let found = match container {
        Value::List(items) => items.iter().any(|v| values_equal(v, item)),
        Value::Str(s) => match item {
            Value::Str(sub) => s.contains(sub.as_str()),
            _ => false,
        },
        Value::Dict(map) => match item {
            Value::Str(key) => map.contains_key(key),
            _ => false,
        },
        other => {
            return Err(InterpError::Type(format!(
                "membership test on {other:?}"
            )))
        }
    };
    Ok(Value::Bool(found))
}

fn range_builtin(args: Vec<Value>) -> Result<Value, InterpError> {
    let ints = args
        .iter()
        .map(|v| match v {
            Value::Int(n) => Ok(*n),
            other => Err(InterpError::Type(format!("range: {other:?}"))),
        })
        .collect::<Result<Vec<_>, _>>()?;

    let (start, stop, step) = match ints.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] if *step != 0 => (*start, *stop, *step),
        _ => {
            return Err(InterpError::Arity {
                name: "range".to_string(),
                expected: 1,
                got: ints.len(),
            })
        }
    };

    let mut out = Vec::new();
    let mut i = start;
    while (step > 0 && i < stop) || (step < 0 && i > stop) {
        out.push(Value::Int(i));
        i += step;
    }
    Ok(Value::List(out))
}

/// Python-style `%` formatting, restricted to `%s`, `%d`, `%f` and `%%`.
fn format_builtin(args: Vec<Value>) -> Result<Value, InterpError> {
    if args.is_empty() {
        return Err(InterpError::Arity {
            name: "format".to_string(),
            expected: 1,
            got: 0,
        });
    }
    let mut args = args.into_iter();
    let template = match args.next() {
        Some(Value::Str(s)) => s,
        other => return Err(InterpError::Type(format!("format: {other:?}"))),
    };

    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some('s') => {
                let v = args
                    .next()
                    .ok_or_else(|| InterpError::Type("format: not enough arguments".to_string()))?;
                out.push_str(&v.display());
            }
            Some('d') => {
                let v = args
                    .next()
                    .ok_or_else(|| InterpError::Type("format: not enough arguments".to_string()))?;
                match numeric(&v) {
                    Some(n) => out.push_str(&(n as i64).to_string()),
                    None => return Err(InterpError::Type(format!("format: %d on {v:?}"))),
                }
            }
            Some('f') => {
                let v = args
                    .next()
                    .ok_or_else(|| InterpError::Type("format: not enough arguments".to_string()))?;
                match numeric(&v) {
                    Some(n) => out.push_str(&n.to_string()),
                    None => return Err(InterpError::Type(format!("format: %f on {v:?}"))),
                }
            }
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }

    Ok(Value::Str(out))
}
