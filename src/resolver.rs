//! `$name` / `${func(args)}` substitution over nested values.
//!
//! Strings are scanned for two token families. Function calls are
//! evaluated first, left to right, then variable references. A string
//! made of exactly one token is replaced by the token's native value;
//! otherwise every token is rendered into the surrounding text.

use crate::error::{EngineError, Result};
use crate::functions::{CallArgs, FunctionRegistry};
use crate::model::VariableMap;
use regex::{Captures, Regex};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::debug;

/// Name of the built-in parameter loader.
pub const PARAMETERIZE_FN: &str = "P";
/// Name of the built-in environment variable reader.
pub const ENV_FN: &str = "ENV";

// groups: 1 = function name, 2 = raw args, 3 = braced variable,
// 4 = bare variable. Names start with a letter or underscore, so `$5`
// and `$$` stay literal text on every pass.
static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\$\{([A-Za-z_]\w*)\((.*?)\)\}|\$\{([A-Za-z_]\w*)\}|\$([A-Za-z_]\w*)",
    )
    .expect("failed to compile token regex")
});

static KWARG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\w+)\s*=\s*(.*)$").expect("failed to compile kwarg regex")
});

/// Read access to a variable scope.
pub trait Lookup {
    fn lookup(&self, name: &str) -> Option<&Value>;
}

impl Lookup for VariableMap {
    fn lookup(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }
}

impl Lookup for HashMap<String, Value> {
    fn lookup(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }
}

/// How missing variables are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Missing variables raise [`EngineError::VariableNotFound`].
    Strict,
    /// Missing variables are left as literal token text.
    Lenient,
}

/// Substitutes tokens using a function registry.
#[derive(Debug, Clone, Copy)]
pub struct Resolver<'a> {
    functions: &'a FunctionRegistry,
    base_dir: Option<&'a Path>,
    mode: Mode,
}

enum Token<'t> {
    Call { name: &'t str, args: &'t str },
    Variable(&'t str),
}

fn classify<'t>(caps: &Captures<'t>) -> Token<'t> {
    match (caps.get(1), caps.get(2)) {
        (Some(name), Some(args)) => Token::Call {
            name: name.as_str(),
            args: args.as_str(),
        },
        _ => Token::Variable(
            caps.get(3)
                .or_else(|| caps.get(4))
                .map_or("", |m| m.as_str()),
        ),
    }
}

impl<'a> Resolver<'a> {
    pub fn new(functions: &'a FunctionRegistry) -> Self {
        Self {
            functions,
            base_dir: None,
            mode: Mode::Strict,
        }
    }

    /// Directory that relative `P(...)` paths are resolved against.
    pub fn with_base_dir(mut self, dir: &'a Path) -> Self {
        self.base_dir = Some(dir);
        self
    }

    /// Same resolver, tolerating missing variables.
    pub fn lenient(mut self) -> Self {
        self.mode = Mode::Lenient;
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Resolve every token in `content`, recursing into arrays and
    /// objects. Object keys are resolved as strings.
    pub fn resolve(&self, content: &Value, scope: &dyn Lookup) -> Result<Value> {
        match content {
            Value::String(s) => self.resolve_str(s, scope),
            Value::Array(items) => items
                .iter()
                .map(|item| self.resolve(item, scope))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, value) in map {
                    let key = match self.resolve_str(key, scope)? {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    out.insert(key, self.resolve(value, scope)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    /// Resolve a serialisable definition by round-tripping it through
    /// [`Value`].
    pub fn resolve_as<T>(&self, content: &T, scope: &dyn Lookup) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        let value = serde_json::to_value(content).map_err(|e| {
            EngineError::config(format!("failed to serialise definition: {e}"))
        })?;
        let resolved = self.resolve(&value, scope)?;
        serde_json::from_value(resolved).map_err(|e| {
            EngineError::config(format!("resolved definition is malformed: {e}"))
        })
    }

    /// Resolve the tokens of a single string.
    pub fn resolve_str(&self, text: &str, scope: &dyn Lookup) -> Result<Value> {
        let captures: Vec<Captures<'_>> = TOKEN_RE.captures_iter(text).collect();
        if captures.is_empty() {
            return Ok(Value::String(text.to_string()));
        }

        let tokens: Vec<Token<'_>> = captures.iter().map(classify).collect();
        let mut values: Vec<Option<Value>> = vec![None; tokens.len()];

        for (slot, token) in values.iter_mut().zip(&tokens) {
            if let Token::Call { name, args } = token {
                *slot = Some(self.call(name, args, scope)?);
            }
        }
        for (slot, token) in values.iter_mut().zip(&tokens) {
            match token {
                Token::Variable(name) => match scope.lookup(name) {
                    Some(value) => *slot = Some(value.clone()),
                    None if self.mode == Mode::Lenient => {
                        debug!("Leaving unresolved variable ${name}");
                    }
                    None => {
                        return Err(EngineError::VariableNotFound(name.to_string()))
                    }
                },
                Token::Call { .. } => {}
            }
        }

        let whole = captures[0].get(0).map(|m| m.as_str().len()) == Some(text.len());
        if captures.len() == 1 && whole {
            return Ok(values
                .pop()
                .flatten()
                .unwrap_or_else(|| Value::String(text.to_string())));
        }

        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for (caps, value) in captures.iter().zip(values) {
            let Some(span) = caps.get(0) else { continue };
            out.push_str(&text[last..span.start()]);
            match value {
                Some(v) => out.push_str(&render(&v)),
                None => out.push_str(span.as_str()),
            }
            last = span.end();
        }
        out.push_str(&text[last..]);
        Ok(Value::String(out))
    }

    fn call(&self, name: &str, raw_args: &str, scope: &dyn Lookup) -> Result<Value> {
        let args = self.parse_args(raw_args, scope)?;
        debug!(function = name, "Calling function");
        match name {
            PARAMETERIZE_FN => {
                let path = single_string_arg(name, &args)?;
                load_parameters(&self.resolve_path(&path))
            }
            ENV_FN => {
                let var = single_string_arg(name, &args)?;
                std::env::var(&var).map(Value::String).map_err(|_| {
                    EngineError::Function {
                        name: name.to_string(),
                        message: format!("environment variable '{var}' is not set"),
                    }
                })
            }
            _ => {
                let func = self
                    .functions
                    .get(name)
                    .ok_or_else(|| EngineError::FunctionNotFound(name.to_string()))?;
                func(&args).map_err(|e| EngineError::Function {
                    name: name.to_string(),
                    message: format!("{e:#}"),
                })
            }
        }
    }

    fn parse_args(&self, raw: &str, scope: &dyn Lookup) -> Result<CallArgs> {
        let mut args = CallArgs::default();
        if raw.trim().is_empty() {
            return Ok(args);
        }
        for part in split_top_level(raw, ',') {
            let part = part.trim();
            if let Some(caps) = KWARG_RE.captures(part) {
                let key = caps[1].to_string();
                let value = self.parse_arg_value(caps[2].trim(), scope)?;
                args.named.insert(key, value);
            } else {
                args.positional.push(self.parse_arg_value(part, scope)?);
            }
        }
        Ok(args)
    }

    fn parse_arg_value(&self, raw: &str, scope: &dyn Lookup) -> Result<Value> {
        if let Some(inner) = raw
            .strip_prefix('\'')
            .and_then(|rest| rest.strip_suffix('\''))
        {
            return Ok(Value::String(inner.to_string()));
        }
        if !raw.contains('$') {
            if let Ok(value) = serde_json::from_str::<Value>(raw) {
                return Ok(value);
            }
        }
        self.resolve_str(raw, scope)
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        match self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }
}

/// Render a value into surrounding text.
pub fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Split `raw` at `sep` outside quotes and brackets.
fn split_top_level(raw: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;

    for ch in raw.chars() {
        match quote {
            Some(q) => {
                if ch == q {
                    quote = None;
                }
                current.push(ch);
            }
            None => match ch {
                '"' | '\'' => {
                    quote = Some(ch);
                    current.push(ch);
                }
                '[' | '{' | '(' => {
                    depth += 1;
                    current.push(ch);
                }
                ']' | '}' | ')' => {
                    depth -= 1;
                    current.push(ch);
                }
                c if c == sep && depth == 0 => {
                    parts.push(std::mem::take(&mut current));
                }
                _ => current.push(ch),
            },
        }
    }
    parts.push(current);
    parts
}

fn single_string_arg(name: &str, args: &CallArgs) -> Result<String> {
    if args.positional.len() != 1 || !args.named.is_empty() {
        return Err(EngineError::config(format!(
            "{name}() takes exactly one positional argument"
        )));
    }
    Ok(render(&args.positional[0]))
}

/// Load parameter records from a CSV, JSON or YAML file.
pub fn load_parameters(path: &Path) -> Result<Value> {
    let fail = |message: String| EngineError::Function {
        name: PARAMETERIZE_FN.to_string(),
        message,
    };
    let content = std::fs::read_to_string(path)
        .map_err(|e| fail(format!("failed to read {}: {e}", path.display())))?;

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    let value = match ext.as_str() {
        "csv" => parse_csv(&content).map_err(fail)?,
        "json" => serde_json::from_str(&content)
            .map_err(|e| fail(format!("invalid JSON in {}: {e}", path.display())))?,
        "yaml" | "yml" => serde_yaml::from_str(&content)
            .map_err(|e| fail(format!("invalid YAML in {}: {e}", path.display())))?,
        other => {
            return Err(EngineError::config(format!(
                "unsupported parameter file type '{other}': {}",
                path.display()
            )))
        }
    };

    match value {
        Value::Array(_) => Ok(value),
        other => Err(fail(format!(
            "{} must contain a list of records, got {other}",
            path.display()
        ))),
    }
}

fn parse_csv(content: &str) -> std::result::Result<Value, String> {
    let mut lines = content.lines().filter(|l| !l.trim().is_empty());
    let Some(header) = lines.next() else {
        return Ok(Value::Array(Vec::new()));
    };
    let columns: Vec<String> = split_top_level(header, ',')
        .iter()
        .map(|c| unquote(c.trim()))
        .collect();

    let mut records = Vec::new();
    for (row, line) in lines.enumerate() {
        let cells = split_top_level(line, ',');
        if cells.len() != columns.len() {
            return Err(format!(
                "row {} has {} cells, expected {}",
                row + 2,
                cells.len(),
                columns.len()
            ));
        }
        let record: Map<String, Value> = columns
            .iter()
            .zip(cells)
            .map(|(col, cell)| (col.clone(), Value::String(unquote(cell.trim()))))
            .collect();
        records.push(Value::Object(record));
    }
    Ok(Value::Array(records))
}

fn unquote(cell: &str) -> String {
    cell.strip_prefix('"')
        .and_then(|c| c.strip_suffix('"'))
        .unwrap_or(cell)
        .to_string()
}
