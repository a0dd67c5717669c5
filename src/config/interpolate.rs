//! `${group.key}` interpolation over a parsed TOML tree.
//!
//! A string value of exactly the form `"${a.b}"` is replaced by the value at
//! dotted path `a.b`, whatever its type. Referenced values may themselves
//! contain references; chains resolve recursively. Strings that merely embed
//! `${...}` among other text are left alone.

use super::defaults::MAX_INTERPOLATION_DEPTH;
use thiserror::Error;
use toml::Value;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InterpolationError {
    #[error("'${{{reference}}}' does not name a config value")]
    Missing { reference: String },

    #[error("reference cycle: {0}")]
    Cycle(String),

    #[error("reference chain too deep: {0}")]
    TooDeep(String),
}

/// Resolve every reference in `root`, returning the resolved tree.
pub fn interpolate(root: &Value) -> Result<Value, InterpolationError> {
    let mut chain = Vec::new();
    resolve(root.clone(), root, &mut chain)
}

/// Target path of an exact `${...}` reference.
fn reference(s: &str) -> Option<&str> {
    s.strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
        .filter(|target| !target.is_empty() && !target.contains(char::is_whitespace))
}

fn resolve(value: Value, root: &Value, chain: &mut Vec<String>) -> Result<Value, InterpolationError> {
    match value {
        Value::String(s) => match reference(&s) {
            Some(target) => follow(target, root, chain),
            None => Ok(Value::String(s)),
        },
        Value::Table(table) => table
            .into_iter()
            .map(|(k, v)| Ok((k, resolve(v, root, chain)?)))
            .collect::<Result<toml::map::Map<_, _>, _>>()
            .map(Value::Table),
        Value::Array(items) => items
            .into_iter()
            .map(|v| resolve(v, root, chain))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        other => Ok(other),
    }
}

fn follow(target: &str, root: &Value, chain: &mut Vec<String>) -> Result<Value, InterpolationError> {
    if chain.iter().any(|seen| seen == target) {
        let mut path = chain.clone();
        path.push(target.to_string());
        return Err(InterpolationError::Cycle(path.join(" -> ")));
    }
    if chain.len() >= MAX_INTERPOLATION_DEPTH {
        return Err(InterpolationError::TooDeep(chain.join(" -> ")));
    }
    let value = lookup(root, target)
        .cloned()
        .ok_or_else(|| InterpolationError::Missing {
            reference: target.to_string(),
        })?;
    chain.push(target.to_string());
    let resolved = resolve(value, root, chain);
    chain.pop();
    resolved
}

fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(root, |node, part| node.as_table()?.get(part))
}
