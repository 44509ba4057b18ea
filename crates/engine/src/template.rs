//! Template rendering for procedure node configuration using Tera
//!
//! String values in a node's `config` may contain `{{ ... }}` placeholders that
//! are rendered against the run's scope before the procedure is invoked.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};
use tera::{Context, Tera};

use crate::{expression, Error, Result};

lazy_static! {
    /// A string that is exactly one placeholder over a plain path, e.g. `{{ outputs.A.result }}`
    static ref SINGLE_PLACEHOLDER: Regex =
        Regex::new(r"^\{\{\s*([A-Za-z_$][\w$]*(?:\.[A-Za-z_$][\w$]*|\[\d+\])*)\s*\}\}$")
            .unwrap();
}

pub fn is_template(text: &str) -> bool {
    text.contains("{{") || text.contains("{%")
}

/// Render a template string with the given context
pub fn render_template(template: &str, context: &Value) -> Result<String> {
    let mut tera = Tera::default();
    tera.add_raw_template("template", template)
        .map_err(|e| Error::Template(format!("Failed to parse template: {}", e)))?;

    let mut tera_context = Context::new();
    match context {
        Value::Object(map) => {
            for (key, value) in map {
                tera_context.insert(key, value);
            }
        }
        _ => tera_context.insert("data", context),
    }

    tera.render("template", &tera_context)
        .map_err(|e| Error::Template(format!("Failed to render template: {}", e)))
}

/// Renders every templated string inside `value`.
///
/// A string consisting of a single `{{ path }}` placeholder is replaced by the
/// JSON value at that path, so numbers and objects keep their type.
pub fn render_value(value: &Value, context: &Value) -> Result<Value> {
    match value {
        Value::String(text) if is_template(text) => {
            if let Some(captures) = SINGLE_PLACEHOLDER.captures(text) {
                let resolved = expression::evaluate(&captures[1], context)?;
                if !resolved.is_null() {
                    return Ok(resolved);
                }
            }
            render_template(text, context).map(Value::String)
        }
        Value::Array(items) => items
            .iter()
            .map(|item| render_value(item, context))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(key, item)| Ok((key.clone(), render_value(item, context)?)))
            .collect::<Result<Map<String, Value>>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}
