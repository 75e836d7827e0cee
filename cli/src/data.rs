use std::collections::BTreeMap;
use std::path::Path;

use renderer::{RenderConfig, RuntimeValue};

/// Default config file picked up from the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "sstemplate.toml";

/// Convert a TOML value into render data. Tables become records, arrays
/// become lists, datetimes are kept as their text.
pub fn toml_to_runtime(value: &toml::Value) -> RuntimeValue {
    match value {
        toml::Value::Integer(n) => RuntimeValue::Number(*n as f64),
        toml::Value::Float(f) => RuntimeValue::Number(*f),
        toml::Value::Boolean(b) => RuntimeValue::Boolean(*b),
        toml::Value::String(s) => RuntimeValue::String(s.clone()),
        toml::Value::Datetime(dt) => RuntimeValue::String(dt.to_string()),
        toml::Value::Array(items) => RuntimeValue::List(items.iter().map(toml_to_runtime).collect()),
        toml::Value::Table(table) => table_to_runtime(table),
    }
}

pub fn table_to_runtime(table: &toml::Table) -> RuntimeValue {
    RuntimeValue::Record(
        table
            .iter()
            .map(|(k, v)| (k.clone(), toml_to_runtime(v)))
            .collect::<BTreeMap<_, _>>(),
    )
}

/// Apply `overlay` on top of `base`, replacing top-level fields.
pub fn overlay(base: &toml::Table, overlay: &toml::Table) -> toml::Table {
    let mut merged = base.clone();
    for (k, v) in overlay {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

/// Read a TOML data file as the root record.
pub fn load_data(path: &Path) -> Result<toml::Table, String> {
    let text = std::fs::read_to_string(path).map_err(|e| format!("cannot read '{}': {}", path.display(), e))?;
    text.parse::<toml::Table>()
        .map_err(|e| format!("invalid data file '{}': {}", path.display(), e))
}

/// Load the render configuration: an explicit path must exist, otherwise
/// `sstemplate.toml` is used when present, otherwise defaults.
pub fn load_config(path: Option<&Path>) -> Result<RenderConfig, String> {
    let path = match path {
        Some(path) => path,
        None if Path::new(DEFAULT_CONFIG_FILE).is_file() => Path::new(DEFAULT_CONFIG_FILE),
        None => return Ok(RenderConfig::default()),
    };
    let text = std::fs::read_to_string(path).map_err(|e| format!("cannot read '{}': {}", path.display(), e))?;
    toml::from_str(&text).map_err(|e| format!("invalid config '{}': {}", path.display(), e))
}
