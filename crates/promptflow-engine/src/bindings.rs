use std::collections::HashMap;

use serde_json::Value;

use promptflow_core::template;

/// Named values visible to a node.
///
/// Seeded from flow variables and caller inputs, then extended with each
/// completed node's output (keyed by node id, plus any declared alias).
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    data: HashMap<String, Value>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(data: HashMap<String, Value>) -> Self {
        Self { data }
    }

    /// Exact-key lookup.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Lookup by exact key first, then as a dot path (`review.score`,
    /// `files.0`) into nested objects and arrays.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        if let Some(v) = self.data.get(path) {
            return Some(v);
        }
        let (head, rest) = path.split_once('.')?;
        lookup_path(self.data.get(head)?, rest)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    pub fn set_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data.insert(key.into(), Value::String(value.into()));
    }

    /// Merge values into this map (overwrites on conflict).
    pub fn extend<I>(&mut self, values: I)
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        self.data.extend(values);
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get_path(path).is_some()
    }

    /// Render `{{name}}` placeholders from these bindings.
    pub fn render(&self, template_text: &str) -> String {
        template::resolve_with(template_text, |name| self.get_path(name).map(value_to_text))
    }

    /// Template variables with no binding.
    pub fn missing(&self, template_text: &str) -> Vec<String> {
        template::missing_variables(template_text, |name| self.contains(name))
    }
}

/// Walk a dot path into a JSON value.
pub fn lookup_path<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Text form of a value for prompt rendering: strings raw, null empty,
/// everything else as compact JSON.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Interpret a value as a list. Strings holding a JSON array qualify.
pub fn as_list(value: &Value) -> Option<Vec<Value>> {
    match value {
        Value::Array(items) => Some(items.clone()),
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Array(items)) => Some(items),
            _ => None,
        },
        _ => None,
    }
}
