//! Query-string options for `find` and `find_reduce`.

use serde_json::{Map, Value};

/// Ordered `key=value` view options such as `limit`, `descending` or `key`.
///
/// Values render as follows: booleans as `true`/`false`, strings verbatim,
/// numbers in decimal, anything else as its JSON text. Rendered values are
/// percent-encoded; keys are used as given.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOptions {
    params: Vec<(String, Value)>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an option, replacing an earlier one with the same key.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        let value = value.into();
        match self.params.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.params.push((key, value)),
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// `k=v&k=v`, or an empty string when no options are set.
    pub fn to_query_string(&self) -> String {
        self.params
            .iter()
            .map(|(key, value)| format!("{key}={}", urlencoding::encode(&render(value))))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Appends `?k=v&...` to `path` when any option is set.
    pub fn apply(&self, path: &str) -> String {
        if self.is_empty() {
            path.to_string()
        } else {
            format!("{path}?{}", self.to_query_string())
        }
    }
}

impl From<Map<String, Value>> for QueryOptions {
    fn from(map: Map<String, Value>) -> Self {
        Self {
            params: map.into_iter().collect(),
        }
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for QueryOptions {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        iter.into_iter()
            .fold(QueryOptions::new(), |opts, (k, v)| opts.set(k, v))
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::Bool(true) => "true".to_string(),
        Value::Bool(false) => "false".to_string(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn booleans_render_as_literal_words() {
        let opts = QueryOptions::new()
            .set("descending", true)
            .set("include_docs", false);
        assert_eq!(opts.to_query_string(), "descending=true&include_docs=false");
    }

    #[test]
    fn numbers_and_strings_render_verbatim() {
        let opts = QueryOptions::new().set("limit", 10).set("startkey_docid", "abc");
        assert_eq!(opts.to_query_string(), "limit=10&startkey_docid=abc");
    }

    #[test]
    fn composite_values_render_as_encoded_json() {
        let opts = QueryOptions::new().set("key", json!(["a", 1]));
        assert_eq!(opts.to_query_string(), "key=%5B%22a%22%2C1%5D");
    }

    #[test]
    fn set_replaces_existing_key_in_place() {
        let opts = QueryOptions::new()
            .set("limit", 1)
            .set("skip", 2)
            .set("limit", 5);
        assert_eq!(opts.to_query_string(), "limit=5&skip=2");
    }

    #[test]
    fn apply_leaves_path_alone_without_options() {
        assert_eq!(QueryOptions::new().apply("/db/doc"), "/db/doc");
        let opts = QueryOptions::new().set("limit", 2);
        assert_eq!(opts.apply("/db/_design/d/_view/v"), "/db/_design/d/_view/v?limit=2");
    }

    #[test]
    fn collects_from_pairs() {
        let opts: QueryOptions = [("limit", json!(3)), ("reduce", json!(false))]
            .into_iter()
            .collect();
        assert_eq!(opts.to_query_string(), "limit=3&reduce=false");
    }
}
