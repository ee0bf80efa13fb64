//! Placeholder renderer
//!
//! Turns a compiled [`Template`] plus one [`Record`] into SQL text. Literal
//! segments are copied verbatim; placeholders are replaced with the SQL text
//! form of the field they name (see [`Value::write_sql_text`]). Rendering is
//! pure and never fails: absent fields follow the [`MissingFieldPolicy`].

use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sqlsink_rdbc::types::{write_json_sql_text, NULL_TEXT};
use sqlsink_rdbc::Value;

use crate::template::{FieldPath, Segment, Template};

/// What an absent field renders as
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum MissingFieldPolicy {
    /// Render `NULL`
    #[default]
    Null,
    /// Render nothing
    Empty,
}

/// An ordered mapping of field name to value submitted by a producer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(
    from = "serde_json::Map<String, serde_json::Value>",
    into = "serde_json::Map<String, serde_json::Value>"
)]
pub struct Record {
    fields: IndexMap<String, Value>,
}

/// A field resolved from a record, possibly nested inside a JSON value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldRef<'a> {
    /// A top-level field
    Value(&'a Value),
    /// A member reached by descending into a JSON field
    Json(&'a serde_json::Value),
}

impl FieldRef<'_> {
    /// Append the SQL text form of the field
    pub fn write_sql_text(&self, out: &mut Vec<u8>) {
        match self {
            Self::Value(v) => v.write_sql_text(out),
            Self::Json(j) => write_json_sql_text(j, out),
        }
    }
}

impl Record {
    /// Create an empty record
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a record from a JSON object; `None` for any other JSON value
    pub fn from_json(value: serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Object(map) => Some(map.into()),
            _ => None,
        }
    }

    /// Builder-style insert
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    /// Insert or replace a field, keeping its original position on replace
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Get a top-level field
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Number of top-level fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the record has no fields
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterate fields in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Resolve a placeholder path.
    ///
    /// A top-level field whose name is the whole path wins; otherwise the
    /// first segment names a JSON field and the remaining segments descend
    /// into it (object keys, or array indices).
    pub fn lookup(&self, path: &FieldPath) -> Option<FieldRef<'_>> {
        if let Some(value) = self.fields.get(path.as_str()) {
            return Some(FieldRef::Value(value));
        }

        let mut segments = path.segments();
        let head = self.fields.get(segments.next()?)?;
        let mut current = head.as_json()?;
        let mut descended = false;
        for segment in segments {
            current = match current {
                serde_json::Value::Object(map) => map.get(segment)?,
                serde_json::Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
            descended = true;
        }

        descended.then_some(FieldRef::Json(current))
    }
}

impl From<serde_json::Map<String, serde_json::Value>> for Record {
    fn from(map: serde_json::Map<String, serde_json::Value>) -> Self {
        map.into_iter()
            .map(|(k, v)| (k, Value::from_json(v)))
            .collect()
    }
}

impl From<Record> for serde_json::Map<String, serde_json::Value> {
    fn from(record: Record) -> Self {
        record
            .fields
            .into_iter()
            .map(|(k, v)| (k, value_to_json(v)))
            .collect()
    }
}

fn value_to_json(value: Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => b.into(),
        Value::Int64(n) => n.into(),
        Value::Float64(n) => n.into(),
        Value::String(s) => s.into(),
        Value::Bytes(b) => String::from_utf8_lossy(&b).into_owned().into(),
        Value::Json(j) => j,
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Render with the default (`NULL`) missing-field policy
pub fn render(template: &Template, record: &Record) -> Vec<u8> {
    render_with(template, record, MissingFieldPolicy::default())
}

/// Render with an explicit missing-field policy
pub fn render_with(template: &Template, record: &Record, policy: MissingFieldPolicy) -> Vec<u8> {
    let mut out = Vec::new();
    render_into(template, record, policy, &mut out);
    out
}

/// Append the rendering of `record` to `out`
pub fn render_into(
    template: &Template,
    record: &Record,
    policy: MissingFieldPolicy,
    out: &mut Vec<u8>,
) {
    for segment in template.segments() {
        match segment {
            Segment::Literal(text) => out.extend_from_slice(text.as_bytes()),
            Segment::Placeholder(path) => match record.lookup(path) {
                Some(field) => field.write_sql_text(out),
                None => {
                    if policy == MissingFieldPolicy::Null {
                        out.extend_from_slice(NULL_TEXT.as_bytes());
                    }
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_scalars() {
        let template = Template::parse("(${i}, ${f}, ${b}, '${s}', ${n})");
        let record = Record::new()
            .with("i", 7)
            .with("f", 1.5)
            .with("b", true)
            .with("s", "plain")
            .with("n", Value::Null);

        assert_eq!(render(&template, &record), b"(7, 1.5, true, 'plain', NULL)");
    }

    #[test]
    fn test_render_missing_field_policy() {
        let template = Template::parse("(${a},${b})");
        let record = Record::new().with("a", 1);

        assert_eq!(render(&template, &record), b"(1,NULL)");
        assert_eq!(
            render_with(&template, &record, MissingFieldPolicy::Empty),
            b"(1,)"
        );
    }

    #[test]
    fn test_render_nested_json_paths() {
        let record = Record::from_json(json!({
            "device": "d1",
            "payload": {"temp": 21.5, "tags": ["a", "b"], "meta": {"ok": true}},
        }))
        .unwrap();

        let template =
            Template::parse("${payload.temp}|${payload.tags.1}|${payload.meta}|${payload.nope}");
        assert_eq!(
            render(&template, &record),
            br#"21.5|b|{"ok":true}|NULL"#.to_vec()
        );
    }

    #[test]
    fn test_dotted_top_level_key_wins() {
        let record = Record::new()
            .with("a.b", "flat")
            .with("a", json!({"b": "nested"}));

        assert_eq!(
            render(&Template::parse("${a.b}"), &record),
            b"flat".to_vec()
        );
    }

    #[test]
    fn test_scalar_field_has_no_members() {
        let record = Record::new().with("a", 5);
        assert!(record.lookup(&FieldPath::new("a.b")).is_none());
    }

    #[test]
    fn test_bytes_rendered_raw() {
        let record = Record::new().with("blob", vec![0xde, 0xad]);
        assert_eq!(
            render(&Template::parse("x${blob}"), &record),
            vec![b'x', 0xde, 0xad]
        );
    }

    #[test]
    fn test_record_from_json_rejects_non_objects() {
        assert!(Record::from_json(json!([1, 2])).is_none());
        assert!(Record::from_json(json!("x")).is_none());
    }

    #[test]
    fn test_record_serde_keeps_order() {
        let record: Record = serde_json::from_str(r#"{"z": 1, "a": "x", "m": null}"#).unwrap();
        let keys: Vec<&str> = record.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
        assert_eq!(record.get("a"), Some(&Value::String("x".into())));

        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(json, r#"{"z":1,"a":"x","m":null}"#);
    }
}
