//! Registry payload codec.
//!
//! Registry values are stored as text in the coordination store. Maps
//! and lists are JSON with a lossy type escape for symbol-like atoms:
//! a key or string value written as `":name"` decodes back to a
//! symbol. Bare scalars are YAML-serialized so that integers, floats,
//! booleans, dates, and times survive the trip (YAML quoting keeps an
//! ambiguous string like `"42"` a string). An unparseable payload
//! decodes to itself as a raw string.

use chrono::{DateTime, NaiveDate, Utc};

/// A decoded registry payload. Symbols are carried as a typed variant
/// internally; the `":name"` textual marker exists only on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Sym(String),
    Date(NaiveDate),
    Time(DateTime<Utc>),
    List(Vec<RegistryValue>),
    Map(Vec<(MapKey, RegistryValue)>),
}

/// Map keys distinguish symbols from plain strings, as the source
/// schema does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapKey {
    Str(String),
    Sym(String),
}

impl RegistryValue {
    /// Serialize to the stored text form.
    pub fn encode(&self) -> String {
        match self {
            RegistryValue::Map(_) | RegistryValue::List(_) => self.to_json().to_string(),
            RegistryValue::Sym(name) => format!(":{name}"),
            RegistryValue::Date(d) => d.format("%Y-%m-%d").to_string(),
            RegistryValue::Time(t) => t.to_rfc3339(),
            RegistryValue::Null => "null".to_string(),
            RegistryValue::Bool(b) => b.to_string(),
            RegistryValue::Int(i) => i.to_string(),
            RegistryValue::Float(f) => {
                // serde_yaml keeps the decimal point, so 2.0 does not
                // collapse into the integer 2.
                serde_yaml::to_string(f).map_or_else(|_| f.to_string(), |s| s.trim_end().to_string())
            }
            RegistryValue::Str(s) => serde_yaml::to_string(s)
                .map(|y| y.trim_end_matches('\n').to_string())
                .unwrap_or_else(|_| s.clone()),
        }
    }

    pub fn encode_bytes(&self) -> Vec<u8> {
        self.encode().into_bytes()
    }

    /// Deserialize from stored text. Never fails: text that parses as
    /// neither JSON nor a YAML scalar is returned as a raw string.
    pub fn decode(text: &str) -> RegistryValue {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return RegistryValue::Null;
        }

        if let Some(sym) = as_symbol(trimmed) {
            return RegistryValue::Sym(sym.to_string());
        }

        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
                return RegistryValue::from_json(json);
            }
        }

        match serde_yaml::from_str::<serde_yaml::Value>(text) {
            Ok(yaml) => RegistryValue::from_yaml(yaml, text),
            Err(_) => RegistryValue::Str(text.to_string()),
        }
    }

    pub fn decode_bytes(bytes: &[u8]) -> RegistryValue {
        RegistryValue::decode(&String::from_utf8_lossy(bytes))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            RegistryValue::Str(s) | RegistryValue::Sym(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            RegistryValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    fn to_json(&self) -> serde_json::Value {
        match self {
            RegistryValue::Null => serde_json::Value::Null,
            RegistryValue::Bool(b) => serde_json::Value::from(*b),
            RegistryValue::Int(i) => serde_json::Value::from(*i),
            RegistryValue::Float(f) => serde_json::Value::from(*f),
            RegistryValue::Str(s) => serde_json::Value::from(s.clone()),
            RegistryValue::Sym(name) => serde_json::Value::from(format!(":{name}")),
            RegistryValue::Date(d) => serde_json::Value::from(d.format("%Y-%m-%d").to_string()),
            RegistryValue::Time(t) => serde_json::Value::from(t.to_rfc3339()),
            RegistryValue::List(items) => {
                serde_json::Value::Array(items.iter().map(RegistryValue::to_json).collect())
            }
            RegistryValue::Map(pairs) => {
                let mut map = serde_json::Map::new();
                for (key, value) in pairs {
                    let key = match key {
                        MapKey::Str(s) => s.clone(),
                        MapKey::Sym(s) => format!(":{s}"),
                    };
                    map.insert(key, value.to_json());
                }
                serde_json::Value::Object(map)
            }
        }
    }

    fn from_json(json: serde_json::Value) -> RegistryValue {
        match json {
            serde_json::Value::Null => RegistryValue::Null,
            serde_json::Value::Bool(b) => RegistryValue::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    RegistryValue::Int(i)
                } else {
                    RegistryValue::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => classify_string(&s),
            serde_json::Value::Array(items) => {
                RegistryValue::List(items.into_iter().map(RegistryValue::from_json).collect())
            }
            serde_json::Value::Object(map) => RegistryValue::Map(
                map.into_iter()
                    .map(|(key, value)| {
                        let key = match as_symbol(&key) {
                            Some(sym) => MapKey::Sym(sym.to_string()),
                            None => MapKey::Str(key),
                        };
                        (key, RegistryValue::from_json(value))
                    })
                    .collect(),
            ),
        }
    }

    fn from_yaml(yaml: serde_yaml::Value, raw: &str) -> RegistryValue {
        match yaml {
            serde_yaml::Value::Null => RegistryValue::Null,
            serde_yaml::Value::Bool(b) => RegistryValue::Bool(b),
            serde_yaml::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    RegistryValue::Int(i)
                } else {
                    RegistryValue::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_yaml::Value::String(s) => classify_string(&s),
            serde_yaml::Value::Sequence(items) => RegistryValue::List(
                items
                    .into_iter()
                    .map(|v| RegistryValue::from_yaml(v, ""))
                    .collect(),
            ),
            serde_yaml::Value::Mapping(map) => RegistryValue::Map(
                map.into_iter()
                    .map(|(key, value)| {
                        let key = match key {
                            serde_yaml::Value::String(s) => match as_symbol(&s) {
                                Some(sym) => MapKey::Sym(sym.to_string()),
                                None => MapKey::Str(s),
                            },
                            other => MapKey::Str(format!("{other:?}")),
                        };
                        (key, RegistryValue::from_yaml(value, ""))
                    })
                    .collect(),
            ),
            serde_yaml::Value::Tagged(_) => RegistryValue::Str(raw.to_string()),
        }
    }
}

/// A symbol marker is a single-line `:name` with no quotes.
fn as_symbol(text: &str) -> Option<&str> {
    let name = text.strip_prefix(':')?;
    if name.is_empty() || name.contains('"') || name.contains('\n') {
        return None;
    }
    Some(name)
}

/// Strings decoded from JSON or YAML get the lossy escapes applied:
/// symbol markers become symbols, ISO timestamps and dates become
/// their typed forms.
fn classify_string(s: &str) -> RegistryValue {
    if let Some(sym) = as_symbol(s) {
        return RegistryValue::Sym(sym.to_string());
    }
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return RegistryValue::Time(t.with_timezone(&Utc));
    }
    if s.len() == 10 {
        if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            return RegistryValue::Date(d);
        }
    }
    RegistryValue::Str(s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn round_trip(value: RegistryValue) {
        let encoded = value.encode();
        let decoded = RegistryValue::decode(&encoded);
        assert_eq!(decoded, value, "encoded form was: {encoded:?}");
    }

    #[test]
    fn scalars_round_trip() {
        round_trip(RegistryValue::Null);
        round_trip(RegistryValue::Bool(true));
        round_trip(RegistryValue::Bool(false));
        round_trip(RegistryValue::Int(42));
        round_trip(RegistryValue::Int(-7));
        round_trip(RegistryValue::Float(3.25));
        round_trip(RegistryValue::Str("hello world".into()));
        round_trip(RegistryValue::Sym("registered".into()));
    }

    #[test]
    fn ambiguous_strings_stay_strings() {
        round_trip(RegistryValue::Str("42".into()));
        round_trip(RegistryValue::Str("true".into()));
        round_trip(RegistryValue::Str("null".into()));
    }

    #[test]
    fn dates_and_times_round_trip() {
        round_trip(RegistryValue::Date(
            NaiveDate::from_ymd_opt(2012, 3, 14).unwrap(),
        ));
        round_trip(RegistryValue::Time(
            Utc.with_ymd_and_hms(2012, 3, 14, 15, 9, 26).unwrap(),
        ));
    }

    #[test]
    fn collections_round_trip() {
        round_trip(RegistryValue::List(vec![
            RegistryValue::Int(1),
            RegistryValue::Str("two".into()),
            RegistryValue::Sym("three".into()),
        ]));
        round_trip(RegistryValue::Map(vec![
            (MapKey::Sym("name".into()), RegistryValue::Str("echo".into())),
            (MapKey::Str("port".into()), RegistryValue::Int(2000)),
            (
                MapKey::Sym("tags".into()),
                RegistryValue::List(vec![RegistryValue::Bool(true), RegistryValue::Null]),
            ),
        ]));
    }

    #[test]
    fn nested_map_with_time_round_trips() {
        round_trip(RegistryValue::Map(vec![(
            MapKey::Str("registered_at".into()),
            RegistryValue::Time(Utc.with_ymd_and_hms(2012, 3, 14, 15, 9, 26).unwrap()),
        )]));
    }

    #[test]
    fn symbols_use_the_textual_marker() {
        assert_eq!(RegistryValue::Sym("addr".into()).encode(), ":addr");
        assert_eq!(
            RegistryValue::decode(":addr"),
            RegistryValue::Sym("addr".into())
        );
    }

    #[test]
    fn unparseable_text_decodes_to_itself() {
        let raw = "{not json at all";
        assert_eq!(RegistryValue::decode(raw), RegistryValue::Str(raw.into()));
    }

    #[test]
    fn empty_payload_is_null() {
        assert_eq!(RegistryValue::decode(""), RegistryValue::Null);
    }
}
