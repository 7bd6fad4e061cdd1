//! JSON import/export (spec §6 "JSON format").
//!
//! A value's JSON representation is plain where it is unambiguous (bool,
//! a string, an integer that fits `i32`) and suffix-tagged where it is not
//! (`"42I"`, `"3.14D"`, `"@123@"`). `$id$` carries the record id. A value
//! beginning with `@` and ending with `@` whose interior is not purely
//! numeric is a *resolvable link*: a caller-supplied resolver turns the
//! enclosed text into zero or more concrete `Link`s (the CCL parser that
//! would normally evaluate that text is out of scope, spec §1).

use concourse_core::error::{Error, Result};
use concourse_core::key::RESERVED_IDENTIFIER_KEY;
use concourse_core::value::{RecordId, Value};
use serde_json::Value as Json;
use std::collections::BTreeMap;

/// Resolves the CCL-like text inside a resolvable link (`@text@`) to the
/// record ids it denotes. The core has no CCL parser (spec §1); callers
/// that want resolvable-link support pass one in.
pub type LinkResolver<'a> = dyn Fn(&str) -> Result<Vec<RecordId>> + 'a;

/// One record's worth of parsed fields, ready to be staged as writes.
/// `id` is `Some` when the document carried an explicit `$id$`.
#[derive(Clone)]
pub struct ParsedRecord {
    /// Explicit record id from `$id$`, if present.
    pub id: Option<RecordId>,
    /// Field name to the values it should hold.
    pub fields: Vec<(String, Vec<Value>)>,
}

/// Parse a JSON object or array-of-objects `insert` document into one
/// [`ParsedRecord`] per object (spec §6).
pub fn parse_insert_document(doc: &str, resolver: Option<&LinkResolver>) -> Result<Vec<ParsedRecord>> {
    let parsed: Json =
        serde_json::from_str(doc).map_err(|e| Error::Parse(format!("invalid JSON: {e}")))?;
    match parsed {
        Json::Array(items) => items
            .into_iter()
            .map(|item| parse_object(item, resolver))
            .collect(),
        obj @ Json::Object(_) => Ok(vec![parse_object(obj, resolver)?]),
        other => Err(Error::Parse(format!(
            "insert document must be an object or array of objects, got {other}"
        ))),
    }
}

fn parse_object(value: Json, resolver: Option<&LinkResolver>) -> Result<ParsedRecord> {
    let Json::Object(map) = value else {
        return Err(Error::Parse("expected a JSON object".into()));
    };
    let mut id = None;
    let mut fields = Vec::new();
    for (key, v) in map {
        if key == RESERVED_IDENTIFIER_KEY {
            id = Some(parse_record_id(&v)?);
            continue;
        }
        if !concourse_core::key::is_valid_key(&key) {
            return Err(Error::Parse(format!("empty field key in document")));
        }
        let values = parse_field_values(v, resolver)?;
        fields.push((key, values));
    }
    Ok(ParsedRecord { id, fields })
}

fn parse_record_id(v: &Json) -> Result<RecordId> {
    match v {
        Json::Number(n) => n
            .as_u64()
            .ok_or_else(|| Error::Parse(format!("$id$ must be a non-negative integer, got {n}"))),
        Json::String(s) => s
            .parse::<u64>()
            .map_err(|_| Error::Parse(format!("$id$ string {s:?} is not a valid record id"))),
        other => Err(Error::Parse(format!("$id$ must be numeric, got {other}"))),
    }
}

fn parse_field_values(v: Json, resolver: Option<&LinkResolver>) -> Result<Vec<Value>> {
    match v {
        Json::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.extend(parse_scalar(item, resolver)?);
            }
            Ok(out)
        }
        scalar => parse_scalar(scalar, resolver),
    }
}

/// One JSON scalar normally yields one `Value`; a resolvable link may
/// expand to zero or more `Link` values once resolved.
fn parse_scalar(v: Json, resolver: Option<&LinkResolver>) -> Result<Vec<Value>> {
    match v {
        Json::Bool(b) => Ok(vec![Value::Boolean(b)]),
        Json::Number(n) => Ok(vec![number_to_value(&n)?]),
        Json::String(s) => parse_tagged_string(&s, resolver),
        Json::Null => Err(Error::Parse("null values are not supported".into())),
        other => Err(Error::Parse(format!("unsupported JSON value: {other}"))),
    }
}

fn number_to_value(n: &serde_json::Number) -> Result<Value> {
    if let Some(i) = n.as_i64() {
        if let Ok(i32_val) = i32::try_from(i) {
            return Ok(Value::Integer(i32_val));
        }
        return Ok(Value::Long(i));
    }
    if let Some(f) = n.as_f64() {
        return Ok(Value::Double(f));
    }
    Err(Error::Parse(format!("unrepresentable JSON number: {n}")))
}

fn parse_tagged_string(s: &str, resolver: Option<&LinkResolver>) -> Result<Vec<Value>> {
    if let Some(inner) = s.strip_prefix('@').and_then(|r| r.strip_suffix('@')) {
        if let Ok(id) = inner.parse::<u64>() {
            return Ok(vec![Value::Link(id)]);
        }
        let resolver = resolver.ok_or_else(|| {
            Error::Parse(format!(
                "resolvable link {s:?} requires a link resolver, none was supplied"
            ))
        })?;
        return Ok(resolver(inner)?.into_iter().map(Value::Link).collect());
    }
    if let Some(digits) = s.strip_suffix('I') {
        if let Ok(i) = digits.parse::<i32>() {
            return Ok(vec![Value::Integer(i)]);
        }
    }
    if let Some(digits) = s.strip_suffix('L') {
        if let Ok(l) = digits.parse::<i64>() {
            return Ok(vec![Value::Long(l)]);
        }
    }
    if let Some(digits) = s.strip_suffix('F') {
        if let Ok(f) = digits.parse::<f32>() {
            return Ok(vec![Value::Float(f)]);
        }
    }
    if let Some(digits) = s.strip_suffix('D') {
        if let Ok(d) = digits.parse::<f64>() {
            return Ok(vec![Value::Double(d)]);
        }
    }
    Ok(vec![Value::String(s.to_string())])
}

/// Render one record's fields into a JSON object, with `$id$` set to
/// `record` (spec §6 `jsonify`). `Tag` values are emitted as plain
/// strings — lossy on round-trip, since the JSON format defines no tag
/// suffix (documented in DESIGN.md).
pub fn record_to_json(record: RecordId, fields: &BTreeMap<String, Vec<Value>>) -> Json {
    let mut map = serde_json::Map::new();
    map.insert(
        RESERVED_IDENTIFIER_KEY.to_string(),
        Json::Number(record.into()),
    );
    for (key, values) in fields {
        let json_values: Vec<Json> = values.iter().map(value_to_json).collect();
        let rendered = if json_values.len() == 1 {
            json_values.into_iter().next().unwrap()
        } else {
            Json::Array(json_values)
        };
        map.insert(key.clone(), rendered);
    }
    Json::Object(map)
}

fn value_to_json(v: &Value) -> Json {
    match v {
        Value::Boolean(b) => Json::Bool(*b),
        Value::Integer(i) => Json::Number((*i).into()),
        Value::Long(l) => Json::String(format!("{l}L")),
        Value::Float(f) => Json::String(format!("{f}F")),
        Value::Double(d) => serde_json::Number::from_f64(*d)
            .map(Json::Number)
            .unwrap_or_else(|| Json::String(format!("{d}D"))),
        Value::String(s) => Json::String(s.clone()),
        Value::Tag(s) => Json::String(s.clone()),
        Value::Link(r) => Json::String(format!("@{r}@")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_scalars() {
        let docs = parse_insert_document(
            r#"{"name":"A","likes":["x","y"],"age":30}"#,
            None,
        )
        .unwrap();
        assert_eq!(docs.len(), 1);
        let doc = &docs[0];
        assert!(doc.id.is_none());
        let likes = doc.fields.iter().find(|(k, _)| k == "likes").unwrap();
        assert_eq!(likes.1.len(), 2);
        let age = doc.fields.iter().find(|(k, _)| k == "age").unwrap();
        assert_eq!(age.1, vec![Value::Integer(30)]);
    }

    #[test]
    fn parses_typed_suffixes_and_links() {
        let docs = parse_insert_document(
            r#"{"big":"9000000000L","ratio":"3.14D","friend":"@42@"}"#,
            None,
        )
        .unwrap();
        let doc = &docs[0];
        assert_eq!(
            doc.fields.iter().find(|(k, _)| k == "big").unwrap().1,
            vec![Value::Long(9_000_000_000)]
        );
        assert_eq!(
            doc.fields.iter().find(|(k, _)| k == "ratio").unwrap().1,
            vec![Value::Double(3.14)]
        );
        assert_eq!(
            doc.fields.iter().find(|(k, _)| k == "friend").unwrap().1,
            vec![Value::Link(42)]
        );
    }

    #[test]
    fn explicit_id_is_extracted() {
        let docs = parse_insert_document(r#"{"$id$":17,"name":"A"}"#, None).unwrap();
        assert_eq!(docs[0].id, Some(17));
    }

    #[test]
    fn resolvable_link_requires_resolver() {
        let err = parse_insert_document(r#"{"mgr":"@name = \"bob\"@"}"#, None).unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn resolvable_link_uses_resolver() {
        let resolver: &LinkResolver = &|text: &str| {
            assert!(text.contains("bob"));
            Ok(vec![7])
        };
        let docs =
            parse_insert_document(r#"{"mgr":"@name = \"bob\"@"}"#, Some(resolver)).unwrap();
        assert_eq!(
            docs[0].fields.iter().find(|(k, _)| k == "mgr").unwrap().1,
            vec![Value::Link(7)]
        );
    }

    #[test]
    fn array_of_objects_yields_multiple_records() {
        let docs = parse_insert_document(r#"[{"a":1},{"a":2}]"#, None).unwrap();
        assert_eq!(docs.len(), 2);
    }

    #[test]
    fn round_trip_through_json_is_lossless_for_common_types() {
        let mut fields = BTreeMap::new();
        fields.insert(
            "name".to_string(),
            vec![Value::String("A".into())],
        );
        fields.insert(
            "likes".to_string(),
            vec![Value::String("x".into()), Value::String("y".into())],
        );
        let json = record_to_json(17, &fields);
        let text = json.to_string();
        let parsed = parse_insert_document(&text, None).unwrap();
        assert_eq!(parsed[0].id, Some(17));
        let likes = parsed[0]
            .fields
            .iter()
            .find(|(k, _)| k == "likes")
            .unwrap();
        assert_eq!(likes.1.len(), 2);
    }
}
