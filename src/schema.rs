//! Schema declaration and field codec
//!
//! A schema maps field names to one of three types:
//!
//! | Type     | On disk                         | Modifiers |
//! |----------|---------------------------------|-----------|
//! | `binary` | raw bytes                       | `?` `*`   |
//! | `string` | UTF-8 text                      | `?` `*`   |
//! | `table`  | sorted, escaped `key\tvalue\n`  | `?`       |
//!
//! `?` marks a field optional; `*` declares by-reference passing,
//! expressed through the `Cow` payloads of [`FieldValue`]: a `*`
//! field takes borrowed data on add, a plain field takes owned data,
//! and a mismatch fails with
//! [`ByRefMismatch`](crate::error::SchemaError::ByRefMismatch). Reads
//! always materialize owned buffers. A schema must declare at least
//! one mandatory field.

use crate::error::{SchemaError, SchemaResult};
use crate::name::{FIELD_NAME_RE, LOCKED_DIR};
use std::borrow::Cow;
use std::collections::BTreeMap;

/// The three field types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Binary,
    String,
    Table,
}

impl FieldKind {
    fn label(self) -> &'static str {
        match self {
            FieldKind::Binary => "binary",
            FieldKind::String => "string",
            FieldKind::Table => "table",
        }
    }
}

/// One field declaration inside a schema
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub kind: FieldKind,
    pub optional: bool,
    pub by_ref: bool,
}

impl FieldSpec {
    fn parse(decl: &str) -> Result<Self, String> {
        let split = decl.find(['?', '*']).unwrap_or(decl.len());
        let (base, modifiers) = decl.split_at(split);
        let kind = match base {
            "binary" => FieldKind::Binary,
            "string" => FieldKind::String,
            "table" => FieldKind::Table,
            _ => return Err(format!("unknown field type '{decl}'")),
        };
        let mut optional = false;
        let mut by_ref = false;
        for c in modifiers.chars() {
            match c {
                '?' if !optional => optional = true,
                '*' if !by_ref => by_ref = true,
                _ => return Err(format!("bad modifiers in '{decl}'")),
            }
        }
        if by_ref && kind == FieldKind::Table {
            return Err("table fields cannot be passed by reference".into());
        }
        Ok(FieldSpec {
            kind,
            optional,
            by_ref,
        })
    }

    /// Encode a caller-supplied value for this field
    ///
    /// The value must match the declared type, and its ownership must
    /// match the `*` declaration: by-reference fields take borrowed
    /// data, plain fields take owned data.
    pub fn encode<'a>(&self, field: &str, value: &'a FieldValue<'a>) -> SchemaResult<Cow<'a, [u8]>> {
        let (bytes, supplied_by_ref) = match (self.kind, value) {
            (FieldKind::Binary, FieldValue::Binary(bytes)) => (
                Cow::Borrowed(bytes.as_ref()),
                matches!(bytes, Cow::Borrowed(_)),
            ),
            (FieldKind::String, FieldValue::String(text)) => (
                Cow::Borrowed(text.as_bytes()),
                matches!(text, Cow::Borrowed(_)),
            ),
            (FieldKind::Table, FieldValue::Table(entries)) => {
                return Ok(Cow::Owned(encode_table(entries)))
            }
            _ => {
                return Err(SchemaError::InvalidField {
                    field: field.to_string(),
                    expected: self.kind.label(),
                })
            }
        };
        if supplied_by_ref != self.by_ref {
            return Err(SchemaError::ByRefMismatch {
                field: field.to_string(),
                expected: if self.by_ref {
                    "by reference"
                } else {
                    "by value"
                },
            });
        }
        Ok(bytes)
    }

    /// Decode on-disk bytes for this field
    pub fn decode(&self, field: &str, bytes: Vec<u8>) -> SchemaResult<FieldValue<'static>> {
        match self.kind {
            FieldKind::Binary => Ok(FieldValue::Binary(Cow::Owned(bytes))),
            FieldKind::String => String::from_utf8(bytes)
                .map(|s| FieldValue::String(Cow::Owned(s)))
                .map_err(|_| SchemaError::InvalidEncoding {
                    field: field.to_string(),
                }),
            FieldKind::Table => {
                let text =
                    std::str::from_utf8(&bytes).map_err(|_| SchemaError::InvalidEncoding {
                        field: field.to_string(),
                    })?;
                decode_table(text).map(FieldValue::Table)
            }
        }
    }
}

/// A typed field value
///
/// Binary and string payloads are `Cow`; whether a field takes
/// borrowed or owned data on add is declared by the schema's `*`
/// modifier, and reads always return owned data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue<'a> {
    Binary(Cow<'a, [u8]>),
    String(Cow<'a, str>),
    Table(BTreeMap<String, String>),
}

impl<'a> FieldValue<'a> {
    pub fn binary(bytes: impl Into<Cow<'a, [u8]>>) -> Self {
        FieldValue::Binary(bytes.into())
    }

    pub fn string(text: impl Into<Cow<'a, str>>) -> Self {
        FieldValue::String(text.into())
    }

    pub fn table(entries: BTreeMap<String, String>) -> Self {
        FieldValue::Table(entries)
    }

    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Binary(_) => FieldKind::Binary,
            FieldValue::String(_) => FieldKind::String,
            FieldValue::Table(_) => FieldKind::Table,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            FieldValue::Binary(bytes) => Some(bytes.as_ref()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(text) => Some(text.as_ref()),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            FieldValue::Table(entries) => Some(entries),
            _ => None,
        }
    }
}

/// A map of field values keyed by field name
pub type FieldMap<'a> = BTreeMap<String, FieldValue<'a>>;

/// Per-queue declaration of the fields composing an element
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    fields: BTreeMap<String, FieldSpec>,
}

impl Schema {
    /// Parse a schema declaration from `(name, type)` pairs
    ///
    /// Type strings are `binary`, `string` or `table`, optionally
    /// suffixed with `?` and/or `*`.
    pub fn parse<I, K, V>(declaration: I) -> SchemaResult<Schema>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<str>,
    {
        let mut fields = BTreeMap::new();
        for (name, decl) in declaration {
            let name = name.into();
            if name == LOCKED_DIR || !FIELD_NAME_RE.is_match(&name) {
                return Err(SchemaError::BadSchema {
                    reason: format!("invalid field name '{name}'"),
                });
            }
            let spec = FieldSpec::parse(decl.as_ref()).map_err(|reason| SchemaError::BadSchema {
                reason: format!("field '{name}': {reason}"),
            })?;
            if fields.insert(name.clone(), spec).is_some() {
                return Err(SchemaError::BadSchema {
                    reason: format!("duplicate field '{name}'"),
                });
            }
        }
        if fields.values().all(|spec| spec.optional) {
            return Err(SchemaError::BadSchema {
                reason: "at least one mandatory field is required".into(),
            });
        }
        Ok(Schema { fields })
    }

    /// Look up one field declaration
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.get(name)
    }

    /// Iterate the field declarations in name order
    pub fn fields(&self) -> impl Iterator<Item = (&String, &FieldSpec)> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape(text: &str, line: &str) -> SchemaResult<String> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            _ => {
                return Err(SchemaError::MalformedTable {
                    line: line.to_string(),
                })
            }
        }
    }
    Ok(out)
}

/// Serialize a table: entries sorted by key, escaped, one per line
pub fn encode_table(entries: &BTreeMap<String, String>) -> Vec<u8> {
    let mut out = String::new();
    for (key, value) in entries {
        out.push_str(&escape(key));
        out.push('\t');
        out.push_str(&escape(value));
        out.push('\n');
    }
    out.into_bytes()
}

/// Parse a table; duplicate keys keep the last value
pub fn decode_table(text: &str) -> SchemaResult<BTreeMap<String, String>> {
    let mut entries = BTreeMap::new();
    for line in text.split_terminator('\n') {
        if line.matches('\t').count() != 1 {
            return Err(SchemaError::MalformedTable {
                line: line.to_string(),
            });
        }
        let (key, value) = line.split_once('\t').unwrap_or(("", ""));
        entries.insert(unescape(key, line)?, unescape(value, line)?);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_declarations() {
        let schema = Schema::parse([("body", "string"), ("header", "table?")]).unwrap();
        assert_eq!(schema.len(), 2);
        let body = schema.field("body").unwrap();
        assert_eq!(body.kind, FieldKind::String);
        assert!(!body.optional);
        let header = schema.field("header").unwrap();
        assert_eq!(header.kind, FieldKind::Table);
        assert!(header.optional);

        let blob = Schema::parse([("data", "binary*?")]).unwrap();
        let spec = blob.field("data").unwrap();
        assert!(spec.by_ref);
        assert!(spec.optional);
    }

    #[test]
    fn test_parse_rejections() {
        // no mandatory field
        assert!(Schema::parse([("a", "string?")]).is_err());
        // empty schema
        assert!(Schema::parse::<_, &str, &str>([]).is_err());
        // reserved name
        assert!(Schema::parse([("locked", "binary")]).is_err());
        // bad name
        assert!(Schema::parse([("a b", "binary")]).is_err());
        // unknown type
        assert!(Schema::parse([("a", "blob")]).is_err());
        // table by reference
        assert!(Schema::parse([("a", "table*")]).is_err());
        // doubled modifier
        assert!(Schema::parse([("a", "string??")]).is_err());
    }

    #[test]
    fn test_encode_kind_mismatch() {
        let schema = Schema::parse([("body", "string")]).unwrap();
        let spec = schema.field("body").unwrap();
        let err = spec
            .encode("body", &FieldValue::binary(b"x".as_slice()))
            .unwrap_err();
        assert!(matches!(err, SchemaError::InvalidField { .. }));
    }

    #[test]
    fn test_string_round_trip() {
        let spec = FieldSpec {
            kind: FieldKind::String,
            optional: false,
            by_ref: false,
        };
        let value = FieldValue::string("Théâtre Français".to_string());
        let bytes = spec.encode("s", &value).unwrap().into_owned();
        assert_eq!(&bytes[..4], &[0x54, 0x68, 0xC3, 0xA9]);
        let back = spec.decode("s", bytes).unwrap();
        assert_eq!(back.as_str(), Some("Théâtre Français"));

        let err = spec.decode("s", vec![0xff, 0xfe]).unwrap_err();
        assert!(matches!(err, SchemaError::InvalidEncoding { .. }));
    }

    #[test]
    fn test_by_ref_contract_enforced() {
        let schema = Schema::parse([("blob", "binary*"), ("text", "string")]).unwrap();

        // a by-reference field takes borrowed data only
        let blob = schema.field("blob").unwrap();
        assert!(blob
            .encode("blob", &FieldValue::binary(b"x".as_slice()))
            .is_ok());
        let err = blob
            .encode("blob", &FieldValue::binary(vec![1u8]))
            .unwrap_err();
        assert!(matches!(err, SchemaError::ByRefMismatch { .. }));

        // a plain field takes owned data only
        let text = schema.field("text").unwrap();
        assert!(text
            .encode("text", &FieldValue::string("x".to_string()))
            .is_ok());
        let err = text.encode("text", &FieldValue::string("x")).unwrap_err();
        assert!(matches!(err, SchemaError::ByRefMismatch { .. }));
    }

    #[test]
    fn test_table_encoding_sorted_and_escaped() {
        let entries = table(&[("b", "2"), ("a", "1")]);
        assert_eq!(encode_table(&entries), b"a\t1\nb\t2\n");

        let tricky = table(&[("k\te\\y", "v\nal")]);
        assert_eq!(encode_table(&tricky), b"k\\te\\\\y\tv\\nal\n");
        let text = String::from_utf8(encode_table(&tricky)).unwrap();
        assert_eq!(decode_table(&text).unwrap(), tricky);
    }

    #[test]
    fn test_table_decode_rejections() {
        // no tab
        assert!(decode_table("justakey\n").is_err());
        // two tabs
        assert!(decode_table("a\tb\tc\n").is_err());
        // blank line
        assert!(decode_table("a\t1\n\nb\t2\n").is_err());
        // dangling escape
        assert!(decode_table("a\tb\\\n").is_err());
        // unknown escape
        assert!(decode_table("a\t\\x\n").is_err());
    }

    #[test]
    fn test_table_decode_tolerances() {
        // duplicate key keeps the last value
        let entries = decode_table("a\t1\na\t2\n").unwrap();
        assert_eq!(entries.get("a").map(String::as_str), Some("2"));
        // missing trailing newline
        let entries = decode_table("a\t1").unwrap();
        assert_eq!(entries.len(), 1);
        // empty key and value are legal
        let entries = decode_table("\t\n").unwrap();
        assert_eq!(entries.get("").map(String::as_str), Some(""));
    }
}
