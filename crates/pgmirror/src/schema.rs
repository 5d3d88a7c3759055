//! Static table descriptors
//!
//! A `TableDescriptor` declares the mirrored columns of one table once, with
//! their types. Everything that used to be derived by enumerating item
//! properties at runtime comes from here instead:
//! - SQL literal formatting for INSERT/UPDATE statements
//! - parsing result and notification rows into `MirroredItem`s
//! - JSON encoding of items

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RowParseError;
use pgmirror_api::{normalize_id, MirroredItem, Row, Value, IDENTITY_FIELD};

/// Column type, which decides both coercion and literal formatting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Bytes,
    Integer,
    Float,
    Boolean,
    Uuid,
    DateTime,
}

/// Quote a string as an SQL literal, doubling embedded quotes
pub fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn unquote(literal: &str) -> Option<String> {
    let inner = literal.strip_prefix('\'')?.strip_suffix('\'')?;
    Some(inner.replace("''", "'"))
}

impl FieldType {
    pub fn name(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Bytes => "bytes",
            FieldType::Integer => "integer",
            FieldType::Float => "float",
            FieldType::Boolean => "boolean",
            FieldType::Uuid => "uuid",
            FieldType::DateTime => "datetime",
        }
    }

    /// Convert a value from any channel (text rows, JSON payloads, typed
    /// client values) into this type's `Value` variant. NULL stays NULL.
    pub fn coerce(&self, field: &str, value: Value) -> Result<Value, RowParseError> {
        let invalid = |found: &Value| RowParseError::InvalidValue {
            field: field.to_string(),
            expected: self.name(),
            found: format!("{:?}", found),
        };

        match (self, value) {
            (_, Value::Null) => Ok(Value::Null),

            (FieldType::String, Value::Bytes(b)) => Err(invalid(&Value::Bytes(b))),
            (FieldType::String, v) => match v.to_text() {
                Some(s) => Ok(Value::String(s)),
                None => Err(invalid(&v)),
            },

            (FieldType::Bytes, Value::Bytes(b)) => Ok(Value::Bytes(b)),
            (FieldType::Bytes, Value::String(s)) => match s.strip_prefix("\\x") {
                Some(hex_digits) => hex::decode(hex_digits)
                    .map(Value::Bytes)
                    .map_err(|_| invalid(&Value::String(s.clone()))),
                None => Ok(Value::Bytes(s.into_bytes())),
            },

            (FieldType::Integer, Value::Integer(i)) => Ok(Value::Integer(i)),
            (FieldType::Integer, Value::Float(f))
                if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 =>
            {
                Ok(Value::Integer(f as i64))
            }
            (FieldType::Integer, Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map(Value::Integer)
                .map_err(|_| invalid(&Value::String(s.clone()))),

            (FieldType::Float, Value::Float(f)) => Ok(Value::Float(f)),
            (FieldType::Float, Value::Integer(i)) => Ok(Value::Float(i as f64)),
            (FieldType::Float, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| invalid(&Value::String(s.clone()))),

            (FieldType::Boolean, Value::Boolean(b)) => Ok(Value::Boolean(b)),
            (FieldType::Boolean, Value::Integer(i)) if i == 0 || i == 1 => {
                Ok(Value::Boolean(i == 1))
            }
            (FieldType::Boolean, Value::String(s)) => match s.trim() {
                "t" | "true" | "TRUE" | "1" => Ok(Value::Boolean(true)),
                "f" | "false" | "FALSE" | "0" => Ok(Value::Boolean(false)),
                _ => Err(invalid(&Value::String(s.clone()))),
            },

            (FieldType::Uuid, Value::Uuid(u)) => Ok(Value::Uuid(u)),
            (FieldType::Uuid, Value::String(s)) => Uuid::parse_str(&normalize_id(&s))
                .map(Value::Uuid)
                .map_err(|_| invalid(&Value::String(s.clone()))),

            (FieldType::DateTime, Value::DateTime(dt)) => Ok(Value::DateTime(dt)),
            (FieldType::DateTime, Value::String(s)) => {
                parse_datetime(&s).ok_or_else(|| invalid(&Value::String(s.clone())))
            }

            (_, other) => Err(invalid(&other)),
        }
    }

    /// Format a value of this type as an SQL literal.
    ///
    /// Strings and binary are single-quoted, numbers bare, booleans
    /// `true`/`false`, UUIDs quoted without braces.
    pub fn format_literal(&self, field: &str, value: &Value) -> Result<String, RowParseError> {
        let literal = match self.coerce(field, value.clone())? {
            Value::Null => "NULL".to_string(),
            Value::String(s) => quote(&s),
            Value::Bytes(b) => format!("'\\x{}'", hex::encode(b)),
            Value::Integer(i) => i.to_string(),
            Value::Float(f) if f.is_nan() => "'NaN'".to_string(),
            Value::Float(f) if f.is_infinite() && f > 0.0 => "'Infinity'".to_string(),
            Value::Float(f) if f.is_infinite() => "'-Infinity'".to_string(),
            Value::Float(f) => f.to_string(),
            Value::Boolean(true) => "true".to_string(),
            Value::Boolean(false) => "false".to_string(),
            Value::Uuid(u) => quote(&u.hyphenated().to_string()),
            Value::DateTime(dt) => quote(&dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        };
        Ok(literal)
    }

    /// Inverse of [`FieldType::format_literal`]
    pub fn parse_literal(&self, field: &str, literal: &str) -> Result<Value, RowParseError> {
        let literal = literal.trim();
        if literal == "NULL" {
            return Ok(Value::Null);
        }
        let text = unquote(literal).unwrap_or_else(|| literal.to_string());
        self.coerce(field, Value::String(text))
    }
}

fn parse_datetime(s: &str) -> Option<Value> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(Value::DateTime(dt.with_timezone(&Utc)));
    }
    // PostgreSQL text output, e.g. "2024-03-01 10:15:00.5+01"
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(Value::DateTime(dt.with_timezone(&Utc)));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| Value::DateTime(naive.and_utc()))
}

/// One mirrored column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Declared shape of one mirrored table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescriptor {
    schema: String,
    table: String,
    identity_field: String,
    fields: Vec<FieldDescriptor>,
}

impl TableDescriptor {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            identity_field: IDENTITY_FIELD.to_string(),
            fields: Vec::new(),
        }
    }

    pub fn with_identity_field(mut self, name: impl Into<String>) -> Self {
        self.identity_field = name.into();
        self
    }

    pub fn field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push(FieldDescriptor::new(name, field_type));
        self
    }

    pub fn required_field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields
            .push(FieldDescriptor::new(name, field_type).required());
        self
    }

    pub fn with_fields(mut self, fields: impl IntoIterator<Item = FieldDescriptor>) -> Self {
        self.fields.extend(fields);
        self
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn identity_field(&self) -> &str {
        &self.identity_field
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// `schema.table`
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    /// Literal used to filter by row identity
    pub fn identity_literal(&self, id: &str) -> String {
        quote(&normalize_id(id))
    }

    /// Mirrored columns of an item as `(name, literal)`, in declaration order.
    /// The identity column is not included.
    pub fn item_to_columns(
        &self,
        item: &MirroredItem,
    ) -> Result<Vec<(String, String)>, RowParseError> {
        self.fields
            .iter()
            .map(|field| {
                let value = item.get(&field.name).unwrap_or(&Value::Null);
                let literal = field.field_type.format_literal(&field.name, value)?;
                Ok((field.name.clone(), literal))
            })
            .collect()
    }

    /// Build an item from a result or notification row.
    ///
    /// Columns the descriptor does not declare are ignored; declared optional
    /// columns that are absent become NULL.
    pub fn row_to_item(&self, row: &Row) -> Result<MirroredItem, RowParseError> {
        let id = row
            .get(&self.identity_field)
            .and_then(Value::to_text)
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| RowParseError::MissingIdentity(self.identity_field.clone()))?;

        let mut item = MirroredItem::with_id(id);
        for field in &self.fields {
            let value = match row.get(&field.name) {
                Some(raw) => field.field_type.coerce(&field.name, raw.clone())?,
                None => Value::Null,
            };
            if field.required && value.is_null() {
                return Err(RowParseError::MissingField(field.name.clone()));
            }
            item.set(field.name.clone(), value);
        }
        Ok(item)
    }

    /// Row id carried by a row, if any
    pub fn row_id(&self, row: &Row) -> Option<String> {
        row.get(&self.identity_field)
            .and_then(Value::to_text)
            .map(|id| normalize_id(&id))
    }

    pub fn item_to_json(&self, item: &MirroredItem) -> serde_json::Value {
        let mut row = Row::with_capacity(self.fields.len() + 1);
        for field in &self.fields {
            row.set(
                field.name.clone(),
                item.get(&field.name).cloned().unwrap_or(Value::Null),
            );
        }
        row.set(self.identity_field.clone(), item.id());
        row.to_json()
    }

    pub fn item_from_json(&self, json: &serde_json::Value) -> Result<MirroredItem, RowParseError> {
        let obj = json.as_object().ok_or(RowParseError::NotAnObject)?;
        self.row_to_item(&Row::from_json_object(obj))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn users() -> TableDescriptor {
        TableDescriptor::new("public", "users")
            .required_field("login", FieldType::String)
            .field("age", FieldType::Integer)
            .field("score", FieldType::Float)
            .field("active", FieldType::Boolean)
            .field("team", FieldType::Uuid)
            .field("avatar", FieldType::Bytes)
            .field("seen_at", FieldType::DateTime)
    }

    fn literal(field_type: FieldType, value: Value) -> String {
        field_type.format_literal("f", &value).unwrap()
    }

    #[test]
    fn test_string_literals_are_quoted_and_escaped() {
        assert_eq!(literal(FieldType::String, "O'Reilly".into()), "'O''Reilly'");
        assert_eq!(literal(FieldType::String, "".into()), "''");
    }

    #[test]
    fn test_numeric_and_boolean_literals_are_bare() {
        assert_eq!(literal(FieldType::Integer, Value::Integer(-12)), "-12");
        assert_eq!(literal(FieldType::Float, Value::Float(2.5)), "2.5");
        assert_eq!(literal(FieldType::Boolean, Value::Boolean(true)), "true");
        assert_eq!(literal(FieldType::Boolean, Value::Boolean(false)), "false");
        assert_eq!(literal(FieldType::Integer, Value::Null), "NULL");
    }

    #[test]
    fn test_uuid_literal_drops_braces() {
        let lit = literal(
            FieldType::Uuid,
            Value::String("{67e55044-10b1-426f-9247-bb680e5fe0c8}".into()),
        );
        assert_eq!(lit, "'67e55044-10b1-426f-9247-bb680e5fe0c8'");
    }

    #[test]
    fn test_bytes_literal_is_hex_bytea() {
        assert_eq!(literal(FieldType::Bytes, Value::Bytes(vec![0xde, 0xad])), "'\\xdead'");
    }

    #[test]
    fn test_coerce_postgres_text_output() {
        let b = FieldType::Boolean.coerce("f", Value::String("t".into())).unwrap();
        assert_eq!(b, Value::Boolean(true));

        let dt = FieldType::DateTime
            .coerce("f", Value::String("2024-03-01 10:15:00+01".into()))
            .unwrap();
        assert_eq!(
            dt.as_datetime().unwrap().to_rfc3339(),
            "2024-03-01T09:15:00+00:00"
        );

        let err = FieldType::Integer
            .coerce("age", Value::String("forty".into()))
            .unwrap_err();
        assert!(matches!(err, RowParseError::InvalidValue { .. }));
    }

    #[test]
    fn test_row_to_item_requires_identity() {
        let row = Row::new().with("login", "ann");
        assert_eq!(
            users().row_to_item(&row).unwrap_err(),
            RowParseError::MissingIdentity("_uuid".to_string())
        );
    }

    #[test]
    fn test_row_to_item_rejects_missing_required_field() {
        let row = Row::new().with("_uuid", "1").with("age", "3");
        assert_eq!(
            users().row_to_item(&row).unwrap_err(),
            RowParseError::MissingField("login".to_string())
        );
    }

    #[test]
    fn test_row_to_item_fills_optional_fields_with_null() {
        let row = Row::new()
            .with("_uuid", "{1}")
            .with("login", "ann")
            .with("age", "33")
            .with("unrelated", "ignored");
        let item = users().row_to_item(&row).unwrap();

        assert_eq!(item.id(), "1");
        assert_eq!(item.get("age"), Some(&Value::Integer(33)));
        assert_eq!(item.get("score"), Some(&Value::Null));
        assert_eq!(item.get("unrelated"), None);
    }

    #[test]
    fn test_item_json_round_trip() {
        let desc = users();
        let item = MirroredItem::with_id("abc")
            .with("login", "ann")
            .with("age", 30i64)
            .with("active", true);

        let json = desc.item_to_json(&item);
        assert_eq!(json["_uuid"], "abc");
        assert_eq!(json["age"], 30);

        let back = desc.item_from_json(&json).unwrap();
        assert_eq!(back.get("login"), Some(&Value::String("ann".into())));
        assert_eq!(back.get("active"), Some(&Value::Boolean(true)));
        assert_eq!(back.id(), "abc");
    }

    fn arb_item() -> impl Strategy<Value = MirroredItem> {
        (
            "[a-z0-9-]{1,12}",
            "\\PC*",
            proptest::option::of(any::<i64>()),
            -1.0e12..1.0e12f64,
            any::<bool>(),
            any::<u128>(),
            proptest::collection::vec(any::<u8>(), 0..16),
            0i64..4_000_000_000,
        )
            .prop_map(|(id, login, age, score, active, team, avatar, secs)| {
                MirroredItem::with_id(id)
                    .with("login", login)
                    .with("age", age)
                    .with("score", score)
                    .with("active", active)
                    .with("team", Uuid::from_u128(team))
                    .with("avatar", avatar)
                    .with(
                        "seen_at",
                        DateTime::<Utc>::from_timestamp(secs, 0).unwrap_or_default(),
                    )
            })
    }

    proptest! {
        #[test]
        fn prop_columns_round_trip_through_literals(item in arb_item()) {
            let desc = users();
            let columns = desc.item_to_columns(&item).unwrap();

            let mut row = Row::new().with("_uuid", item.id());
            for (field, (name, lit)) in desc.fields().iter().zip(columns) {
                prop_assert_eq!(&field.name, &name);
                row.set(name.clone(), field.field_type.parse_literal(&name, &lit).unwrap());
            }

            let parsed = desc.row_to_item(&row).unwrap();
            prop_assert_eq!(parsed, item);
        }

        #[test]
        fn prop_string_escaping_prevents_injection(s in "\\PC*") {
            let lit = literal(FieldType::String, Value::String(s.clone()));
            prop_assert!(lit.starts_with('\''));
            prop_assert!(lit.ends_with('\''));
            let quote_count_input = s.matches('\'').count();
            let quote_count_output = lit[1..lit.len() - 1].matches("''").count();
            prop_assert_eq!(quote_count_input, quote_count_output);
        }
    }
}
