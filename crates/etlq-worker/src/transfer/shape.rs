//! Value shaping applied to every mapped column before it is loaded

use super::row::FieldValue;

/// Textual form date/time values are written in
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A value ready to be bound as a statement parameter
#[derive(Debug, Clone, PartialEq)]
pub enum ShapedValue {
    /// Written as a literal SQL NULL
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ShapedValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ShapedValue::Null)
    }
}

/// Shape one value for loading
///
/// Date/times become `YYYY-MM-DD HH:MM:SS` text, arrays and objects become
/// JSON text, nulls stay NULL and everything else passes through.
pub fn shape_value(value: &FieldValue) -> ShapedValue {
    match value {
        FieldValue::Null => ShapedValue::Null,
        FieldValue::Bool(v) => ShapedValue::Bool(*v),
        FieldValue::Int(v) => ShapedValue::Int(*v),
        FieldValue::Float(v) => ShapedValue::Float(*v),
        FieldValue::Text(v) => ShapedValue::Text(v.clone()),
        FieldValue::DateTime(v) => ShapedValue::Text(v.format(DATETIME_FORMAT).to_string()),
        FieldValue::Json(json) => shape_json(json),
    }
}

fn shape_json(json: &serde_json::Value) -> ShapedValue {
    use serde_json::Value;

    match json {
        Value::Null => ShapedValue::Null,
        Value::Bool(v) => ShapedValue::Bool(*v),
        Value::Number(n) => match n.as_i64() {
            Some(i) => ShapedValue::Int(i),
            None => n
                .as_f64()
                .map(ShapedValue::Float)
                .unwrap_or_else(|| ShapedValue::Text(n.to_string())),
        },
        Value::String(s) => ShapedValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => ShapedValue::Text(json.to_string()),
    }
}

/// Shape a missing column the same way as an explicit null
pub fn shape_optional(value: Option<&FieldValue>) -> ShapedValue {
    value.map(shape_value).unwrap_or(ShapedValue::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    #[test]
    fn test_datetime_is_normalized() {
        let dt = NaiveDate::from_ymd_opt(2023, 7, 4)
            .and_then(|d| d.and_hms_milli_opt(9, 5, 3, 250));
        let shaped = shape_value(&FieldValue::from(dt));
        assert_eq!(shaped, ShapedValue::Text("2023-07-04 09:05:03".into()));
    }

    #[test]
    fn test_composites_become_json_text() {
        let shaped = shape_value(&FieldValue::Json(json!(["a", 1])));
        assert_eq!(shaped, ShapedValue::Text(r#"["a",1]"#.into()));

        let shaped = shape_value(&FieldValue::Json(json!({"k": true})));
        assert_eq!(shaped, ShapedValue::Text(r#"{"k":true}"#.into()));
    }

    #[test]
    fn test_json_scalars_pass_through() {
        assert_eq!(shape_value(&FieldValue::Json(json!(3))), ShapedValue::Int(3));
        assert_eq!(shape_value(&FieldValue::Json(json!(1.5))), ShapedValue::Float(1.5));
        assert_eq!(
            shape_value(&FieldValue::Json(json!("x"))),
            ShapedValue::Text("x".into())
        );
    }

    #[test]
    fn test_nulls_and_missing_columns() {
        assert!(shape_value(&FieldValue::Null).is_null());
        assert!(shape_value(&FieldValue::Json(serde_json::Value::Null)).is_null());
        assert!(shape_optional(None).is_null());
        assert_eq!(
            shape_optional(Some(&FieldValue::Text("kept".into()))),
            ShapedValue::Text("kept".into())
        );
    }
}
