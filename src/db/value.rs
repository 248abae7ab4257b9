use std::collections::HashMap;

/// A single column value scanned out of a gateway-database row.
///
/// MySQL returns aggregate results (SUM, AVG, DECIMAL columns) as
/// strings or decimals depending on driver settings; the accessors
/// coerce those into canonical numeric form so callers never branch
/// on dialect.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Null,
}

pub type Row = HashMap<String, SqlValue>;

impl SqlValue {
    /// Coerce to i64. Null and unparseable values become 0.
    pub fn as_i64(&self) -> i64 {
        match self {
            SqlValue::Int(v) => *v,
            SqlValue::Float(v) => *v as i64,
            SqlValue::Text(s) => s.trim().parse::<i64>().ok().or_else(|| {
                s.trim().parse::<f64>().ok().map(|f| f as i64)
            }).unwrap_or(0),
            SqlValue::Bytes(b) => std::str::from_utf8(b)
                .ok()
                .and_then(|s| s.trim().parse::<f64>().ok())
                .map(|f| f as i64)
                .unwrap_or(0),
            SqlValue::Null => 0,
        }
    }

    /// Coerce to f64. Null and unparseable values become 0.0.
    pub fn as_f64(&self) -> f64 {
        match self {
            SqlValue::Int(v) => *v as f64,
            SqlValue::Float(v) => *v,
            SqlValue::Text(s) => s.trim().parse::<f64>().unwrap_or(0.0),
            SqlValue::Bytes(b) => std::str::from_utf8(b)
                .ok()
                .and_then(|s| s.trim().parse::<f64>().ok())
                .unwrap_or(0.0),
            SqlValue::Null => 0.0,
        }
    }

    /// Borrowing string view; numbers render through `to_string_lossy`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            SqlValue::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Owned string form for display paths.
    pub fn to_string_lossy(&self) -> String {
        match self {
            SqlValue::Int(v) => v.to_string(),
            SqlValue::Float(v) => v.to_string(),
            SqlValue::Text(s) => s.clone(),
            SqlValue::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            SqlValue::Null => String::new(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            SqlValue::Int(v) => serde_json::Value::from(*v),
            SqlValue::Float(v) => serde_json::Value::from(*v),
            SqlValue::Text(s) => serde_json::Value::from(s.clone()),
            SqlValue::Bytes(b) => serde_json::Value::from(String::from_utf8_lossy(b).into_owned()),
            SqlValue::Null => serde_json::Value::Null,
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}
impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Int(i64::from(v))
    }
}
impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Float(v)
    }
}
impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}
impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

// -- Row accessors -------------------------------------------------------

pub fn row_i64(row: &Row, key: &str) -> i64 {
    row.get(key).map(SqlValue::as_i64).unwrap_or(0)
}

pub fn row_f64(row: &Row, key: &str) -> f64 {
    row.get(key).map(SqlValue::as_f64).unwrap_or(0.0)
}

pub fn row_string(row: &Row, key: &str) -> String {
    row.get(key).map(SqlValue::to_string_lossy).unwrap_or_default()
}

/// Build an `IN (…)` placeholder list.
///
/// Postgres placeholders are positional, so `start_idx` is the index of
/// the first parameter in the statement (1-based). MySQL ignores it.
pub fn build_placeholders(is_pg: bool, n: usize, start_idx: usize) -> String {
    let mut out = String::with_capacity(n * 4);
    for i in 0..n {
        if i > 0 {
            out.push(',');
        }
        if is_pg {
            out.push('$');
            out.push_str(&(start_idx + i).to_string());
        } else {
            out.push('?');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_coercions() {
        assert_eq!(SqlValue::Int(42).as_i64(), 42);
        assert_eq!(SqlValue::Float(42.9).as_i64(), 42);
        assert_eq!(SqlValue::Text("42".into()).as_i64(), 42);
        assert_eq!(SqlValue::Text(" 42.5 ".into()).as_i64(), 42);
        assert_eq!(SqlValue::Bytes(b"1234".to_vec()).as_i64(), 1234);
        assert_eq!(SqlValue::Null.as_i64(), 0);
        assert_eq!(SqlValue::Text("not a number".into()).as_i64(), 0);
    }

    #[test]
    fn float_coercions() {
        assert_eq!(SqlValue::Int(3).as_f64(), 3.0);
        assert_eq!(SqlValue::Float(0.5).as_f64(), 0.5);
        assert_eq!(SqlValue::Text("0.25".into()).as_f64(), 0.25);
        assert_eq!(SqlValue::Bytes(b"1.5".to_vec()).as_f64(), 1.5);
        assert_eq!(SqlValue::Null.as_f64(), 0.0);
    }

    #[test]
    fn string_views() {
        assert_eq!(SqlValue::Text("abc".into()).as_str(), Some("abc"));
        assert_eq!(SqlValue::Bytes(b"abc".to_vec()).as_str(), Some("abc"));
        assert_eq!(SqlValue::Int(1).as_str(), None);
        assert_eq!(SqlValue::Int(7).to_string_lossy(), "7");
        assert_eq!(SqlValue::Null.to_string_lossy(), "");
    }

    #[test]
    fn row_accessors_default_on_missing() {
        let mut row = Row::new();
        row.insert("a".into(), SqlValue::Int(5));
        assert_eq!(row_i64(&row, "a"), 5);
        assert_eq!(row_i64(&row, "missing"), 0);
        assert_eq!(row_f64(&row, "missing"), 0.0);
        assert_eq!(row_string(&row, "missing"), "");
    }

    #[test]
    fn placeholders_match_count_and_dialect() {
        assert_eq!(build_placeholders(false, 3, 1), "?,?,?");
        assert_eq!(build_placeholders(true, 3, 1), "$1,$2,$3");
        assert_eq!(build_placeholders(true, 2, 5), "$5,$6");
        assert_eq!(build_placeholders(true, 0, 1), "");
    }

    #[test]
    fn json_conversion() {
        assert_eq!(SqlValue::Int(1).to_json(), serde_json::json!(1));
        assert_eq!(SqlValue::Text("x".into()).to_json(), serde_json::json!("x"));
        assert!(SqlValue::Null.to_json().is_null());
    }
}
