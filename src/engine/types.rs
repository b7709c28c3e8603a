//! Universal data types for the execution collaborator
//!
//! Result values, bound parameters and the two possible execution outcomes.

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

/// Universal value representation for result cells
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(#[serde(with = "base64_bytes")] Vec<u8>),
    Json(serde_json::Value),
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// A scalar bound to a `?` placeholder.
///
/// Only scalars are accepted; arrays and objects fail deserialization so a
/// caller cannot smuggle a structure the driver would have to stringify.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<i64> for QueryParam {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for QueryParam {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<bool> for QueryParam {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for QueryParam {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

/// A single result row, columns kept in select-list order.
///
/// Serializes as a JSON object keyed by column name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<(String, Value)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_column(mut self, name: impl Into<String>, value: Value) -> Self {
        self.push(name, value);
        self
    }

    pub fn push(&mut self, name: impl Into<String>, value: Value) {
        self.columns.push((name.into(), value));
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|(name, value)| (name.as_str(), value))
    }
}

impl Serialize for Row {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.columns.len()))?;
        for (name, value) in &self.columns {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Which outcome the caller expects from the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeShape {
    Rows,
    AffectedCount,
}

/// Raw outcome of a successful execution
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Rows(Vec<Row>),
    AffectedCount(u64),
}

impl ExecutionOutcome {
    pub fn shape(&self) -> OutcomeShape {
        match self {
            Self::Rows(_) => OutcomeShape::Rows,
            Self::AffectedCount(_) => OutcomeShape::AffectedCount,
        }
    }

    /// Rows returned or rows affected, for audit and metrics.
    pub fn row_count(&self) -> u64 {
        match self {
            Self::Rows(rows) => rows.len() as u64,
            Self::AffectedCount(count) => *count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_serializes_as_ordered_object() {
        let row = Row::new()
            .with_column("id", Value::Int(1))
            .with_column("name", Value::Text("test".into()))
            .with_column("avatar", Value::Bytes(vec![1, 2, 3]));

        let json = serde_json::to_string(&row).unwrap();
        assert_eq!(json, r#"{"id":1,"name":"test","avatar":"AQID"}"#);
    }

    #[test]
    fn params_reject_structured_values() {
        let ok: Vec<QueryParam> = serde_json::from_str(r#"[1, "a", null, true, 2.5]"#).unwrap();
        assert_eq!(
            ok,
            vec![
                QueryParam::Int(1),
                QueryParam::Text("a".into()),
                QueryParam::Null,
                QueryParam::Bool(true),
                QueryParam::Float(2.5),
            ]
        );

        assert!(serde_json::from_str::<Vec<QueryParam>>(r#"[[1, 2]]"#).is_err());
        assert!(serde_json::from_str::<Vec<QueryParam>>(r#"[{"a": 1}]"#).is_err());
    }

    #[test]
    fn outcome_row_count() {
        let rows = ExecutionOutcome::Rows(vec![Row::new(), Row::new()]);
        assert_eq!(rows.row_count(), 2);
        assert_eq!(rows.shape(), OutcomeShape::Rows);
        assert_eq!(ExecutionOutcome::AffectedCount(7).row_count(), 7);
    }
}
