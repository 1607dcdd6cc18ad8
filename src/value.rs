//! Values flowing through dataflow channels.
//!
//! Every channel message, script-context binding, and hashed input is a
//! [`DataValue`]. Paths are a first-class variant so file inputs survive the
//! trip from channel to stager without string round-trips.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Path(PathBuf),
    List(Vec<DataValue>),
}

impl DataValue {
    /// Text form substituted into script bodies. Lists join with a single
    /// space so `$reads` over staged files expands to a shell word list.
    pub fn render(&self) -> String {
        match self {
            DataValue::Null => String::new(),
            DataValue::Bool(b) => b.to_string(),
            DataValue::Int(i) => i.to_string(),
            DataValue::Float(f) => f.to_string(),
            DataValue::String(s) => s.clone(),
            DataValue::Path(p) => p.display().to_string(),
            DataValue::List(items) => items
                .iter()
                .map(DataValue::render)
                .collect::<Vec<_>>()
                .join(" "),
        }
    }

    /// Iteration view used by `each` fan-out: lists iterate element-wise,
    /// scalars iterate as a single-element list.
    pub fn iter_elements(&self) -> Vec<DataValue> {
        match self {
            DataValue::List(items) => items.clone(),
            other => vec![other.clone()],
        }
    }

    pub fn as_path(&self) -> Option<PathBuf> {
        match self {
            DataValue::Path(p) => Some(p.clone()),
            DataValue::String(s) => Some(PathBuf::from(s)),
            _ => None,
        }
    }
}

impl fmt::Display for DataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl From<bool> for DataValue {
    fn from(v: bool) -> Self {
        DataValue::Bool(v)
    }
}

impl From<i64> for DataValue {
    fn from(v: i64) -> Self {
        DataValue::Int(v)
    }
}

impl From<f64> for DataValue {
    fn from(v: f64) -> Self {
        DataValue::Float(v)
    }
}

impl From<&str> for DataValue {
    fn from(v: &str) -> Self {
        DataValue::String(v.to_string())
    }
}

impl From<String> for DataValue {
    fn from(v: String) -> Self {
        DataValue::String(v)
    }
}

impl From<PathBuf> for DataValue {
    fn from(v: PathBuf) -> Self {
        DataValue::Path(v)
    }
}

impl From<Vec<DataValue>> for DataValue {
    fn from(v: Vec<DataValue>) -> Self {
        DataValue::List(v)
    }
}

#[cfg(test)]
mod tests {
    use super::DataValue;
    use std::path::PathBuf;

    #[test]
    fn list_renders_space_joined() {
        let v = DataValue::List(vec![
            DataValue::Path(PathBuf::from("/tmp/a.txt")),
            DataValue::Path(PathBuf::from("/tmp/b.txt")),
        ]);
        assert_eq!(v.render(), "/tmp/a.txt /tmp/b.txt");
    }

    #[test]
    fn scalars_iterate_as_singletons() {
        assert_eq!(DataValue::Int(3).iter_elements(), vec![DataValue::Int(3)]);
        let list = DataValue::List(vec![DataValue::Int(1), DataValue::Int(2)]);
        assert_eq!(list.iter_elements().len(), 2);
    }
}
