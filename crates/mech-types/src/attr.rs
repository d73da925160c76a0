//! Attribute value type (spec §3 "Attribute") — a scalar or simple
//! (rank <= MAX_RANK) named value attached to a dataset or the board.

use serde::{Deserialize, Serialize};

use crate::schema::{CONFIG_LEN, MAX_RANK};

/// A scalar or array attribute value. String attributes are fixed-length
/// `CONFIG_LEN` on the wire (spec §4.3 `CommitAttribute`); in memory they
/// are ordinary owned `String`s, truncated/padded only at the archive
/// boundary (`mech-archive`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    Int(i64),
    Double(f64),
    Text(String),
    IntArray(Vec<i64>),
    DoubleArray(Vec<f64>),
}

impl AttrValue {
    pub fn rank(&self) -> usize {
        match self {
            AttrValue::Int(_) | AttrValue::Double(_) | AttrValue::Text(_) => 0,
            AttrValue::IntArray(v) | AttrValue::DoubleArray(_) => {
                let _ = v;
                1
            }
        }
    }
}

/// A named attribute attached to a dataset or the board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub value: AttrValue,
}

impl Attribute {
    pub fn check(&self) -> Result<(), crate::error::MechError> {
        if self.rank_len() > MAX_RANK {
            return Err(crate::error::MechError::Layout(format!(
                "attribute '{}': rank exceeds MAX_RANK {}",
                self.name, MAX_RANK
            )));
        }
        Ok(())
    }

    fn rank_len(&self) -> usize {
        match &self.value {
            AttrValue::IntArray(v) => v.len(),
            AttrValue::DoubleArray(v) => v.len(),
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_array_attribute_is_rejected() {
        let attr = Attribute {
            name: "huge".into(),
            value: AttrValue::IntArray(vec![0; MAX_RANK + 1]),
        };
        assert!(attr.check().is_err());
    }
}
