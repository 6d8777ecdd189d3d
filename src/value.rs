//! Type-aware ordering for key values.
//!
//! Bookmarks and pagination bounds carry key values as plain JSON so the
//! persisted state blob stays self-describing across runs. Ordering must
//! follow the native ordering of the column type: numeric magnitude for
//! numbers, lexical order for strings and for date-times in their sortable
//! renderings (RFC 3339 and `YYYY-MM-DD HH:MM:SS`), and byte order for
//! row-version counters carried as fixed-width lowercase hex.

use crate::catalog::DataType;
use serde_json::Value;
use std::cmp::Ordering;

/// Compare two key values under the ordering of their declared type.
///
/// Null sorts before every non-null value, mirroring how the source orders
/// nullable key columns ascending.
pub fn compare_typed(a: &Value, b: &Value, datatype: &DataType) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        _ => match datatype {
            DataType::Integer => match (a.as_i64(), b.as_i64()) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => compare_numeric(a, b),
            },
            DataType::Float | DataType::Decimal { .. } => compare_numeric(a, b),
            DataType::Boolean => a.as_bool().cmp(&b.as_bool()),
            _ => text_of(a).cmp(&text_of(b)),
        },
    }
}

/// Compare two ordered key tuples column by column.
pub fn compare_key_tuple(a: &[Value], b: &[Value], types: &[DataType]) -> Ordering {
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        let datatype = types.get(i).unwrap_or(&DataType::String);
        match compare_typed(x, y, datatype) {
            Ordering::Equal => continue,
            unequal => return unequal,
        }
    }
    a.len().cmp(&b.len())
}

fn compare_numeric(a: &Value, b: &Value) -> Ordering {
    match (numeric_of(a), numeric_of(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => text_of(a).cmp(&text_of(b)),
    }
}

fn numeric_of(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        // Decimals from sources that render them as strings.
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn text_of(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn integers_compare_by_magnitude() {
        assert_eq!(
            compare_typed(&json!(9), &json!(10), &DataType::Integer),
            Ordering::Less
        );
        assert_eq!(
            compare_typed(&json!(10), &json!(10), &DataType::Integer),
            Ordering::Equal
        );
    }

    #[test]
    fn decimals_rendered_as_strings_compare_numerically() {
        let ty = DataType::Decimal {
            precision: Some(10),
            scale: Some(2),
        };
        assert_eq!(
            compare_typed(&json!("99.50"), &json!("100.00"), &ty),
            Ordering::Less
        );
    }

    #[test]
    fn datetimes_compare_lexically_which_is_temporal() {
        assert_eq!(
            compare_typed(
                &json!("2024-01-15T14:30:00Z"),
                &json!("2024-02-01T00:00:00Z"),
                &DataType::DateTime
            ),
            Ordering::Less
        );
    }

    #[test]
    fn row_versions_compare_as_hex_strings() {
        assert_eq!(
            compare_typed(
                &json!("00000000000007d1"),
                &json!("00000000000007d2"),
                &DataType::RowVersion
            ),
            Ordering::Less
        );
    }

    #[test]
    fn null_sorts_first() {
        assert_eq!(
            compare_typed(&Value::Null, &json!(0), &DataType::Integer),
            Ordering::Less
        );
    }

    #[test]
    fn tuples_compare_column_by_column() {
        let types = vec![DataType::Integer, DataType::String];
        let a = vec![json!(1), json!("b")];
        let b = vec![json!(1), json!("c")];
        let c = vec![json!(2), json!("a")];
        assert_eq!(compare_key_tuple(&a, &b, &types), Ordering::Less);
        assert_eq!(compare_key_tuple(&b, &c, &types), Ordering::Less);
        assert_eq!(compare_key_tuple(&a, &a, &types), Ordering::Equal);
    }
}
