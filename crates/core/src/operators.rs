//! Evaluate a `find` operator against a `browse`-shaped value index
//! (spec §4.4). Shared by every `Store` implementation so operator
//! semantics never drift between the Buffer's scan path and the
//! Database's indexed path.

use crate::error::{Error, Result};
use crate::value::{Operator, RecordId, Value};
use std::collections::{BTreeMap, HashSet};

/// Evaluate `operator` against `values`, scanning a `value -> records`
/// map (the shape `browse`/`browse_at` return).
pub fn evaluate(
    index: &BTreeMap<Value, HashSet<RecordId>>,
    operator: Operator,
    values: &[Value],
) -> Result<HashSet<RecordId>> {
    let expected = operator.expected_operand_count();
    if let Some(n) = expected {
        if values.len() != n {
            return Err(Error::InvalidArgument(format!(
                "{operator:?} expects {n} operand(s), got {}",
                values.len()
            )));
        }
    }

    let mut out = HashSet::new();
    match operator {
        Operator::Equals => {
            if let Some(records) = index.get(&values[0]) {
                out.extend(records.iter().copied());
            }
        }
        Operator::NotEquals => {
            for (v, records) in index {
                if v != &values[0] {
                    out.extend(records.iter().copied());
                }
            }
        }
        Operator::LessThan => {
            for (_, records) in index.range(..values[0].clone()) {
                out.extend(records.iter().copied());
            }
        }
        Operator::LessThanOrEquals => {
            for (v, records) in index {
                if v <= &values[0] {
                    out.extend(records.iter().copied());
                }
            }
        }
        Operator::GreaterThan => {
            for (v, records) in index {
                if v > &values[0] {
                    out.extend(records.iter().copied());
                }
            }
        }
        Operator::GreaterThanOrEquals => {
            for (v, records) in index.range(values[0].clone()..) {
                out.extend(records.iter().copied());
            }
        }
        Operator::Between => {
            let (lo, hi) = (&values[0], &values[1]);
            for (v, records) in index.range(lo.clone()..hi.clone()) {
                out.extend(records.iter().copied());
            }
        }
        Operator::Regex | Operator::NotRegex => {
            let pattern = values[0]
                .as_str()
                .ok_or_else(|| Error::InvalidArgument("regex operand must be a string".into()))?;
            let re = regex::Regex::new(pattern)
                .map_err(|e| Error::Parse(format!("invalid regex: {e}")))?;
            for (v, records) in index {
                let text = v.to_string();
                let is_match = re.is_match(&text);
                if is_match == matches!(operator, Operator::Regex) {
                    out.extend(records.iter().copied());
                }
            }
        }
        Operator::LinksTo => {
            let target = values[0]
                .as_link()
                .ok_or_else(|| Error::InvalidArgument("LinksTo operand must be a Link".into()))?;
            if let Some(records) = index.get(&Value::Link(target)) {
                out.extend(records.iter().copied());
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idx() -> BTreeMap<Value, HashSet<RecordId>> {
        let mut m = BTreeMap::new();
        m.insert(Value::Integer(10), HashSet::from([1]));
        m.insert(Value::Integer(20), HashSet::from([2]));
        m.insert(Value::Integer(30), HashSet::from([3]));
        m
    }

    #[test]
    fn equals_matches_exact() {
        let result = evaluate(&idx(), Operator::Equals, &[Value::Integer(20)]).unwrap();
        assert_eq!(result, HashSet::from([2]));
    }

    #[test]
    fn between_is_half_open() {
        let result = evaluate(
            &idx(),
            Operator::Between,
            &[Value::Integer(10), Value::Integer(30)],
        )
        .unwrap();
        assert_eq!(result, HashSet::from([1, 2]));
    }

    #[test]
    fn greater_than_excludes_equal() {
        let result = evaluate(&idx(), Operator::GreaterThan, &[Value::Integer(20)]).unwrap();
        assert_eq!(result, HashSet::from([3]));
    }

    #[test]
    fn wrong_operand_count_is_invalid_argument() {
        let err = evaluate(&idx(), Operator::Equals, &[]).unwrap_err();
        assert!(err.is_validation_error());
    }
}
