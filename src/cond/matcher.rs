//! In-memory evaluation of a [`Condition`] against a cached instance.
//!
//! Mirrors what the remote tier would answer for the same predicate, with
//! the short-circuit walk the condition chain defines: a satisfied term
//! wins unless an `&&` follows, a failed term loses unless an `||` follows.

use tracing::warn;

use crate::cond::{CondArg, CondNode, CondTerm, Comparison, Condition, Op};
use crate::model::{FieldValue, Model};

/// Evaluate `cond` against `model`'s field values.
///
/// `None` and empty conditions match everything.
pub fn matches(model: &dyn Model, cond: Option<&Condition>) -> bool {
    let Some(cond) = cond else {
        return true;
    };
    eval_nodes(model, cond, cond.nodes(), 0)
}

fn eval_nodes(model: &dyn Model, cond: &Condition, nodes: &[CondNode], depth: usize) -> bool {
    for (index, node) in nodes.iter().enumerate() {
        let raw = match &node.term {
            CondTerm::Group(nested) => eval_nodes(model, cond, nested, depth + 1),
            CondTerm::Comp(comparison) => eval_comp(model, cond, comparison, depth),
        };
        let satisfied = raw != node.not;
        let next_or = nodes.get(index + 1).map(|next| next.or);

        if satisfied {
            match next_or {
                // Last term, or the next one is an alternative: done.
                None | Some(true) => return true,
                Some(false) => {}
            }
        } else {
            match next_or {
                None | Some(false) => return false,
                Some(true) => {}
            }
        }
    }
    true
}

fn eval_comp(model: &dyn Model, cond: &Condition, comparison: &Comparison, depth: usize) -> bool {
    let value = model.field(&comparison.column);
    if matches!(value, FieldValue::Null) && comparison.op != Op::IsNull {
        return false;
    }

    match comparison.op {
        Op::IsNull => {
            let expected = match &comparison.operand {
                CondArg::Value(FieldValue::Bool(b)) => *b,
                _ => true,
            };
            value.is_null() == expected
        }
        Op::In => {
            let CondArg::List(list) = &comparison.operand else {
                warn!(column = %comparison.column, "`in` requires a list operand");
                return false;
            };
            if list.is_empty() {
                return false;
            }
            cond.memo_set(&comparison.column, depth, list).contains(&value)
        }
        Op::Eq | Op::Ne => {
            let CondArg::Value(operand) = &comparison.operand else {
                return false;
            };
            let equal = values_equal(&value, operand);
            (comparison.op == Op::Eq) == equal
        }
        Op::Gt | Op::Gte | Op::Lt | Op::Lte => {
            let CondArg::Value(operand) = &comparison.operand else {
                return false;
            };
            compare_numeric(&value, operand, comparison.op)
        }
        Op::Contains | Op::StartsWith | Op::EndsWith => {
            let (Some(value), CondArg::Value(FieldValue::Str(pattern))) =
                (value.as_str(), &comparison.operand)
            else {
                return false;
            };
            match comparison.op {
                Op::Contains => value.contains(pattern.as_str()),
                Op::StartsWith => value.starts_with(pattern.as_str()),
                _ => value.ends_with(pattern.as_str()),
            }
        }
    }
}

/// Equality with int/float width normalization.
fn values_equal(value: &FieldValue, operand: &FieldValue) -> bool {
    match (value, operand) {
        (FieldValue::Int(a), FieldValue::Int(b)) => a == b,
        (FieldValue::Str(a), FieldValue::Str(b)) => a == b,
        (FieldValue::Bool(a), FieldValue::Bool(b)) => a == b,
        _ => match (value.as_float(), operand.as_float()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
    }
}

/// Ordering comparisons are numeric-only; mixed widths widen to f64.
fn compare_numeric(value: &FieldValue, operand: &FieldValue, op: Op) -> bool {
    if let (Some(a), Some(b)) = (value.as_int(), operand.as_int()) {
        return apply_ordering(a.cmp(&b), op);
    }
    match (value.as_float(), operand.as_float()) {
        (Some(a), Some(b)) => a
            .partial_cmp(&b)
            .map(|ordering| apply_ordering(ordering, op))
            .unwrap_or(false),
        _ => false,
    }
}

fn apply_ordering(ordering: std::cmp::Ordering, op: Op) -> bool {
    use std::cmp::Ordering::*;
    match op {
        Op::Gt => ordering == Greater,
        Op::Gte => ordering != Less,
        Op::Lt => ordering == Less,
        Op::Lte => ordering != Greater,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cond::cond;
    use serde::Serialize;
    use std::any::Any;

    #[derive(Debug, Clone, Serialize, Default)]
    struct Player {
        id: i64,
        name: String,
        score: f64,
        online: bool,
        #[serde(skip)]
        valid: bool,
    }

    impl Model for Player {
        fn alias(&self) -> &'static str {
            "test"
        }
        fn table(&self) -> &'static str {
            "player"
        }
        fn columns(&self) -> &'static [&'static str] {
            &["id", "name", "score", "online"]
        }
        fn primary_key(&self) -> &'static str {
            "id"
        }
        fn field(&self, column: &str) -> FieldValue {
            match column {
                "id" => self.id.into(),
                "name" => self.name.clone().into(),
                "score" => self.score.into(),
                "online" => self.online.into(),
                _ => FieldValue::Null,
            }
        }
        fn valid(&self) -> bool {
            self.valid
        }
        fn set_valid(&mut self, valid: bool) {
            self.valid = valid;
        }
        fn clone_model(&self) -> Box<dyn Model> {
            Box::new(self.clone())
        }
        fn json(&self) -> String {
            serde_json::to_string(self).unwrap_or_default()
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn player() -> Player {
        Player {
            id: 7,
            name: "marco".into(),
            score: 41.5,
            online: true,
            valid: true,
        }
    }

    #[test]
    fn empty_condition_matches_everything() {
        assert!(matches(&player(), None));
        assert!(matches(&player(), Some(&Condition::new())));
    }

    #[test]
    fn ordering_and_equality() {
        let p = player();
        assert!(matches(&p, Some(&cond("id > {0}", [3.into()]))));
        assert!(matches(&p, Some(&cond("id >= {0}", [7.into()]))));
        assert!(!matches(&p, Some(&cond("id < {0}", [7.into()]))));
        assert!(matches(&p, Some(&cond("name == {0}", ["marco".into()]))));
        assert!(matches(&p, Some(&cond("name != {0}", ["polo".into()]))));
        assert!(matches(&p, Some(&cond("online == {0}", [true.into()]))));
    }

    #[test]
    fn mixed_width_numerics_normalize() {
        let p = player();
        assert!(matches(&p, Some(&cond("score > {0}", [41.into()]))));
        assert!(matches(&p, Some(&cond("score == {0}", [41.5f64.into()]))));
        assert!(matches(&p, Some(&cond("id == {0}", [7.0f64.into()]))));
    }

    #[test]
    fn string_operators() {
        let p = player();
        assert!(matches(&p, Some(&cond("name contains {0}", ["arc".into()]))));
        assert!(matches(&p, Some(&cond("name startswith {0}", ["mar".into()]))));
        assert!(matches(&p, Some(&cond("name endswith {0}", ["co".into()]))));
        assert!(!matches(&p, Some(&cond("name contains {0}", ["xyz".into()]))));
    }

    #[test]
    fn in_operator_uses_hashed_set() {
        let p = player();
        let c = cond("id in {0}", [vec![1i64, 7, 9].into()]);
        // Evaluate twice so the second pass hits the memo.
        assert!(matches(&p, Some(&c)));
        assert!(matches(&p, Some(&c)));
        assert!(!matches(&p, Some(&cond("id in {0}", [vec![1i64, 2].into()]))));
        assert!(!matches(&p, Some(&cond("id in {0}", [CondArg::List(vec![])]))));
    }

    #[test]
    fn isnull_checks_emptiness() {
        let mut p = player();
        assert!(!matches(&p, Some(&cond("name isnull {0}", [true.into()]))));
        p.name.clear();
        assert!(matches(&p, Some(&cond("name isnull {0}", [true.into()]))));
        assert!(!matches(&p, Some(&cond("name isnull {0}", [false.into()]))));
    }

    #[test]
    fn boolean_chains_short_circuit() {
        let p = player();
        assert!(matches(
            &p,
            Some(&cond("id > {0} && name == {1}", [3.into(), "marco".into()]))
        ));
        assert!(!matches(
            &p,
            Some(&cond("id > {0} && name == {1}", [3.into(), "polo".into()]))
        ));
        assert!(matches(
            &p,
            Some(&cond("id > {0} || name == {1}", [100.into(), "marco".into()]))
        ));
        assert!(matches(
            &p,
            Some(&cond(
                "( id > {0} && online == {1} ) || name == {2}",
                [100.into(), false.into(), "marco".into()]
            ))
        ));
    }

    #[test]
    fn negated_groups() {
        let p = player();
        assert!(matches(
            &p,
            Some(&cond("! ( id > {0} )", [100.into()]))
        ));
        assert!(!matches(
            &p,
            Some(&cond("! ( id > {0} )", [3.into()]))
        ));
    }

    #[test]
    fn unknown_column_never_matches() {
        let p = player();
        assert!(!matches(&p, Some(&cond("ghost == {0}", [1.into()]))));
    }
}
