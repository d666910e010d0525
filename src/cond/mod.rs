//! Query conditions: an immutable predicate tree plus optional paging.
//!
//! A [`Condition`] is built either programmatically or through the
//! expression factory in [`parse`] (`"age > {0} && name == {1}"`). The same
//! value is handed to the remote tier as-is and evaluated in memory by
//! [`matcher::matches`] against cached instances.
//!
//! Conditions are logically immutable. The one piece of interior state is a
//! memoized hash set per `(column, depth)` backing the `in` operator, so
//! repeated matching against the same condition costs O(1) per check
//! instead of O(|list|).

pub mod matcher;
pub mod parse;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::cache::lock::mutex_lock;
use crate::model::FieldValue;

pub use parse::{cond, CondError};

const SOURCE: &str = "cond";

/// Comparison operator set understood by both tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
    Ne,
    Contains,
    StartsWith,
    EndsWith,
    IsNull,
    In,
}

impl Op {
    /// DSL token for this operator.
    pub fn token(self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Contains => "contains",
            Self::StartsWith => "startswith",
            Self::EndsWith => "endswith",
            Self::IsNull => "isnull",
            Self::In => "in",
        }
    }

    pub(crate) fn from_token(token: &str) -> Option<Self> {
        Some(match token {
            "<" => Self::Lt,
            "<=" => Self::Lte,
            ">" => Self::Gt,
            ">=" => Self::Gte,
            "==" => Self::Eq,
            "!=" => Self::Ne,
            "contains" => Self::Contains,
            "startswith" => Self::StartsWith,
            "endswith" => Self::EndsWith,
            "isnull" => Self::IsNull,
            "in" => Self::In,
            _ => return None,
        })
    }
}

/// Right-hand side of a comparison: one value, or a list for `in`.
#[derive(Debug, Clone, PartialEq)]
pub enum CondArg {
    Value(FieldValue),
    List(Vec<FieldValue>),
}

macro_rules! cond_arg_from_value {
    ($($ty:ty),*) => {
        $(impl From<$ty> for CondArg {
            fn from(v: $ty) -> Self {
                Self::Value(v.into())
            }
        })*
    };
}

cond_arg_from_value!(i8, i16, i32, i64, u8, u16, u32, f32, f64, bool, &str, String);

impl From<FieldValue> for CondArg {
    fn from(v: FieldValue) -> Self {
        Self::Value(v)
    }
}

macro_rules! cond_arg_from_list {
    ($($ty:ty),*) => {
        $(impl From<Vec<$ty>> for CondArg {
            fn from(list: Vec<$ty>) -> Self {
                Self::List(list.into_iter().map(Into::into).collect())
            }
        })*
    };
}

cond_arg_from_list!(i32, i64, f64, &str, String);

/// One comparison leaf.
#[derive(Debug, Clone)]
pub struct Comparison {
    pub column: String,
    pub op: Op,
    pub operand: CondArg,
}

#[derive(Debug, Clone)]
pub enum CondTerm {
    Comp(Comparison),
    Group(Vec<CondNode>),
}

/// A term plus how it joins the previous one. The first node's `or` flag is
/// ignored.
#[derive(Debug, Clone)]
pub struct CondNode {
    pub or: bool,
    pub not: bool,
    pub term: CondTerm,
}

/// Hashed form of an `in` list, memoized per `(column, depth)`.
#[derive(Debug)]
pub(crate) enum MemoSet {
    Ints(HashSet<i64>),
    FloatBits(HashSet<u64>),
    Strs(HashSet<String>),
}

impl MemoSet {
    fn build(list: &[FieldValue]) -> Self {
        if list.iter().all(|v| matches!(v, FieldValue::Int(_))) {
            Self::Ints(list.iter().filter_map(FieldValue::as_int).collect())
        } else if list
            .iter()
            .all(|v| matches!(v, FieldValue::Int(_) | FieldValue::Float(_)))
        {
            Self::FloatBits(
                list.iter()
                    .filter_map(FieldValue::as_float)
                    .map(f64::to_bits)
                    .collect(),
            )
        } else {
            Self::Strs(
                list.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
            )
        }
    }

    pub(crate) fn contains(&self, value: &FieldValue) -> bool {
        match self {
            Self::Ints(set) => value.as_int().is_some_and(|v| set.contains(&v)),
            Self::FloatBits(set) => value.as_float().is_some_and(|v| set.contains(&v.to_bits())),
            Self::Strs(set) => value.as_str().is_some_and(|v| set.contains(v)),
        }
    }
}

/// Immutable predicate tree plus optional limit/offset, with interior
/// memoization for `in` lists.
#[derive(Debug, Default)]
pub struct Condition {
    nodes: Vec<CondNode>,
    limit: usize,
    offset: usize,
    memo: Mutex<HashMap<(String, usize), Arc<MemoSet>>>,
}

impl Condition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nodes(&self) -> &[CondNode] {
        &self.nodes
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    // ------------------------------------------------------------------
    // Builder
    // ------------------------------------------------------------------

    fn push(mut self, or: bool, not: bool, term: CondTerm) -> Self {
        self.nodes.push(CondNode { or, not, term });
        self
    }

    pub fn and(self, column: impl Into<String>, op: Op, operand: impl Into<CondArg>) -> Self {
        self.push(false, false, comp(column, op, operand))
    }

    pub fn or(self, column: impl Into<String>, op: Op, operand: impl Into<CondArg>) -> Self {
        self.push(true, false, comp(column, op, operand))
    }

    pub fn and_not(self, column: impl Into<String>, op: Op, operand: impl Into<CondArg>) -> Self {
        self.push(false, true, comp(column, op, operand))
    }

    pub fn or_not(self, column: impl Into<String>, op: Op, operand: impl Into<CondArg>) -> Self {
        self.push(true, true, comp(column, op, operand))
    }

    pub fn and_cond(self, nested: Condition) -> Self {
        self.push(false, false, CondTerm::Group(nested.nodes))
    }

    pub fn or_cond(self, nested: Condition) -> Self {
        self.push(true, false, CondTerm::Group(nested.nodes))
    }

    pub fn and_not_cond(self, nested: Condition) -> Self {
        self.push(false, true, CondTerm::Group(nested.nodes))
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub(crate) fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
    }

    pub(crate) fn set_offset(&mut self, offset: usize) {
        self.offset = offset;
    }

    /// Hashed `in` list for one leaf, built on first use.
    pub(crate) fn memo_set(&self, column: &str, depth: usize, list: &[FieldValue]) -> Arc<MemoSet> {
        let key = (column.to_string(), depth);
        let mut memo = mutex_lock(&self.memo, SOURCE, "memo_set");
        memo.entry(key)
            .or_insert_with(|| Arc::new(MemoSet::build(list)))
            .clone()
    }
}

impl Clone for Condition {
    fn clone(&self) -> Self {
        // The memo is derived state; a clone starts cold.
        Self {
            nodes: self.nodes.clone(),
            limit: self.limit,
            offset: self.offset,
            memo: Mutex::new(HashMap::new()),
        }
    }
}

fn comp(column: impl Into<String>, op: Op, operand: impl Into<CondArg>) -> CondTerm {
    CondTerm::Comp(Comparison {
        column: column.into(),
        op,
        operand: operand.into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_accumulates_nodes() {
        let cond = Condition::new()
            .and("age", Op::Gt, 18)
            .or("name", Op::Eq, "root")
            .with_limit(10)
            .with_offset(5);

        assert_eq!(cond.nodes().len(), 2);
        assert!(!cond.nodes()[0].or);
        assert!(cond.nodes()[1].or);
        assert_eq!(cond.limit(), 10);
        assert_eq!(cond.offset(), 5);
    }

    #[test]
    fn clone_starts_with_cold_memo() {
        let cond = Condition::new().and("id", Op::In, vec![1i64, 2, 3]);
        let list = [FieldValue::Int(1), FieldValue::Int(2), FieldValue::Int(3)];
        cond.memo_set("id", 0, &list);

        let cloned = cond.clone();
        assert_eq!(cloned.nodes().len(), 1);
        assert!(mutex_lock(&cloned.memo, "test", "inspect").is_empty());
    }

    #[test]
    fn memo_set_hashes_each_value_family() {
        let ints = MemoSet::build(&[FieldValue::Int(1), FieldValue::Int(2)]);
        assert!(ints.contains(&FieldValue::Int(2)));
        assert!(!ints.contains(&FieldValue::Int(3)));

        let floats = MemoSet::build(&[FieldValue::Float(1.5), FieldValue::Int(2)]);
        assert!(floats.contains(&FieldValue::Float(1.5)));
        assert!(floats.contains(&FieldValue::Int(2)));

        let strs = MemoSet::build(&[FieldValue::Str("a".into())]);
        assert!(strs.contains(&FieldValue::Str("a".into())));
        assert!(!strs.contains(&FieldValue::Str("b".into())));
    }
}
