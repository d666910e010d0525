//! Expression factory for conditions.
//!
//! Grammar, whitespace-tolerant:
//!
//! ```text
//! expr   := clause { ("&&" | "||") clause }
//! clause := [ "!" ] ( "(" expr ")" | comparison )
//! comparison := column [operator] "{n}"
//! ```
//!
//! Operators are the tokens of [`Op`]; a missing operator means equality.
//! The pseudo-columns `limit` and `offset` consume their parameter as
//! paging bounds instead of producing a predicate. `{n}` slots index into
//! the argument list; a count or index mismatch is a setup bug.

use thiserror::Error;

use crate::cond::{CondArg, CondNode, CondTerm, Comparison, Condition, Op};
use crate::model::FieldValue;

#[derive(Debug, Error)]
pub enum CondError {
    #[error("malformed condition `{expr}`: {message}")]
    Malformed { expr: String, message: String },
    #[error("condition `{expr}` has {slots} parameter slot(s) but {args} argument(s)")]
    ArgCount { expr: String, slots: usize, args: usize },
}

/// Build a condition from an expression, panicking on malformed input.
///
/// The panicking form matches how conditions are written in practice: the
/// expression is a literal and a mistake in it is a bug, not a runtime
/// state. Use [`Condition::parse`] where graceful handling is needed.
pub fn cond<A>(expr: &str, args: A) -> Condition
where
    A: IntoIterator<Item = CondArg>,
{
    match Condition::parse(expr, args.into_iter().collect()) {
        Ok(cond) => cond,
        Err(err) => panic!("{err}"),
    }
}

impl Condition {
    /// Parse an expression such as `"age > {0} && name == {1}"`.
    pub fn parse(expr: &str, args: Vec<CondArg>) -> Result<Self, CondError> {
        let tokens = tokenize(expr);
        let slots = tokens
            .iter()
            .filter(|token| matches!(token, Token::Param(_)))
            .count();
        if slots != args.len() {
            return Err(CondError::ArgCount {
                expr: expr.to_string(),
                slots,
                args: args.len(),
            });
        }

        let mut parser = Parser {
            expr,
            tokens,
            pos: 0,
            args,
            cond: Condition::new(),
        };
        let nodes = parser.parse_nodes(true)?;
        if parser.pos != parser.tokens.len() {
            return Err(parser.malformed("unbalanced `)`"));
        }
        let mut cond = parser.cond;
        cond.nodes = nodes;
        Ok(cond)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    Not,
    And,
    Or,
    Word(String),
    Param(usize),
}

fn tokenize(expr: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    for chunk in expr.split_whitespace() {
        let mut rest = chunk;
        loop {
            if let Some(stripped) = rest.strip_prefix('(') {
                tokens.push(Token::LParen);
                rest = stripped;
            } else if let Some(stripped) = rest.strip_prefix('!') {
                // A leading `!` negates, unless it spells the `!=` operator.
                if stripped.starts_with('=') {
                    break;
                }
                tokens.push(Token::Not);
                rest = stripped;
            } else {
                break;
            }
        }
        let mut closing = 0;
        while let Some(stripped) = rest.strip_suffix(')') {
            closing += 1;
            rest = stripped;
        }
        if !rest.is_empty() {
            tokens.push(classify(rest));
        }
        tokens.extend(std::iter::repeat(Token::RParen).take(closing));
    }
    tokens
}

fn classify(word: &str) -> Token {
    match word {
        "&&" => Token::And,
        "||" => Token::Or,
        "!" => Token::Not,
        _ => {
            if let Some(index) = word
                .strip_prefix('{')
                .and_then(|w| w.strip_suffix('}'))
                .and_then(|w| w.parse::<usize>().ok())
            {
                Token::Param(index)
            } else {
                Token::Word(word.to_string())
            }
        }
    }
}

struct Parser<'a> {
    expr: &'a str,
    tokens: Vec<Token>,
    pos: usize,
    args: Vec<CondArg>,
    cond: Condition,
}

impl Parser<'_> {
    fn malformed(&self, message: impl Into<String>) -> CondError {
        CondError::Malformed {
            expr: self.expr.to_string(),
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    /// Parse a clause chain until end of input or, for nested groups, the
    /// matching `)`.
    fn parse_nodes(&mut self, top_level: bool) -> Result<Vec<CondNode>, CondError> {
        let mut nodes = Vec::new();
        let mut or = false;

        loop {
            let mut not = false;
            while matches!(self.peek(), Some(Token::Not)) {
                self.advance();
                not = !not;
            }

            match self.advance() {
                Some(Token::LParen) => {
                    let nested = self.parse_nodes(false)?;
                    if !matches!(self.advance(), Some(Token::RParen)) {
                        return Err(self.malformed("missing `)`"));
                    }
                    nodes.push(CondNode {
                        or,
                        not,
                        term: CondTerm::Group(nested),
                    });
                }
                Some(Token::Word(column)) => {
                    self.parse_comparison(column, or, not, &mut nodes)?;
                }
                Some(token) => {
                    return Err(self.malformed(format!("unexpected token {token:?}")));
                }
                None => {
                    if nodes.is_empty() && self.args.is_empty() {
                        // An empty expression is the match-all condition.
                        return Ok(nodes);
                    }
                    return Err(self.malformed("dangling operator"));
                }
            }

            match self.peek() {
                Some(Token::And) => {
                    self.advance();
                    or = false;
                }
                Some(Token::Or) => {
                    self.advance();
                    or = true;
                }
                Some(Token::RParen) => {
                    if top_level {
                        return Err(self.malformed("unbalanced `)`"));
                    }
                    return Ok(nodes);
                }
                Some(token) => {
                    let token = token.clone();
                    return Err(self.malformed(format!("expected `&&` or `||`, got {token:?}")));
                }
                None => return Ok(nodes),
            }
        }
    }

    fn parse_comparison(
        &mut self,
        column: String,
        or: bool,
        not: bool,
        nodes: &mut Vec<CondNode>,
    ) -> Result<(), CondError> {
        let op = match self.peek() {
            Some(Token::Word(word)) => {
                let op = Op::from_token(word);
                if op.is_some() {
                    self.advance();
                } else {
                    return Err(self.malformed(format!("unknown operator `{word}`")));
                }
                op
            }
            _ => None,
        };

        let Some(Token::Param(index)) = self.advance() else {
            return Err(self.malformed(format!("column `{column}` is missing its `{{n}}` slot")));
        };
        let Some(operand) = self.args.get(index).cloned() else {
            return Err(self.malformed(format!(
                "parameter index {index} exceeds argument count {}",
                self.args.len()
            )));
        };

        // Bare `limit {n}` / `offset {n}` are paging bounds, not predicates.
        if op.is_none() && (column == "limit" || column == "offset") {
            let CondArg::Value(FieldValue::Int(bound)) = operand else {
                return Err(self.malformed(format!("`{column}` requires an integer argument")));
            };
            let bound = usize::try_from(bound)
                .map_err(|_| self.malformed(format!("`{column}` must not be negative")))?;
            if column == "limit" {
                self.cond.set_limit(bound);
            } else {
                self.cond.set_offset(bound);
            }
            return Ok(());
        }

        nodes.push(CondNode {
            or,
            not,
            term: CondTerm::Comp(Comparison {
                column,
                op: op.unwrap_or(Op::Eq),
                operand,
            }),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_chain() {
        let cond = cond("age > {0} && name == {1}", [30.into(), "ada".into()]);
        assert_eq!(cond.nodes().len(), 2);
        let CondTerm::Comp(first) = &cond.nodes()[0].term else {
            panic!("expected comparison");
        };
        assert_eq!(first.column, "age");
        assert_eq!(first.op, Op::Gt);
        assert!(!cond.nodes()[1].or);
    }

    #[test]
    fn parses_groups_and_negation() {
        let cond = cond(
            "! ( age > {0} || vip == {1} ) && name != {2}",
            [60.into(), true.into(), "bob".into()],
        );
        assert_eq!(cond.nodes().len(), 2);
        assert!(cond.nodes()[0].not);
        assert!(matches!(cond.nodes()[0].term, CondTerm::Group(_)));
    }

    #[test]
    fn tight_parentheses_tokenize() {
        let cond = cond("(age > {0}) && (name == {1})", [1.into(), "x".into()]);
        assert_eq!(cond.nodes().len(), 2);
        assert!(matches!(cond.nodes()[0].term, CondTerm::Group(_)));
        assert!(matches!(cond.nodes()[1].term, CondTerm::Group(_)));
    }

    #[test]
    fn missing_operator_defaults_to_equality() {
        let cond = cond("age {0}", [30.into()]);
        let CondTerm::Comp(comp) = &cond.nodes()[0].term else {
            panic!("expected comparison");
        };
        assert_eq!(comp.op, Op::Eq);
    }

    #[test]
    fn limit_and_offset_become_paging_bounds() {
        let cond = cond(
            "age >= {0} && limit {1} && offset {2}",
            [18.into(), 25.into(), 50.into()],
        );
        assert_eq!(cond.nodes().len(), 1);
        assert_eq!(cond.limit(), 25);
        assert_eq!(cond.offset(), 50);
    }

    #[test]
    fn empty_expression_is_match_all() {
        let cond = cond("", []);
        assert!(cond.is_empty());
    }

    #[test]
    fn argument_count_mismatch_is_rejected() {
        let err = Condition::parse("age > {0} && id == {1}", vec![1.into()]).unwrap_err();
        assert!(matches!(err, CondError::ArgCount { slots: 2, args: 1, .. }));
    }

    #[test]
    fn out_of_range_parameter_is_rejected() {
        let err = Condition::parse("age > {5}", vec![1.into()]).unwrap_err();
        assert!(matches!(err, CondError::Malformed { .. }));
    }

    #[test]
    fn unknown_operator_is_rejected() {
        let err = Condition::parse("age ~= {0}", vec![1.into()]).unwrap_err();
        assert!(matches!(err, CondError::Malformed { .. }));
    }

    #[test]
    #[should_panic(expected = "parameter slot")]
    fn cond_panics_on_arity_bugs() {
        cond("age > {0}", []);
    }
}
