//! JSON-Logic parser for stored `rule_logic` documents.
//!
//! Only the operators the AST models are accepted. Everything else is a
//! [`RuleParseError`], and the catalog drops the segment.
//!
//! The `{"var": [name, default]}` form is accepted but the default is
//! dropped: a missing attribute still makes its comparison false.

use daffodil_core::Scalar;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::engine::{validate, MalformedRuleError, MAX_RULE_DEPTH};
use crate::predicates::{ComparisonOperator, LogicalOperator, RuleNode};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuleParseError {
    #[error("unsupported operator `{0}`")]
    UnknownOperator(String),

    #[error("operator object must have exactly one key, found {0}")]
    AmbiguousOperator(usize),

    #[error("`{op}` expects {expected} operand(s), found {found}")]
    Arity {
        op: String,
        expected: usize,
        found: usize,
    },

    #[error("`var` expects an attribute name, found {0}")]
    InvalidVar(String),

    #[error("value {0} is not a supported literal")]
    InvalidLiteral(String),

    #[error(transparent)]
    Malformed(#[from] MalformedRuleError),
}

/// Parse a JSON-Logic document into a validated rule tree.
pub fn parse_rule(value: &Value) -> Result<RuleNode, RuleParseError> {
    let rule = parse_node(value, 1)?;
    validate(&rule)?;
    Ok(rule)
}

fn parse_node(value: &Value, depth: usize) -> Result<RuleNode, RuleParseError> {
    if depth > MAX_RULE_DEPTH {
        return Err(MalformedRuleError::TooDeep {
            max: MAX_RULE_DEPTH,
        }
        .into());
    }
    match value {
        Value::Object(map) => parse_operator(map, depth),
        other => Scalar::from_json(other)
            .map(RuleNode::Literal)
            .ok_or_else(|| RuleParseError::InvalidLiteral(other.to_string())),
    }
}

fn parse_operator(map: &Map<String, Value>, depth: usize) -> Result<RuleNode, RuleParseError> {
    let mut entries = map.iter();
    let (op, args) = match (entries.next(), map.len()) {
        (Some(entry), 1) => entry,
        (_, n) => return Err(RuleParseError::AmbiguousOperator(n)),
    };

    if op == "var" {
        return parse_var(args);
    }

    if let Some(cmp) = comparison(op) {
        let operands = operands(args);
        return match operands.as_slice() {
            [left, right] => Ok(RuleNode::compare(
                cmp,
                parse_node(left, depth + 1)?,
                parse_node(right, depth + 1)?,
            )),
            other => Err(RuleParseError::Arity {
                op: op.clone(),
                expected: 2,
                found: other.len(),
            }),
        };
    }

    let logical = match op.as_str() {
        "and" => LogicalOperator::And,
        "or" => LogicalOperator::Or,
        "!" | "not" => LogicalOperator::Not,
        _ => return Err(RuleParseError::UnknownOperator(op.clone())),
    };
    let children = operands(args)
        .into_iter()
        .map(|arg| parse_node(arg, depth + 1))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(RuleNode::Logical {
        op: logical,
        children,
    })
}

fn comparison(op: &str) -> Option<ComparisonOperator> {
    Some(match op {
        "==" | "===" => ComparisonOperator::Equals,
        "!=" | "!==" => ComparisonOperator::NotEquals,
        ">" => ComparisonOperator::GreaterThan,
        ">=" => ComparisonOperator::GreaterThanOrEqual,
        "<" => ComparisonOperator::LessThan,
        "<=" => ComparisonOperator::LessThanOrEqual,
        _ => return None,
    })
}

/// JSON-Logic allows a lone operand without the surrounding array.
fn operands(args: &Value) -> Vec<&Value> {
    match args {
        Value::Array(items) => items.iter().collect(),
        single => vec![single],
    }
}

fn parse_var(args: &Value) -> Result<RuleNode, RuleParseError> {
    let name = match args {
        Value::String(name) => Some(name),
        Value::Array(items) => match items.as_slice() {
            [Value::String(name)] | [Value::String(name), _] => Some(name),
            _ => None,
        },
        _ => None,
    };
    match name {
        Some(name) if !name.is_empty() => Ok(RuleNode::VarRef(name.clone())),
        _ => Err(RuleParseError::InvalidVar(args.to_string())),
    }
}
