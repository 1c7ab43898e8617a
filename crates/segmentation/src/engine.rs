//! Rule evaluator: decides whether one user's attributes satisfy a rule.

use daffodil_core::{AttributeSet, Scalar};
use thiserror::Error;

use crate::predicates::{compare_values, LogicalOperator, RuleNode};

/// Deepest rule tree accepted by the parser and the evaluator.
pub const MAX_RULE_DEPTH: usize = 32;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedRuleError {
    #[error("`not` expects exactly one operand, found {0}")]
    NotArity(usize),

    #[error("rule exceeds the maximum depth of {max}")]
    TooDeep { max: usize },
}

/// Structural check applied once at parse time.
pub fn validate(rule: &RuleNode) -> Result<(), MalformedRuleError> {
    check(rule, 1)
}

fn check(rule: &RuleNode, depth: usize) -> Result<(), MalformedRuleError> {
    if depth > MAX_RULE_DEPTH {
        return Err(MalformedRuleError::TooDeep {
            max: MAX_RULE_DEPTH,
        });
    }
    match rule {
        RuleNode::Literal(_) | RuleNode::VarRef(_) => Ok(()),
        RuleNode::Compare { left, right, .. } => {
            check(left, depth + 1)?;
            check(right, depth + 1)
        }
        RuleNode::Logical { op, children } => {
            if *op == LogicalOperator::Not && children.len() != 1 {
                return Err(MalformedRuleError::NotArity(children.len()));
            }
            children.iter().try_for_each(|c| check(c, depth + 1))
        }
    }
}

/// Evaluate `rule` against `attrs`.
///
/// Pure: the same rule and attribute set always produce the same answer.
/// Missing attributes and type mismatches evaluate to `false`; only a
/// structurally invalid tree is an error.
pub fn evaluate(rule: &RuleNode, attrs: &AttributeSet) -> Result<bool, MalformedRuleError> {
    eval_bool(rule, attrs, 1)
}

fn eval_bool(rule: &RuleNode, attrs: &AttributeSet, depth: usize) -> Result<bool, MalformedRuleError> {
    if depth > MAX_RULE_DEPTH {
        return Err(MalformedRuleError::TooDeep {
            max: MAX_RULE_DEPTH,
        });
    }
    match rule {
        RuleNode::Logical { op, children } => match op {
            LogicalOperator::And => {
                for child in children {
                    if !eval_bool(child, attrs, depth + 1)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            LogicalOperator::Or => {
                for child in children {
                    if eval_bool(child, attrs, depth + 1)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            LogicalOperator::Not => match children.as_slice() {
                [child] => Ok(!eval_bool(child, attrs, depth + 1)?),
                other => Err(MalformedRuleError::NotArity(other.len())),
            },
        },
        other => Ok(eval_value(other, attrs, depth)?.and_then(|v| v.as_bool()) == Some(true)),
    }
}

/// Resolve a node to a scalar. `None` is the missing value.
fn eval_value(
    rule: &RuleNode,
    attrs: &AttributeSet,
    depth: usize,
) -> Result<Option<Scalar>, MalformedRuleError> {
    if depth > MAX_RULE_DEPTH {
        return Err(MalformedRuleError::TooDeep {
            max: MAX_RULE_DEPTH,
        });
    }
    match rule {
        RuleNode::Literal(value) => Ok(Some(value.clone())),
        RuleNode::VarRef(name) => Ok(attrs.get(name).cloned()),
        RuleNode::Compare { op, left, right } => {
            let lhs = eval_value(left, attrs, depth + 1)?;
            let rhs = eval_value(right, attrs, depth + 1)?;
            Ok(Some(Scalar::Bool(compare_values(lhs.as_ref(), *op, rhs.as_ref()))))
        }
        RuleNode::Logical { .. } => Ok(Some(Scalar::Bool(eval_bool(rule, attrs, depth)?))),
    }
}
