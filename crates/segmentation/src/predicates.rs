//! Rule AST and the comparison semantics behind `Compare` nodes.

use daffodil_core::Scalar;
use serde_json::json;
use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum RuleNode {
    Literal(Scalar),
    VarRef(String),
    Compare {
        op: ComparisonOperator,
        left: Box<RuleNode>,
        right: Box<RuleNode>,
    },
    Logical {
        op: LogicalOperator,
        children: Vec<RuleNode>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComparisonOperator {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicalOperator {
    And,
    Or,
    Not,
}

impl ComparisonOperator {
    /// JSON-Logic spelling.
    pub fn symbol(self) -> &'static str {
        match self {
            ComparisonOperator::Equals => "==",
            ComparisonOperator::NotEquals => "!=",
            ComparisonOperator::GreaterThan => ">",
            ComparisonOperator::GreaterThanOrEqual => ">=",
            ComparisonOperator::LessThan => "<",
            ComparisonOperator::LessThanOrEqual => "<=",
        }
    }

    fn accepts(self, ordering: Ordering) -> bool {
        match self {
            ComparisonOperator::Equals => ordering == Ordering::Equal,
            ComparisonOperator::NotEquals => ordering != Ordering::Equal,
            ComparisonOperator::GreaterThan => ordering == Ordering::Greater,
            ComparisonOperator::GreaterThanOrEqual => ordering != Ordering::Less,
            ComparisonOperator::LessThan => ordering == Ordering::Less,
            ComparisonOperator::LessThanOrEqual => ordering != Ordering::Greater,
        }
    }
}

impl LogicalOperator {
    pub fn symbol(self) -> &'static str {
        match self {
            LogicalOperator::And => "and",
            LogicalOperator::Or => "or",
            LogicalOperator::Not => "!",
        }
    }
}

impl RuleNode {
    pub fn var(name: impl Into<String>) -> Self {
        RuleNode::VarRef(name.into())
    }

    pub fn lit(value: impl Into<Scalar>) -> Self {
        RuleNode::Literal(value.into())
    }

    pub fn compare(op: ComparisonOperator, left: RuleNode, right: RuleNode) -> Self {
        RuleNode::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn and(children: Vec<RuleNode>) -> Self {
        RuleNode::Logical {
            op: LogicalOperator::And,
            children,
        }
    }

    pub fn or(children: Vec<RuleNode>) -> Self {
        RuleNode::Logical {
            op: LogicalOperator::Or,
            children,
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(child: RuleNode) -> Self {
        RuleNode::Logical {
            op: LogicalOperator::Not,
            children: vec![child],
        }
    }

    /// Number of nodes on the longest root-to-leaf path.
    pub fn depth(&self) -> usize {
        match self {
            RuleNode::Literal(_) | RuleNode::VarRef(_) => 1,
            RuleNode::Compare { left, right, .. } => 1 + left.depth().max(right.depth()),
            RuleNode::Logical { children, .. } => {
                1 + children.iter().map(RuleNode::depth).max().unwrap_or(0)
            }
        }
    }

    /// Render back to the JSON-Logic form the parser accepts.
    pub fn to_json_logic(&self) -> serde_json::Value {
        match self {
            RuleNode::Literal(value) => serde_json::to_value(value).unwrap_or_default(),
            RuleNode::VarRef(name) => json!({ "var": name }),
            RuleNode::Compare { op, left, right } => {
                json!({ op.symbol(): [left.to_json_logic(), right.to_json_logic()] })
            }
            RuleNode::Logical { op, children } => {
                let rendered: Vec<_> = children.iter().map(RuleNode::to_json_logic).collect();
                json!({ op.symbol(): rendered })
            }
        }
    }
}

impl fmt::Display for RuleNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json_logic())
    }
}

/// Compare two resolved operands. `None` is a missing attribute.
///
/// Missing operands and cross-type pairs never match, for any operator.
/// Integers and floats compare as `f64`, strings lexicographically, and
/// booleans only under equality.
pub fn compare_values(
    actual: Option<&Scalar>,
    operator: ComparisonOperator,
    expected: Option<&Scalar>,
) -> bool {
    let (Some(a), Some(b)) = (actual, expected) else {
        return false;
    };
    match (a, b) {
        (Scalar::Bool(x), Scalar::Bool(y)) => match operator {
            ComparisonOperator::Equals => x == y,
            ComparisonOperator::NotEquals => x != y,
            _ => false,
        },
        (Scalar::Str(x), Scalar::Str(y)) => operator.accepts(x.as_str().cmp(y.as_str())),
        _ => numeric_cmp(a, b).is_some_and(|o| operator.accepts(o)),
    }
}

fn numeric_cmp(a: &Scalar, b: &Scalar) -> Option<Ordering> {
    let a_num = a.as_f64()?;
    let b_num = b.as_f64()?;
    a_num.partial_cmp(&b_num)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: impl Into<Scalar>) -> Scalar {
        v.into()
    }

    #[test]
    fn test_numeric_coercion() {
        assert!(compare_values(Some(&s(5)), ComparisonOperator::Equals, Some(&s(5.0))));
        assert!(compare_values(Some(&s(6)), ComparisonOperator::GreaterThan, Some(&s(5.5))));
        assert!(compare_values(Some(&s(5)), ComparisonOperator::LessThanOrEqual, Some(&s(5))));
        assert!(!compare_values(Some(&s(5)), ComparisonOperator::NotEquals, Some(&s(5.0))));
    }

    #[test]
    fn test_missing_never_matches() {
        for op in [
            ComparisonOperator::Equals,
            ComparisonOperator::NotEquals,
            ComparisonOperator::GreaterThan,
            ComparisonOperator::GreaterThanOrEqual,
            ComparisonOperator::LessThan,
            ComparisonOperator::LessThanOrEqual,
        ] {
            assert!(!compare_values(None, op, Some(&s(5))));
            assert!(!compare_values(Some(&s(5)), op, None));
            assert!(!compare_values(None, op, None));
        }
    }

    #[test]
    fn test_type_mismatch_is_no_match() {
        assert!(!compare_values(Some(&s(5)), ComparisonOperator::Equals, Some(&s("5"))));
        assert!(!compare_values(Some(&s(5)), ComparisonOperator::NotEquals, Some(&s("5"))));
        assert!(!compare_values(Some(&s(true)), ComparisonOperator::Equals, Some(&s(1))));
    }

    #[test]
    fn test_strings_and_bools() {
        assert!(compare_values(Some(&s("NYC")), ComparisonOperator::Equals, Some(&s("NYC"))));
        assert!(compare_values(Some(&s("b")), ComparisonOperator::GreaterThan, Some(&s("a"))));
        assert!(compare_values(Some(&s(true)), ComparisonOperator::NotEquals, Some(&s(false))));
        assert!(!compare_values(Some(&s(true)), ComparisonOperator::GreaterThan, Some(&s(false))));
    }

    #[test]
    fn test_nan_never_matches() {
        let nan = s(f64::NAN);
        assert!(!compare_values(Some(&nan), ComparisonOperator::Equals, Some(&nan)));
        assert!(!compare_values(Some(&nan), ComparisonOperator::NotEquals, Some(&s(1))));
    }

    #[test]
    fn test_depth() {
        let rule = RuleNode::and(vec![
            RuleNode::compare(ComparisonOperator::GreaterThan, RuleNode::var("a"), RuleNode::lit(1)),
            RuleNode::lit(true),
        ]);
        assert_eq!(rule.depth(), 3);
        assert_eq!(RuleNode::and(vec![]).depth(), 1);
    }

    #[test]
    fn test_to_json_logic() {
        let rule = RuleNode::compare(
            ComparisonOperator::GreaterThanOrEqual,
            RuleNode::var("orders_23d"),
            RuleNode::lit(5),
        );
        assert_eq!(
            rule.to_json_logic(),
            json!({">=": [{"var": "orders_23d"}, 5]})
        );
    }
}
