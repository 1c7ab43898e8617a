//! Segment builder: fluent API for constructing segment definitions.

use crate::catalog::{Segment, SegmentId};
use crate::predicates::{ComparisonOperator, LogicalOperator, RuleNode};
use daffodil_core::{Scalar, SegmentRecord};
use serde_json::{Map, Value};

pub struct SegmentBuilder {
    id: SegmentId,
    name: String,
    conditions: Vec<RuleNode>,
    operator: LogicalOperator,
    rule: Option<RuleNode>,
    payload: Map<String, Value>,
}

impl SegmentBuilder {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: SegmentId::new(id),
            name: name.into(),
            conditions: Vec::new(),
            operator: LogicalOperator::And,
            rule: None,
            payload: Map::new(),
        }
    }

    /// Combine conditions with `or` instead of `and`.
    pub fn with_or(mut self) -> Self {
        self.operator = LogicalOperator::Or;
        self
    }

    pub fn attribute_equals(self, key: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.attribute(key, ComparisonOperator::Equals, value)
    }

    pub fn attribute_gt(self, key: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.attribute(key, ComparisonOperator::GreaterThan, value)
    }

    pub fn attribute_gte(self, key: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.attribute(key, ComparisonOperator::GreaterThanOrEqual, value)
    }

    pub fn attribute_lt(self, key: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.attribute(key, ComparisonOperator::LessThan, value)
    }

    pub fn attribute(
        mut self,
        key: impl Into<String>,
        operator: ComparisonOperator,
        value: impl Into<Scalar>,
    ) -> Self {
        self.conditions.push(RuleNode::compare(
            operator,
            RuleNode::var(key),
            RuleNode::lit(value),
        ));
        self
    }

    /// Use `rule` verbatim, ignoring any attribute conditions.
    pub fn rule(mut self, rule: RuleNode) -> Self {
        self.rule = Some(rule);
        self
    }

    pub fn payload(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    pub fn build(self) -> Segment {
        let rule = match self.rule {
            Some(rule) => rule,
            None if self.conditions.len() == 1 => {
                let mut conditions = self.conditions;
                conditions.remove(0)
            }
            None => RuleNode::Logical {
                op: self.operator,
                children: self.conditions,
            },
        };
        Segment {
            id: self.id,
            name: self.name,
            rule,
            payload: self.payload,
        }
    }

    /// Build straight into the stored record shape.
    pub fn record(self) -> SegmentRecord {
        self.build().to_record()
    }
}
