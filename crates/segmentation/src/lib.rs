//! Segment evaluation: rule AST, JSON-Logic parsing, evaluation, catalog
//! snapshots and per-user membership resolution.

pub mod builder;
pub mod catalog;
pub mod engine;
pub mod parser;
pub mod predicates;
pub mod resolver;

pub use builder::SegmentBuilder;
pub use catalog::{CatalogError, CatalogSnapshot, Segment, SegmentCatalog, SegmentId};
pub use engine::{evaluate, MalformedRuleError, MAX_RULE_DEPTH};
pub use parser::{parse_rule, RuleParseError};
pub use predicates::{ComparisonOperator, LogicalOperator, RuleNode};
pub use resolver::{resolve, MembershipResult, SegmentDiagnostic};
