//! Membership resolver: runs every segment of a snapshot against one user
//! and folds the matches into a single [`MembershipResult`].

use std::collections::BTreeSet;

use daffodil_core::{AttributeSet, Sequence};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

use crate::catalog::{CatalogSnapshot, SegmentId};
use crate::engine::{evaluate, MalformedRuleError};

/// A segment skipped during resolution because its rule could not be
/// evaluated.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentDiagnostic {
    pub segment_id: SegmentId,
    pub segment_name: String,
    pub error: MalformedRuleError,
}

/// Complete membership state for one user. Never patched: the next
/// evaluation for the same user replaces it wholesale.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MembershipResult {
    pub user_id: String,
    pub matched_segments: BTreeSet<String>,
    pub merged_payload: Map<String, Value>,
    pub evaluated_at: Sequence,
    pub catalog_version: u64,
    #[serde(skip)]
    pub diagnostics: Vec<SegmentDiagnostic>,
}

impl MembershipResult {
    pub fn is_empty(&self) -> bool {
        self.matched_segments.is_empty()
    }
}

/// Resolve `user_id`'s memberships against `snapshot`.
///
/// Segments are visited in ascending id order and matching payloads are
/// merged key by key, so the highest matching id wins any conflict. A segment
/// whose rule is malformed counts as a non-match and is reported in
/// `diagnostics`.
pub fn resolve(
    user_id: &str,
    attrs: &AttributeSet,
    snapshot: &CatalogSnapshot,
    evaluated_at: Sequence,
) -> MembershipResult {
    let mut matched_segments = BTreeSet::new();
    let mut merged_payload = Map::new();
    let mut diagnostics = Vec::new();

    for segment in snapshot.segments() {
        match evaluate(&segment.rule, attrs) {
            Ok(true) => {
                matched_segments.insert(segment.name.clone());
                for (key, value) in &segment.payload {
                    merged_payload.insert(key.clone(), value.clone());
                }
            }
            Ok(false) => {}
            Err(error) => {
                warn!(
                    user_id = %user_id,
                    segment_id = %segment.id,
                    error = %error,
                    "Skipping segment with malformed rule"
                );
                metrics::counter!("resolver.malformed_rules").increment(1);
                diagnostics.push(SegmentDiagnostic {
                    segment_id: segment.id.clone(),
                    segment_name: segment.name.clone(),
                    error,
                });
            }
        }
    }

    metrics::counter!("resolver.users_resolved").increment(1);
    metrics::histogram!("resolver.segments_matched").record(matched_segments.len() as f64);

    MembershipResult {
        user_id: user_id.to_string(),
        matched_segments,
        merged_payload,
        evaluated_at,
        catalog_version: snapshot.version(),
        diagnostics,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::builder::SegmentBuilder;
    use crate::catalog::Segment;
    use crate::predicates::{LogicalOperator, RuleNode};
    use daffodil_core::{SegmentRecord, Scalar};
    use proptest::prelude::*;
    use serde_json::json;

    fn attrs(orders: i64) -> AttributeSet {
        [("orders_23d", Scalar::Int(orders))].into_iter().collect()
    }

    fn discount_segments() -> Vec<Segment> {
        vec![
            SegmentBuilder::new("1", "Regular")
                .attribute_gt("orders_23d", 0)
                .payload("discount_pct", json!(10))
                .payload("banner", json!("welcome"))
                .build(),
            SegmentBuilder::new("2", "Power User")
                .attribute_gt("orders_23d", 5)
                .payload("discount_pct", json!(15))
                .build(),
        ]
    }

    #[test]
    fn test_higher_id_wins_payload_conflict() {
        let snapshot = CatalogSnapshot::from_segments(1, discount_segments());
        let result = resolve("u1", &attrs(9), &snapshot, Sequence(1));

        assert_eq!(
            result.matched_segments,
            BTreeSet::from(["Regular".to_string(), "Power User".to_string()])
        );
        assert_eq!(result.merged_payload.get("discount_pct"), Some(&json!(15)));
        assert_eq!(result.merged_payload.get("banner"), Some(&json!("welcome")));
    }

    #[test]
    fn test_merge_independent_of_input_order() {
        let mut reversed = discount_segments();
        reversed.reverse();
        let a = resolve("u1", &attrs(9), &CatalogSnapshot::from_segments(1, discount_segments()), Sequence(1));
        let b = resolve("u1", &attrs(9), &CatalogSnapshot::from_segments(1, reversed), Sequence(1));
        assert_eq!(a, b);
        assert_eq!(a.merged_payload, json!({"discount_pct": 15, "banner": "welcome"}).as_object().cloned().unwrap());
    }

    #[test]
    fn test_no_match_yields_empty_result() {
        let snapshot = CatalogSnapshot::from_segments(1, discount_segments());
        let result = resolve("u1", &attrs(0), &snapshot, Sequence(1));
        assert!(result.is_empty());
        assert!(result.merged_payload.is_empty());
    }

    #[test]
    fn test_malformed_segment_is_skipped() {
        let mut segments = discount_segments();
        segments.push(Segment {
            id: SegmentId::new("3"),
            name: "Broken".into(),
            rule: RuleNode::Logical {
                op: LogicalOperator::Not,
                children: vec![],
            },
            payload: Map::new(),
        });
        let snapshot = CatalogSnapshot::from_segments(1, segments);
        let result = resolve("u1", &attrs(9), &snapshot, Sequence(1));

        assert_eq!(result.matched_segments.len(), 2);
        assert_eq!(result.diagnostics.len(), 1);
        assert_eq!(result.diagnostics[0].segment_name, "Broken");
        assert_eq!(result.diagnostics[0].error, MalformedRuleError::NotArity(0));
    }

    #[test]
    fn test_unparsable_record_does_not_affect_others() {
        let mut records: Vec<SegmentRecord> =
            discount_segments().iter().map(Segment::to_record).collect();
        records.insert(
            1,
            SegmentRecord {
                id: "15".into(),
                name: "Garbage".into(),
                rule_logic: json!({"??": "not a rule"}),
                payload: json!({"discount_pct": 99}),
            },
        );
        let snapshot = CatalogSnapshot::from_records(1, &records);

        for orders in [0, 3, 9] {
            let expected = resolve(
                "u1",
                &attrs(orders),
                &CatalogSnapshot::from_segments(1, discount_segments()),
                Sequence(1),
            );
            assert_eq!(resolve("u1", &attrs(orders), &snapshot, Sequence(1)), expected);
        }
    }

    #[test]
    fn test_result_records_sequence_and_version() {
        let snapshot = CatalogSnapshot::from_segments(42, discount_segments());
        let result = resolve("u1", &attrs(1), &snapshot, Sequence(7));
        assert_eq!(result.evaluated_at, Sequence(7));
        assert_eq!(result.catalog_version, 42);
    }

    proptest! {
        #[test]
        fn prop_last_matching_id_wins(values in prop::collection::vec((any::<bool>(), 0i64..100), 1..12)) {
            let segments: Vec<Segment> = values
                .iter()
                .enumerate()
                .map(|(i, (matches, v))| {
                    SegmentBuilder::new(i.to_string(), format!("seg-{i}"))
                        .rule(RuleNode::lit(*matches))
                        .payload("value", json!(v))
                        .build()
                })
                .collect();
            let mut shuffled = segments.clone();
            shuffled.rotate_left(values.len() / 2);

            let result = resolve("u", &AttributeSet::new(), &CatalogSnapshot::from_segments(1, shuffled), Sequence(1));
            let expected = values.iter().rev().find(|(m, _)| *m).map(|(_, v)| json!(v));
            prop_assert_eq!(result.merged_payload.get("value").cloned(), expected);
        }
    }
}
