use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// The closed stance set. `Unrelated` doubles as the default class when the
/// model answer is missing or unrecognized.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stance {
    Anti,
    Pro,
    Unrelated,
}

impl Stance {
    pub const ALL: [Stance; 3] = [Stance::Anti, Stance::Pro, Stance::Unrelated];

    pub fn default_class() -> Stance {
        Stance::Unrelated
    }
}

/// Terminal label for an item. Every item ends a run with exactly one of
/// these, never unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Label {
    Anti,
    Pro,
    Unrelated,
    Refused,
    DecodeFailed,
}

impl From<Stance> for Label {
    fn from(stance: Stance) -> Self {
        match stance {
            Stance::Anti => Label::Anti,
            Stance::Pro => Label::Pro,
            Stance::Unrelated => Label::Unrelated,
        }
    }
}

/// Which decode-cascade strategy produced an item's raw result, or that the
/// provider refused the whole batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeStatus {
    Strict,
    Repaired,
    PatternRebuilt,
    SegmentRebuilt,
    Placeholder,
    Refused,
}

/// One input record from the preparation stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentRecord {
    pub id: u64,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_key: Option<String>,
}

/// One finalized output record for the export stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifiedComment {
    pub id: u64,
    pub label: Label,
    pub confidence: f32,
    pub ambiguous: bool,
    pub decode_status: DecodeStatus,
}

/// Items sharing one context string, in input order.
#[derive(Debug, Clone)]
pub struct ClassificationGroup {
    pub context: Option<String>,
    pub items: Vec<CommentRecord>,
}

/// Groups records by their shared-context key, preserving first-seen order of
/// both groups and items. Records without a key share one context-free group.
pub fn group_by_context(records: Vec<CommentRecord>) -> Vec<ClassificationGroup> {
    let mut groups: IndexMap<Option<String>, Vec<CommentRecord>> = IndexMap::new();
    for record in records {
        groups
            .entry(record.context_key.clone())
            .or_default()
            .push(record);
    }

    groups
        .into_iter()
        .map(|(context, items)| ClassificationGroup { context, items })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u64, context_key: Option<&str>) -> CommentRecord {
        CommentRecord {
            id,
            text: format!("comment {id}"),
            context_key: context_key.map(String::from),
        }
    }

    #[test]
    fn test_stance_wire_forms() {
        use std::str::FromStr;

        assert_eq!(Stance::Anti.to_string(), "ANTI");
        assert_eq!(Stance::from_str("UNRELATED").unwrap(), Stance::Unrelated);
        assert!(Stance::from_str("MAYBE").is_err());
    }

    #[test]
    fn test_group_by_context_preserves_order() {
        let records = vec![
            record(1, Some("post-a")),
            record(2, None),
            record(3, Some("post-a")),
            record(4, Some("post-b")),
        ];

        let groups = group_by_context(records);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].context.as_deref(), Some("post-a"));
        assert_eq!(
            groups[0].items.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![1, 3]
        );
        assert_eq!(groups[1].context, None);
        assert_eq!(groups[2].context.as_deref(), Some("post-b"));
    }
}
