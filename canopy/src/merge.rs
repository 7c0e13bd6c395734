//! Multi-key merge retrieval
//!
//! Assembles one dataset out of several members of a group, each row tagged
//! with its member in [`MEMBER_COLUMN`]. Requested members that are not
//! cached are reported and left out; they never fail the request.

use crate::dataset::Dataset;
use crate::store::MEMBER_COLUMN;
use serde_json::Value;
use std::collections::HashSet;
use tracing::warn;

/// Which members of a group a caller wants
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberFilter {
    Single(String),
    List(Vec<String>),
}

impl MemberFilter {
    /// Requested members, deduplicated, in the order supplied
    pub fn into_members(self) -> Vec<String> {
        let members = match self {
            MemberFilter::Single(name) => vec![name],
            MemberFilter::List(names) => names,
        };
        let mut seen = HashSet::new();
        members
            .into_iter()
            .filter(|m| seen.insert(m.clone()))
            .collect()
    }
}

impl From<&str> for MemberFilter {
    fn from(name: &str) -> Self {
        MemberFilter::Single(name.to_string())
    }
}

impl From<String> for MemberFilter {
    fn from(name: String) -> Self {
        MemberFilter::Single(name)
    }
}

impl From<Vec<String>> for MemberFilter {
    fn from(names: Vec<String>) -> Self {
        MemberFilter::List(names)
    }
}

impl From<&[&str]> for MemberFilter {
    fn from(names: &[&str]) -> Self {
        MemberFilter::List(names.iter().map(|s| s.to_string()).collect())
    }
}

/// Result of a filtered group retrieval
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    pub data: Dataset,
    /// Requested members that were not found
    pub missing: Vec<String>,
}

/// Restrict a member-tagged dataset to the requested members
///
/// Rows follow the order members were requested, then stored order within
/// each member.
pub fn select_members(data: &Dataset, filter: MemberFilter, group: &str) -> Selection {
    let requested = filter.into_members();
    if data.is_empty() {
        return Selection {
            data: data.clone(),
            missing: Vec::new(),
        };
    }

    let available = data.distinct_strings(MEMBER_COLUMN);
    let missing: Vec<String> = requested
        .iter()
        .filter(|m| !available.contains(m))
        .cloned()
        .collect();

    if !missing.is_empty() {
        warn!(
            group,
            missing = ?missing,
            available = ?available,
            "Requested members not found in cache"
        );
    }

    let member_idx = data.column_index(MEMBER_COLUMN);
    let parts = requested.iter().filter(|m| !missing.contains(m)).map(|member| {
        data.filter_rows(|_, row| {
            member_idx.is_some_and(|idx| matches!(&row[idx], Value::String(s) if s == member))
        })
    });

    Selection {
        data: Dataset::concat(std::iter::once(Dataset::new(data.columns().to_vec())).chain(parts)),
        missing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tagged() -> Dataset {
        Dataset::from_rows(
            vec!["metric".to_string(), MEMBER_COLUMN.to_string()],
            vec![
                vec![json!("x"), json!("m1")],
                vec![json!("y"), json!("m2")],
                vec![json!("z"), json!("m1")],
            ],
        )
    }

    #[test]
    fn test_single_member_normalizes_to_list() {
        assert_eq!(MemberFilter::from("m1").into_members(), vec!["m1"]);
        assert_eq!(
            MemberFilter::List(vec!["b".into(), "a".into(), "b".into()]).into_members(),
            vec!["b", "a"]
        );
    }

    #[test]
    fn test_select_follows_requested_order() {
        let selection = select_members(&tagged(), MemberFilter::from(&["m2", "m1"][..]), "qc");
        assert!(selection.missing.is_empty());
        let metrics: Vec<&Value> = selection.data.column_values("metric").unwrap();
        assert_eq!(metrics, vec![&json!("y"), &json!("x"), &json!("z")]);
    }

    #[test]
    fn test_ghost_member_is_reported_not_raised() {
        let selection = select_members(&tagged(), MemberFilter::from(&["m1", "ghost"][..]), "qc");
        assert_eq!(selection.missing, vec!["ghost"]);
        assert_eq!(selection.data.len(), 2);
        assert_eq!(selection.data.distinct_strings(MEMBER_COLUMN), vec!["m1"]);
    }

    #[test]
    fn test_select_on_empty_dataset() {
        let selection = select_members(&Dataset::empty(), MemberFilter::from("m1"), "qc");
        assert!(selection.data.is_empty());
        assert!(selection.missing.is_empty());
    }
}
