//! Desired-vs-observed diffing into ordered mutation groups.
//!
//! Some remote APIs need a separate call per attribute category, so a diff
//! yields zero or more [`MutationGroup`]s. Groups always come out in the
//! order they were declared, never in the order fields happened to differ.

use crate::error::ConvergeResult;
use crate::status::{AttrValue, Attributes, AttributesExt};

/// Attributes that must be sent together in one update call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationGroup {
    /// Group name, used in logs and in the update request.
    pub name: String,
    /// Changed attributes with their desired values.
    pub attrs: Attributes,
}

/// Computes the mutations needed to move `observed` to `desired`.
pub trait ConfigDiff: Send + Sync {
    /// Returns the mutation groups to apply, in a fixed order; empty when
    /// nothing differs. Errors reject transitions the API cannot make.
    fn diff(
        &self,
        desired: &Attributes,
        observed: &Attributes,
    ) -> ConvergeResult<Vec<MutationGroup>>;
}

/// Field-by-field diff over a declared list of groups.
///
/// Attributes not named by any group are ignored (computed or immutable).
/// A field missing from `desired` is treated as explicitly unset.
#[derive(Debug, Clone, Default)]
pub struct GroupedDiff {
    groups: Vec<(String, Vec<String>)>,
}

impl GroupedDiff {
    /// Creates an empty diff.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares the next group and the fields that belong to it.
    pub fn group<I, S>(mut self, name: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups
            .push((name.into(), fields.into_iter().map(Into::into).collect()));
        self
    }

    /// Group names in declared order.
    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(|(name, _)| name.as_str())
    }

    /// Returns true if any mutable field differs.
    pub fn has_changes(&self, desired: &Attributes, observed: &Attributes) -> bool {
        self.changed_groups(desired, observed).next().is_some()
    }

    fn changed_groups<'a>(
        &'a self,
        desired: &'a Attributes,
        observed: &'a Attributes,
    ) -> impl Iterator<Item = MutationGroup> + 'a {
        self.groups.iter().filter_map(move |(name, fields)| {
            let attrs: Attributes = fields
                .iter()
                .filter(|f| desired.value_or_null(f) != observed.value_or_null(f))
                .map(|f| (f.clone(), desired.get(f).cloned().unwrap_or(AttrValue::Null)))
                .collect();
            (!attrs.is_empty()).then(|| MutationGroup {
                name: name.clone(),
                attrs,
            })
        })
    }
}

impl ConfigDiff for GroupedDiff {
    fn diff(
        &self,
        desired: &Attributes,
        observed: &Attributes,
    ) -> ConvergeResult<Vec<MutationGroup>> {
        Ok(self.changed_groups(desired, observed).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs;
    use pretty_assertions::assert_eq;

    fn diff() -> GroupedDiff {
        GroupedDiff::new()
            .group("settings", ["priority", "compute_environments"])
            .group("state", ["state"])
    }

    #[test]
    fn test_no_changes() {
        let a = attrs! { "priority" => 1i64, "state" => "ENABLED", "arn" => "arn:1" };
        let b = attrs! { "priority" => 1i64, "state" => "ENABLED", "arn" => "arn:2" };
        assert!(diff().diff(&a, &b).unwrap().is_empty());
        assert!(!diff().has_changes(&a, &b));
    }

    #[test]
    fn test_declared_order_not_diff_order() {
        let desired = attrs! { "state" => "DISABLED", "priority" => 5i64 };
        let observed = attrs! { "state" => "ENABLED", "priority" => 1i64 };

        let groups = diff().diff(&desired, &observed).unwrap();
        let names: Vec<_> = groups.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["settings", "state"]);
        assert_eq!(groups[0].attrs, attrs! { "priority" => 5i64 });
        assert_eq!(groups[1].attrs, attrs! { "state" => "DISABLED" });
    }

    #[test]
    fn test_only_changed_fields_in_group() {
        let desired = attrs! {
            "priority" => 1i64,
            "compute_environments" => vec!["ce-b", "ce-a"],
        };
        let observed = attrs! {
            "priority" => 1i64,
            "compute_environments" => vec!["ce-a", "ce-b"],
        };

        let groups = diff().diff(&desired, &observed).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(
            groups[0].attrs,
            attrs! { "compute_environments" => vec!["ce-b", "ce-a"] }
        );
    }

    #[test]
    fn test_missing_desired_field_is_unset() {
        let desired = attrs! { "state" => "ENABLED" };
        let observed = attrs! { "state" => "ENABLED", "priority" => 3i64 };

        let groups = diff().diff(&desired, &observed).unwrap();
        assert_eq!(groups[0].attrs.get("priority"), Some(&AttrValue::Null));
        assert_eq!(diff().group_names().collect::<Vec<_>>(), vec!["settings", "state"]);
    }
}
