// ABOUTME: Table-set reconciliation - diffs source and destination table names
// ABOUTME: Produces create/delete/sync actions in a deterministic application order

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// What to do with one table name.
///
/// Variant order is the application order for a single name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TableAction {
    /// Exists only in the source; create it, then sync its rows
    CreateTable,
    /// Exists only in the destination
    DeleteTable,
    /// Exists on both sides
    SyncData,
}

impl TableAction {
    pub fn label(&self) -> &'static str {
        match self {
            TableAction::CreateTable => "CREATE",
            TableAction::DeleteTable => "DELETE",
            TableAction::SyncData => "SYNC",
        }
    }

    /// Whether rows must be copied for this table.
    pub fn syncs_data(&self) -> bool {
        matches!(self, TableAction::CreateTable | TableAction::SyncData)
    }

    fn is_table_level(&self) -> bool {
        matches!(self, TableAction::CreateTable | TableAction::DeleteTable)
    }
}

impl fmt::Display for TableAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One action per table name in the union of both sides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TablePlan {
    actions: BTreeMap<String, TableAction>,
}

/// Compute the action for every table name.
///
/// Every source name syncs data; names missing at the destination are created
/// first; names only at the destination are deleted. Duplicate names collapse.
pub fn plan_table_actions<S, D>(source: S, destination: D) -> TablePlan
where
    S: IntoIterator,
    S::Item: AsRef<str>,
    D: IntoIterator,
    D::Item: AsRef<str>,
{
    let source: BTreeSet<String> = source
        .into_iter()
        .map(|n| n.as_ref().to_string())
        .collect();
    let destination: BTreeSet<String> = destination
        .into_iter()
        .map(|n| n.as_ref().to_string())
        .collect();

    let mut actions = BTreeMap::new();
    for name in &source {
        let action = if destination.contains(name) {
            TableAction::SyncData
        } else {
            TableAction::CreateTable
        };
        actions.insert(name.clone(), action);
    }
    for name in destination.difference(&source) {
        actions.insert(name.clone(), TableAction::DeleteTable);
    }

    TablePlan { actions }
}

impl TablePlan {
    pub fn get(&self, table: &str) -> Option<TableAction> {
        self.actions.get(table).copied()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// All entries ordered by name, then action.
    pub fn iter(&self) -> impl Iterator<Item = (&str, TableAction)> {
        self.actions.iter().map(|(name, action)| (name.as_str(), *action))
    }

    /// Create and delete actions, applied before any data is moved.
    pub fn table_level(&self) -> Vec<(&str, TableAction)> {
        self.iter()
            .filter(|(_, action)| action.is_table_level())
            .collect()
    }

    /// Names whose rows must be copied, in application order.
    pub fn data_level(&self) -> Vec<&str> {
        self.iter()
            .filter(|(_, action)| action.syncs_data())
            .map(|(name, _)| name)
            .collect()
    }

    /// Human-readable listing, one `LABEL name` line per table.
    pub fn render(&self) -> String {
        self.iter()
            .map(|(name, action)| format!("{:<6} {}", action.label(), name))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_source_ab_destination_bc() {
        let plan = plan_table_actions(["A", "B"], ["B", "C"]);

        assert_eq!(plan.len(), 3);
        assert_eq!(plan.get("A"), Some(TableAction::CreateTable));
        assert_eq!(plan.get("B"), Some(TableAction::SyncData));
        assert_eq!(plan.get("C"), Some(TableAction::DeleteTable));

        assert_eq!(
            plan.table_level(),
            vec![("A", TableAction::CreateTable), ("C", TableAction::DeleteTable)]
        );
        assert_eq!(plan.data_level(), vec!["A", "B"]);
    }

    #[test]
    fn test_plan_covers_union_exactly_once() {
        let source = ["orders", "users", "audit"];
        let destination = ["users", "legacy", "audit"];
        let plan = plan_table_actions(source, destination);

        let names: Vec<&str> = plan.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["audit", "legacy", "orders", "users"]);
        for name in source {
            assert!(plan.get(name).unwrap().syncs_data());
        }
        assert_eq!(plan.get("legacy"), Some(TableAction::DeleteTable));
    }

    #[test]
    fn test_plan_empty_inputs() {
        let plan = plan_table_actions(Vec::<String>::new(), Vec::<String>::new());
        assert!(plan.is_empty());
        assert!(plan.table_level().is_empty());
        assert!(plan.data_level().is_empty());
    }

    #[test]
    fn test_plan_names_are_case_sensitive() {
        let plan = plan_table_actions(["Users"], ["users"]);
        assert_eq!(plan.get("Users"), Some(TableAction::CreateTable));
        assert_eq!(plan.get("users"), Some(TableAction::DeleteTable));
    }

    #[test]
    fn test_plan_duplicates_collapse() {
        let plan = plan_table_actions(["a1x", "a1x"], ["a1x"]);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.get("a1x"), Some(TableAction::SyncData));
    }

    #[test]
    fn test_action_order_and_labels() {
        assert!(TableAction::CreateTable < TableAction::DeleteTable);
        assert!(TableAction::DeleteTable < TableAction::SyncData);
        assert_eq!(TableAction::SyncData.to_string(), "SYNC");
    }

    #[test]
    fn test_render() {
        let plan = plan_table_actions(["A", "B"], ["B", "C"]);
        assert_eq!(plan.render(), "CREATE A\nSYNC   B\nDELETE C");
    }
}
