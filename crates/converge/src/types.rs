//! Core types for reconciliation

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Attribute mapping of a declared or observed object.
pub type Attributes = Map<String, Value>;

/// How a resource kind behaves after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Lifecycle {
    /// Regular CRUD object.
    #[default]
    Mutable,
    /// Result of a single call; update and delete never reach the remote.
    WriteOnce,
    /// Read-only lookup, refreshed on every pass and never created remotely.
    DataSource,
}

/// Operation selected for an instance in a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    NoOp,
    Create,
    Update,
    /// Delete the old identity, then create a new one.
    Replace,
    Delete,
    Import,
    /// Data source refresh.
    Read,
}

impl Action {
    /// Check if the action changes remote or recorded state
    pub fn is_change(&self) -> bool {
        !matches!(self, Self::NoOp | Self::Read)
    }

    /// Plan symbol
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::NoOp => " ",
            Self::Create => "+",
            Self::Update => "~",
            Self::Replace => "-/+",
            Self::Delete => "-",
            Self::Import => "<=",
            Self::Read => "<=",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoOp => "no-op",
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::Import => "import",
            Self::Read => "read",
        };
        write!(f, "{name}")
    }
}

/// Result of reconciling one instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyResult {
    /// No changes needed
    NoChange,
    Created,
    Updated,
    Replaced,
    /// Removed, remotely or locally per the delete policy
    Deleted,
    Imported,
    /// Data source refreshed
    Refreshed,
    Failed { error: String },
    Skipped { reason: String },
}

impl ApplyResult {
    /// Check if the result represents success (no failure)
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }

    /// Check if the result represents a change
    pub fn is_change(&self) -> bool {
        matches!(
            self,
            Self::Created | Self::Updated | Self::Replaced | Self::Deleted | Self::Imported
        )
    }
}

/// Summary of execution results
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteSummary {
    pub created: usize,
    pub updated: usize,
    pub replaced: usize,
    pub deleted: usize,
    pub imported: usize,
    pub refreshed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub no_change: usize,
}

impl ExecuteSummary {
    /// Total number of actual changes made
    pub fn total_changes(&self) -> usize {
        self.created + self.updated + self.replaced + self.deleted + self.imported
    }

    /// Check if execution was fully successful (no failures)
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    /// Total number of instances processed
    pub fn total(&self) -> usize {
        self.total_changes() + self.refreshed + self.skipped + self.failed + self.no_change
    }

    /// Merge another summary into this one
    pub fn merge(&mut self, other: &Self) {
        self.created += other.created;
        self.updated += other.updated;
        self.replaced += other.replaced;
        self.deleted += other.deleted;
        self.imported += other.imported;
        self.refreshed += other.refreshed;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.no_change += other.no_change;
    }

    /// Add a result to the summary
    pub fn add_result(&mut self, result: &ApplyResult) {
        match result {
            ApplyResult::NoChange => self.no_change += 1,
            ApplyResult::Created => self.created += 1,
            ApplyResult::Updated => self.updated += 1,
            ApplyResult::Replaced => self.replaced += 1,
            ApplyResult::Deleted => self.deleted += 1,
            ApplyResult::Imported => self.imported += 1,
            ApplyResult::Refreshed => self.refreshed += 1,
            ApplyResult::Failed { .. } => self.failed += 1,
            ApplyResult::Skipped { .. } => self.skipped += 1,
        }
    }
}

/// Options for a reconciliation pass
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Compute the plan without executing it
    pub dry_run: bool,
    /// Number of instances reconciled in parallel
    pub jobs: usize,
    /// Limit the pass to instances matching "kind" or "kind.name"
    pub target: Option<String>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            jobs: 4,
            target: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_counts() {
        let mut summary = ExecuteSummary::default();
        for result in [
            ApplyResult::Created,
            ApplyResult::Deleted,
            ApplyResult::NoChange,
            ApplyResult::Refreshed,
            ApplyResult::Failed {
                error: "boom".into(),
            },
        ] {
            summary.add_result(&result);
        }

        assert_eq!(summary.total_changes(), 2);
        assert_eq!(summary.total(), 5);
        assert!(!summary.is_success());
    }

    #[test]
    fn test_action_change_classification() {
        assert!(Action::Replace.is_change());
        assert!(!Action::Read.is_change());
        assert!(!Action::NoOp.is_change());
        assert_eq!(Action::Replace.symbol(), "-/+");
    }
}
