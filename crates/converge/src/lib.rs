//! # Converge
//!
//! Declarative reconciliation of platform resources.
//!
//! Declared instances are compared against a persisted snapshot and the
//! live platform, and a minimal set of create/update/replace/delete calls
//! brings the two together.
//!
//! ## Core Concepts
//!
//! - **Controller**: Per-kind lifecycle adapter (create, read, update, delete)
//! - **Instance**: A declared resource; references to other instances are
//!   `{"$ref": "name"}` objects resolved from the snapshot
//! - **SnapshotStore**: Last-known identity and payload of every managed instance
//! - **Driver**: Plans and executes a pass in dependency order
//!
//! ## Example
//!
//! ```ignore
//! use converge::{AutoConfirm, Driver, ExecuteOptions, Instance, NoProgress, Registry, SnapshotStore};
//!
//! let mut registry = Registry::new();
//! registry.register(ProjectController::new(client));
//!
//! let store = SnapshotStore::load(path)?;
//! let instances = vec![Instance::new("demo", "project", attrs)];
//! let report = Driver::new(&registry, &store, ExecuteOptions::default())
//!     .execute(&instances, &mut NoProgress, &mut AutoConfirm)?;
//! store.save(path)?;
//! ```

#![warn(clippy::all)]

pub mod context;
pub mod controller;
pub mod diff;
pub mod drift;
pub mod executor;
pub mod planner;
pub mod policy;
pub mod reference;
pub mod snapshot;
pub mod types;

pub use apikit::{Error, Result};
pub use context::{AutoConfirm, AutoDecline, CancelToken, ConfirmCallback, NoProgress, ProgressCallback};
pub use controller::{AttrMode, Controller, Created, Imported, Registry, Schema, SharedController};
pub use diff::{AttributeDiff, Change, Diff, Source};
pub use drift::Comparator;
pub use executor::{Driver, OperationError, Outcome, Report};
pub use planner::{Instance, Plan, Step};
pub use policy::{DeleteOutcome, DeleteRule, DeleteStep};
pub use snapshot::{Entry, SNAPSHOT_VERSION, Snapshot, SnapshotStore};
pub use types::{Action, ApplyResult, Attributes, ExecuteOptions, ExecuteSummary, Lifecycle};
