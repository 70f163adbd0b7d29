//! Chart release actions for namespaces
//!
//! Runs `upgrade` and `rollback` against the release belonging to a namespace.
//! Each action spawns its own release engine on a local, OS-assigned port,
//! points the chart tool at it, and tears the engine down when the action ends.
//!
//! # Flow
//!
//! ```text
//! action ──► ReleaseStore (persist externalId, fetch template files)
//!        ──► chart dir on disk
//!        ──► ReleaseEngine (tiller on 127.0.0.1:<port>)
//!        ──► ChartTool (helm upgrade / rollback, HELM_HOST=<port>)
//! ```

#![deny(missing_docs)]

pub mod action;
pub mod chart;
pub mod engine;
pub mod error;
pub mod store;
pub mod templates;

pub use action::{ReleaseActions, ReleaseConfig};
pub use chart::ChartTool;
pub use engine::{ephemeral_port, ReleaseEngine};
pub use error::{Error, Result};
pub use store::{KubeReleaseStore, ReleaseStore, TemplateFile};
