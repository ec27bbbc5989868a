//!
//! # Geo Core
//!
//! Job dispatch and reconciliation for a secondary node replicating resources from its primary.
//!
//! The pieces, bottom up:
//! - [`catalog`]: the primary's inventory, over HTTP and behind a TTL cache;
//! - [`finder`]: diffs that inventory against the registry to find what needs work;
//! - [`job_finder`]: one bounded, duplicate free batch of jobs per resource type;
//! - [`replicator`]: how one blob or repository is fetched, verified and recorded;
//! - [`scheduler`]: the dispatch loop feeding a bounded worker pool;
//! - [`consistency`]: cleanup of entries whose resource the primary deleted;
//!
//! Everything is built from an explicit [`NodeContext`] and [`GeoConfig`], nothing is global, so
//! several nodes can live in one process.

#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

pub mod cache;
pub mod catalog;
pub mod config;
pub mod consistency;
pub mod context;
pub mod finder;
pub mod job_finder;
pub mod replicator;
pub mod scheduler;
pub mod status;

pub use config::{GeoConfig, RegistryBackend};
pub use context::NodeContext;
pub use job_finder::{JobDescriptor, JobFinder};
pub use scheduler::{DispatchScheduler, SchedulerError, SchedulerState, TickReport};
pub use status::{GeoStatus, TypeStatus};

pub use geo_registry as registry;
