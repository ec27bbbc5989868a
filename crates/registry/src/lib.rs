//!
//! # Geo Registry
//!
//! Secondary-side bookkeeping for replicated resources. Every resource the secondary knows about
//! has exactly one [`RegistryEntry`] keyed by `(resource_type, resource_id)`, tracking whether it
//! was never attempted, is being synced right now, is synced, or failed.
//!
//! Stores are pluggable through the [`RegistryStore`] trait:
//! - [`InMemoryRegistry`] keeps everything in a process-local ordered map, used for tests and
//!   ephemeral nodes;
//! - [`SqliteRegistry`] persists entries in a SQLite table (behind the `sqlite` feature);
//!
//! State transitions are pure methods on [`RegistryEntry`], so the replicators decide *what*
//! changes and the store only decides *where* it is written.

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

mod entry;
mod error;
mod memory;
mod resource;
#[cfg(feature = "sqlite")]
mod sqlite;
mod store;

pub use entry::{FailureKind, RegistryEntry, StateCounts, SyncState};
pub use error::Error as RegistryError;
pub use memory::InMemoryRegistry;
pub use resource::{ResourceId, ResourceType, ResourceTypeDescriptor, TransferKind};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteRegistry;
pub use store::RegistryStore;
