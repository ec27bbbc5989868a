use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};

/// Identifier of a resource in the primary's resource table.
pub type ResourceId = u64;

/// How a resource's content travels from the primary to the secondary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransferKind {
	/// A single file fetched over HTTP.
	Blob,
	/// A git repository fetched with the git protocol.
	Repository,
}

/// Every kind of replicable resource, in the canonical dispatch order.
#[derive(
	Debug,
	Clone,
	Copy,
	PartialEq,
	Eq,
	PartialOrd,
	Ord,
	Hash,
	Serialize,
	Deserialize,
	AsRefStr,
	Display,
	EnumIter,
	EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ResourceType {
	Upload,
	LfsObject,
	JobArtifact,
	PackageFile,
	ProjectRepository,
	WikiRepository,
}

/// Static description of a resource type, everything the finders, transports and scheduler
/// need to know about it without one implementation per type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceTypeDescriptor {
	pub resource_type: ResourceType,
	pub name: &'static str,
	pub transfer: TransferKind,
	/// Path segment identifying this type on the primary's internal API.
	pub primary_path: &'static str,
	pub default_timeout: Duration,
}

const BLOB_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const REPOSITORY_TIMEOUT: Duration = Duration::from_secs(60 * 60);

const DESCRIPTORS: [ResourceTypeDescriptor; 6] = [
	ResourceTypeDescriptor {
		resource_type: ResourceType::Upload,
		name: "upload",
		transfer: TransferKind::Blob,
		primary_path: "uploads",
		default_timeout: BLOB_TIMEOUT,
	},
	ResourceTypeDescriptor {
		resource_type: ResourceType::LfsObject,
		name: "lfs_object",
		transfer: TransferKind::Blob,
		primary_path: "lfs_objects",
		default_timeout: BLOB_TIMEOUT,
	},
	ResourceTypeDescriptor {
		resource_type: ResourceType::JobArtifact,
		name: "job_artifact",
		transfer: TransferKind::Blob,
		primary_path: "job_artifacts",
		default_timeout: BLOB_TIMEOUT,
	},
	ResourceTypeDescriptor {
		resource_type: ResourceType::PackageFile,
		name: "package_file",
		transfer: TransferKind::Blob,
		primary_path: "package_files",
		default_timeout: BLOB_TIMEOUT,
	},
	ResourceTypeDescriptor {
		resource_type: ResourceType::ProjectRepository,
		name: "project_repository",
		transfer: TransferKind::Repository,
		primary_path: "project_repositories",
		default_timeout: REPOSITORY_TIMEOUT,
	},
	ResourceTypeDescriptor {
		resource_type: ResourceType::WikiRepository,
		name: "wiki_repository",
		transfer: TransferKind::Repository,
		primary_path: "wiki_repositories",
		default_timeout: REPOSITORY_TIMEOUT,
	},
];

impl ResourceType {
	#[must_use]
	pub const fn descriptor(self) -> &'static ResourceTypeDescriptor {
		match self {
			Self::Upload => &DESCRIPTORS[0],
			Self::LfsObject => &DESCRIPTORS[1],
			Self::JobArtifact => &DESCRIPTORS[2],
			Self::PackageFile => &DESCRIPTORS[3],
			Self::ProjectRepository => &DESCRIPTORS[4],
			Self::WikiRepository => &DESCRIPTORS[5],
		}
	}

	#[must_use]
	pub const fn transfer(self) -> TransferKind {
		self.descriptor().transfer
	}

	/// All resource types in canonical order.
	pub fn all() -> impl Iterator<Item = Self> {
		Self::iter()
	}
}
