use thiserror::Error;

use super::resource::{ResourceId, ResourceType};

#[derive(Debug, Error)]
pub enum Error {
	#[error("registry store is unavailable: {0}")]
	Unavailable(String),
	#[cfg(feature = "sqlite")]
	#[error("registry database error: {0}")]
	Database(#[from] sqlx::Error),
	#[error("invalid registry row <type='{resource_type}', id='{resource_id}'>: {reason}")]
	InvalidRow {
		resource_type: ResourceType,
		resource_id: ResourceId,
		reason: String,
	},
	#[error("resource id {0} doesn't fit the registry's id column")]
	IdOutOfRange(ResourceId),
}
