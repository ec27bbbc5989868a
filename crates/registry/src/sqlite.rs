use std::{collections::HashMap, path::Path, str::FromStr};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
	sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
	QueryBuilder, Row, Sqlite, SqlitePool,
};
use tracing::debug;

use super::{
	entry::{FailureKind, RegistryEntry, StateCounts, SyncState},
	error::Error,
	resource::{ResourceId, ResourceType},
	store::RegistryStore,
};

const SELECT_COLUMNS: &str = "SELECT resource_type, resource_id, state, retry_count, retry_at_ms, \
	last_synced_at_ms, checksum, missing_on_primary, checksum_mismatch_count, last_failure, \
	last_failure_kind FROM geo_registry";

// Stays well below SQLite's bound parameter limit.
const IN_CLAUSE_CHUNK: usize = 500;

/// Registry persisted in a single SQLite table keyed by `(resource_type, resource_id)`.
#[derive(Debug, Clone)]
pub struct SqliteRegistry {
	pool: SqlitePool,
}

impl SqliteRegistry {
	/// Opens (creating if needed) the registry database at `path`.
	pub async fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
		let options = SqliteConnectOptions::new()
			.filename(path.as_ref())
			.create_if_missing(true);

		let pool = SqlitePoolOptions::new()
			.max_connections(4)
			.connect_with(options)
			.await?;

		Self::with_pool(pool).await
	}

	/// A registry living in a private in-memory database, gone once dropped.
	pub async fn in_memory() -> Result<Self, Error> {
		let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

		// Every connection to `:memory:` is a distinct database, so we pin a single one
		let pool = SqlitePoolOptions::new()
			.max_connections(1)
			.min_connections(1)
			.idle_timeout(None)
			.max_lifetime(None)
			.connect_with(options)
			.await?;

		Self::with_pool(pool).await
	}

	pub async fn with_pool(pool: SqlitePool) -> Result<Self, Error> {
		let this = Self { pool };
		this.ensure_schema().await?;
		Ok(this)
	}

	async fn ensure_schema(&self) -> Result<(), Error> {
		sqlx::query(
			"CREATE TABLE IF NOT EXISTS geo_registry (
				resource_type TEXT NOT NULL,
				resource_id INTEGER NOT NULL,
				state TEXT NOT NULL,
				retry_count INTEGER NOT NULL DEFAULT 0,
				retry_at_ms INTEGER NULL,
				last_synced_at_ms INTEGER NULL,
				checksum TEXT NULL,
				missing_on_primary INTEGER NOT NULL DEFAULT 0,
				checksum_mismatch_count INTEGER NOT NULL DEFAULT 0,
				last_failure TEXT NULL,
				last_failure_kind TEXT NULL,
				PRIMARY KEY (resource_type, resource_id)
			)",
		)
		.execute(&self.pool)
		.await?;

		sqlx::query(
			"CREATE INDEX IF NOT EXISTS geo_registry_state_idx
				ON geo_registry (resource_type, state, resource_id)",
		)
		.execute(&self.pool)
		.await?;

		debug!("Registry schema ready");

		Ok(())
	}

	async fn fetch_page(
		&self,
		resource_type: ResourceType,
		filter: &str,
		state: Option<SyncState>,
		limit: usize,
		offset_after: Option<ResourceId>,
	) -> Result<Vec<RegistryEntry>, Error> {
		let mut builder = QueryBuilder::<Sqlite>::new(SELECT_COLUMNS);
		builder
			.push(" WHERE resource_type = ")
			.push_bind(resource_type.to_string())
			.push(" AND resource_id > ")
			.push_bind(offset_after.map_or(Ok(-1), to_db_id)?);

		if let Some(state) = state {
			builder.push(" AND state = ").push_bind(state.to_string());
		}

		builder
			.push(filter)
			.push(" ORDER BY resource_id ASC LIMIT ")
			.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));

		builder
			.build()
			.fetch_all(&self.pool)
			.await?
			.iter()
			.map(entry_from_row)
			.collect()
	}
}

fn to_db_id(id: ResourceId) -> Result<i64, Error> {
	i64::try_from(id).map_err(|_| Error::IdOutOfRange(id))
}

fn ms_to_dt(ms: Option<i64>) -> Option<DateTime<Utc>> {
	ms.and_then(DateTime::from_timestamp_millis)
}

fn entry_from_row(row: &SqliteRow) -> Result<RegistryEntry, Error> {
	let resource_type = row.try_get::<String, _>("resource_type")?;
	let resource_id = row.try_get::<i64, _>("resource_id")?;

	let resource_type =
		ResourceType::from_str(&resource_type).map_err(|e| Error::Unavailable(format!(
			"unknown resource type '{resource_type}' in registry: {e}"
		)))?;

	let resource_id = ResourceId::try_from(resource_id).map_err(|_| Error::Unavailable(format!(
		"negative resource id {resource_id} in registry"
	)))?;

	let invalid = |reason: String| Error::InvalidRow {
		resource_type,
		resource_id,
		reason,
	};

	let state = row.try_get::<String, _>("state")?;
	let state = SyncState::from_str(&state).map_err(|e| invalid(format!("state '{state}': {e}")))?;

	let last_failure_kind = row
		.try_get::<Option<String>, _>("last_failure_kind")?
		.map(|kind| {
			FailureKind::from_str(&kind).map_err(|e| invalid(format!("failure kind '{kind}': {e}")))
		})
		.transpose()?;

	let retry_count = u32::try_from(row.try_get::<i64, _>("retry_count")?)
		.map_err(|e| invalid(format!("retry_count: {e}")))?;
	let checksum_mismatch_count = u32::try_from(row.try_get::<i64, _>("checksum_mismatch_count")?)
		.map_err(|e| invalid(format!("checksum_mismatch_count: {e}")))?;

	Ok(RegistryEntry {
		resource_type,
		resource_id,
		state,
		retry_count,
		retry_at: ms_to_dt(row.try_get("retry_at_ms")?),
		last_synced_at: ms_to_dt(row.try_get("last_synced_at_ms")?),
		checksum: row.try_get("checksum")?,
		missing_on_primary: row.try_get("missing_on_primary")?,
		checksum_mismatch_count,
		last_failure: row.try_get("last_failure")?,
		last_failure_kind,
	})
}

fn count(row: &SqliteRow, column: &str) -> Result<u64, Error> {
	Ok(u64::try_from(row.try_get::<i64, _>(column)?).unwrap_or_default())
}

#[async_trait]
impl RegistryStore for SqliteRegistry {
	async fn find(
		&self,
		resource_type: ResourceType,
		resource_id: ResourceId,
	) -> Result<Option<RegistryEntry>, Error> {
		sqlx::query(&format!(
			"{SELECT_COLUMNS} WHERE resource_type = ? AND resource_id = ?"
		))
		.bind(resource_type.to_string())
		.bind(to_db_id(resource_id)?)
		.fetch_optional(&self.pool)
		.await?
		.as_ref()
		.map(entry_from_row)
		.transpose()
	}

	async fn find_many(
		&self,
		resource_type: ResourceType,
		resource_ids: &[ResourceId],
	) -> Result<HashMap<ResourceId, RegistryEntry>, Error> {
		let mut found = HashMap::with_capacity(resource_ids.len());

		for chunk in resource_ids.chunks(IN_CLAUSE_CHUNK) {
			let mut builder = QueryBuilder::<Sqlite>::new(SELECT_COLUMNS);
			builder
				.push(" WHERE resource_type = ")
				.push_bind(resource_type.to_string())
				.push(" AND resource_id IN (");

			let mut separated = builder.separated(", ");
			for id in chunk {
				separated.push_bind(to_db_id(*id)?);
			}
			separated.push_unseparated(")");

			for row in builder.build().fetch_all(&self.pool).await? {
				let entry = entry_from_row(&row)?;
				found.insert(entry.resource_id, entry);
			}
		}

		Ok(found)
	}

	async fn upsert(&self, entry: &RegistryEntry) -> Result<(), Error> {
		sqlx::query(
			"INSERT INTO geo_registry (
				resource_type, resource_id, state, retry_count, retry_at_ms, last_synced_at_ms,
				checksum, missing_on_primary, checksum_mismatch_count, last_failure, last_failure_kind
			) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
			ON CONFLICT (resource_type, resource_id) DO UPDATE SET
				state = excluded.state,
				retry_count = excluded.retry_count,
				retry_at_ms = excluded.retry_at_ms,
				last_synced_at_ms = excluded.last_synced_at_ms,
				checksum = excluded.checksum,
				missing_on_primary = excluded.missing_on_primary,
				checksum_mismatch_count = excluded.checksum_mismatch_count,
				last_failure = excluded.last_failure,
				last_failure_kind = excluded.last_failure_kind",
		)
		.bind(entry.resource_type.to_string())
		.bind(to_db_id(entry.resource_id)?)
		.bind(entry.state.to_string())
		.bind(i64::from(entry.retry_count))
		.bind(entry.retry_at.map(|dt| dt.timestamp_millis()))
		.bind(entry.last_synced_at.map(|dt| dt.timestamp_millis()))
		.bind(entry.checksum.as_deref())
		.bind(entry.missing_on_primary)
		.bind(i64::from(entry.checksum_mismatch_count))
		.bind(entry.last_failure.as_deref())
		.bind(entry.last_failure_kind.map(|kind| kind.to_string()))
		.execute(&self.pool)
		.await?;

		Ok(())
	}

	async fn query_by_state(
		&self,
		resource_type: ResourceType,
		state: SyncState,
		limit: usize,
		offset_after: Option<ResourceId>,
	) -> Result<Vec<RegistryEntry>, Error> {
		self.fetch_page(resource_type, "", Some(state), limit, offset_after)
			.await
	}

	async fn query_missing_on_primary(
		&self,
		resource_type: ResourceType,
		limit: usize,
		offset_after: Option<ResourceId>,
	) -> Result<Vec<RegistryEntry>, Error> {
		self.fetch_page(
			resource_type,
			" AND missing_on_primary = 1",
			None,
			limit,
			offset_after,
		)
		.await
	}

	async fn list(
		&self,
		resource_type: ResourceType,
		limit: usize,
		offset_after: Option<ResourceId>,
	) -> Result<Vec<RegistryEntry>, Error> {
		self.fetch_page(resource_type, "", None, limit, offset_after)
			.await
	}

	async fn delete(
		&self,
		resource_type: ResourceType,
		resource_id: ResourceId,
	) -> Result<bool, Error> {
		let result =
			sqlx::query("DELETE FROM geo_registry WHERE resource_type = ? AND resource_id = ?")
				.bind(resource_type.to_string())
				.bind(to_db_id(resource_id)?)
				.execute(&self.pool)
				.await?;

		Ok(result.rows_affected() > 0)
	}

	async fn counts(
		&self,
		resource_type: ResourceType,
		retry_ceiling: u32,
	) -> Result<StateCounts, Error> {
		let row = sqlx::query(
			"SELECT
				COALESCE(SUM(state = 'pending'), 0) AS pending,
				COALESCE(SUM(state = 'started'), 0) AS started,
				COALESCE(SUM(state = 'synced'), 0) AS synced,
				COALESCE(SUM(state = 'failed'), 0) AS failed,
				COALESCE(SUM(missing_on_primary), 0) AS missing_on_primary,
				COALESCE(SUM(state = 'failed' AND retry_count >= ?), 0) AS terminal_failures
			FROM geo_registry WHERE resource_type = ?",
		)
		.bind(i64::from(retry_ceiling))
		.bind(resource_type.to_string())
		.fetch_one(&self.pool)
		.await?;

		Ok(StateCounts {
			pending: count(&row, "pending")?,
			started: count(&row, "started")?,
			synced: count(&row, "synced")?,
			failed: count(&row, "failed")?,
			missing_on_primary: count(&row, "missing_on_primary")?,
			terminal_failures: count(&row, "terminal_failures")?,
		})
	}

	async fn reset_started(&self, resource_type: ResourceType) -> Result<u64, Error> {
		let result = sqlx::query(
			"UPDATE geo_registry SET state = 'pending' WHERE resource_type = ? AND state = 'started'",
		)
		.bind(resource_type.to_string())
		.execute(&self.pool)
		.await?;

		Ok(result.rows_affected())
	}
}
