use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use super::resource::{ResourceId, ResourceType};

/// Sync state of a single registry entry.
#[derive(
	Debug,
	Clone,
	Copy,
	PartialEq,
	Eq,
	Hash,
	Serialize,
	Deserialize,
	AsRefStr,
	Display,
	EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SyncState {
	Pending,
	Started,
	Synced,
	Failed,
}

/// Why the last sync attempt of an entry failed.
#[derive(
	Debug,
	Clone,
	Copy,
	PartialEq,
	Eq,
	Hash,
	Serialize,
	Deserialize,
	AsRefStr,
	Display,
	EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
	Transport,
	Timeout,
	ChecksumMismatch,
	MissingOnPrimary,
}

/// Secondary-side tracking record for one replicable resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
	pub resource_type: ResourceType,
	pub resource_id: ResourceId,
	pub state: SyncState,
	pub retry_count: u32,
	/// Earliest moment a failed entry may be picked up again.
	pub retry_at: Option<DateTime<Utc>>,
	pub last_synced_at: Option<DateTime<Utc>>,
	pub checksum: Option<String>,
	pub missing_on_primary: bool,
	pub checksum_mismatch_count: u32,
	pub last_failure: Option<String>,
	pub last_failure_kind: Option<FailureKind>,
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
	TimeDelta::from_std(delay)
		.ok()
		.and_then(|delta| now.checked_add_signed(delta))
		.unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl RegistryEntry {
	/// A fresh entry for a resource that was never attempted.
	#[must_use]
	pub const fn pending(resource_type: ResourceType, resource_id: ResourceId) -> Self {
		Self {
			resource_type,
			resource_id,
			state: SyncState::Pending,
			retry_count: 0,
			retry_at: None,
			last_synced_at: None,
			checksum: None,
			missing_on_primary: false,
			checksum_mismatch_count: 0,
			last_failure: None,
			last_failure_kind: None,
		}
	}

	/// Whether the primary ever served this resource to us.
	#[must_use]
	pub const fn previously_existed(&self) -> bool {
		self.checksum.is_some() || self.last_synced_at.is_some()
	}

	/// Whether a backoff delay is still running at `now`.
	#[must_use]
	pub fn is_backing_off(&self, now: DateTime<Utc>) -> bool {
		self.retry_at.is_some_and(|retry_at| retry_at > now)
	}

	pub fn start(&mut self) {
		self.state = SyncState::Started;
	}

	pub fn succeed(&mut self, checksum: impl Into<String>, now: DateTime<Utc>) {
		self.state = SyncState::Synced;
		self.checksum = Some(checksum.into());
		self.last_synced_at = Some(now);
		self.retry_count = 0;
		self.retry_at = None;
		self.missing_on_primary = false;
		self.last_failure = None;
		self.last_failure_kind = None;
	}

	/// Network errors, unexpected statuses and timeouts, all count against the retry ceiling.
	pub fn fail_transport(
		&mut self,
		kind: FailureKind,
		reason: impl Into<String>,
		now: DateTime<Utc>,
		backoff: Duration,
	) {
		self.state = SyncState::Failed;
		self.retry_count = self.retry_count.saturating_add(1);
		self.retry_at = Some(after(now, backoff));
		self.last_failure = Some(reason.into());
		self.last_failure_kind = Some(kind);
	}

	/// Content arrived but its digest disagrees with the primary's. Doesn't consume a retry.
	pub fn fail_checksum_mismatch(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
		self.state = SyncState::Failed;
		self.checksum_mismatch_count = self.checksum_mismatch_count.saturating_add(1);
		self.retry_at = Some(now);
		self.last_failure = Some(reason.into());
		self.last_failure_kind = Some(FailureKind::ChecksumMismatch);
	}

	/// The primary answered 404 for a resource it used to serve.
	pub fn mark_missing_on_primary(&mut self, now: DateTime<Utc>, recheck_after: Duration) {
		self.state = SyncState::Failed;
		self.retry_count = self.retry_count.saturating_add(1);
		self.retry_at = Some(after(now, recheck_after));
		self.missing_on_primary = true;
		self.last_failure = Some("resource is missing on the primary".to_string());
		self.last_failure_kind = Some(FailureKind::MissingOnPrimary);
	}

	/// Manual re-trigger, gives a terminally failed resource a clean slate.
	pub fn reset(&mut self) {
		self.state = SyncState::Pending;
		self.retry_count = 0;
		self.retry_at = None;
		self.missing_on_primary = false;
		self.last_failure = None;
		self.last_failure_kind = None;
	}
}

/// Aggregate counts of registry entries for one resource type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
	pub pending: u64,
	pub started: u64,
	pub synced: u64,
	pub failed: u64,
	pub missing_on_primary: u64,
	/// Failed entries whose retries are exhausted, given the ceiling the counts were taken with.
	pub terminal_failures: u64,
}

impl StateCounts {
	#[must_use]
	pub const fn total(&self) -> u64 {
		self.pending + self.started + self.synced + self.failed
	}

	/// Accumulates one entry, used by stores that can't aggregate natively.
	pub fn record(&mut self, entry: &RegistryEntry, retry_ceiling: u32) {
		match entry.state {
			SyncState::Pending => self.pending += 1,
			SyncState::Started => self.started += 1,
			SyncState::Synced => self.synced += 1,
			SyncState::Failed => {
				self.failed += 1;
				if entry.retry_count >= retry_ceiling {
					self.terminal_failures += 1;
				}
			}
		}

		if entry.missing_on_primary {
			self.missing_on_primary += 1;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn entry() -> RegistryEntry {
		RegistryEntry::pending(ResourceType::Upload, 1)
	}

	#[test]
	fn success_clears_failure_bookkeeping() {
		let now = Utc::now();
		let mut entry = entry();
		entry.fail_transport(FailureKind::Transport, "connection refused", now, Duration::ZERO);
		entry.fail_transport(FailureKind::Timeout, "timed out", now, Duration::ZERO);
		assert_eq!(entry.retry_count, 2);

		entry.succeed("abc", now);

		assert_eq!(entry.state, SyncState::Synced);
		assert_eq!(entry.retry_count, 0);
		assert_eq!(entry.checksum.as_deref(), Some("abc"));
		assert_eq!(entry.last_synced_at, Some(now));
		assert!(entry.last_failure_kind.is_none());
	}

	#[test]
	fn checksum_mismatch_does_not_consume_retries() {
		let now = Utc::now();
		let mut entry = entry();

		entry.fail_checksum_mismatch("expected abc, got def", now);
		entry.fail_checksum_mismatch("expected abc, got def", now);

		assert_eq!(entry.state, SyncState::Failed);
		assert_eq!(entry.retry_count, 0);
		assert_eq!(entry.checksum_mismatch_count, 2);
		assert_eq!(entry.last_failure_kind, Some(FailureKind::ChecksumMismatch));
		assert!(!entry.is_backing_off(now));
	}

	#[test]
	fn transport_failure_schedules_backoff() {
		let now = Utc::now();
		let mut entry = entry();

		entry.fail_transport(
			FailureKind::Transport,
			"HTTP 502",
			now,
			Duration::from_secs(60),
		);

		assert!(entry.is_backing_off(now));
		assert!(!entry.is_backing_off(now + TimeDelta::seconds(61)));
	}

	#[test]
	fn missing_on_primary_is_flagged_and_reset_clears_it() {
		let now = Utc::now();
		let mut entry = entry();
		entry.succeed("abc", now);
		assert!(entry.previously_existed());

		entry.mark_missing_on_primary(now, Duration::from_secs(3600));
		assert!(entry.missing_on_primary);
		assert_eq!(entry.state, SyncState::Failed);
		assert_eq!(entry.retry_count, 1);

		entry.reset();
		assert_eq!(entry.state, SyncState::Pending);
		assert!(!entry.missing_on_primary);
		assert_eq!(entry.retry_count, 0);
		assert!(entry.retry_at.is_none());
	}

	#[test]
	fn counts_track_terminal_failures() {
		let now = Utc::now();
		let mut counts = StateCounts::default();

		let mut exhausted = entry();
		for _ in 0..3 {
			exhausted.fail_transport(FailureKind::Transport, "boom", now, Duration::ZERO);
		}
		let mut retrying = RegistryEntry::pending(ResourceType::Upload, 2);
		retrying.fail_transport(FailureKind::Transport, "boom", now, Duration::ZERO);

		counts.record(&exhausted, 3);
		counts.record(&retrying, 3);
		counts.record(&RegistryEntry::pending(ResourceType::Upload, 3), 3);

		assert_eq!(counts.failed, 2);
		assert_eq!(counts.terminal_failures, 1);
		assert_eq!(counts.pending, 1);
		assert_eq!(counts.total(), 3);
	}
}
