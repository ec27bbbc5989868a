use std::{
	collections::{HashMap, HashSet},
	path::Path,
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc, Mutex,
	},
	time::Duration,
};

use async_trait::async_trait;
use axum::{
	extract::{Path as UrlPath, Query, State},
	http::{header, HeaderMap, StatusCode},
	response::{IntoResponse, Response},
	routing::{get, post},
	Json, Router,
};
use chrono::{TimeDelta, Utc};
use geo_core::{
	catalog::{HttpCatalog, PrimaryCatalog, PrimaryResource},
	consistency::ConsistencySweep,
	replicator::{
		refs_digest, BlobReplicator, BlobTransport, GitTransport, HttpBlobTransport,
		RepositoryReplicator, ReplicatorSet, ReplicatorStrategy, SyncOutcome, TransportError,
	},
	NodeContext,
};
use geo_registry::{FailureKind, RegistryEntry, RegistryStore, ResourceId, ResourceType, SyncState};
use geo_task_system::Interrupter;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing_test::traced_test;

mod common;

use common::{config, wait_for_entry, wait_until_idle, Fixture, RefusingTransport, TestServer};

const UPLOAD: ResourceType = ResourceType::Upload;
const PROJECT: ResourceType = ResourceType::ProjectRepository;
const TOKEN: &str = "secret-token";
const CONTENT: &[u8] = b"hello world";

fn sha256(bytes: &[u8]) -> String {
	hex::encode(Sha256::digest(bytes))
}

/// Blob endpoint of a fake primary, honoring `Range` and recording what it was asked.
#[derive(Clone, Default)]
struct Primary {
	blobs: Arc<HashMap<ResourceId, Vec<u8>>>,
	ranges: Arc<Mutex<Vec<Option<String>>>>,
	/// Ranges are served starting this many bytes earlier than asked
	skew: usize,
}

async fn retrieve(
	State(primary): State<Primary>,
	UrlPath((_, id)): UrlPath<(String, ResourceId)>,
	headers: HeaderMap,
) -> Response {
	let authorized = headers
		.get(header::AUTHORIZATION)
		.and_then(|value| value.to_str().ok())
		.is_some_and(|value| value == format!("Bearer {TOKEN}"));
	if !authorized {
		return StatusCode::UNAUTHORIZED.into_response();
	}

	let range = headers
		.get(header::RANGE)
		.and_then(|value| value.to_str().ok())
		.map(ToString::to_string);
	primary
		.ranges
		.lock()
		.expect("not poisoned")
		.push(range.clone());

	let Some(blob) = primary.blobs.get(&id) else {
		return StatusCode::NOT_FOUND.into_response();
	};

	let start = range
		.as_deref()
		.and_then(|range| range.strip_prefix("bytes="))
		.and_then(|range| range.strip_suffix('-'))
		.and_then(|start| start.parse::<usize>().ok());

	match start {
		Some(start) if start >= blob.len() => StatusCode::RANGE_NOT_SATISFIABLE.into_response(),
		Some(start) => {
			let first = start.saturating_sub(primary.skew);
			let content_range = format!("bytes {first}-{}/{}", blob.len() - 1, blob.len());
			(
				StatusCode::PARTIAL_CONTENT,
				[(header::CONTENT_RANGE, content_range)],
				blob[first..].to_vec(),
			)
				.into_response()
		}
		None => (StatusCode::OK, blob.clone()).into_response(),
	}
}

async fn serve(blobs: HashMap<ResourceId, Vec<u8>>) -> (TestServer, Primary) {
	serve_primary(Primary {
		blobs: Arc::new(blobs),
		..Default::default()
	})
	.await
}

async fn serve_primary(primary: Primary) -> (TestServer, Primary) {
	let router = Router::new()
		.route("/api/v4/geo/retrieve/:path/:id", get(retrieve))
		.with_state(primary.clone());

	(TestServer::new(router).await, primary)
}

fn http_transport(server: &TestServer, storage_dir: &Path) -> Arc<HttpBlobTransport> {
	let ctx = NodeContext::new(
		"test-secondary",
		server.base_url.clone(),
		Some(TOKEN.to_string()),
		storage_dir.to_path_buf(),
	)
	.unwrap();

	Arc::new(HttpBlobTransport::new(ctx))
}

fn http_replicator(fixture: &Fixture, server: &TestServer) -> BlobReplicator {
	let config = config(fixture.path(), 2, &[UPLOAD]);

	BlobReplicator::new(
		UPLOAD,
		fixture.replication(&config),
		&config.storage_dir(),
		http_transport(server, &config.storage_dir()),
	)
}

#[tokio::test]
#[traced_test]
async fn downloads_and_verifies_blobs() {
	let fixture = Fixture::new();
	fixture.catalog.insert(UPLOAD, 1, Some(&sha256(CONTENT))).await;
	let (server, _) = serve(HashMap::from([(1, CONTENT.to_vec())])).await;
	let replicator = http_replicator(&fixture, &server);

	let outcome = replicator.sync(1, &Interrupter::detached()).await.unwrap();

	assert_eq!(
		outcome,
		SyncOutcome::Synced {
			checksum: sha256(CONTENT)
		}
	);
	assert_eq!(fs::read(replicator.blob_path(1)).await.unwrap(), CONTENT);
	assert!(!replicator.partial_path(1).exists());

	let entry = fixture.entry(UPLOAD, 1).await.unwrap();
	assert_eq!(entry.state, SyncState::Synced);
	assert_eq!(entry.retry_count, 0);
	assert!(entry.last_synced_at.is_some());
}

#[tokio::test]
#[traced_test]
async fn lost_resources_are_flagged_missing() {
	let fixture = Fixture::new();
	let (server, _) = serve(HashMap::new()).await;
	let replicator = http_replicator(&fixture, &server);

	let mut synced = RegistryEntry::pending(UPLOAD, 5);
	synced.succeed("abc", Utc::now());
	fixture.registry.upsert(&synced).await.unwrap();

	let outcome = replicator.sync(5, &Interrupter::detached()).await.unwrap();
	assert_eq!(outcome, SyncOutcome::MissingOnPrimary);

	let entry = fixture.entry(UPLOAD, 5).await.unwrap();
	assert!(entry.missing_on_primary);
	assert_eq!(entry.state, SyncState::Failed);
	assert_eq!(entry.last_failure_kind, Some(FailureKind::MissingOnPrimary));
}

#[tokio::test]
#[traced_test]
async fn recreated_resources_are_synced_again() {
	let fixture = Fixture::new();
	fixture.catalog.insert(UPLOAD, 5, Some(&sha256(CONTENT))).await;
	let (server, _) = serve(HashMap::from([(5, CONTENT.to_vec())])).await;

	let mut lost = RegistryEntry::pending(UPLOAD, 5);
	lost.succeed("abc", Utc::now());
	lost.mark_missing_on_primary(Utc::now() - TimeDelta::seconds(10), Duration::ZERO);
	fixture.registry.upsert(&lost).await.unwrap();

	let config = config(fixture.path(), 2, &[UPLOAD]);
	let replicators =
		fixture.blob_replicators(&config, http_transport(&server, &config.storage_dir()));
	let scheduler = fixture.scheduler(&config, replicators);

	// Only the missing on primary listing can pick it up
	let report = scheduler.tick(None).await.unwrap();
	assert_eq!(report.scheduled.len(), 1);
	assert_eq!(report.scheduled[0].resource_id, 5);

	let entry = wait_for_entry(&fixture, UPLOAD, 5, |entry| {
		entry.state == SyncState::Synced
	})
	.await;
	assert!(!entry.missing_on_primary);
	assert_eq!(entry.retry_count, 0);
	assert_eq!(entry.checksum, Some(sha256(CONTENT)));
	assert_eq!(entry.last_failure_kind, None);

	wait_until_idle(&scheduler).await;
	assert!(scheduler.tick(None).await.unwrap().scheduled.is_empty());

	scheduler.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn not_found_on_first_attempt_is_a_transport_failure() {
	let fixture = Fixture::new();
	let (server, _) = serve(HashMap::new()).await;
	let replicator = http_replicator(&fixture, &server);

	let outcome = replicator.sync(9, &Interrupter::detached()).await.unwrap();
	assert!(matches!(
		outcome,
		SyncOutcome::TransportFailed { retry_count: 1, .. }
	));

	let entry = fixture.entry(UPLOAD, 9).await.unwrap();
	assert!(!entry.missing_on_primary);
	assert_eq!(entry.state, SyncState::Failed);
	assert_eq!(entry.retry_count, 1);
}

#[tokio::test]
#[traced_test]
async fn partial_downloads_resume_with_a_range() {
	let fixture = Fixture::new();
	fixture.catalog.insert(UPLOAD, 1, Some(&sha256(CONTENT))).await;
	let (server, primary) = serve(HashMap::from([(1, CONTENT.to_vec())])).await;
	let replicator = http_replicator(&fixture, &server);

	let part = replicator.partial_path(1);
	fs::create_dir_all(part.parent().unwrap()).await.unwrap();
	fs::write(&part, b"hello ").await.unwrap();

	let outcome = replicator.sync(1, &Interrupter::detached()).await.unwrap();

	assert!(matches!(outcome, SyncOutcome::Synced { .. }));
	assert_eq!(fs::read(replicator.blob_path(1)).await.unwrap(), CONTENT);
	assert_eq!(
		*primary.ranges.lock().unwrap(),
		vec![Some("bytes=6-".to_string())]
	);
}

#[tokio::test]
#[traced_test]
async fn misaligned_ranges_restart_from_scratch() {
	let fixture = Fixture::new();
	fixture.catalog.insert(UPLOAD, 1, Some(&sha256(CONTENT))).await;
	let (server, primary) = serve_primary(Primary {
		blobs: Arc::new(HashMap::from([(1, CONTENT.to_vec())])),
		skew: 4,
		..Default::default()
	})
	.await;
	let replicator = http_replicator(&fixture, &server);

	let part = replicator.partial_path(1);
	fs::create_dir_all(part.parent().unwrap()).await.unwrap();
	fs::write(&part, b"hello ").await.unwrap();

	let outcome = replicator.sync(1, &Interrupter::detached()).await.unwrap();

	assert_eq!(
		outcome,
		SyncOutcome::Synced {
			checksum: sha256(CONTENT)
		}
	);
	assert_eq!(fs::read(replicator.blob_path(1)).await.unwrap(), CONTENT);
	assert_eq!(
		*primary.ranges.lock().unwrap(),
		vec![Some("bytes=6-".to_string()), None]
	);
	assert_eq!(
		fixture.entry(UPLOAD, 1).await.unwrap().checksum_mismatch_count,
		0
	);
}

#[tokio::test]
#[traced_test]
async fn unsatisfiable_ranges_restart_from_scratch() {
	let fixture = Fixture::new();
	fixture.catalog.insert(UPLOAD, 1, Some(&sha256(CONTENT))).await;
	let (server, primary) = serve(HashMap::from([(1, CONTENT.to_vec())])).await;
	let replicator = http_replicator(&fixture, &server);

	let part = replicator.partial_path(1);
	fs::create_dir_all(part.parent().unwrap()).await.unwrap();
	fs::write(&part, b"stale content, longer than the blob")
		.await
		.unwrap();

	let outcome = replicator.sync(1, &Interrupter::detached()).await.unwrap();

	assert!(matches!(outcome, SyncOutcome::Synced { .. }));
	assert_eq!(fs::read(replicator.blob_path(1)).await.unwrap(), CONTENT);
	assert_eq!(primary.ranges.lock().unwrap().len(), 2);
}

#[tokio::test]
#[traced_test]
async fn checksum_mismatch_is_its_own_failure() {
	let fixture = Fixture::new();
	fixture.catalog.insert(UPLOAD, 1, Some("deadbeef")).await;
	let (server, _) = serve(HashMap::from([(1, CONTENT.to_vec())])).await;
	let replicator = http_replicator(&fixture, &server);

	let outcome = replicator.sync(1, &Interrupter::detached()).await.unwrap();

	assert_eq!(
		outcome,
		SyncOutcome::ChecksumMismatch {
			expected: "deadbeef".to_string(),
			actual: sha256(CONTENT),
		}
	);

	let entry = fixture.entry(UPLOAD, 1).await.unwrap();
	assert_eq!(entry.state, SyncState::Failed);
	assert_eq!(entry.retry_count, 0);
	assert_eq!(entry.checksum_mismatch_count, 1);
	assert_eq!(entry.last_failure_kind, Some(FailureKind::ChecksumMismatch));
	assert!(!replicator.blob_path(1).exists());
	assert!(!replicator.partial_path(1).exists());
}

#[tokio::test]
#[traced_test]
async fn missing_credentials_are_a_transport_failure() {
	let fixture = Fixture::new();
	let (server, _) = serve(HashMap::from([(1, CONTENT.to_vec())])).await;
	let config = config(fixture.path(), 1, &[UPLOAD]);
	let anonymous = common::node(server.base_url.clone(), &config.storage_dir());
	let replicator = BlobReplicator::new(
		UPLOAD,
		fixture.replication(&config),
		&config.storage_dir(),
		Arc::new(HttpBlobTransport::new(anonymous)),
	);

	let outcome = replicator.sync(1, &Interrupter::detached()).await.unwrap();

	let SyncOutcome::TransportFailed { reason, .. } = outcome else {
		panic!("expected a transport failure, got {outcome:?}");
	};
	assert!(reason.contains("401"), "{reason}");
}

/// Git mirrors faked with a directory and an in-memory list of refs.
#[derive(Default)]
struct FakeGit {
	refs: Mutex<String>,
	clones: AtomicUsize,
	fetches: AtomicUsize,
}

impl FakeGit {
	fn set_refs(&self, refs: &str) {
		*self.refs.lock().unwrap() = refs.to_string();
	}
}

#[async_trait]
impl GitTransport for FakeGit {
	async fn clone_mirror(
		&self,
		_resource_type: ResourceType,
		_resource_id: ResourceId,
		dest: &Path,
	) -> Result<(), TransportError> {
		self.clones.fetch_add(1, Ordering::SeqCst);
		fs::create_dir_all(dest).await?;
		Ok(())
	}

	async fn fetch(&self, _dest: &Path) -> Result<(), TransportError> {
		self.fetches.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}

	async fn refs_checksum(&self, _dest: &Path) -> Result<String, TransportError> {
		Ok(refs_digest(&self.refs.lock().unwrap()))
	}
}

#[tokio::test]
#[traced_test]
async fn repositories_clone_once_then_fetch() {
	let fixture = Fixture::new();
	let config = config(fixture.path(), 1, &[PROJECT]);
	let git = Arc::new(FakeGit::default());
	let replicator = RepositoryReplicator::new(
		PROJECT,
		fixture.replication(&config),
		&config.storage_dir(),
		Arc::clone(&git) as Arc<dyn GitTransport>,
	);

	let v1 = "1111 refs/heads/main";
	git.set_refs(v1);
	fixture.catalog.insert(PROJECT, 1, Some(&refs_digest(v1))).await;

	let outcome = replicator.sync(1, &Interrupter::detached()).await.unwrap();
	assert!(matches!(outcome, SyncOutcome::Synced { .. }));
	assert!(replicator.repository_path(1).is_dir());
	assert_eq!(git.clones.load(Ordering::SeqCst), 1);

	let v2 = "2222 refs/heads/main";
	git.set_refs(v2);
	fixture.catalog.insert(PROJECT, 1, Some(&refs_digest(v2))).await;

	let outcome = replicator.sync(1, &Interrupter::detached()).await.unwrap();
	assert_eq!(
		outcome,
		SyncOutcome::Synced {
			checksum: refs_digest(v2)
		}
	);
	assert_eq!(git.clones.load(Ordering::SeqCst), 1);
	assert_eq!(git.fetches.load(Ordering::SeqCst), 1);

	// The primary moved on again but our fetch didn't see it
	fixture.catalog.insert(PROJECT, 1, Some("3333")).await;
	let outcome = replicator.sync(1, &Interrupter::detached()).await.unwrap();
	assert!(matches!(outcome, SyncOutcome::ChecksumMismatch { .. }));

	replicator.purge(1).await.unwrap();
	assert!(!replicator.repository_path(1).exists());
}

#[tokio::test]
#[traced_test]
async fn transports_pick_the_strategy_of_each_type() {
	let fixture = Fixture::new();
	let config = config(fixture.path(), 1, &[UPLOAD, PROJECT]);
	let blobs: Arc<dyn BlobTransport> = Arc::new(RefusingTransport);
	let git: Arc<dyn GitTransport> = Arc::new(FakeGit::default());

	let set = ReplicatorSet::from_transports(
		&config.resource_types,
		&fixture.replication(&config),
		&config.storage_dir(),
		&blobs,
		&git,
	);

	assert_eq!(set.get(UPLOAD).unwrap().resource_type(), UPLOAD);
	assert_eq!(set.get(PROJECT).unwrap().resource_type(), PROJECT);
	assert!(set.get(ResourceType::WikiRepository).is_none());
	assert!(set.try_get(ResourceType::LfsObject).is_err());
}

#[tokio::test]
#[traced_test]
async fn sweep_deletes_what_the_primary_deleted() {
	let fixture = Fixture::new();
	let config = config(fixture.path(), 2, &[UPLOAD]);
	let replicators = fixture.blob_replicators(&config, Arc::new(RefusingTransport));
	let uploads = config.storage_dir().join("uploads");
	fs::create_dir_all(&uploads).await.unwrap();

	for id in 1..=3 {
		let mut entry = RegistryEntry::pending(UPLOAD, id);
		entry.succeed("checksum", Utc::now());
		fixture.registry.upsert(&entry).await.unwrap();
		fs::write(uploads.join(id.to_string()), b"data").await.unwrap();
	}
	fixture.add_primary(UPLOAD, [1, 3]).await;

	// In flight entries are left for their job to settle
	let sweep = ConsistencySweep::new(fixture.registry(), fixture.catalog()).with_page_size(2);
	let report = sweep
		.sweep(
			UPLOAD,
			replicators.get(UPLOAD).unwrap().as_ref(),
			&HashSet::from([2]),
		)
		.await
		.unwrap();
	assert_eq!(report.checked, 2);
	assert_eq!(report.deleted, 0);

	let scheduler = fixture.scheduler(&config, replicators);
	let reports = scheduler.sweep_consistency().await;

	assert_eq!(reports.len(), 1);
	assert_eq!(reports[0].0, UPLOAD);
	assert_eq!(reports[0].1.deleted, 1);
	assert_eq!(fixture.entry(UPLOAD, 2).await, None);
	assert!(!uploads.join("2").exists());
	assert!(uploads.join("1").exists());
	assert!(fixture.entry(UPLOAD, 3).await.is_some());

	scheduler.shutdown().await;
}

#[derive(Deserialize)]
struct Page {
	after: Option<ResourceId>,
	limit: usize,
}

#[derive(Deserialize)]
struct Lookup {
	ids: Vec<ResourceId>,
}

fn inventory() -> Vec<PrimaryResource> {
	[(2, Some("b")), (5, None), (7, Some("c")), (9, Some("d"))]
		.into_iter()
		.map(|(id, checksum)| PrimaryResource {
			id,
			checksum: checksum.map(ToString::to_string),
		})
		.collect()
}

#[tokio::test]
#[traced_test]
async fn catalog_pages_and_lookups_over_http() {
	let router = Router::new()
		.route(
			"/api/v4/geo/catalog/uploads",
			get(|Query(page): Query<Page>| async move {
				Json(
					inventory()
						.into_iter()
						.filter(|resource| page.after.map_or(true, |after| resource.id > after))
						.take(page.limit)
						.collect::<Vec<_>>(),
				)
			}),
		)
		.route(
			"/api/v4/geo/catalog/uploads/lookup",
			post(|Json(lookup): Json<Lookup>| async move {
				Json(
					inventory()
						.into_iter()
						.filter(|resource| lookup.ids.contains(&resource.id))
						.collect::<Vec<_>>(),
				)
			}),
		);
	let server = TestServer::new(router).await;
	let fixture = Fixture::new();
	let catalog = HttpCatalog::new(common::node(
		server.base_url.clone(),
		&fixture.path().join("storage"),
	));

	let first = catalog.list_resources(UPLOAD, None, 2).await.unwrap();
	assert_eq!(first.iter().map(|r| r.id).collect::<Vec<_>>(), vec![2, 5]);

	let rest = catalog.list_resources(UPLOAD, Some(5), 10).await.unwrap();
	assert_eq!(rest.iter().map(|r| r.id).collect::<Vec<_>>(), vec![7, 9]);

	let found = catalog.find_many(UPLOAD, &[5, 6, 7]).await.unwrap();
	assert_eq!(found.len(), 2);
	assert_eq!(found[&5].checksum, None);
	assert_eq!(found[&7].checksum.as_deref(), Some("c"));

	// Anything but a success is an outage, never an empty inventory
	assert!(catalog.list_resources(ResourceType::LfsObject, None, 10).await.is_err());
}
