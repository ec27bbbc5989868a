use std::{
	fmt,
	future::IntoFuture,
	io,
	path::{Path, PathBuf},
	pin::pin,
	process::Stdio,
	sync::Arc,
};

use async_trait::async_trait;
use geo_registry::{ResourceId, ResourceType};
use geo_task_system::Interrupter;
use sha2::{Digest, Sha256};
use tokio::{fs, process::Command};
use tracing::{debug, instrument, trace};

use crate::context::NodeContext;

use super::{
	ReplicationContext, ReplicatorError, ReplicatorStrategy, SyncOutcome, TransportError,
};

/// Mirrors git repositories from the primary.
#[async_trait]
pub trait GitTransport: Send + Sync + 'static {
	/// Creates a bare mirror of the primary's copy of a repository at `dest`, which must not
	/// exist yet.
	async fn clone_mirror(
		&self,
		resource_type: ResourceType,
		resource_id: ResourceId,
		dest: &Path,
	) -> Result<(), TransportError>;

	/// Updates an existing mirror from its remote.
	async fn fetch(&self, dest: &Path) -> Result<(), TransportError>;

	/// Digest of every ref of the mirror, hex encoded. Two mirrors with the same refs pointing to
	/// the same objects have the same digest.
	async fn refs_checksum(&self, dest: &Path) -> Result<String, TransportError>;
}

fn ref_name(line: &str) -> &str {
	line.split_once(' ').map_or(line, |(_, name)| name)
}

/// Digest over `<object> <ref>` lines, sorted by ref name.
#[must_use]
pub fn refs_digest(show_ref_output: &str) -> String {
	let mut refs = show_ref_output
		.lines()
		.map(str::trim)
		.filter(|line| !line.is_empty())
		.collect::<Vec<_>>();
	refs.sort_unstable_by(|a, b| ref_name(a).cmp(ref_name(b)));

	let mut hasher = Sha256::new();
	for line in refs {
		hasher.update(line.as_bytes());
		hasher.update(b"\n");
	}

	hex::encode(hasher.finalize())
}

/// Runs the `git` binary found in `PATH` against the primary of a node.
#[derive(Debug, Clone)]
pub struct GitCliTransport {
	ctx: NodeContext,
}

impl GitCliTransport {
	#[must_use]
	pub const fn new(ctx: NodeContext) -> Self {
		Self { ctx }
	}

	async fn git(&self, args: &[&str], cwd: Option<&Path>) -> Result<String, TransportError> {
		let mut command = Command::new("git");

		if let Some(token) = self.ctx.access_token() {
			command
				.arg("-c")
				.arg(format!("http.extraHeader=Authorization: Bearer {token}"));
		}

		command
			.args(args)
			.env("GIT_TERMINAL_PROMPT", "0")
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			// Dropping the future on interruption or timeout must not leave git running
			.kill_on_drop(true);

		if let Some(cwd) = cwd {
			command.current_dir(cwd);
		}

		trace!(?args, "Running git");

		let output = command.output().await?;

		if output.status.success() {
			return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
		}

		let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
		let lowered = stderr.to_lowercase();

		if lowered.contains("not found") || lowered.contains("404") {
			Err(TransportError::NotFound)
		} else {
			Err(TransportError::Git(stderr))
		}
	}
}

#[async_trait]
impl GitTransport for GitCliTransport {
	async fn clone_mirror(
		&self,
		resource_type: ResourceType,
		resource_id: ResourceId,
		dest: &Path,
	) -> Result<(), TransportError> {
		let remote = self
			.ctx
			.repository_url(resource_type.descriptor(), resource_id);
		let dest = dest.to_string_lossy();

		debug!(%remote, "Cloning mirror");

		self.git(&["clone", "--mirror", "--quiet", remote.as_str(), &dest], None)
			.await
			.map(|_| ())
	}

	async fn fetch(&self, dest: &Path) -> Result<(), TransportError> {
		self.git(&["fetch", "--prune", "--quiet", "origin"], Some(dest))
			.await
			.map(|_| ())
	}

	async fn refs_checksum(&self, dest: &Path) -> Result<String, TransportError> {
		match self.git(&["show-ref"], Some(dest)).await {
			Ok(refs) => Ok(refs_digest(&refs)),
			// show-ref exits with 1 on a repository without any ref
			Err(TransportError::Git(stderr)) if stderr.is_empty() => Ok(refs_digest("")),
			Err(e) => Err(e),
		}
	}
}

/// Replicates git repositories as bare mirrors, `<storage>/<path>/<id>.git`.
pub struct RepositoryReplicator {
	resource_type: ResourceType,
	ctx: ReplicationContext,
	root: PathBuf,
	transport: Arc<dyn GitTransport>,
}

impl fmt::Debug for RepositoryReplicator {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("RepositoryReplicator")
			.field("resource_type", &self.resource_type)
			.field("root", &self.root)
			.finish_non_exhaustive()
	}
}

impl RepositoryReplicator {
	#[must_use]
	pub fn new(
		resource_type: ResourceType,
		ctx: ReplicationContext,
		storage_dir: &Path,
		transport: Arc<dyn GitTransport>,
	) -> Self {
		Self {
			resource_type,
			ctx,
			root: storage_dir.join(resource_type.descriptor().primary_path),
			transport,
		}
	}

	#[must_use]
	pub fn repository_path(&self, resource_id: ResourceId) -> PathBuf {
		self.root.join(format!("{resource_id}.git"))
	}

	async fn mirror(&self, resource_id: ResourceId) -> Result<String, TransportError> {
		fs::create_dir_all(&self.root).await?;
		let dest = self.repository_path(resource_id);

		if fs::try_exists(&dest).await? {
			debug!(%resource_id, "Fetching into existing mirror");
			self.transport.fetch(&dest).await?;
		} else {
			let staging = self.root.join(format!("{resource_id}.git.tmp"));

			match fs::remove_dir_all(&staging).await {
				Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
				_ => {}
			}

			self.transport
				.clone_mirror(self.resource_type, resource_id, &staging)
				.await?;
			fs::rename(&staging, &dest).await?;
		}

		self.transport.refs_checksum(&dest).await
	}
}

#[async_trait]
impl ReplicatorStrategy for RepositoryReplicator {
	fn resource_type(&self) -> ResourceType {
		self.resource_type
	}

	#[instrument(skip(self, interrupter), fields(resource_type = %self.resource_type), err)]
	async fn sync(
		&self,
		resource_id: ResourceId,
		interrupter: &Interrupter,
	) -> Result<SyncOutcome, ReplicatorError> {
		let attempt = self.ctx.begin(self.resource_type, resource_id).await?;

		let mirrored = {
			let mut interrupted = pin!(interrupter.into_future());
			let mirror = self.mirror(resource_id);

			tokio::select! {
				biased;

				() = interrupted.as_mut() => None,
				res = mirror => Some(res),
			}
		};

		match mirrored {
			None => self.ctx.restore(attempt).await,
			Some(Ok(actual)) => {
				let expected = self
					.ctx
					.expected_checksum(self.resource_type, resource_id)
					.await;

				self.ctx.record_fetched(attempt, expected, actual).await
			}
			Some(Err(e)) => self.ctx.record_transport_failure(attempt, &e).await,
		}
	}

	async fn purge(&self, resource_id: ResourceId) -> Result<(), ReplicatorError> {
		match fs::remove_dir_all(self.repository_path(resource_id)).await {
			Err(e) if e.kind() != io::ErrorKind::NotFound => Err(ReplicatorError::Purge {
				resource_type: self.resource_type,
				resource_id,
				source: e,
			}),
			_ => Ok(()),
		}
	}
}
