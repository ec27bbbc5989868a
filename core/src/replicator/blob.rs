use std::{
	fmt,
	future::IntoFuture,
	io,
	path::{Path, PathBuf},
	pin::pin,
	sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use geo_registry::{ResourceId, ResourceType};
use geo_task_system::Interrupter;
use reqwest::{header, Method, Response, StatusCode};
use tokio::{
	fs::{self, File, OpenOptions},
	io::AsyncWriteExt,
};
use tracing::{debug, instrument, trace, warn};
use url::Url;

use crate::context::NodeContext;

use super::{
	sha256_file, ReplicationContext, ReplicatorError, ReplicatorStrategy, SyncOutcome,
	TransportError,
};

/// An open download of a blob's content.
pub struct BlobDownload {
	/// Whether the body continues the bytes already on disk instead of starting over
	pub resumed: bool,
	pub body: BoxStream<'static, Result<Bytes, TransportError>>,
}

impl fmt::Debug for BlobDownload {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("BlobDownload")
			.field("resumed", &self.resumed)
			.finish_non_exhaustive()
	}
}

/// Fetches blob content from the primary.
#[async_trait]
pub trait BlobTransport: Send + Sync + 'static {
	/// Starts downloading a blob from byte `offset`. Transports that can't resume answer with
	/// [`BlobDownload::resumed`] set to `false` and the whole content.
	async fn open(
		&self,
		resource_type: ResourceType,
		resource_id: ResourceId,
		offset: u64,
	) -> Result<BlobDownload, TransportError>;
}

/// Authenticated HTTP downloads with `Range` resumption.
#[derive(Debug, Clone)]
pub struct HttpBlobTransport {
	ctx: NodeContext,
}

impl HttpBlobTransport {
	#[must_use]
	pub const fn new(ctx: NodeContext) -> Self {
		Self { ctx }
	}

	async fn send(&self, url: Url, offset: u64) -> Result<Response, TransportError> {
		let mut request = self.ctx.request(Method::GET, url);
		if offset > 0 {
			request = request.header(header::RANGE, format!("bytes={offset}-"));
		}

		Ok(request.send().await?)
	}
}

/// First byte of a `Content-Range: bytes <first>-<last>/<length>` answer.
fn content_range_start(response: &Response) -> Option<u64> {
	response
		.headers()
		.get(header::CONTENT_RANGE)?
		.to_str()
		.ok()?
		.strip_prefix("bytes ")?
		.split_once('-')?
		.0
		.trim()
		.parse()
		.ok()
}

#[async_trait]
impl BlobTransport for HttpBlobTransport {
	#[instrument(skip(self), err)]
	async fn open(
		&self,
		resource_type: ResourceType,
		resource_id: ResourceId,
		offset: u64,
	) -> Result<BlobDownload, TransportError> {
		let url = self.ctx.blob_url(resource_type.descriptor(), resource_id);

		let mut response = self.send(url.clone(), offset).await?;

		if offset > 0
			&& response.status() == StatusCode::PARTIAL_CONTENT
			&& content_range_start(&response) != Some(offset)
		{
			warn!(
				%offset,
				content_range = ?response.headers().get(header::CONTENT_RANGE),
				"Primary answered with another range, starting over"
			);
			response = self.send(url, 0).await?;
		}

		let resumed = match response.status() {
			StatusCode::PARTIAL_CONTENT => true,
			status if status.is_success() => false,
			StatusCode::NOT_FOUND => return Err(TransportError::NotFound),
			status => return Err(TransportError::Status(status.as_u16())),
		};

		trace!(%resumed, "Download started");

		Ok(BlobDownload {
			resumed: resumed && offset > 0,
			body: response.bytes_stream().map_err(Into::into).boxed(),
		})
	}
}

enum Fetch {
	Complete,
	Interrupted,
}

/// Replicates single file resources, keeping partial downloads in a `.part` file next to where
/// the blob lands so an interrupted transfer resumes where it stopped.
pub struct BlobReplicator {
	resource_type: ResourceType,
	ctx: ReplicationContext,
	root: PathBuf,
	transport: Arc<dyn BlobTransport>,
}

impl fmt::Debug for BlobReplicator {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("BlobReplicator")
			.field("resource_type", &self.resource_type)
			.field("root", &self.root)
			.finish_non_exhaustive()
	}
}

impl BlobReplicator {
	#[must_use]
	pub fn new(
		resource_type: ResourceType,
		ctx: ReplicationContext,
		storage_dir: &Path,
		transport: Arc<dyn BlobTransport>,
	) -> Self {
		Self {
			resource_type,
			ctx,
			root: storage_dir.join(resource_type.descriptor().primary_path),
			transport,
		}
	}

	/// Where a synced blob lives.
	#[must_use]
	pub fn blob_path(&self, resource_id: ResourceId) -> PathBuf {
		self.root.join(resource_id.to_string())
	}

	#[must_use]
	pub fn partial_path(&self, resource_id: ResourceId) -> PathBuf {
		self.root.join(format!("{resource_id}.part"))
	}

	async fn download(
		&self,
		resource_id: ResourceId,
		interrupter: &Interrupter,
	) -> Result<Fetch, TransportError> {
		fs::create_dir_all(&self.root).await?;

		let part = self.partial_path(resource_id);
		let offset = match fs::metadata(&part).await {
			Ok(metadata) => metadata.len(),
			Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
			Err(e) => return Err(e.into()),
		};

		let download = match self.transport.open(self.resource_type, resource_id, offset).await {
			// What we hold is no prefix of the current content anymore
			Err(TransportError::Status(416)) if offset > 0 => {
				fs::remove_file(&part).await?;
				self.transport.open(self.resource_type, resource_id, 0).await?
			}
			res => res?,
		};

		if download.resumed {
			debug!(%resource_id, %offset, "Resuming partial download");
		}

		let mut file = if download.resumed {
			OpenOptions::new().append(true).open(&part).await?
		} else {
			File::create(&part).await?
		};

		let mut body = download.body;
		let mut interrupted = pin!(interrupter.into_future());

		loop {
			tokio::select! {
				biased;

				() = interrupted.as_mut() => {
					file.flush().await?;
					return Ok(Fetch::Interrupted);
				}

				chunk = body.next() => match chunk {
					Some(Ok(bytes)) => file.write_all(&bytes).await?,
					Some(Err(e)) => {
						file.flush().await?;
						return Err(e);
					}
					None => break,
				},
			}
		}

		file.flush().await?;
		file.sync_all().await?;

		Ok(Fetch::Complete)
	}

	async fn remove_if_exists(path: &Path) -> io::Result<()> {
		match fs::remove_file(path).await {
			Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
			_ => Ok(()),
		}
	}
}

#[async_trait]
impl ReplicatorStrategy for BlobReplicator {
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
		let part = self.partial_path(resource_id);

		match self.download(resource_id, interrupter).await {
			Ok(Fetch::Interrupted) => self.ctx.restore(attempt).await,

			Ok(Fetch::Complete) => {
				let actual = match sha256_file(&part).await {
					Ok(actual) => actual,
					Err(e) => {
						return self
							.ctx
							.record_transport_failure(attempt, &e.into())
							.await
					}
				};

				let expected = self
					.ctx
					.expected_checksum(self.resource_type, resource_id)
					.await;

				if expected.as_deref().is_some_and(|expected| expected != actual) {
					// Start from scratch next time
					if let Err(e) = Self::remove_if_exists(&part).await {
						return self.ctx.record_transport_failure(attempt, &e.into()).await;
					}
				} else if let Err(e) = fs::rename(&part, self.blob_path(resource_id)).await {
					return self.ctx.record_transport_failure(attempt, &e.into()).await;
				}

				self.ctx.record_fetched(attempt, expected, actual).await
			}

			Err(e) => {
				if matches!(e, TransportError::NotFound) {
					Self::remove_if_exists(&part).await.ok();
				}

				self.ctx.record_transport_failure(attempt, &e).await
			}
		}
	}

	async fn purge(&self, resource_id: ResourceId) -> Result<(), ReplicatorError> {
		for path in [self.blob_path(resource_id), self.partial_path(resource_id)] {
			Self::remove_if_exists(&path)
				.await
				.map_err(|source| ReplicatorError::Purge {
					resource_type: self.resource_type,
					resource_id,
					source,
				})?;
		}

		Ok(())
	}
}
