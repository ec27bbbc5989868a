use std::{
	fs, io,
	net::SocketAddr,
	path::{Path, PathBuf},
	sync::Arc,
};

use anyhow::Context;
use clap::Parser;
use geo_core::{
	catalog::{CachedCatalog, HttpCatalog, PrimaryCatalog},
	registry::{InMemoryRegistry, RegistryStore, SqliteRegistry},
	replicator::{
		BlobTransport, GitCliTransport, GitTransport, HttpBlobTransport, ReplicationContext,
		ReplicatorSet, SyncPolicy,
	},
	DispatchScheduler, GeoConfig, NodeContext, SchedulerState,
};
use tokio::{net::TcpListener, signal};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod api;

/// Geo secondary node, replicating blobs and repositories from its primary.
#[derive(Debug, Parser)]
#[command(name = "geo-server", version)]
struct Args {
	/// Directory holding geo.json, logs, the registry and replicated data
	#[arg(long, env = "DATA_DIR", default_value = "geo_data")]
	data_dir: PathBuf,

	/// Address of the status and control API
	#[arg(long, env = "LISTEN_ADDR", default_value = "[::]:8080")]
	listen: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	let _log_guard = init_logging(&args.data_dir)?;

	let config = GeoConfig::load_from(&args.data_dir).context("Failed to load config")?;
	let scheduler = build_scheduler(&config).await?;

	let runner = tokio::spawn({
		let scheduler = scheduler.clone();
		async move {
			let res = scheduler.run().await;
			if let Err(e) = &res {
				error!(?e, "Dispatch scheduler failed, shutting down");
				scheduler.shutdown().await;
			}
			res
		}
	});

	let listener = TcpListener::bind(args.listen)
		.await
		.with_context(|| format!("Failed to bind {}", args.listen))?;
	info!("Listening on http://{}", args.listen);

	axum::serve(listener, api::router(scheduler.clone()))
		.with_graceful_shutdown(shutdown_signal(scheduler))
		.await
		.context("HTTP server failed")?;

	runner.await.context("Dispatch scheduler task panicked")??;

	info!("Bye");
	Ok(())
}

/// Logs to stdout and to a daily rotated file under `<data_dir>/logs`.
fn init_logging(data_dir: &Path) -> anyhow::Result<WorkerGuard> {
	let logs_dir = data_dir.join("logs");
	fs::create_dir_all(&logs_dir)
		.with_context(|| format!("Failed to create logs directory {}", logs_dir.display()))?;

	let (file_writer, guard) =
		tracing_appender::non_blocking(tracing_appender::rolling::daily(&logs_dir, "geo.log"));

	tracing_subscriber::registry()
		.with(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| {
				EnvFilter::new("geo_core=info,geo_server=info,geo_task_system=info")
			}),
		)
		.with(fmt::layer().with_target(true).with_writer(io::stdout))
		.with(
			fmt::layer()
				.with_target(true)
				.with_ansi(false)
				.with_writer(file_writer),
		)
		.try_init()
		.context("Failed to initialize tracing")?;

	Ok(guard)
}

async fn build_scheduler(config: &GeoConfig) -> anyhow::Result<DispatchScheduler> {
	let ctx = NodeContext::from_config(config).context("Failed to build HTTP client")?;

	let registry: Arc<dyn RegistryStore> = match config.registry_path() {
		Some(path) => Arc::new(
			SqliteRegistry::open(&path)
				.await
				.with_context(|| format!("Failed to open registry {}", path.display()))?,
		),
		None => {
			warn!("Registry is kept in memory, sync state is lost on restart");
			Arc::new(InMemoryRegistry::new())
		}
	};

	let catalog: Arc<dyn PrimaryCatalog> = Arc::new(CachedCatalog::new(
		HttpCatalog::new(ctx.clone()),
		config.catalog_cache_ttl(),
	));

	let replication = ReplicationContext::new(
		Arc::clone(&registry),
		Arc::clone(&catalog),
		SyncPolicy::from_config(config),
	);
	let blobs: Arc<dyn BlobTransport> = Arc::new(HttpBlobTransport::new(ctx.clone()));
	let git: Arc<dyn GitTransport> = Arc::new(GitCliTransport::new(ctx.clone()));
	let replicators = ReplicatorSet::from_transports(
		&config.resource_types,
		&replication,
		&config.storage_dir(),
		&blobs,
		&git,
	);

	info!(
		node = %ctx.name,
		primary = %config.node.primary_url,
		types = ?config.resource_types,
		max_concurrency = config.max_concurrency,
		"Starting Geo secondary"
	);

	DispatchScheduler::new(ctx, config, registry, catalog, replicators)
		.context("Failed to set up dispatch scheduler")
}

/// Resolves on Ctrl-C or SIGTERM once in-flight jobs are drained, or when the scheduler stopped
/// on its own.
async fn shutdown_signal(scheduler: DispatchScheduler) {
	let ctrl_c = async {
		if let Err(e) = signal::ctrl_c().await {
			error!(?e, "Failed to listen for Ctrl-C");
			std::future::pending::<()>().await;
		}
	};

	#[cfg(unix)]
	let terminate = async {
		match signal::unix::signal(signal::unix::SignalKind::terminate()) {
			Ok(mut sigterm) => {
				sigterm.recv().await;
			}
			Err(e) => {
				error!(?e, "Failed to listen for SIGTERM");
				std::future::pending::<()>().await;
			}
		}
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	let mut state = scheduler.subscribe();

	tokio::select! {
		() = ctrl_c => {}
		() = terminate => {}
		_ = state.wait_for(|state| *state == SchedulerState::Stopped) => return,
	}

	info!("Shutdown requested, draining sync jobs");
	scheduler.shutdown().await;
}
