use axum::{
	extract::{Path, State},
	http::StatusCode,
	response::{IntoResponse, Response},
	routing::{get, post},
	Json, Router,
};
use geo_core::{
	registry::{ResourceId, ResourceType},
	replicator::ReplicatorError,
	DispatchScheduler, GeoStatus, SchedulerError,
};
use serde::Serialize;
use serde_json::json;
use tracing::error;

pub fn router(scheduler: DispatchScheduler) -> Router {
	Router::new()
		.route("/health", get(|| async { "OK" }))
		.route("/status", get(status))
		.route("/dispatch", post(dispatch))
		.route("/dispatch/:resource_type", post(dispatch_type))
		.route(
			"/registry/:resource_type/:resource_id/resync",
			post(resync),
		)
		.fallback(|| async { (StatusCode::NOT_FOUND, "404 Not Found") })
		.with_state(scheduler)
}

struct ApiError(SchedulerError);

impl From<SchedulerError> for ApiError {
	fn from(e: SchedulerError) -> Self {
		Self(e)
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let status = match &self.0 {
			SchedulerError::Replicator(ReplicatorError::UnknownType(_)) => StatusCode::NOT_FOUND,
			e => {
				error!(?e, "Request failed");
				StatusCode::INTERNAL_SERVER_ERROR
			}
		};

		(status, Json(json!({ "error": self.0.to_string() }))).into_response()
	}
}

async fn status(State(scheduler): State<DispatchScheduler>) -> Result<Json<GeoStatus>, ApiError> {
	Ok(Json(scheduler.status().await?))
}

async fn dispatch(State(scheduler): State<DispatchScheduler>) -> StatusCode {
	scheduler.trigger_dispatch(None).await;
	StatusCode::ACCEPTED
}

async fn dispatch_type(
	State(scheduler): State<DispatchScheduler>,
	Path(resource_type): Path<ResourceType>,
) -> StatusCode {
	scheduler.trigger_dispatch(Some(resource_type)).await;
	StatusCode::ACCEPTED
}

#[derive(Serialize)]
struct Resync {
	resource_type: ResourceType,
	resource_id: ResourceId,
	/// `false` when a sync of the resource is already running
	queued: bool,
}

async fn resync(
	State(scheduler): State<DispatchScheduler>,
	Path((resource_type, resource_id)): Path<(ResourceType, ResourceId)>,
) -> Result<(StatusCode, Json<Resync>), ApiError> {
	let queued = scheduler.resync(resource_type, resource_id).await?;
	let status = if queued {
		StatusCode::ACCEPTED
	} else {
		StatusCode::CONFLICT
	};

	Ok((
		status,
		Json(Resync {
			resource_type,
			resource_id,
			queued,
		}),
	))
}
