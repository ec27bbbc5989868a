use std::collections::HashMap;

use async_trait::async_trait;
use geo_registry::{ResourceId, ResourceType};
use reqwest::{Method, Response};
use serde::Serialize;
use tracing::{instrument, trace};

use crate::context::NodeContext;

use super::{CatalogError, PrimaryCatalog, PrimaryResource};

/// Reads the catalog from the primary's internal Geo API.
#[derive(Debug, Clone)]
pub struct HttpCatalog {
	ctx: NodeContext,
}

#[derive(Serialize)]
struct Lookup<'ids> {
	ids: &'ids [ResourceId],
}

impl HttpCatalog {
	#[must_use]
	pub const fn new(ctx: NodeContext) -> Self {
		Self { ctx }
	}

	async fn decode(
		response: Result<Response, reqwest::Error>,
	) -> Result<Vec<PrimaryResource>, CatalogError> {
		let response = response.map_err(|e| CatalogError::Unavailable(e.to_string()))?;

		let status = response.status();
		if !status.is_success() {
			return Err(CatalogError::Unavailable(format!(
				"primary answered HTTP {} for {}",
				status.as_u16(),
				response.url()
			)));
		}

		response
			.json()
			.await
			.map_err(|e| CatalogError::Unavailable(format!("malformed catalog page: {e}")))
	}
}

#[async_trait]
impl PrimaryCatalog for HttpCatalog {
	#[instrument(skip(self), err)]
	async fn list_resources(
		&self,
		resource_type: ResourceType,
		after: Option<ResourceId>,
		limit: usize,
	) -> Result<Vec<PrimaryResource>, CatalogError> {
		let mut url = self
			.ctx
			.api_url(&["catalog", resource_type.descriptor().primary_path]);

		{
			let mut query = url.query_pairs_mut();
			if let Some(after) = after {
				query.append_pair("after", &after.to_string());
			}
			query.append_pair("limit", &limit.to_string());
		}

		let mut resources = Self::decode(self.ctx.request(Method::GET, url).send().await).await?;

		// Never trust the remote to honor the cursor
		resources.retain(|resource| after.map_or(true, |after| resource.id > after));
		resources.sort_unstable_by_key(|resource| resource.id);
		resources.truncate(limit);

		trace!(count = resources.len(), "Fetched catalog page");

		Ok(resources)
	}

	#[instrument(skip(self, ids), fields(ids_count = ids.len()), err)]
	async fn find_many(
		&self,
		resource_type: ResourceType,
		ids: &[ResourceId],
	) -> Result<HashMap<ResourceId, PrimaryResource>, CatalogError> {
		if ids.is_empty() {
			return Ok(HashMap::new());
		}

		let url = self.ctx.api_url(&[
			"catalog",
			resource_type.descriptor().primary_path,
			"lookup",
		]);

		let resources = Self::decode(
			self.ctx
				.request(Method::POST, url)
				.json(&Lookup { ids })
				.send()
				.await,
		)
		.await?;

		Ok(resources
			.into_iter()
			.map(|resource| (resource.id, resource))
			.collect())
	}
}
