//! Identity of the running node, handed explicitly to every component that talks to the primary.

use std::{path::PathBuf, sync::Arc, time::Duration};

use geo_registry::{ResourceId, ResourceTypeDescriptor};
use reqwest::{Client, RequestBuilder};
use url::Url;

use crate::config::GeoConfig;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared context of a secondary node.
#[derive(Debug, Clone)]
pub struct NodeContext {
	pub name: Arc<str>,
	pub primary_url: Url,
	access_token: Option<Arc<str>>,
	pub storage_dir: PathBuf,
	http: Client,
}

impl NodeContext {
	pub fn new(
		name: impl Into<Arc<str>>,
		primary_url: Url,
		access_token: Option<String>,
		storage_dir: PathBuf,
	) -> Result<Self, reqwest::Error> {
		let http = Client::builder()
			.connect_timeout(CONNECT_TIMEOUT)
			.user_agent(concat!("geo-core/", env!("CARGO_PKG_VERSION")))
			.build()?;

		Ok(Self {
			name: name.into(),
			primary_url,
			access_token: access_token.map(Into::into),
			storage_dir,
			http,
		})
	}

	pub fn from_config(config: &GeoConfig) -> Result<Self, reqwest::Error> {
		Self::new(
			config.node.name.as_str(),
			config.node.primary_url.clone(),
			config.node.access_token.clone(),
			config.storage_dir(),
		)
	}

	/// `{primary}/api/v4/geo/{segments..}`
	#[must_use]
	pub fn api_url(&self, segments: &[&str]) -> Url {
		let mut url = self.primary_url.clone();

		// Only cannot-be-a-base urls refuse segments, and the config only takes http(s) ones
		if let Ok(mut path) = url.path_segments_mut() {
			path.pop_if_empty()
				.extend(["api", "v4", "geo"])
				.extend(segments);
		}

		url
	}

	/// Where the primary serves the content of a blob.
	#[must_use]
	pub fn blob_url(&self, descriptor: &ResourceTypeDescriptor, resource_id: ResourceId) -> Url {
		self.api_url(&["retrieve", descriptor.primary_path, &resource_id.to_string()])
	}

	/// Git remote of a repository on the primary.
	#[must_use]
	pub fn repository_url(
		&self,
		descriptor: &ResourceTypeDescriptor,
		resource_id: ResourceId,
	) -> Url {
		let mut url = self.primary_url.clone();

		if let Ok(mut path) = url.path_segments_mut() {
			path.pop_if_empty()
				.extend([descriptor.primary_path, &format!("{resource_id}.git")]);
		}

		url
	}

	#[must_use]
	pub fn access_token(&self) -> Option<&str> {
		self.access_token.as_deref()
	}

	/// Request builder with the node's credentials already attached.
	pub(crate) fn request(&self, method: reqwest::Method, url: Url) -> RequestBuilder {
		let request = self.http.request(method, url);

		match &self.access_token {
			Some(token) => request.bearer_auth(token),
			None => request,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use geo_registry::ResourceType;

	#[test]
	fn builds_primary_urls() {
		let ctx = NodeContext::new(
			"secondary",
			Url::parse("https://primary.example.com/gitlab/").unwrap(),
			None,
			PathBuf::from("/tmp"),
		)
		.unwrap();

		assert_eq!(
			ctx.blob_url(ResourceType::LfsObject.descriptor(), 12).as_str(),
			"https://primary.example.com/gitlab/api/v4/geo/retrieve/lfs_objects/12"
		);
		assert_eq!(
			ctx.repository_url(ResourceType::WikiRepository.descriptor(), 3)
				.as_str(),
			"https://primary.example.com/gitlab/wiki_repositories/3.git"
		);
	}
}
