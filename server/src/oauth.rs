//! Provides the OAuth endpoints the console requests tokens from

use crate::{config::OAuthOverrides, error::Error};
use serde::Deserialize;
use std::{fs, path::Path, time::Duration};
use url::Url;

/// Absolute path of the OAuth 2.0 authorization server metadata on the master
const METADATA_PATH: &str = "/.well-known/oauth-authorization-server";
/// Time after which discovery is abandoned
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Endpoints of the OAuth authorization server
///
/// Deserializes from the authorization server metadata, ignoring its other fields.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
pub(crate) struct OAuthEndpoints {
	/// Authorization endpoint
	#[serde(default)]
	pub(crate) authorization_endpoint: String,
	/// Token endpoint
	#[serde(default)]
	pub(crate) token_endpoint: String,
}
impl OAuthEndpoints {
	/// Replaces the endpoints set in `overrides`
	fn overridden(self, overrides: &OAuthOverrides) -> Self {
		Self {
			authorization_endpoint: overrides
				.authorization_endpoint
				.clone()
				.unwrap_or(self.authorization_endpoint),
			token_endpoint: overrides
				.token_endpoint
				.clone()
				.unwrap_or(self.token_endpoint),
		}
	}

	/// Checks that both endpoints are set
	fn validate(self) -> Result<Self, Error> {
		if self.authorization_endpoint.is_empty() || self.token_endpoint.is_empty() {
			return Err(Error::IncompleteOAuthMetadata {
				authorization: self.authorization_endpoint,
				token: self.token_endpoint,
			});
		}
		Ok(self)
	}
}

/// Returns the URL of the authorization server metadata published by `master`
fn metadata_url(master: &Url) -> Result<Url, Error> {
	master.join(METADATA_PATH).map_err(|source| Error::InvalidUrl {
		field: "OAuth metadata URL",
		value: master.to_string(),
		source,
	})
}

/// Constructs the client fetching the metadata
///
/// Certificates in `ca_file` are trusted along with the public roots.
fn discovery_client(ca_file: Option<&Path>) -> Result<reqwest::Client, Error> {
	let mut builder = reqwest::Client::builder().timeout(DISCOVERY_TIMEOUT);
	if let Some(path) = ca_file {
		let pem = fs::read(path).map_err(|source| Error::CaFile {
			path: path.to_owned(),
			source,
		})?;
		let certificate = reqwest::Certificate::from_pem(&pem).map_err(|source| Error::InvalidCaFile {
			path: path.to_owned(),
			source,
		})?;
		log::debug!("Trusting the certificate authorities in {}", path.display());
		builder = builder.add_root_certificate(certificate);
	}
	Ok(builder.build()?)
}

/// Resolves the OAuth endpoints
///
/// Endpoints set in `overrides` are used as is.
/// Otherwise they are discovered from the metadata published by `master`.
///
/// # Errors
/// Fails if the certificate authorities cannot be loaded, if discovery fails
/// or if an endpoint remains empty.
pub(crate) async fn resolve(overrides: &OAuthOverrides, master: &Url) -> Result<OAuthEndpoints, Error> {
	if overrides.authorization_endpoint.is_some() && overrides.token_endpoint.is_some() {
		log::debug!("Using the configured OAuth endpoints");
		return OAuthEndpoints::default().overridden(overrides).validate();
	}

	let url = metadata_url(master)?;
	log::info!("Discovering OAuth endpoints from {url}");
	let discovered = discovery_client(overrides.ca_file.as_deref())?
		.get(url)
		.send()
		.await?
		.error_for_status()?
		.json::<OAuthEndpoints>()
		.await?;
	let endpoints = discovered.overridden(overrides).validate()?;
	log::debug!(
		"OAuth endpoints: authorization {}, token {}",
		endpoints.authorization_endpoint,
		endpoints.token_endpoint
	);
	Ok(endpoints)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn metadata() {
		let endpoints: OAuthEndpoints = serde_json::from_str(
			r#"{
				"issuer": "https://api.example.com:8443",
				"authorization_endpoint": "https://api.example.com:8443/oauth/authorize",
				"token_endpoint": "https://api.example.com:8443/oauth/token",
				"scopes_supported": ["user:full"]
			}"#,
		)
		.unwrap();
		let endpoints = endpoints.validate().unwrap();
		assert_eq!(endpoints.token_endpoint, "https://api.example.com:8443/oauth/token");
	}

	#[test]
	fn incomplete_metadata() {
		let endpoints: OAuthEndpoints =
			serde_json::from_str(r#"{"authorization_endpoint": "https://api.example.com/oauth/authorize"}"#)
				.unwrap();
		assert!(matches!(
			endpoints.validate(),
			Err(Error::IncompleteOAuthMetadata { token, .. }) if token.is_empty()
		));
	}

	#[test]
	fn partial_overrides() {
		let discovered = OAuthEndpoints {
			authorization_endpoint: "https://a.example.com".to_owned(),
			token_endpoint: "https://t.example.com".to_owned(),
		};
		let overrides = OAuthOverrides {
			token_endpoint: Some("https://override.example.com".to_owned()),
			..OAuthOverrides::default()
		};
		assert_eq!(
			discovered.overridden(&overrides),
			OAuthEndpoints {
				authorization_endpoint: "https://a.example.com".to_owned(),
				token_endpoint: "https://override.example.com".to_owned(),
			}
		);
	}

	#[test]
	fn metadata_on_master_root() {
		let master = Url::parse("https://api.example.com:8443/some/path").unwrap();
		assert_eq!(
			metadata_url(&master).unwrap().as_str(),
			"https://api.example.com:8443/.well-known/oauth-authorization-server"
		);
	}

	#[tokio::test]
	async fn configured_endpoints_skip_discovery() {
		let overrides = OAuthOverrides {
			authorization_endpoint: Some("https://a.example.com".to_owned()),
			token_endpoint: Some("https://t.example.com".to_owned()),
			ca_file: Some("/nonexistent/ca.crt".into()),
		};
		// Nothing listens on this address
		let master = Url::parse("https://127.0.0.1:1").unwrap();
		let endpoints = resolve(&overrides, &master).await.unwrap();
		assert_eq!(endpoints.authorization_endpoint, "https://a.example.com");
	}

	#[tokio::test]
	async fn missing_ca_file() {
		let dir = tempfile::tempdir().unwrap();
		let overrides = OAuthOverrides {
			ca_file: Some(dir.path().join("ca.crt")),
			..OAuthOverrides::default()
		};
		let master = Url::parse("https://127.0.0.1:1").unwrap();
		assert!(matches!(
			resolve(&overrides, &master).await,
			Err(Error::CaFile { path, .. }) if path.ends_with("ca.crt")
		));
	}
}
