//! Provides the server's configuration

use crate::error::Error;
use config::{ConfigError, Environment, File};
use serde::Deserialize;
use std::{
	collections::BTreeMap,
	net::{IpAddr, Ipv4Addr, SocketAddr},
	path::{Path, PathBuf},
	time::Duration,
};
use url::Url;

/// Base name of the configuration file looked up in the working directory
const DEFAULT_CONFIG_NAME: &str = "webconsole-config";
/// Prefix of the environment variables overriding the configuration
const ENV_PREFIX: &str = "WEBCONSOLE";

/// Builds the server's configuration
///
/// If `file` is given it must exist, otherwise an optional `webconsole-config.{toml,yaml}`
/// is read from the working directory.
/// Both are overridden by `WEBCONSOLE_`-prefixed environment variables,
/// using `__` to separate nested keys (e.g. `WEBCONSOLE_SERVING_INFO__PORT`).
///
/// Relative paths are resolved against the directory of `file`.
pub(super) fn build_config(file: Option<&Path>) -> Result<Config, ConfigError> {
	let source = match file {
		Some(file) => File::from(file).required(true),
		None => File::with_name(DEFAULT_CONFIG_NAME).required(false),
	};
	let mut config: Config = config::Config::builder()
		.add_source(source)
		.add_source(
			Environment::with_prefix(ENV_PREFIX)
				.prefix_separator("_")
				.separator("__")
				.list_separator(",")
				.with_list_parse_key("serving_info.cors_allowed_origins")
				.with_list_parse_key("extensions.script_urls")
				.with_list_parse_key("extensions.stylesheet_urls")
				.try_parsing(true),
		)
		.build()
		.and_then(|config| config.try_deserialize())?;

	if let Some(base) = file.and_then(Path::parent) {
		config.resolve_paths(base);
	}
	Ok(config)
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Config {
	/// How the server listens for and handles requests
	#[serde(default)]
	pub(crate) serving_info: ServingInfo,
	/// Public URLs of the cluster
	pub(crate) cluster_info: ClusterInfo,
	/// Console feature toggles
	#[serde(default)]
	pub(crate) features: Features,
	/// Operator-supplied console extensions
	#[serde(default)]
	pub(crate) extensions: Extensions,
	/// Ratios overriding container requests and limits
	#[serde(default)]
	pub(crate) limit_request_overrides: Option<ResourceOverrides>,
	/// Explicit OAuth endpoints, skipping discovery
	#[serde(default)]
	pub(crate) oauth: OAuthOverrides,
	/// Single-page applications served under the context root
	#[serde(default = "Config::default_subcontexts")]
	pub(crate) subcontexts: Vec<Subcontext>,
	/// Directory whose files take precedence over the embedded console
	#[serde(default)]
	pub(crate) assets_dir: Option<PathBuf>,
}
impl Config {
	/// Default value for [`subcontexts`](Self#structfield.subcontexts)
	fn default_subcontexts() -> Vec<Subcontext> {
		vec![
			Subcontext {
				path: String::new(),
				index: "index.html".to_owned(),
			},
			Subcontext {
				path: "java".to_owned(),
				index: "java/index.html".to_owned(),
			},
		]
	}

	/// Makes relative paths relative to `base`
	fn resolve_paths(&mut self, base: &Path) {
		for path in [self.assets_dir.as_mut(), self.oauth.ca_file.as_mut()]
			.into_iter()
			.flatten()
		{
			if path.is_relative() {
				*path = base.join(&*path);
			}
		}
	}

	/// Parses the console's public URL
	///
	/// # Errors
	/// The URL must be valid and its path must end with a slash,
	/// since it is used as the context root.
	pub(crate) fn public_url(&self) -> Result<Url, Error> {
		let url = parse_url("console public URL", &self.cluster_info.console_public_url)?;
		if !url.path().ends_with('/') {
			return Err(Error::InvalidContextRoot(url.path().to_owned()));
		}
		Ok(url)
	}

	/// Parses the master's public URL
	///
	/// # Errors
	/// The URL must be valid and have a host.
	pub(crate) fn master_url(&self) -> Result<Url, Error> {
		let url = parse_url("master public URL", &self.cluster_info.master_public_url)?;
		if url.host_str().is_none() {
			return Err(Error::MissingHost {
				field: "master public URL",
				value: self.cluster_info.master_public_url.clone(),
			});
		}
		Ok(url)
	}
}

/// Parses a configured URL
fn parse_url(field: &'static str, value: &str) -> Result<Url, Error> {
	Url::parse(value).map_err(|source| Error::InvalidUrl {
		field,
		value: value.to_owned(),
		source,
	})
}

/// Configuration of the listener and of the generic request pipeline
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ServingInfo {
	/// Address to bind the server to
	#[serde(default = "ServingInfo::default_addr")]
	pub(crate) addr: IpAddr,
	/// Port to bind the server to
	#[serde(default = "ServingInfo::default_port")]
	pub(crate) port: u16,
	/// Maximum number of requests handled at once, `0` meaning unlimited
	#[serde(default)]
	pub(crate) max_requests_in_flight: usize,
	/// Time after which a request is answered with `408 Request Timeout`
	#[serde(default = "ServingInfo::default_request_timeout_seconds")]
	pub(crate) request_timeout_seconds: u64,
	/// Origins allowed to make cross-origin requests
	#[serde(default)]
	pub(crate) cors_allowed_origins: Vec<String>,
}
impl ServingInfo {
	/// Default value for [`addr`](Self#structfield.addr)
	#[inline]
	const fn default_addr() -> IpAddr {
		IpAddr::V4(Ipv4Addr::UNSPECIFIED)
	}

	/// Default value for [`port`](Self#structfield.port)
	#[inline]
	const fn default_port() -> u16 {
		8443
	}

	/// Default value for [`request_timeout_seconds`](Self#structfield.request_timeout_seconds)
	#[inline]
	const fn default_request_timeout_seconds() -> u64 {
		60
	}

	/// Returns the socket address to listen on
	#[inline]
	pub(crate) const fn socket_addr(&self) -> SocketAddr {
		SocketAddr::new(self.addr, self.port)
	}

	/// Returns the request timeout
	#[inline]
	pub(crate) const fn request_timeout(&self) -> Duration {
		Duration::from_secs(self.request_timeout_seconds)
	}
}
impl Default for ServingInfo {
	#[inline]
	fn default() -> Self {
		Self {
			addr: Self::default_addr(),
			port: Self::default_port(),
			max_requests_in_flight: 0,
			request_timeout_seconds: Self::default_request_timeout_seconds(),
			cors_allowed_origins: Vec::new(),
		}
	}
}

/// Public URLs of the cluster, as seen by browsers
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ClusterInfo {
	/// URL the console is served on; its path is the context root
	pub(crate) console_public_url: String,
	/// URL of the master API server
	pub(crate) master_public_url: String,
	/// URL to redirect to after logging out
	#[serde(default)]
	pub(crate) logout_public_url: Option<String>,
	/// URL of the log aggregation console
	#[serde(default)]
	pub(crate) logging_public_url: Option<String>,
	/// URL of the metrics service
	#[serde(default)]
	pub(crate) metrics_public_url: Option<String>,
	/// URL of the administrator console
	#[serde(default)]
	pub(crate) admin_console_public_url: Option<String>,
}

/// Console feature toggles
#[derive(Debug, Default, Clone, Copy, Deserialize)]
pub(crate) struct Features {
	/// Minutes of inactivity before logging out, `0` disabling it
	#[serde(default)]
	pub(crate) inactivity_timeout_minutes: i64,
	/// Whether the cluster overcommits resources
	#[serde(default)]
	pub(crate) cluster_resource_overrides_enabled: bool,
	/// Whether templates are provided through the template service broker
	#[serde(default)]
	pub(crate) template_service_broker_enabled: bool,
}

/// Console extensions
#[derive(Debug, Default, Clone, Deserialize)]
pub(crate) struct Extensions {
	/// Scripts appended to the root console's index document
	#[serde(default)]
	pub(crate) script_urls: Vec<String>,
	/// Stylesheets appended to the root console's index document
	#[serde(default)]
	pub(crate) stylesheet_urls: Vec<String>,
	/// Free-form properties exposed to extensions
	#[serde(default)]
	pub(crate) properties: BTreeMap<String, String>,
}

/// Ratios overriding container requests and limits, in percent
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
pub(crate) struct ResourceOverrides {
	/// CPU limit as a ratio of the memory limit
	#[serde(default)]
	pub(crate) limit_cpu_to_memory_percent: i64,
	/// CPU request as a ratio of the CPU limit
	#[serde(default)]
	pub(crate) cpu_request_to_limit_percent: i64,
	/// Memory request as a ratio of the memory limit
	#[serde(default)]
	pub(crate) memory_request_to_limit_percent: i64,
}

/// OAuth endpoints overriding discovery
#[derive(Debug, Default, Clone, Deserialize)]
pub(crate) struct OAuthOverrides {
	/// Authorization endpoint
	#[serde(default)]
	pub(crate) authorization_endpoint: Option<String>,
	/// Token endpoint
	#[serde(default)]
	pub(crate) token_endpoint: Option<String>,
	/// PEM file of the certificate authorities trusted when discovering the endpoints
	#[serde(default)]
	pub(crate) ca_file: Option<PathBuf>,
}

/// Single-page application mounted under the context root
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub(crate) struct Subcontext {
	/// Mount path relative to the context root, without leading or trailing slash
	///
	/// The empty path is the console itself.
	#[serde(default)]
	pub(crate) path: String,
	/// Asset path of the index document
	pub(crate) index: String,
}
