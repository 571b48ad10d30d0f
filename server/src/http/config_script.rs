//! Provides the `config.js` document configuring the console at load time
//!
//! The document is rendered once at startup from a tree of JavaScript literals,
//! every string going through [`escape_js`].

use crate::{
	config::{Config, ResourceOverrides},
	oauth::OAuthEndpoints,
};
use axum::{
	body::Bytes,
	http::{header, HeaderValue, Uri},
	response::{IntoResponse, Response},
};
use std::fmt::Write;
use url::Url;

/// Path prefix of API groups
const API_GROUP_PREFIX: &str = "/apis";
/// Path prefix of the OpenShift API
const MASTER_PREFIX: &str = "/oapi";
/// Path prefix of the legacy Kubernetes API
const KUBERNETES_PREFIX: &str = "/api";
/// OAuth client the console requests tokens as
const CLIENT_ID: &str = "openshift-web-console";

/// Endpoints and features of the cluster, as exposed to the console
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct ConsoleSettings {
	/// `host[:port]` to call API groups on
	pub(crate) api_group_addr: String,
	/// Path prefix of API groups
	pub(crate) api_group_prefix: String,
	/// `host[:port]` to call the OpenShift API on
	pub(crate) master_addr: String,
	/// Path prefix of the OpenShift API
	pub(crate) master_prefix: String,
	/// `host[:port]` to call the Kubernetes API on
	pub(crate) kubernetes_addr: String,
	/// Path prefix of the Kubernetes API
	pub(crate) kubernetes_prefix: String,
	/// OAuth authorization endpoint
	pub(crate) oauth_authorize_uri: String,
	/// OAuth token endpoint
	pub(crate) oauth_token_uri: String,
	/// Base of the OAuth redirect URI
	pub(crate) oauth_redirect_base: String,
	/// OAuth client identifier
	pub(crate) oauth_client_id: String,
	/// URL to redirect to after logging out
	pub(crate) logout_uri: String,
	/// Ratios overriding container requests and limits
	pub(crate) limit_request_overrides: Option<ResourceOverrides>,
	/// URL of the administrator console
	pub(crate) admin_console_url: String,
	/// URL of the log aggregation console
	pub(crate) logging_url: String,
	/// URL of the metrics service
	pub(crate) metrics_url: String,
	/// Whether templates are provided through the template service broker
	pub(crate) template_service_broker_enabled: bool,
	/// Minutes of inactivity before logging out
	pub(crate) inactivity_timeout_minutes: i64,
	/// Whether the cluster overcommits resources
	pub(crate) cluster_resource_overrides_enabled: bool,
}
impl ConsoleSettings {
	/// Collects the settings of a configured cluster
	pub(crate) fn new(config: &Config, master: &Url, oauth: &OAuthEndpoints) -> Self {
		let cluster = &config.cluster_info;
		let addr = host_port(&cluster.master_public_url, master);
		let optional = |url: &Option<String>| url.clone().unwrap_or_default();
		Self {
			api_group_addr: addr.clone(),
			api_group_prefix: API_GROUP_PREFIX.to_owned(),
			master_addr: addr.clone(),
			master_prefix: MASTER_PREFIX.to_owned(),
			kubernetes_addr: addr,
			kubernetes_prefix: KUBERNETES_PREFIX.to_owned(),
			oauth_authorize_uri: oauth.authorization_endpoint.clone(),
			oauth_token_uri: oauth.token_endpoint.clone(),
			oauth_redirect_base: cluster.console_public_url.clone(),
			oauth_client_id: CLIENT_ID.to_owned(),
			logout_uri: optional(&cluster.logout_public_url),
			limit_request_overrides: config.limit_request_overrides,
			admin_console_url: optional(&cluster.admin_console_public_url),
			logging_url: optional(&cluster.logging_public_url),
			metrics_url: optional(&cluster.metrics_public_url),
			template_service_broker_enabled: config.features.template_service_broker_enabled,
			inactivity_timeout_minutes: config.features.inactivity_timeout_minutes,
			cluster_resource_overrides_enabled: config.features.cluster_resource_overrides_enabled,
		}
	}

	/// Converts to a JavaScript object
	fn to_literal(&self) -> Literal<'_> {
		let mut fields = vec![
			(
				"apis",
				Literal::object([
					("hostPort", Literal::String(&self.api_group_addr)),
					("prefix", Literal::String(&self.api_group_prefix)),
				]),
			),
			(
				"api",
				Literal::object([
					(
						"openshift",
						Literal::object([
							("hostPort", Literal::String(&self.master_addr)),
							("prefix", Literal::String(&self.master_prefix)),
						]),
					),
					(
						"k8s",
						Literal::object([
							("hostPort", Literal::String(&self.kubernetes_addr)),
							("prefix", Literal::String(&self.kubernetes_prefix)),
						]),
					),
				]),
			),
			(
				"auth",
				Literal::object([
					("oauth_authorize_uri", Literal::String(&self.oauth_authorize_uri)),
					("oauth_token_uri", Literal::String(&self.oauth_token_uri)),
					("oauth_redirect_base", Literal::String(&self.oauth_redirect_base)),
					("oauth_client_id", Literal::String(&self.oauth_client_id)),
					("logout_uri", Literal::String(&self.logout_uri)),
				]),
			),
		];
		if let Some(overrides) = &self.limit_request_overrides {
			fields.push((
				"limitRequestOverrides",
				Literal::object([
					(
						"limitCPUToMemoryPercent",
						Literal::Number(overrides.limit_cpu_to_memory_percent),
					),
					(
						"cpuRequestToLimitPercent",
						Literal::Number(overrides.cpu_request_to_limit_percent),
					),
					(
						"memoryRequestToLimitPercent",
						Literal::Number(overrides.memory_request_to_limit_percent),
					),
				]),
			));
		}
		fields.extend([
			("adminConsoleURL", Literal::String(&self.admin_console_url)),
			("loggingURL", Literal::String(&self.logging_url)),
			("metricsURL", Literal::String(&self.metrics_url)),
			(
				"templateServiceBrokerEnabled",
				Literal::Bool(self.template_service_broker_enabled),
			),
			(
				"inactivityTimeoutMinutes",
				Literal::Number(self.inactivity_timeout_minutes),
			),
			(
				"clusterResourceOverridesEnabled",
				Literal::Bool(self.cluster_resource_overrides_enabled),
			),
		]);
		Literal::object(fields)
	}
}

/// Version information exposed to the console
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct ConsoleVersion {
	/// Version of the console
	pub(crate) console: String,
}

/// Returns `host[:port]` as written in `raw`, falling back to its parsed form `url`
///
/// Explicit default ports are kept, which [`Url`] drops.
fn host_port(raw: &str, url: &Url) -> String {
	let authority = Uri::try_from(raw)
		.ok()
		.and_then(|uri| uri.into_parts().authority);
	if let Some(authority) = authority {
		return match authority.port() {
			Some(port) => format!("{}:{}", authority.host(), port.as_str()),
			None => authority.host().to_owned(),
		};
	}

	let host = url.host_str().unwrap_or_default();
	match url.port() {
		Some(port) => format!("{host}:{port}"),
		None => host.to_owned(),
	}
}

/// Key of a JavaScript object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Key<'a> {
	/// Written as is
	Ident(&'static str),
	/// Written as an escaped string
	Quoted(&'a str),
}

/// JavaScript literal
#[derive(Debug, Clone, PartialEq, Eq)]
enum Literal<'a> {
	/// Escaped string
	String(&'a str),
	/// Integer
	Number(i64),
	/// Boolean
	Bool(bool),
	/// Object, keeping the order of its fields
	Object(Vec<(Key<'a>, Literal<'a>)>),
}
impl<'a> Literal<'a> {
	/// Constructs an object with identifier keys
	fn object<I>(fields: I) -> Self
	where
		I: IntoIterator<Item = (&'static str, Literal<'a>)>,
	{
		Self::Object(
			fields
				.into_iter()
				.map(|(key, value)| (Key::Ident(key), value))
				.collect(),
		)
	}

	/// Appends the source of this literal to `out`, nested `depth` objects deep
	fn write_to(&self, out: &mut String, depth: usize) {
		match self {
			Self::String(value) => {
				out.push('"');
				out.push_str(&escape_js(value));
				out.push('"');
			}
			Self::Number(value) => {
				let _ = write!(out, "{value}");
			}
			Self::Bool(value) => {
				let _ = write!(out, "{value}");
			}
			Self::Object(fields) if fields.is_empty() => out.push_str("{}"),
			Self::Object(fields) => {
				out.push_str("{\n");
				for (i, (key, value)) in fields.iter().enumerate() {
					if i > 0 {
						out.push_str(",\n");
					}
					indent(out, depth + 1);
					match key {
						Key::Ident(key) => out.push_str(key),
						Key::Quoted(key) => {
							out.push('"');
							out.push_str(&escape_js(key));
							out.push('"');
						}
					}
					out.push_str(": ");
					value.write_to(out, depth + 1);
				}
				out.push('\n');
				indent(out, depth);
				out.push('}');
			}
		}
	}
}

/// Appends the indentation of `depth` to `out`
#[inline]
fn indent(out: &mut String, depth: usize) {
	out.extend(std::iter::repeat("  ").take(depth));
}

/// Escapes `value` for use in a JavaScript string literal
///
/// Besides quotes and backslashes, characters meaningful to HTML (`<`, `>`, `&`, `=`),
/// control characters and line terminators are written as `\uXXXX` escapes,
/// so the literal is also safe inside an HTML document.
pub(crate) fn escape_js(value: &str) -> String {
	let mut escaped = String::with_capacity(value.len());
	for c in value.chars() {
		match c {
			'\\' => escaped.push_str("\\\\"),
			'\'' => escaped.push_str("\\'"),
			'"' => escaped.push_str("\\\""),
			'<' | '>' | '&' | '=' => {
				let _ = write!(escaped, "\\u{:04X}", u32::from(c));
			}
			c if c < ' ' || (!c.is_ascii() && c.is_control()) || matches!(c, '\u{2028}' | '\u{2029}') => {
				let _ = write!(escaped, "\\u{:04X}", u32::from(c));
			}
			c => escaped.push(c),
		}
	}
	escaped
}

/// Renders the `config.js` document
///
/// `properties` are written in the given order.
pub(crate) fn render<'p, I>(settings: &ConsoleSettings, version: &ConsoleVersion, properties: I) -> Bytes
where
	I: IntoIterator<Item = (&'p str, &'p str)>,
{
	let version = Literal::object([("console", Literal::String(&version.console))]);
	let properties = Literal::Object(
		properties
			.into_iter()
			.map(|(key, value)| (Key::Quoted(key), Literal::String(value)))
			.collect(),
	);

	let mut out = String::new();
	for (name, literal) in [
		("OPENSHIFT_CONFIG", settings.to_literal()),
		("OPENSHIFT_VERSION", version),
		("OPENSHIFT_EXTENSION_PROPERTIES", properties),
	] {
		out.push_str("window.");
		out.push_str(name);
		out.push_str(" = ");
		literal.write_to(&mut out, 0);
		out.push_str(";\n");
	}
	Bytes::from(out)
}

/// Rendered `config.js` document, answered as is
#[derive(Debug, Clone)]
pub(crate) struct ConfigScript(Bytes);
impl ConfigScript {
	/// Renders the document of a configured cluster
	pub(crate) fn new(config: &Config, master: &Url, oauth: &OAuthEndpoints, version: &str) -> Self {
		let settings = ConsoleSettings::new(config, master, oauth);
		let version = ConsoleVersion {
			console: version.to_owned(),
		};
		let properties = config
			.extensions
			.properties
			.iter()
			.map(|(key, value)| (key.as_str(), value.as_str()));
		Self(render(&settings, &version, properties))
	}
}
impl IntoResponse for ConfigScript {
	fn into_response(self) -> Response {
		(
			[
				(header::CACHE_CONTROL, HeaderValue::from_static("no-cache, no-store")),
				(
					header::CONTENT_TYPE,
					HeaderValue::from_static("application/javascript"),
				),
			],
			self.0,
		)
			.into_response()
	}
}
