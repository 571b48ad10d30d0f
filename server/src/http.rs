//! Provides the server's HTTP features

use crate::{assets::SharedAssets, config::Config, error::Error};
use axum::{
	error_handling::HandleErrorLayer,
	extract::{ConnectInfo, State},
	http::{
		header::{self, HeaderName},
		uri::PathAndQuery,
		HeaderValue, Method, Request, StatusCode, Uri,
	},
	middleware::{self, Next},
	response::{IntoResponse, Response},
	routing, BoxError, Router,
};
use futures_util::future;
use std::{
	borrow::Cow,
	fmt::{self, Display, Formatter},
	net::SocketAddr,
	sync::Arc,
	time::Duration,
};
use tower::{limit::GlobalConcurrencyLimitLayer, load_shed::error::Overloaded, ServiceBuilder};
use tower_http::{
	catch_panic::CatchPanicLayer,
	classify::{ServerErrorsAsFailures, SharedClassifier},
	cors::{AllowOrigin, CorsLayer},
	timeout::TimeoutLayer,
	trace::{DefaultMakeSpan, OnFailure, OnRequest, OnResponse, TraceLayer},
};
use tracing::Span;

pub(crate) mod config_script;
mod files;
mod gzip;
mod html5;
mod sniff;
mod vary;

use config_script::ConfigScript;
use files::FileServer;
use gzip::GzipLayer;
use html5::{Html5Mode, Html5ModeLayer, Html5Options};

/// Headers set on every response of the console
static SECURITY_HEADERS: [(HeaderName, &str); 5] = [
	(header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
	(header::X_XSS_PROTECTION, "1; mode=block"),
	(header::X_FRAME_OPTIONS, "DENY"),
	(header::X_DNS_PREFETCH_CONTROL, "off"),
	(header::REFERRER_POLICY, "strict-origin-when-cross-origin"),
];

/// Constructs a new configured [`Router`]
///
/// `cache_token` versions the `ETag`s of the assets.
///
/// # Errors
/// Fails if the public URL or the subcontexts are invalid.
pub(super) fn new_router(
	config: &Config,
	assets: SharedAssets,
	script: ConfigScript,
	cache_token: &str,
) -> Result<Router, Error> {
	let public_url = config.public_url()?;
	let context_root = public_url.path();
	// Route paths would interpret these, or be empty
	if context_root.contains([':', '*']) || context_root.contains("//") {
		return Err(Error::InvalidContextRoot(context_root.to_owned()));
	}

	let html5 = Html5Mode::new(
		Html5Options {
			context_root,
			subcontexts: &config.subcontexts,
			extension_scripts: &config.extensions.script_urls,
			extension_stylesheets: &config.extensions.stylesheet_urls,
			version: cache_token,
		},
		Arc::clone(&assets),
	)?;
	let serving_info = &config.serving_info;
	let cors = cors_layer(&serving_info.cors_allowed_origins);
	let console = ServiceBuilder::new()
		.layer(middleware::from_fn_with_state(
			ContextRoot(context_root.into()),
			strip_context_root,
		))
		// NOTE: Gzip must wrap the HTML5 mode so that `ETag`s vary on `Accept-Encoding`,
		// and CORS so that its `Vary` values do not replace `Accept-Encoding`
		.layer(GzipLayer)
		.layer(cors.clone())
		.map_response(set_security_headers)
		.layer(Html5ModeLayer::new(html5))
		.service(FileServer::new(assets));

	let config_script = routing::get(move || future::ready(script.clone())).layer(
		ServiceBuilder::new()
			.layer(GzipLayer)
			.layer(cors)
			.map_response(set_security_headers),
	);
	let mut router = Router::new().route(&format!("{context_root}config.js"), config_script);
	if context_root != "/" {
		let target = context_root.to_owned();
		router = router
			.route(
				context_root.trim_end_matches('/'),
				routing::any(move || future::ready(redirect(StatusCode::MOVED_PERMANENTLY, &target))),
			)
			.route(
				"/",
				routing::any({
					let target = context_root.to_owned();
					move || future::ready(redirect(StatusCode::FOUND, &target))
				}),
			);
	}
	log::info!("Serving the console under {context_root}");

	let concurrency_limit = (serving_info.max_requests_in_flight > 0)
		.then(|| GlobalConcurrencyLimitLayer::new(serving_info.max_requests_in_flight));
	Ok(router.fallback_service(console).layer(
		// NOTE: Requests pass through layers top down (↓)
		ServiceBuilder::new()
			.layer(CatchPanicLayer::new())
			.layer(CustomTrace::new_layer())
			.layer(middleware::from_fn(req_to_res_extensions))
			.layer(TimeoutLayer::new(serving_info.request_timeout()))
			.layer(HandleErrorLayer::new(handle_overload))
			.load_shed()
			.option_layer(concurrency_limit),
		// NOTE: Responses pass through layers bottom up (↑)
	))
}

/// Path prefix the console is served under, with leading and trailing slashes
#[derive(Debug, Clone)]
struct ContextRoot(Arc<str>);

/// [Middleware](axum::middleware) that removes the context root from the request path
///
/// Requests outside of the context root are answered with `404 Not Found`.
async fn strip_context_root<B>(
	State(ContextRoot(root)): State<ContextRoot>,
	mut request: Request<B>,
	next: Next<B>,
) -> Response {
	let stripped = match request.uri().path().strip_prefix(&*root) {
		Some(rest) => match request.uri().query() {
			Some(query) => format!("/{rest}?{query}"),
			None => format!("/{rest}"),
		},
		None => return StatusCode::NOT_FOUND.into_response(),
	};

	let mut parts = request.uri().clone().into_parts();
	parts.path_and_query = PathAndQuery::try_from(stripped).ok();
	match Uri::from_parts(parts) {
		Ok(uri) => *request.uri_mut() = uri,
		Err(err) => {
			log::warn!("Could not strip the context root from {}: {err}", request.uri());
			return StatusCode::BAD_REQUEST.into_response();
		}
	}
	next.run(request).await
}

/// Sets [`SECURITY_HEADERS`] on `response`
fn set_security_headers(mut response: Response) -> Response {
	let headers = response.headers_mut();
	for (name, value) in &SECURITY_HEADERS {
		headers.insert(name.clone(), HeaderValue::from_static(*value));
	}
	response
}

/// Answers with a redirection to `location`
pub(crate) fn redirect(status: StatusCode, location: &str) -> Response {
	match HeaderValue::try_from(location) {
		Ok(location) => (status, [(header::LOCATION, location)]).into_response(),
		Err(err) => {
			log::error!("Invalid redirect location {location:?}: {err}");
			StatusCode::INTERNAL_SERVER_ERROR.into_response()
		}
	}
}

/// Returns the asset path requested by `uri`, without leading slash and percent-decoded
pub(crate) fn asset_path(uri: &Uri) -> Cow<'_, str> {
	let path = uri.path();
	let path = path.strip_prefix('/').unwrap_or(path);
	urlencoding::decode(path).unwrap_or(Cow::Borrowed(path))
}

/// Constructs the [`CorsLayer`] allowing `origins` to call the server
fn cors_layer(origins: &[String]) -> CorsLayer {
	let origins = origins.iter().filter_map(|origin| {
		HeaderValue::from_str(origin)
			.map_err(|err| log::warn!("Ignoring CORS origin {origin:?}: {err}"))
			.ok()
	});
	CorsLayer::new()
		.allow_origin(AllowOrigin::list(origins))
		.allow_credentials(true)
		.allow_methods([
			Method::GET,
			Method::HEAD,
			Method::POST,
			Method::PUT,
			Method::PATCH,
			Method::DELETE,
			Method::OPTIONS,
		])
		.allow_headers([
			header::CONTENT_TYPE,
			header::CONTENT_LENGTH,
			header::ACCEPT_ENCODING,
			header::AUTHORIZATION,
			header::IF_NONE_MATCH,
			HeaderName::from_static("x-csrf-token"),
			HeaderName::from_static("x-requested-with"),
		])
		.expose_headers([header::DATE])
}

/// Answers requests rejected by the concurrency limit
async fn handle_overload(err: BoxError) -> StatusCode {
	if err.is::<Overloaded>() {
		StatusCode::TOO_MANY_REQUESTS
	} else {
		log::error!("Unhandled service error: {err}");
		StatusCode::INTERNAL_SERVER_ERROR
	}
}

/// [Middleware](axum::middleware) that copies some [`Request`] extensions to the [`Response`]
///
/// # Copied extensions
/// - [`ConnectInfo<SocketAddr>`]
async fn req_to_res_extensions<B>(request: Request<B>, next: Next<B>) -> Response {
	let client = request
		.extensions()
		.get::<ConnectInfo<SocketAddr>>()
		.copied();

	let mut response = next.run(request).await;
	if let Some(client) = client {
		response.extensions_mut().insert(client);
	}
	response
}

/// Gets the [`ConnectInfo<SocketAddr>`] extension from the given object
macro_rules! get_client {
	($obj:expr) => {
		$obj.extensions()
			.get::<ConnectInfo<SocketAddr>>()
			.map(|ConnectInfo(addr)| addr.to_string())
			.unwrap_or_else(|| "anonymous".to_owned())
	};
}

/// Custom implementation of [`tower_http::trace`] traits to use with [`TraceLayer`]
#[derive(Debug, Default, Clone, Copy)]
struct CustomTrace;
impl CustomTrace {
	/// Constructs a new [`TraceLayer`] configured to use [`CustomTrace`]
	#[inline]
	fn new_layer() -> TraceLayer<SharedClassifier<ServerErrorsAsFailures>, DefaultMakeSpan, Self, Self, (), (), Self>
	{
		TraceLayer::new_for_http()
			.on_request(Self)
			.on_response(Self)
			.on_body_chunk(())
			.on_eos(())
			.on_failure(Self)
	}
}
impl<B> OnRequest<B> for CustomTrace {
	fn on_request(&mut self, request: &Request<B>, span: &Span) {
		let client = get_client!(request);

		tracing::debug!(parent: span, "{client} ---> {} {}", request.method(), request.uri());
	}
}
impl<B> OnResponse<B> for CustomTrace {
	fn on_response(self, response: &Response<B>, latency: Duration, span: &Span) {
		let client = get_client!(response);
		let encoding = response
			.headers()
			.get(header::CONTENT_ENCODING)
			.and_then(|value| value.to_str().ok())
			.unwrap_or("identity");

		if response.status().is_server_error() {
			tracing::warn!(parent: span, "{client} <--- {} (in {})", response.status(), FmtDuration(latency));
		} else {
			tracing::info!(parent: span, "{client} <--- {} {encoding} (in {})", response.status(), FmtDuration(latency));
		}
	}
}
impl<T> OnFailure<T> for CustomTrace
where
	T: Display,
{
	fn on_failure(&mut self, failure: T, latency: Duration, span: &Span) {
		tracing::warn!(parent: span, "{failure} (after {})", FmtDuration(latency));
	}
}

/// Wrapper around [`Duration`] to implement [`Display`]
#[derive(Debug, Default, Clone, Copy)]
struct FmtDuration(Duration);
impl Display for FmtDuration {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		let duration = self.0.as_micros();
		if duration >= 1_000_000 {
			write!(f, "{:.3}s", self.0.as_secs_f32())
		} else if duration >= 1000 {
			write!(f, "{}ms", duration / 1000)
		} else {
			write!(f, "{duration}µs")
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		config::tests::{from_toml, MINIMAL},
		oauth::OAuthEndpoints,
	};
	use axum::body::Body;
	use flate2::read::GzDecoder;
	use std::io::Read;
	use tower::ServiceExt;

	fn router(toml: &str) -> Router {
		let config = from_toml(toml);
		let oauth = OAuthEndpoints {
			authorization_endpoint: "https://api.example.com:8443/oauth/authorize".to_owned(),
			token_endpoint: "https://api.example.com:8443/oauth/token".to_owned(),
		};
		let script = ConfigScript::new(&config, &config.master_url().unwrap(), &oauth, "v1");
		new_router(&config, html5::tests::assets(), script, "1234").unwrap()
	}

	async fn send(router: Router, request: Request<Body>) -> Response {
		router.oneshot(request).await.unwrap()
	}

	fn get(uri: &str) -> Request<Body> {
		Request::builder().uri(uri).body(Body::empty()).unwrap()
	}

	fn get_gzip(uri: &str) -> Request<Body> {
		Request::builder()
			.uri(uri)
			.header(header::ACCEPT_ENCODING, "gzip, deflate")
			.body(Body::empty())
			.unwrap()
	}

	async fn text(response: Response) -> String {
		let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
		String::from_utf8(bytes.to_vec()).unwrap()
	}

	fn assert_security_headers(response: &Response) {
		for (name, value) in &SECURITY_HEADERS {
			assert_eq!(response.headers()[name], *value, "{name}");
		}
	}

	#[test]
	fn asset_paths() {
		assert_eq!(asset_path(&Uri::from_static("/")), "");
		assert_eq!(asset_path(&Uri::from_static("/scripts/a.js?x=1")), "scripts/a.js");
		assert_eq!(asset_path(&Uri::from_static("/a%20b")), "a b");
		assert_eq!(asset_path(&Uri::from_static("/%FF")), "%FF");
	}

	#[test]
	fn durations() {
		assert_eq!(FmtDuration(Duration::from_micros(250)).to_string(), "250µs");
		assert_eq!(FmtDuration(Duration::from_millis(42)).to_string(), "42ms");
		assert_eq!(FmtDuration(Duration::from_millis(1500)).to_string(), "1.500s");
	}

	#[tokio::test]
	async fn config_script() {
		let response = send(router(MINIMAL), get("/console/config.js")).await;
		assert_eq!(response.status(), StatusCode::OK);
		assert_eq!(response.headers()[header::CONTENT_TYPE], "application/javascript");
		assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache, no-store");
		assert_eq!(response.headers()[header::VARY], "Accept-Encoding");
		assert_security_headers(&response);
		assert!(text(response).await.starts_with("window.OPENSHIFT_CONFIG = {"));
	}

	#[tokio::test]
	async fn config_script_gzip() {
		let response = send(router(MINIMAL), get_gzip("/console/config.js")).await;
		assert_eq!(response.headers()[header::CONTENT_ENCODING], "gzip");
		let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
		let mut decoded = String::new();
		GzDecoder::new(&bytes[..]).read_to_string(&mut decoded).unwrap();
		assert!(decoded.contains("window.OPENSHIFT_VERSION = {\n  console: \"v1\"\n};"));
	}

	#[tokio::test]
	async fn redirects() {
		let response = send(router(MINIMAL), get("/console")).await;
		assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
		assert_eq!(response.headers()[header::LOCATION], "/console/");

		let response = send(router(MINIMAL), get("/")).await;
		assert_eq!(response.status(), StatusCode::FOUND);
		assert_eq!(response.headers()[header::LOCATION], "/console/");
	}

	#[tokio::test]
	async fn outside_context_root() {
		let response = send(router(MINIMAL), get("/other/path")).await;
		assert_eq!(response.status(), StatusCode::NOT_FOUND);
		let response = send(router(MINIMAL), get("/consolex")).await;
		assert_eq!(response.status(), StatusCode::NOT_FOUND);
	}

	#[tokio::test]
	async fn index_fallback() {
		let response = send(router(MINIMAL), get("/console/project/demo/overview")).await;
		assert_eq!(response.status(), StatusCode::OK);
		assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache, no-store");
		assert_eq!(response.headers()[header::CONTENT_TYPE], "text/html; charset=utf-8");
		assert!(response.headers().get(header::ETAG).is_none());
		assert_security_headers(&response);
		assert_eq!(
			text(response).await,
			"<html><head><base href=\"/console/\"></head><body></body></html>"
		);
	}

	#[tokio::test]
	async fn asset_etags() {
		let response = send(router(MINIMAL), get("/console/scripts/vendor.js")).await;
		assert_eq!(response.status(), StatusCode::OK);
		assert_eq!(response.headers()[header::ETAG], "W/\"1234_\"");
		assert_eq!(
			response.headers()[header::CACHE_CONTROL],
			"public, max-age=0, must-revalidate"
		);
		assert_security_headers(&response);
		assert_eq!(text(response).await, "vendor");

		// The gzip representation gets its own validator
		let response = send(router(MINIMAL), get_gzip("/console/scripts/vendor.js")).await;
		assert_eq!(response.headers()[header::CONTENT_ENCODING], "gzip");
		assert_eq!(response.headers()[header::ETAG], "W/\"1234_677a6970\"");
	}

	#[tokio::test]
	async fn not_modified() {
		let request = Request::builder()
			.uri("/console/scripts/vendor.js")
			.header(header::ACCEPT_ENCODING, "gzip")
			.header(header::IF_NONE_MATCH, "W/\"1234_677a6970\"")
			.body(Body::empty())
			.unwrap();
		let response = send(router(MINIMAL), request).await;
		assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
		assert!(response.headers().get(header::CONTENT_ENCODING).is_none());
		assert_eq!(response.headers()[header::VARY], "Accept-Encoding");
		assert_security_headers(&response);
	}

	#[tokio::test]
	async fn root_context() {
		let toml = MINIMAL.replace("https://console.example.com/console/", "https://console.example.com/");
		let response = send(router(&toml), get("/")).await;
		assert_eq!(response.status(), StatusCode::OK);
		assert!(text(response).await.contains("<base href=\"/\">"));

		let response = send(router(&toml), get("/config.js")).await;
		assert_eq!(response.headers()[header::CONTENT_TYPE], "application/javascript");
	}

	#[tokio::test]
	async fn cors() {
		let toml = format!("[serving_info]\ncors_allowed_origins = [\"https://other.example.com\"]\n{MINIMAL}");
		let request = Request::builder()
			.uri("/console/config.js")
			.header(header::ORIGIN, "https://other.example.com")
			.body(Body::empty())
			.unwrap();
		let response = send(router(&toml), request).await;
		assert_eq!(
			response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
			"https://other.example.com"
		);

		let request = Request::builder()
			.uri("/console/config.js")
			.header(header::ORIGIN, "https://evil.example.com")
			.body(Body::empty())
			.unwrap();
		let response = send(router(&toml), request).await;
		assert!(response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
	}

	#[tokio::test]
	async fn cors_keeps_accept_encoding() {
		let toml = format!("[serving_info]\ncors_allowed_origins = [\"https://other.example.com\"]\n{MINIMAL}");
		for uri in ["/console/scripts/vendor.js", "/console/config.js"] {
			let request = Request::builder()
				.uri(uri)
				.header(header::ORIGIN, "https://other.example.com")
				.header(header::ACCEPT_ENCODING, "gzip")
				.body(Body::empty())
				.unwrap();
			let response = send(router(&toml), request).await;
			assert_eq!(response.headers()[header::CONTENT_ENCODING], "gzip");
			assert_eq!(
				response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
				"https://other.example.com"
			);
			let vary = vary::header_names(response.headers().get_all(header::VARY));
			assert_eq!(vary.first(), Some(&"Accept-Encoding"), "{uri}");
			assert!(vary.iter().any(|name| name.eq_ignore_ascii_case("origin")), "{uri}");
		}
	}

	#[test]
	fn invalid_context_root() {
		let config = from_toml(&MINIMAL.replace("/console/", "/con:sole/"));
		let oauth = OAuthEndpoints::default();
		let script = ConfigScript::new(&config, &config.master_url().unwrap(), &oauth, "v1");
		assert!(matches!(
			new_router(&config, html5::tests::assets(), script, "1234"),
			Err(Error::InvalidContextRoot(_))
		));
	}

	#[test]
	fn empty_context_root() {
		for public_url in ["https://console.example.com//", "https://console.example.com/a//b/"] {
			let mut config = from_toml(MINIMAL);
			config.cluster_info.console_public_url = public_url.to_owned();
			let script = ConfigScript::new(&config, &config.master_url().unwrap(), &OAuthEndpoints::default(), "v1");
			assert!(
				matches!(
					new_router(&config, html5::tests::assets(), script, "1234"),
					Err(Error::InvalidContextRoot(_))
				),
				"{public_url}"
			);
		}
	}
}
