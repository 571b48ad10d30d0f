//! Provides the HTML5 mode of the console
//!
//! The console routes on the client side, so any path that is not a known asset
//! must be answered with the index document of the application it belongs to.
//! Known assets are delegated to the inner service, guarded by weak `ETag`s
//! derived from the build version.

use super::{
	asset_path,
	vary::{self, PendingVary},
};
use crate::{assets::SharedAssets, config::Subcontext, error::Error};
use axum::{
	body::{BoxBody, Bytes},
	http::{header, HeaderMap, HeaderValue, Request, Response, StatusCode},
	response::IntoResponse,
};
use futures_util::future::{self, BoxFuture};
use std::{
	fmt::{self, Debug, Formatter},
	sync::Arc,
	task::{Context, Poll},
};
use tower::{Layer, Service};

/// Base URL marker of index documents, rewritten to the mount path of their subcontext
const BASE_HREF: &[u8] = b"<base href=\"/\">";
/// Extension scripts are inserted before this tag
const BODY_END: &[u8] = b"</body>";
/// Extension stylesheets are inserted before this tag
const HEAD_END: &[u8] = b"</head>";

/// `Cache-Control` of index documents, which change with the extensions
const NO_STORE: &str = "no-cache, no-store";
/// `Cache-Control` of assets, which must be revalidated against their `ETag`
const MUST_REVALIDATE: &str = "public, max-age=0, must-revalidate";

/// Inputs of [`Html5Mode::new`]
#[derive(Debug, Clone, Copy)]
pub(crate) struct Html5Options<'a> {
	/// Path the console is mounted on, with leading and trailing slashes
	pub(crate) context_root: &'a str,
	/// Applications served under the context root
	pub(crate) subcontexts: &'a [Subcontext],
	/// Scripts to inject in the root application
	pub(crate) extension_scripts: &'a [String],
	/// Stylesheets to inject in the root application
	pub(crate) extension_stylesheets: &'a [String],
	/// Cache-busting token, usually the build identifier
	pub(crate) version: &'a str,
}

/// Index document derived for a subcontext
#[derive(Debug, Clone)]
struct Fallback {
	/// Subcontext key, without leading or trailing slash
	subcontext: Box<str>,
	/// Rewritten index document
	document: Bytes,
}
impl Fallback {
	/// Returns whether this fallback serves `path`
	///
	/// Paths match on segment boundaries: `java` serves `java` and `java/…` but not `javascript`.
	/// The root subcontext serves every path.
	fn serves(&self, path: &str) -> bool {
		self.subcontext.is_empty()
			|| path
				.strip_prefix(&*self.subcontext)
				.map_or(false, |rest| rest.is_empty() || rest.starts_with('/'))
	}
}

/// State of the HTML5 mode, computed once before serving
pub(crate) struct Html5Mode {
	/// Store the requested paths are looked up in
	assets: SharedAssets,
	/// Index documents, the longest subcontext first
	fallbacks: Vec<Fallback>,
	/// Cache-busting token
	version: Box<str>,
}
impl Html5Mode {
	/// Derives the index documents of all subcontexts
	///
	/// # Errors
	/// Fails if the context root is not enclosed in slashes,
	/// if an index document is not in `assets`,
	/// or if the version cannot appear in a header.
	pub(crate) fn new(options: Html5Options<'_>, assets: SharedAssets) -> Result<Self, Error> {
		let root = options.context_root;
		if !(root.starts_with('/') && root.ends_with('/')) {
			return Err(Error::InvalidContextRoot(root.to_owned()));
		}
		if HeaderValue::try_from(format_etag(options.version, &[])).is_err() {
			return Err(Error::InvalidVersion(options.version.to_owned()));
		}

		let mut fallbacks = options
			.subcontexts
			.iter()
			.map(|Subcontext { path, index }| {
				let subcontext = path.trim_matches('/');
				let raw = assets.get(index).ok_or_else(|| Error::MissingIndex {
					subcontext: subcontext.to_owned(),
					index: index.clone(),
				})?;

				let base = format!("<base href=\"{}\">", mount_path(root, subcontext));
				let mut document = replace_first(&raw, BASE_HREF, base.as_bytes());
				if subcontext.is_empty() {
					if !options.extension_scripts.is_empty() {
						document = insert_before(&document, BODY_END, &script_tags(options.extension_scripts));
					}
					if !options.extension_stylesheets.is_empty() {
						document = insert_before(
							&document,
							HEAD_END,
							&stylesheet_tags(options.extension_stylesheets),
						);
					}
				}

				log::debug!("Serving {index} for subcontext {subcontext:?}");
				Ok::<_, Error>(Fallback {
					subcontext: subcontext.into(),
					document: document.into(),
				})
			})
			.collect::<Result<Vec<_>, Error>>()?;
		fallbacks.sort_by(|a, b| b.subcontext.len().cmp(&a.subcontext.len()));

		Ok(Self {
			assets,
			fallbacks,
			version: options.version.into(),
		})
	}

	/// Returns the index document served for `path`, which is not an asset
	fn fallback(&self, path: &str) -> Option<&Bytes> {
		self.fallbacks
			.iter()
			.find(|fallback| fallback.serves(path))
			.map(|fallback| &fallback.document)
	}

	/// Decides how to answer `request`
	fn route<B>(&self, request: &Request<B>) -> Route {
		let path = asset_path(request.uri());
		if !self.assets.contains(&path) {
			if let Some(document) = self.fallback(&path) {
				return Route::Fallback(document.clone());
			}
		}

		let vary = vary::header_names(PendingVary::of(request));
		let etag = generate_etag(request.headers(), &self.version, &vary);
		let if_none_match = request.headers().get(header::IF_NONE_MATCH);
		if if_none_match.map_or(false, |value| value.as_bytes() == etag.as_bytes()) {
			return Route::NotModified;
		}
		match HeaderValue::try_from(etag) {
			Ok(etag) => Route::Delegate(Some(etag)),
			Err(_) => Route::Delegate(None),
		}
	}
}
impl Debug for Html5Mode {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.debug_struct("Html5Mode")
			.field("fallbacks", &self.fallbacks)
			.field("version", &self.version)
			.finish_non_exhaustive()
	}
}

/// Outcome of [`Html5Mode::route`]
#[derive(Debug)]
enum Route {
	/// Answer with this index document
	Fallback(Bytes),
	/// Answer `304 Not Modified`
	NotModified,
	/// Call the inner service, then set this `ETag`
	Delegate(Option<HeaderValue>),
}

/// Computes the weak `ETag` of a response
///
/// The tag combines `version` with the values `headers` holds for each of the `vary` headers,
/// so that each representation of a resource gets its own validator.
pub(crate) fn generate_etag(headers: &HeaderMap, version: &str, vary: &[&str]) -> String {
	let values = vary
		.iter()
		.filter_map(|name| headers.get(*name))
		.flat_map(HeaderValue::as_bytes)
		.copied()
		.collect::<Vec<u8>>();
	format_etag(version, &values)
}

/// Formats a weak `ETag`
#[inline]
fn format_etag(version: &str, vary_values: &[u8]) -> String {
	format!("W/\"{version}_{}\"", hex::encode(vary_values))
}

/// Returns the absolute path a subcontext is mounted on, with a single trailing slash
fn mount_path(context_root: &str, subcontext: &str) -> String {
	let mut path = format!("{}/{subcontext}", context_root.trim_end_matches('/'));
	if !path.ends_with('/') {
		path.push('/');
	}
	path
}

/// Replaces the first occurrence of `needle` in `haystack`
fn replace_first(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Vec<u8> {
	match haystack
		.windows(needle.len())
		.position(|window| window == needle)
	{
		Some(start) => [
			&haystack[..start],
			replacement,
			&haystack[start + needle.len()..],
		]
		.concat(),
		None => haystack.to_vec(),
	}
}

/// Inserts `insertion` before the first occurrence of `marker` in `haystack`
#[inline]
fn insert_before(haystack: &[u8], marker: &[u8], insertion: &str) -> Vec<u8> {
	replace_first(haystack, marker, &[insertion.as_bytes(), marker].concat())
}

/// Renders the `<script>` tags of extension scripts
fn script_tags(urls: &[String]) -> String {
	urls.iter()
		.map(|url| {
			format!(
				"<script src=\"{}\"></script>\n",
				html_escape::encode_quoted_attribute(url)
			)
		})
		.collect()
}

/// Renders the `<link>` tags of extension stylesheets
fn stylesheet_tags(urls: &[String]) -> String {
	urls.iter()
		.map(|url| {
			format!(
				"<link rel=\"stylesheet\" href=\"{}\">\n",
				html_escape::encode_quoted_attribute(url)
			)
		})
		.collect()
}

/// Answers with an index document
fn fallback_response(document: Bytes) -> Response<BoxBody> {
	(
		[
			(header::CACHE_CONTROL, HeaderValue::from_static(NO_STORE)),
			(
				header::CONTENT_TYPE,
				HeaderValue::from_static("text/html; charset=utf-8"),
			),
		],
		document,
	)
		.into_response()
}

/// [`Layer`] applying [`Html5Mode`]
#[derive(Debug, Clone)]
pub(crate) struct Html5ModeLayer(Arc<Html5Mode>);
impl Html5ModeLayer {
	/// Constructs a new instance
	#[inline]
	pub(crate) fn new(mode: Html5Mode) -> Self {
		Self(Arc::new(mode))
	}
}
impl<S> Layer<S> for Html5ModeLayer {
	type Service = Html5ModeService<S>;

	#[inline]
	fn layer(&self, inner: S) -> Self::Service {
		Html5ModeService {
			mode: Arc::clone(&self.0),
			inner,
		}
	}
}

/// [`Service`] created by [`Html5ModeLayer`]
#[derive(Debug, Clone)]
pub(crate) struct Html5ModeService<S> {
	/// Shared state
	mode: Arc<Html5Mode>,
	/// Service answering for known assets and unmatched paths
	inner: S,
}
impl<S, B> Service<Request<B>> for Html5ModeService<S>
where
	S: Service<Request<B>, Response = Response<BoxBody>> + Clone + Send + 'static,
	S::Future: Send + 'static,
	S::Error: Send + 'static,
	B: Send + 'static,
{
	type Response = Response<BoxBody>;
	type Error = S::Error;
	type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

	#[inline]
	fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
		self.inner.poll_ready(cx)
	}

	fn call(&mut self, request: Request<B>) -> Self::Future {
		let etag = match self.mode.route(&request) {
			Route::Fallback(document) => {
				return Box::pin(future::ready(Ok(fallback_response(document))));
			}
			Route::NotModified => {
				return Box::pin(future::ready(Ok(StatusCode::NOT_MODIFIED.into_response())));
			}
			Route::Delegate(etag) => etag,
		};

		let clone = self.inner.clone();
		let mut inner = std::mem::replace(&mut self.inner, clone);
		Box::pin(async move {
			let mut response = inner.call(request).await?;
			let headers = response.headers_mut();
			headers.append(header::CACHE_CONTROL, HeaderValue::from_static(MUST_REVALIDATE));
			if let Some(etag) = etag {
				headers.append(header::ETAG, etag);
			}
			Ok(response)
		})
	}
}
