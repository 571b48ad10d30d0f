//! Provides the service serving the console's assets as files

use super::{asset_path, redirect, sniff};
use crate::assets::SharedAssets;
use axum::{
	body::Bytes,
	http::{header, HeaderValue, Request, StatusCode, Uri},
	response::{IntoResponse, Response},
};
use futures_util::future::{self, Ready};
use std::{
	convert::Infallible,
	fmt::{self, Debug, Formatter, Write},
	task::{Context, Poll},
};
use tower::Service;

/// Name of the document served for a directory
const INDEX: &str = "index.html";

/// [`Service`] answering with the content of an [`AssetStore`](crate::assets::AssetStore)
///
/// Directories are served their `index.html`, or a listing of their entries.
#[derive(Clone)]
pub(crate) struct FileServer(SharedAssets);
impl FileServer {
	/// Constructs a new instance
	#[inline]
	pub(crate) fn new(assets: SharedAssets) -> Self {
		Self(assets)
	}

	/// Answers a request for `uri`
	fn respond(&self, uri: &Uri) -> Response {
		let raw = uri.path();
		let path = asset_path(uri);

		if path == INDEX || path.ends_with("/index.html") {
			return local_redirect(uri, "./");
		}

		if path.is_empty() || raw.ends_with('/') {
			let dir = path.trim_end_matches('/');
			let index = if dir.is_empty() {
				INDEX.to_owned()
			} else {
				format!("{dir}/{INDEX}")
			};
			if let Some(content) = self.0.get(&index) {
				return file(&index, content);
			}

			let entries = self.0.read_dir(dir);
			if entries.is_empty() && !dir.is_empty() {
				return not_found();
			}
			return listing(entries);
		}

		if let Some(content) = self.0.get(&path) {
			return file(&path, content);
		}
		if !self.0.read_dir(&path).is_empty() {
			let name = raw.rsplit('/').next().unwrap_or_default();
			return local_redirect(uri, &format!("{name}/"));
		}
		not_found()
	}
}
impl<B> Service<Request<B>> for FileServer {
	type Response = Response;
	type Error = Infallible;
	type Future = Ready<Result<Self::Response, Self::Error>>;

	#[inline]
	fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
		Poll::Ready(Ok(()))
	}

	#[inline]
	fn call(&mut self, request: Request<B>) -> Self::Future {
		future::ready(Ok(self.respond(request.uri())))
	}
}
impl Debug for FileServer {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.debug_tuple("FileServer").finish_non_exhaustive()
	}
}

/// Answers with the asset at `path`
fn file(path: &str, content: Bytes) -> Response {
	let name = path.rsplit('/').next().unwrap_or(path);
	let content_type = mime_db::lookup(name).unwrap_or_else(|| sniff::content_type(&content));
	([(header::CONTENT_TYPE, HeaderValue::from_static(content_type))], content).into_response()
}

/// Answers with an HTML listing of directory entries
fn listing<I>(entries: I) -> Response
where
	I: IntoIterator<Item = String>,
{
	let mut html = String::from("<pre>\n");
	for entry in entries {
		let _ = writeln!(
			html,
			"<a href=\"{}\">{}</a>",
			html_escape::encode_double_quoted_attribute(&urlencoding::encode(&entry).replace("%2F", "/")),
			html_escape::encode_text(&entry),
		);
	}
	html.push_str("</pre>\n");
	(
		[(
			header::CONTENT_TYPE,
			HeaderValue::from_static("text/html; charset=utf-8"),
		)],
		html,
	)
		.into_response()
}

/// Redirects permanently to `location`, relative to the requested path, keeping the query
fn local_redirect(uri: &Uri, location: &str) -> Response {
	match uri.query() {
		Some(query) => redirect(StatusCode::MOVED_PERMANENTLY, &format!("{location}?{query}")),
		None => redirect(StatusCode::MOVED_PERMANENTLY, location),
	}
}

/// Answers `404 Not Found`
#[inline]
fn not_found() -> Response {
	(StatusCode::NOT_FOUND, "404 page not found\n").into_response()
}
