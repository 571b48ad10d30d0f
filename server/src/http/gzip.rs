//! Provides on-the-fly gzip compression of responses

use super::{
	sniff,
	vary::{self, PendingVary},
};
use axum::{
	body::{self, BoxBody, Bytes, HttpBody, StreamBody},
	http::{header, HeaderMap, HeaderValue, Request, Response, StatusCode},
	BoxError,
};
use flate2::{write::GzEncoder, Compression};
use futures_util::{future::BoxFuture, stream};
use std::{
	io::Write,
	mem,
	task::{Context, Poll},
};
use tower::{Layer, Service};

/// Value of `Accept-Encoding` seen by inner services when the client accepts gzip
const GZIP: &str = "gzip";
/// `Vary` value of every response
const VARY: &str = "Accept-Encoding";

/// Returns whether the client accepts gzip-encoded responses
fn accepts_gzip(headers: &HeaderMap) -> bool {
	headers
		.get_all(header::ACCEPT_ENCODING)
		.iter()
		.filter_map(|value| value.to_str().ok())
		.any(|value| value.contains(GZIP))
}

/// [`Layer`] compressing responses for clients accepting gzip
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct GzipLayer;
impl<S> Layer<S> for GzipLayer {
	type Service = Gzip<S>;

	#[inline]
	fn layer(&self, inner: S) -> Self::Service {
		Gzip { inner }
	}
}

/// [`Service`] created by [`GzipLayer`]
///
/// Every response varies on `Accept-Encoding`.
/// When the client accepts gzip, inner services see `Accept-Encoding: gzip`.
#[derive(Debug, Clone)]
pub(crate) struct Gzip<S> {
	/// Wrapped service
	inner: S,
}
impl<S, B> Service<Request<B>> for Gzip<S>
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

	fn call(&mut self, mut request: Request<B>) -> Self::Future {
		let gzip = accepts_gzip(request.headers());
		PendingVary::push(&mut request, HeaderValue::from_static(VARY));
		if gzip {
			request
				.headers_mut()
				.insert(header::ACCEPT_ENCODING, HeaderValue::from_static(GZIP));
		}

		let clone = self.inner.clone();
		let mut inner = mem::replace(&mut self.inner, clone);
		Box::pin(async move {
			let mut response = inner.call(request).await?;
			vary::prepend(response.headers_mut(), HeaderValue::from_static(VARY));

			let skip = !gzip
				|| matches!(
					response.status(),
					StatusCode::NOT_MODIFIED | StatusCode::NO_CONTENT
				) || response.headers().contains_key(header::CONTENT_ENCODING);
			if skip {
				return Ok(response);
			}
			Ok(compress(response).await)
		})
	}
}

/// State of a body being compressed
struct Encoding {
	/// Uncompressed body
	body: BoxBody,
	/// Chunk already read from `body`
	pending: Option<Bytes>,
	/// `None` once the compressed stream is complete
	encoder: Option<GzEncoder<Vec<u8>>>,
}
impl Encoding {
	/// Returns the next chunk of the compressed body
	async fn next(&mut self) -> Option<Result<Bytes, BoxError>> {
		loop {
			let encoder = self.encoder.as_mut()?;
			let chunk = match self.pending.take() {
				Some(chunk) => Some(Ok(chunk)),
				None => self.body.data().await,
			};
			match chunk {
				Some(Ok(chunk)) => {
					if let Err(err) = encoder.write_all(&chunk) {
						self.encoder = None;
						return Some(Err(err.into()));
					}
					let compressed = mem::take(encoder.get_mut());
					if !compressed.is_empty() {
						return Some(Ok(Bytes::from(compressed)));
					}
				}
				Some(Err(err)) => {
					self.encoder = None;
					return Some(Err(err.into()));
				}
				None => {
					let encoder = self.encoder.take()?;
					return Some(
						encoder
							.finish()
							.map(Bytes::from)
							.map_err(BoxError::from),
					);
				}
			}
		}
	}
}

/// Compresses the body of `response`
///
/// A missing `Content-Type` is sniffed from the first chunk of the uncompressed body.
async fn compress(response: Response<BoxBody>) -> Response<BoxBody> {
	let (mut parts, mut body) = response.into_parts();
	parts.headers.remove(header::CONTENT_LENGTH);
	parts
		.headers
		.insert(header::CONTENT_ENCODING, HeaderValue::from_static(GZIP));

	let mut pending = None;
	if !parts.headers.contains_key(header::CONTENT_TYPE) {
		let first = match body.data().await {
			Some(Ok(chunk)) => chunk,
			Some(Err(err)) => {
				log::warn!("Could not read the response body: {err}");
				Bytes::new()
			}
			None => Bytes::new(),
		};
		parts.headers.insert(
			header::CONTENT_TYPE,
			HeaderValue::from_static(sniff::content_type(&first)),
		);
		pending = Some(first);
	}

	let encoding = Encoding {
		body,
		pending,
		encoder: Some(GzEncoder::new(Vec::new(), Compression::default())),
	};
	let stream = stream::unfold(encoding, |mut encoding| async move {
		let chunk = encoding.next().await?;
		Some((chunk, encoding))
	});
	Response::from_parts(parts, body::boxed(StreamBody::new(stream)))
}

#[cfg(test)]
mod tests {
	use super::*;
	use axum::body::Body;
	use flate2::read::GzDecoder;
	use futures_util::future;
	use std::{convert::Infallible, io::Read};
	use tower::{service_fn, ServiceExt};

	fn get(accept_encoding: Option<&'static str>) -> Request<Body> {
		let mut request = Request::builder().uri("/");
		if let Some(accept_encoding) = accept_encoding {
			request = request.header(header::ACCEPT_ENCODING, accept_encoding);
		}
		request.body(Body::empty()).unwrap()
	}

	async fn send<F>(request: Request<Body>, respond: F) -> Response<BoxBody>
	where
		F: Fn(Request<Body>) -> Response<BoxBody> + Clone + Send + 'static,
	{
		let inner = service_fn(move |request| future::ready(Ok::<_, Infallible>(respond(request))));
		GzipLayer.layer(inner).oneshot(request).await.unwrap()
	}

	fn text(body: &'static str) -> Response<BoxBody> {
		Response::builder()
			.header(header::CONTENT_TYPE, "text/plain")
			.header(header::CONTENT_LENGTH, body.len())
			.header(header::VARY, "Foo")
			.body(body::boxed(Body::from(body)))
			.unwrap()
	}

	async fn bytes(response: Response<BoxBody>) -> Bytes {
		hyper::body::to_bytes(response.into_body()).await.unwrap()
	}

	fn gunzip(data: &[u8]) -> String {
		let mut decoded = String::new();
		GzDecoder::new(data).read_to_string(&mut decoded).unwrap();
		decoded
	}

	#[tokio::test]
	async fn without_gzip() {
		let response = send(get(None), |request| {
			assert!(request.headers().get(header::ACCEPT_ENCODING).is_none());
			text("hello")
		})
		.await;
		assert!(response.headers().get(header::CONTENT_ENCODING).is_none());
		assert_eq!(response.headers()[header::CONTENT_LENGTH], "5");
		assert_eq!(
			response.headers().get_all(header::VARY).iter().collect::<Vec<_>>(),
			["Accept-Encoding", "Foo"]
		);
		assert_eq!(bytes(response).await, "hello");
	}

	#[tokio::test]
	async fn with_gzip() {
		let response = send(get(Some("deflate, gzip;q=1.0")), |request| {
			assert_eq!(request.headers()[header::ACCEPT_ENCODING], GZIP);
			text("hello")
		})
		.await;
		assert_eq!(response.headers()[header::CONTENT_ENCODING], "gzip");
		assert!(response.headers().get(header::CONTENT_LENGTH).is_none());
		assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
		assert_eq!(
			response.headers().get_all(header::VARY).iter().collect::<Vec<_>>(),
			["Accept-Encoding", "Foo"]
		);
		assert_eq!(gunzip(&bytes(response).await), "hello");
	}

	#[tokio::test]
	async fn several_chunks() {
		let response = send(get(Some("gzip")), |_| {
			let chunks = vec![
				Ok::<_, Infallible>(Bytes::from("foo".repeat(1000))),
				Ok(Bytes::from("bar".repeat(1000))),
			];
			Response::new(body::boxed(StreamBody::new(stream::iter(chunks))))
		})
		.await;
		let expected = "foo".repeat(1000) + &"bar".repeat(1000);
		assert_eq!(gunzip(&bytes(response).await), expected);
	}

	#[tokio::test]
	async fn sniffed_content_type() {
		let response = send(get(Some("gzip")), |_| {
			Response::new(body::boxed(Body::from("<html><body>hi</body></html>")))
		})
		.await;
		assert_eq!(
			response.headers()[header::CONTENT_TYPE],
			"text/html; charset=utf-8"
		);
		assert_eq!(gunzip(&bytes(response).await), "<html><body>hi</body></html>");
	}

	#[tokio::test]
	async fn empty_body() {
		let response = send(get(Some("gzip")), |_| Response::new(body::boxed(Body::empty()))).await;
		assert_eq!(response.headers()[header::CONTENT_ENCODING], "gzip");
		assert_eq!(gunzip(&bytes(response).await), "");
	}

	#[tokio::test]
	async fn not_modified() {
		let response = send(get(Some("gzip")), |_| {
			Response::builder()
				.status(StatusCode::NOT_MODIFIED)
				.body(body::boxed(Body::empty()))
				.unwrap()
		})
		.await;
		assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
		assert!(response.headers().get(header::CONTENT_ENCODING).is_none());
		assert_eq!(response.headers()[header::VARY], "Accept-Encoding");
		assert!(bytes(response).await.is_empty());
	}

	#[tokio::test]
	async fn announces_vary() {
		let response = send(get(Some("gzip")), |request| {
			assert_eq!(
				vary::header_names(PendingVary::of(&request)),
				["Accept-Encoding"]
			);
			text("hello")
		})
		.await;
		assert_eq!(response.status(), StatusCode::OK);
	}

	#[tokio::test]
	async fn body_error_ends_stream() {
		let response = send(get(Some("gzip")), |_| {
			let chunks = vec![
				Ok::<_, BoxError>(Bytes::from("hello")),
				Err(BoxError::from("connection reset")),
				Ok(Bytes::from("never read")),
			];
			Response::builder()
				.header(header::CONTENT_TYPE, "text/plain")
				.body(body::boxed(StreamBody::new(stream::iter(chunks))))
				.unwrap()
		})
		.await;
		assert_eq!(response.headers()[header::CONTENT_ENCODING], "gzip");

		let mut body = response.into_body();
		let mut chunks = Vec::new();
		while let Some(chunk) = body.data().await {
			chunks.push(chunk.map_err(|err| err.to_string()));
		}
		let (last, before) = chunks.split_last().unwrap();
		assert!(matches!(last, Err(err) if err.contains("connection reset")), "{last:?}");
		assert!(before.iter().all(Result::is_ok));
	}
}
