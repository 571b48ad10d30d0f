//! Provides the bookkeeping of the `Vary` response header across layers
//!
//! A layer wrapping another one only sees the response once the inner layer is done with it.
//! Layers that will add a `Vary` header announce it beforehand with [`PendingVary`],
//! so inner layers can compute validators that vary the same way.

use axum::http::{header, HeaderMap, HeaderValue, Request};

/// [Request extension](Request::extensions) listing the `Vary` values outer layers will add to the response
#[derive(Debug, Default, Clone)]
pub(crate) struct PendingVary(Vec<HeaderValue>);
impl PendingVary {
	/// Announces that the response to `request` will vary on `value`
	pub(crate) fn push<B>(request: &mut Request<B>, value: HeaderValue) {
		let extensions = request.extensions_mut();
		match extensions.get_mut::<Self>() {
			Some(Self(values)) => values.push(value),
			None => {
				extensions.insert(Self(vec![value]));
			}
		}
	}

	/// Returns the `Vary` values announced for `request`
	#[inline]
	pub(crate) fn of<B>(request: &Request<B>) -> &[HeaderValue] {
		request
			.extensions()
			.get::<Self>()
			.map(|Self(values)| values.as_slice())
			.unwrap_or_default()
	}
}

/// Splits `Vary` header values into header names, keeping their order
pub(crate) fn header_names<'v, I>(values: I) -> Vec<&'v str>
where
	I: IntoIterator<Item = &'v HeaderValue>,
{
	values
		.into_iter()
		.filter_map(|value| value.to_str().ok())
		.flat_map(|value| value.split(','))
		.map(str::trim)
		.filter(|name| !name.is_empty())
		.collect()
}

/// Places `value` before the `Vary` values already in `headers`
pub(crate) fn prepend(headers: &mut HeaderMap, value: HeaderValue) {
	let existing = headers
		.get_all(header::VARY)
		.iter()
		.cloned()
		.collect::<Vec<_>>();
	headers.remove(header::VARY);
	headers.append(header::VARY, value);
	for existing in existing {
		headers.append(header::VARY, existing);
	}
}
