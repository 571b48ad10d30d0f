//! Provides the server's startup errors
//!
//! Every variant aborts startup: the server never comes up partially configured.
//! Request handling has no error type of its own.

use std::path::PathBuf;

/// Fatal error raised while building the server
#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
	/// The configuration could not be loaded or deserialized
	#[error("Could not load the configuration: {0}")]
	Config(#[from] config::ConfigError),
	/// A configured URL could not be parsed
	#[error("Invalid {field} {value:?}: {source}")]
	InvalidUrl {
		/// Name of the configuration field
		field: &'static str,
		/// Value of the configuration field
		value: String,
		/// Parsing error
		#[source]
		source: url::ParseError,
	},
	/// A configured URL has no host
	#[error("Invalid {field} {value:?}: missing host")]
	MissingHost {
		/// Name of the configuration field
		field: &'static str,
		/// Value of the configuration field
		value: String,
	},
	/// The context root does not start and end with a slash, has empty segments or route parameters
	#[error("Context root {0:?} must start and end with a slash, without empty segments, ':' or '*'")]
	InvalidContextRoot(String),
	/// The index document of a subcontext is not in the asset store
	#[error("Index document {index:?} of subcontext {subcontext:?} does not exist")]
	MissingIndex {
		/// Subcontext key
		subcontext: String,
		/// Configured path of the index document
		index: String,
	},
	/// The version token cannot be used in an `ETag` header
	#[error("Version {0:?} cannot be used in an ETag")]
	InvalidVersion(String),
	/// An assets directory could not be read
	#[error("Could not read assets from {}: {source}", path.display())]
	AssetsDir {
		/// Root of the assets directory
		path: PathBuf,
		/// Underlying error
		#[source]
		source: walkdir::Error,
	},
	/// An asset file could not be read
	#[error("Could not read asset {}: {source}", path.display())]
	AssetFile {
		/// Path of the asset file
		path: PathBuf,
		/// Underlying error
		#[source]
		source: std::io::Error,
	},
	/// The certificate authority file could not be read
	#[error("Could not read the certificate authorities from {}: {source}", path.display())]
	CaFile {
		/// Path of the PEM file
		path: PathBuf,
		/// Underlying error
		#[source]
		source: std::io::Error,
	},
	/// The certificate authority file is not valid PEM
	#[error("Invalid certificate authorities in {}: {source}", path.display())]
	InvalidCaFile {
		/// Path of the PEM file
		path: PathBuf,
		/// Underlying error
		#[source]
		source: reqwest::Error,
	},
	/// The OAuth authorization server metadata could not be fetched
	#[error("Could not discover the OAuth authorization server: {0}")]
	OAuthDiscovery(#[from] reqwest::Error),
	/// The OAuth authorization server metadata lacks an endpoint
	#[error("Authorization or token endpoint missing from OAuth authorization server metadata (authorization endpoint: {authorization:?}, token endpoint: {token:?})")]
	IncompleteOAuthMetadata {
		/// Published authorization endpoint
		authorization: String,
		/// Published token endpoint
		token: String,
	},
	/// The HTTP server failed
	#[error("HTTP server error: {0}")]
	Server(#[from] hyper::Error),
}
