//! Provides the stores of the console's static assets
//!
//! Asset paths are relative, `/`-separated and have no leading slash (e.g. `scripts/vendor.js`).

use crate::error::Error;
use axum::body::Bytes;
use std::{
	borrow::Cow,
	collections::{BTreeSet, HashMap},
	fmt::{self, Debug, Formatter},
	path::Path,
	sync::Arc,
};
use walkdir::WalkDir;

/// Read-only mapping from asset paths to their content
pub(crate) trait AssetStore: Send + Sync {
	/// Returns the content of the asset at `path`
	fn get(&self, path: &str) -> Option<Bytes>;

	/// Returns the paths of all assets
	fn paths(&self) -> Vec<Cow<'_, str>>;

	/// Returns whether there is an asset at `path`
	#[inline]
	fn contains(&self, path: &str) -> bool {
		self.get(path).is_some()
	}

	/// Lists the entries of the directory `dir`
	///
	/// `dir` is empty for the root directory. Subdirectories are listed with a trailing slash.
	/// The listing is empty if `dir` contains no asset.
	fn read_dir(&self, dir: &str) -> BTreeSet<String> {
		let dir = dir.trim_matches('/');
		let prefix = if dir.is_empty() {
			String::new()
		} else {
			format!("{dir}/")
		};

		self.paths()
			.iter()
			.filter_map(|path| path.strip_prefix(prefix.as_str()))
			.filter(|rest| !rest.is_empty())
			.map(|rest| match rest.split_once('/') {
				Some((subdir, _)) => format!("{subdir}/"),
				None => rest.to_owned(),
			})
			.collect()
	}
}

/// [`AssetStore`] shared between request handlers
pub(crate) type SharedAssets = Arc<dyn AssetStore>;

/// Console assets embedded in the executable
#[derive(Debug, rust_embed::Embed)]
#[folder = "console/"]
struct ConsoleBundle;

/// [`AssetStore`] serving the embedded console
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Embedded;
impl AssetStore for Embedded {
	fn get(&self, path: &str) -> Option<Bytes> {
		ConsoleBundle::get(path).map(|file| match file.data {
			Cow::Borrowed(data) => Bytes::from_static(data),
			Cow::Owned(data) => Bytes::from(data),
		})
	}

	#[inline]
	fn paths(&self) -> Vec<Cow<'_, str>> {
		ConsoleBundle::iter().collect()
	}
}

/// [`AssetStore`] holding its assets in memory
#[derive(Default, Clone)]
pub(crate) struct Memory(HashMap<Box<str>, Bytes>);
impl Memory {
	/// Loads all files below `root`
	pub(crate) fn from_dir(root: &Path) -> Result<Self, Error> {
		let mut assets = HashMap::new();
		for entry in WalkDir::new(root).follow_links(true) {
			let entry = entry.map_err(|source| Error::AssetsDir {
				path: root.to_owned(),
				source,
			})?;
			if !entry.file_type().is_file() {
				continue;
			}

			let Ok(relative) = entry.path().strip_prefix(root) else {
				continue;
			};
			let key = relative
				.components()
				.map(|component| component.as_os_str().to_string_lossy())
				.collect::<Vec<_>>()
				.join("/");
			let content = std::fs::read(entry.path()).map_err(|source| Error::AssetFile {
				path: entry.path().to_owned(),
				source,
			})?;
			assets.insert(key.into_boxed_str(), Bytes::from(content));
		}

		log::debug!("Loaded {} assets from {}", assets.len(), root.display());
		Ok(Self(assets))
	}
}
impl<P, C> FromIterator<(P, C)> for Memory
where
	P: Into<Box<str>>,
	C: Into<Bytes>,
{
	fn from_iter<I: IntoIterator<Item = (P, C)>>(iter: I) -> Self {
		Self(
			iter.into_iter()
				.map(|(path, content)| (path.into(), content.into()))
				.collect(),
		)
	}
}
impl AssetStore for Memory {
	#[inline]
	fn get(&self, path: &str) -> Option<Bytes> {
		self.0.get(path).cloned()
	}

	#[inline]
	fn paths(&self) -> Vec<Cow<'_, str>> {
		self.0.keys().map(|path| Cow::Borrowed(&**path)).collect()
	}
}
impl Debug for Memory {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.debug_set().entries(self.0.keys()).finish()
	}
}

/// [`AssetStore`] looking assets up in several stores
///
/// The first store holding a path wins.
#[derive(Clone)]
pub(crate) struct Layered(Vec<SharedAssets>);
impl Layered {
	/// Constructs a new instance, from the highest to the lowest priority store
	#[inline]
	pub(crate) fn new(layers: Vec<SharedAssets>) -> Self {
		Self(layers)
	}
}
impl AssetStore for Layered {
	#[inline]
	fn get(&self, path: &str) -> Option<Bytes> {
		self.0.iter().find_map(|layer| layer.get(path))
	}

	fn paths(&self) -> Vec<Cow<'_, str>> {
		let paths = self
			.0
			.iter()
			.flat_map(|layer| layer.paths())
			.collect::<BTreeSet<_>>();
		paths.into_iter().collect()
	}
}
impl Debug for Layered {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.debug_tuple("Layered").field(&self.0.len()).finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample() -> Memory {
		Memory::from_iter([
			("index.html", "<html></html>"),
			("java/index.html", "<html>java</html>"),
			("scripts/vendor.js", "vendor"),
			("scripts/lib/a.js", "a"),
		])
	}

	#[test]
	fn embedded_console() {
		let store = Embedded;
		assert!(store.contains("index.html"));
		assert!(store.contains("java/index.html"));
		assert!(store.contains("scripts/vendor.js"));
		assert!(!store.contains("missing.js"));
		let index = store.get("index.html").unwrap();
		let marker = b"<base href=\"/\">";
		assert!(index.windows(marker.len()).any(|window| window == marker));
	}

	#[test]
	fn read_dir() {
		let store = sample();
		assert_eq!(
			store.read_dir(""),
			BTreeSet::from([
				"index.html".to_owned(),
				"java/".to_owned(),
				"scripts/".to_owned()
			])
		);
		assert_eq!(
			store.read_dir("scripts/"),
			BTreeSet::from(["lib/".to_owned(), "vendor.js".to_owned()])
		);
		assert_eq!(store.read_dir("scripts"), store.read_dir("scripts/"));
		assert!(store.read_dir("styles").is_empty());
		// Not a directory boundary
		assert!(store.read_dir("scr").is_empty());
	}

	#[test]
	fn layered_precedence() {
		let overlay: SharedAssets = Arc::new(Memory::from_iter([("index.html", "overlay")]));
		let store = Layered::new(vec![overlay, Arc::new(sample())]);
		assert_eq!(store.get("index.html").unwrap(), "overlay");
		assert_eq!(store.get("scripts/vendor.js").unwrap(), "vendor");
		assert!(store.get("nope").is_none());
		assert_eq!(store.paths().len(), 4);
	}

	#[test]
	fn from_dir() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::create_dir_all(dir.path().join("scripts")).unwrap();
		std::fs::write(dir.path().join("index.html"), "index").unwrap();
		std::fs::write(dir.path().join("scripts/app.js"), "app").unwrap();

		let store = Memory::from_dir(dir.path()).unwrap();
		assert_eq!(store.get("index.html").unwrap(), "index");
		assert_eq!(store.get("scripts/app.js").unwrap(), "app");
		assert_eq!(store.paths().len(), 2);
	}

	#[test]
	fn from_missing_dir() {
		let dir = tempfile::tempdir().unwrap();
		let missing = dir.path().join("missing");
		assert!(matches!(
			Memory::from_dir(&missing),
			Err(Error::AssetsDir { .. })
		));
	}
}
