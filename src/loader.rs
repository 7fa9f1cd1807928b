//! Loading mock content from changed files into the registry.
//!
//! Every load re-reads and re-parses the file from scratch, so edits are
//! always observed. Structured files (`.json`, `.yaml`, `.yml`) become
//! descriptor / sequence / literal values; anything else - including
//! structured files that fail to parse - is stored as raw bytes and served
//! as a GET response. A confirmed-missing file removes its entry; other
//! read failures leave the previous entry in place and surface an error.

use std::io;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::Error;
use crate::mock::MockValue;
use crate::registry::{MockRegistry, SourceRank};

/// Result of reloading one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The file was (re)loaded into the registry.
    Loaded,
    /// The file no longer exists; its entry was removed.
    Removed,
    /// The path is not a loadable mock (e.g. a directory).
    Skipped,
}

/// Resolves changed absolute paths to registry bindings and loads them.
#[derive(Debug, Clone)]
pub struct MockLoader {
    /// Glob roots in declaration order; the index is the priority rank.
    roots: Vec<PathBuf>,
}

impl MockLoader {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    /// Resolve an absolute file path to its owning rank and route.
    ///
    /// The first root that is a prefix of the path wins. Paths outside every
    /// root keep their absolute form and sort after all roots. A structured
    /// file named `index.*` registers at its parent directory route.
    pub fn binding_for(&self, path: &Path) -> (SourceRank, String) {
        for (index, root) in self.roots.iter().enumerate() {
            if let Ok(relative) = path.strip_prefix(root) {
                return (SourceRank::Root(index), route_from_relative(relative));
            }
        }
        (SourceRank::Root(self.roots.len()), posix_string(path))
    }

    /// Reload one path into the registry.
    pub async fn reload(
        &self,
        registry: &RwLock<MockRegistry>,
        path: &Path,
    ) -> Result<LoadOutcome, Error> {
        let source = posix_string(path);
        let (rank, route) = self.binding_for(path);

        match tokio::fs::read(path).await {
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                registry.write().await.remove(&source);
                debug!(%source, %route, "mock removed");
                Ok(LoadOutcome::Removed)
            }
            Err(err) if path.is_dir() => {
                debug!(%source, ?err, "ignoring directory event");
                Ok(LoadOutcome::Skipped)
            }
            Err(err) => Err(Error::Load {
                path: path.to_path_buf(),
                source: err,
            }),
            Ok(bytes) => {
                let mut registry = registry.write().await;
                match parse_structured(path, &bytes) {
                    Some(value) => {
                        registry.set(&source, rank, &route, MockValue::interpret(value))
                    }
                    None => registry.set_raw(&source, rank, &route, bytes),
                }
                debug!(%source, %route, "mock loaded");
                Ok(LoadOutcome::Loaded)
            }
        }
    }
}

/// Parse structured mock content; `None` falls back to raw bytes.
fn parse_structured(path: &Path, bytes: &[u8]) -> Option<Value> {
    match extension(path)?.as_str() {
        "json" => serde_json::from_slice(bytes).ok(),
        "yaml" | "yml" => serde_yaml::from_slice::<serde_yaml::Value>(bytes)
            .ok()
            .and_then(|yaml| serde_json::to_value(yaml).ok()),
        _ => None,
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
}

fn is_structured(path: &Path) -> bool {
    matches!(
        extension(path).as_deref(),
        Some("json") | Some("yaml") | Some("yml")
    )
}

fn route_from_relative(relative: &Path) -> String {
    let mut segments: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();

    // A structured index file answers for its directory.
    if let Some(last) = segments.last() {
        let as_path = Path::new(last);
        if is_structured(as_path)
            && as_path.file_stem().map(|s| s == "index").unwrap_or(false)
        {
            segments.pop();
        }
    }

    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}

fn posix_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn loader(roots: &[&Path]) -> MockLoader {
        MockLoader::new(roots.iter().map(|r| r.to_path_buf()).collect())
    }

    #[test]
    fn binding_strips_the_owning_root() {
        let loader = loader(&[Path::new("/srv/mocks"), Path::new("/srv/extra")]);

        let (rank, route) = loader.binding_for(Path::new("/srv/mocks/api/users.json"));
        assert_eq!(rank, SourceRank::Root(0));
        assert_eq!(route, "/api/users.json");

        let (rank, route) = loader.binding_for(Path::new("/srv/extra/thing.txt"));
        assert_eq!(rank, SourceRank::Root(1));
        assert_eq!(route, "/thing.txt");
    }

    #[test]
    fn first_matching_root_wins() {
        let loader = loader(&[Path::new("/srv"), Path::new("/srv/mocks")]);
        let (rank, route) = loader.binding_for(Path::new("/srv/mocks/a.json"));
        assert_eq!(rank, SourceRank::Root(0));
        assert_eq!(route, "/mocks/a.json");
    }

    #[test]
    fn paths_outside_all_roots_keep_their_absolute_form() {
        let loader = loader(&[Path::new("/srv/mocks")]);
        let (rank, route) = loader.binding_for(Path::new("/elsewhere/a.json"));
        assert_eq!(rank, SourceRank::Root(1));
        assert_eq!(route, "/elsewhere/a.json");
    }

    #[test]
    fn structured_index_files_answer_for_their_directory() {
        let loader = loader(&[Path::new("/srv/mocks")]);

        let (_, route) = loader.binding_for(Path::new("/srv/mocks/complex/index.yaml"));
        assert_eq!(route, "/complex");

        let (_, route) = loader.binding_for(Path::new("/srv/mocks/index.json"));
        assert_eq!(route, "/");

        // Non-structured index files keep their literal route.
        let (_, route) = loader.binding_for(Path::new("/srv/mocks/complex/index.txt"));
        assert_eq!(route, "/complex/index.txt");
    }

    #[tokio::test]
    async fn reload_parses_structured_content() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data.json");
        tokio::fs::write(&file, r#"{"users": [1, 2]}"#).await.unwrap();

        let loader = MockLoader::new(vec![dir.path().to_path_buf()]);
        let registry = Arc::new(RwLock::new(MockRegistry::new()));

        let outcome = loader.reload(&registry, &file).await.unwrap();
        assert_eq!(outcome, LoadOutcome::Loaded);

        let mocks = registry.read().await.get("/data");
        assert_eq!(mocks.len(), 1);
        match mocks[0].as_ref() {
            MockValue::Literal(v) => assert_eq!(v, &json!({"users": [1, 2]})),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn reload_falls_back_to_raw_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("broken.json");
        tokio::fs::write(&file, b"{ not json").await.unwrap();

        let loader = MockLoader::new(vec![dir.path().to_path_buf()]);
        let registry = Arc::new(RwLock::new(MockRegistry::new()));

        loader.reload(&registry, &file).await.unwrap();
        let mocks = registry.read().await.get("/broken.json");
        assert_eq!(mocks.len(), 1);
        assert!(matches!(mocks[0].as_ref(), MockValue::Descriptor(_)));
    }

    #[tokio::test]
    async fn reload_of_missing_file_removes_the_entry() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("gone.txt");
        tokio::fs::write(&file, b"here for now").await.unwrap();

        let loader = MockLoader::new(vec![dir.path().to_path_buf()]);
        let registry = Arc::new(RwLock::new(MockRegistry::new()));

        loader.reload(&registry, &file).await.unwrap();
        assert_eq!(registry.read().await.get("/gone.txt").len(), 1);

        tokio::fs::remove_file(&file).await.unwrap();
        let outcome = loader.reload(&registry, &file).await.unwrap();
        assert_eq!(outcome, LoadOutcome::Removed);
        assert!(registry.read().await.get("/gone.txt").is_empty());
    }

    #[tokio::test]
    async fn reload_twice_keeps_a_single_entry() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("once.txt");
        tokio::fs::write(&file, b"same").await.unwrap();

        let loader = MockLoader::new(vec![dir.path().to_path_buf()]);
        let registry = Arc::new(RwLock::new(MockRegistry::new()));

        loader.reload(&registry, &file).await.unwrap();
        loader.reload(&registry, &file).await.unwrap();
        assert_eq!(registry.read().await.get("/once.txt").len(), 1);
    }

    #[tokio::test]
    async fn directories_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("subdir");
        tokio::fs::create_dir(&sub).await.unwrap();

        let loader = MockLoader::new(vec![dir.path().to_path_buf()]);
        let registry = Arc::new(RwLock::new(MockRegistry::new()));

        let outcome = loader.reload(&registry, &sub).await.unwrap();
        assert_eq!(outcome, LoadOutcome::Skipped);
        assert_eq!(registry.read().await.route_count(), 0);
    }
}
