//! Document store: prompt files laid out by stage.
//!
//! Layout: `<root>/<stage dir>/<base_name>/<base>_<stage>_v<X.Y.Z>.yaml`,
//! with stage dirs `00-raw`, `01-templates`, `02-configs`, `03-active`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_yaml::{Mapping, Value};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::domain::digest::short;
use crate::domain::{parse_file_name, LifecycleError, Stage, VersionedDocument};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("yaml error in {path}: {source}")]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("invalid prompt document {path}: {source}")]
    Document {
        path: PathBuf,
        source: LifecycleError,
    },

    #[error("cannot determine stage of {0}")]
    UnknownStage(PathBuf),

    #[error("no document found: {0}")]
    NotFound(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Read, write, list, and archive versioned prompt documents.
pub trait DocumentStore: Send + Sync {
    fn read(&self, path: &Path) -> StoreResult<VersionedDocument>;

    /// Write `document` into its stage directory. Returns the file path.
    fn write(&self, document: &VersionedDocument) -> StoreResult<PathBuf>;

    /// All prompt files of `stage`, sorted by path.
    fn list(&self, stage: Stage) -> StoreResult<Vec<PathBuf>>;

    /// Move a superseded file out of the live tree. Returns its new path.
    fn archive(&self, path: &Path) -> StoreResult<PathBuf>;

    /// Highest version of `base_name` at `stage`.
    fn latest(&self, base_name: &str, stage: Stage) -> StoreResult<VersionedDocument> {
        let mut best: Option<VersionedDocument> = None;
        for path in self.list(stage)? {
            let doc = self.read(&path)?;
            if doc.base_name == base_name
                && best.as_ref().map_or(true, |b| doc.version > b.version)
            {
                best = Some(doc);
            }
        }
        best.ok_or_else(|| StoreError::NotFound(format!("{base_name} at stage {stage}")))
    }
}

/// Filesystem-backed document store.
#[derive(Debug, Clone)]
pub struct FsDocumentStore {
    root: PathBuf,
    archive_dir: PathBuf,
}

impl FsDocumentStore {
    /// Create a store rooted at `root`, archiving into `archive_dir`.
    pub fn new(root: impl AsRef<Path>, archive_dir: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(io_err(&root))?;
        Ok(Self {
            root,
            archive_dir: archive_dir.as_ref().to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stage_dir(&self, stage: Stage) -> PathBuf {
        self.root.join(stage.dir_name())
    }

    /// Stage from the file name suffix, else from the nearest stage directory.
    fn stage_of(path: &Path, from_name: Option<Stage>) -> Option<Stage> {
        from_name.or_else(|| {
            path.ancestors()
                .skip(1)
                .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
                .find_map(Stage::from_dir_name)
        })
    }
}

impl DocumentStore for FsDocumentStore {
    fn read(&self, path: &Path) -> StoreResult<VersionedDocument> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StoreError::NotFound(path.display().to_string()))?;
        let parts = parse_file_name(file_name).map_err(|source| StoreError::Document {
            path: path.to_path_buf(),
            source,
        })?;
        let stage = Self::stage_of(path, parts.stage)
            .ok_or_else(|| StoreError::UnknownStage(path.to_path_buf()))?;

        let text = fs::read_to_string(path).map_err(io_err(path))?;
        let mapping = match serde_yaml::from_str::<Value>(&text) {
            Ok(Value::Mapping(m)) => m,
            Ok(Value::Null) => Mapping::new(),
            Ok(_) => {
                return Err(StoreError::Document {
                    path: path.to_path_buf(),
                    source: LifecycleError::InvalidDocument(
                        "top level must be a mapping".to_string(),
                    ),
                })
            }
            Err(source) => {
                return Err(StoreError::Yaml {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        debug!(path = %path.display(), stage = %stage, "read prompt document");
        VersionedDocument::from_file_mapping(&parts.base_name, stage, parts.version, mapping)
            .map_err(|source| StoreError::Document {
                path: path.to_path_buf(),
                source,
            })
    }

    fn write(&self, document: &VersionedDocument) -> StoreResult<PathBuf> {
        let dir = self.stage_dir(document.stage).join(&document.base_name);
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        let path = dir.join(document.file_name());

        let yaml =
            serde_yaml::to_string(&document.to_file_mapping()).map_err(|source| StoreError::Yaml {
                path: path.clone(),
                source,
            })?;

        // Atomic write: temp file in the same directory, then rename.
        let mut tmp = NamedTempFile::new_in(&dir).map_err(io_err(&dir))?;
        tmp.write_all(yaml.as_bytes()).map_err(io_err(&path))?;
        tmp.persist(&path).map_err(|e| StoreError::Io {
            path: path.clone(),
            source: e.error,
        })?;

        let digest = document.content_digest();
        info!(
            path = %path.display(),
            version = %document.version,
            digest = short(&digest),
            "wrote prompt document"
        );
        Ok(path)
    }

    fn list(&self, stage: Stage) -> StoreResult<Vec<PathBuf>> {
        let dir = self.stage_dir(stage);
        let mut out = Vec::new();
        if dir.is_dir() {
            collect_yaml(&dir, &mut out)?;
        }
        out.sort();
        Ok(out)
    }

    fn archive(&self, path: &Path) -> StoreResult<PathBuf> {
        let relative = path
            .strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| PathBuf::from(path.file_name().unwrap_or_default()));
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let mut target = self.archive_dir.join(&relative);
        let name = format!(
            "{}.{stamp}.bak",
            target.file_name().and_then(|n| n.to_str()).unwrap_or("prompt")
        );
        target.set_file_name(name);

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        if fs::rename(path, &target).is_err() {
            fs::copy(path, &target).map_err(io_err(path))?;
            fs::remove_file(path).map_err(io_err(path))?;
        }
        info!(from = %path.display(), to = %target.display(), "archived prompt document");
        Ok(target)
    }
}

fn collect_yaml(dir: &Path, out: &mut Vec<PathBuf>) -> StoreResult<()> {
    for entry in fs::read_dir(dir).map_err(io_err(dir))? {
        let path = entry.map_err(io_err(dir))?.path();
        if path.is_dir() {
            collect_yaml(&path, out)?;
        } else if matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        ) {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Category, PromptVersion};

    fn make_store() -> (tempfile::TempDir, FsDocumentStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store =
            FsDocumentStore::new(dir.path().join("prompts"), dir.path().join("archive")).expect("store");
        (dir, store)
    }

    fn doc(stage: Stage, version: PromptVersion) -> VersionedDocument {
        VersionedDocument::from_yaml(
            "lead_scoring",
            Category::Company,
            stage,
            version,
            "role: analyst\nobjective: match companies\n",
        )
        .expect("doc")
    }

    #[test]
    fn test_write_then_read() {
        let (_dir, store) = make_store();
        let original = doc(Stage::Template, PromptVersion::new(0, 2, 0));
        let path = store.write(&original).expect("write");

        assert!(path.ends_with("01-templates/lead_scoring/lead_scoring_template_v0.2.0.yaml"));
        let text = fs::read_to_string(&path).expect("read file");
        assert!(text.starts_with("category: company\nversion:"));

        let back = store.read(&path).expect("read");
        assert_eq!(back, original);
    }

    #[test]
    fn test_read_raw_file_without_metadata() {
        let (_dir, store) = make_store();
        let raw_dir = store.stage_dir(Stage::Raw);
        fs::create_dir_all(&raw_dir).expect("mkdir");
        let path = raw_dir.join("contact_match.yaml");
        fs::write(&path, "role: sdr\nobjective: find contacts\n").expect("write");

        let d = store.read(&path).expect("read");
        assert_eq!(d.stage, Stage::Raw);
        assert_eq!(d.category, Category::Raw);
        assert_eq!(d.version, PromptVersion::new(0, 1, 0));
        assert_eq!(d.base_name, "contact_match");
    }

    #[test]
    fn test_list_and_latest() {
        let (_dir, store) = make_store();
        store.write(&doc(Stage::Raw, PromptVersion::new(0, 1, 0))).expect("write");
        store.write(&doc(Stage::Raw, PromptVersion::new(0, 1, 2))).expect("write");
        store.write(&doc(Stage::Template, PromptVersion::new(0, 2, 0))).expect("write");

        assert_eq!(store.list(Stage::Raw).expect("list").len(), 2);
        assert!(store.list(Stage::Active).expect("list").is_empty());

        let latest = store.latest("lead_scoring", Stage::Raw).expect("latest");
        assert_eq!(latest.version, PromptVersion::new(0, 1, 2));
        assert!(matches!(
            store.latest("missing", Stage::Raw),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_archive_moves_file() {
        let (dir, store) = make_store();
        let path = store.write(&doc(Stage::Raw, PromptVersion::new(0, 1, 0))).expect("write");
        let archived = store.archive(&path).expect("archive");

        assert!(!path.exists());
        assert!(archived.exists());
        assert!(archived.starts_with(dir.path().join("archive/00-raw/lead_scoring")));
        let name = archived.file_name().and_then(|n| n.to_str()).expect("name");
        assert!(name.starts_with("lead_scoring_raw_v0.1.0.yaml."));
        assert!(name.ends_with(".bak"));
        assert!(store.list(Stage::Raw).expect("list").is_empty());
    }

    #[test]
    fn test_read_rejects_non_mapping() {
        let (_dir, store) = make_store();
        let raw_dir = store.stage_dir(Stage::Raw);
        fs::create_dir_all(&raw_dir).expect("mkdir");
        let path = raw_dir.join("bad.yaml");
        fs::write(&path, "- just\n- a list\n").expect("write");
        assert!(matches!(store.read(&path), Err(StoreError::Document { .. })));
    }
}
