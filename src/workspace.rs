//! Workspace directories shared by every job.
//!
//! The worker is the only writer: one job's artifacts are always gone before
//! the next job starts, so the directories need no locking of their own.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fmt::Debug;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

use crate::JobId;

const MAX_FILE_NAME_LEN: usize = 100;

#[async_trait]
pub trait Filesystem: Debug + Send + Sync {
    /// Recursively delete `path` if present, then create it empty.
    async fn recreate_dir(&self, path: &Path) -> io::Result<()>;

    /// Delete a file or directory tree. Returns `false` when nothing was there.
    async fn remove(&self, path: &Path) -> io::Result<bool>;

    async fn exists(&self, path: &Path) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFs;

#[async_trait]
impl Filesystem for LocalFs {
    async fn recreate_dir(&self, path: &Path) -> io::Result<()> {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        tokio::fs::create_dir_all(path).await
    }

    async fn remove(&self, path: &Path) -> io::Result<bool> {
        let metadata = match tokio::fs::symlink_metadata(path).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err),
        };
        let result = if metadata.is_dir() {
            tokio::fs::remove_dir_all(path).await
        } else {
            tokio::fs::remove_file(path).await
        };
        match result {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }
}

/// In-memory filesystem for tests and dry runs. Tracks paths only, no content.
#[derive(Debug, Default, Clone)]
pub struct MemoryFs {
    entries: Arc<Mutex<BTreeSet<PathBuf>>>,
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a file as present, e.g. from a stub downloader or converter.
    pub fn add_file(&self, path: impl Into<PathBuf>) {
        self.lock().insert(path.into());
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.lock().iter().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<PathBuf>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove_tree(entries: &mut BTreeSet<PathBuf>, path: &Path) -> bool {
        let before = entries.len();
        entries.retain(|entry| !entry.starts_with(path));
        entries.len() != before
    }
}

#[async_trait]
impl Filesystem for MemoryFs {
    async fn recreate_dir(&self, path: &Path) -> io::Result<()> {
        let mut entries = self.lock();
        Self::remove_tree(&mut entries, path);
        entries.insert(path.to_path_buf());
        Ok(())
    }

    async fn remove(&self, path: &Path) -> io::Result<bool> {
        Ok(Self::remove_tree(&mut self.lock(), path))
    }

    async fn exists(&self, path: &Path) -> bool {
        self.lock().iter().any(|entry| entry.starts_with(path))
    }
}

/// Input and output locations of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPaths {
    pub input: PathBuf,
    pub output: PathBuf,
}

impl JobPaths {
    pub fn artifacts(&self) -> [&Path; 2] {
        [&self.input, &self.output]
    }
}

#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    fs: Arc<dyn Filesystem>,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>, fs: Arc<dyn Filesystem>) -> Self {
        Workspace {
            root: root.into(),
            fs,
        }
    }

    pub fn local(root: impl Into<PathBuf>) -> Self {
        Self::new(root, Arc::new(LocalFs))
    }

    pub fn input_dir(&self) -> PathBuf {
        self.root.join("input")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join("output")
    }

    /// Downloaded model archives.
    pub fn archives_dir(&self) -> PathBuf {
        self.root.join("archives")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join("staging")
    }

    pub fn dirs(&self) -> [PathBuf; 4] {
        [
            self.input_dir(),
            self.output_dir(),
            self.archives_dir(),
            self.staging_dir(),
        ]
    }

    /// Wipe and recreate every workspace directory. Call once at startup.
    pub async fn reset(&self) -> io::Result<()> {
        for dir in self.dirs() {
            self.fs.recreate_dir(&dir).await?;
            debug!(dir = %dir.display(), "Workspace directory reset");
        }
        Ok(())
    }

    /// `file_name` must already be sanitized, see [`sanitize_file_name`].
    pub fn job_paths(&self, id: JobId, file_name: &str) -> JobPaths {
        let name = format!("{id}-{file_name}");
        JobPaths {
            input: self.input_dir().join(&name),
            output: self.output_dir().join(name),
        }
    }

    /// Best effort: absence is fine, other failures are logged and dropped.
    pub async fn cleanup_artifacts<P: AsRef<Path> + Sync>(&self, paths: &[P]) {
        for path in paths {
            let path = path.as_ref();
            match self.fs.remove(path).await {
                Ok(true) => debug!(path = %path.display(), "Removed job artifact"),
                Ok(false) => {}
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Failed to remove job artifact")
                }
            }
        }
    }

    pub async fn exists(&self, path: &Path) -> bool {
        self.fs.exists(path).await
    }
}

/// Turn a user supplied display name into something safe to join onto a
/// workspace directory. Returns `None` when nothing usable is left.
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    let cleaned: String = cleaned.chars().take(MAX_FILE_NAME_LEN).collect();

    if cleaned.chars().all(|c| c == '_' || c == '.') {
        None
    } else {
        Some(cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_separators_and_traversal() {
        assert_eq!(sanitize_file_name("song.mp3").as_deref(), Some("song.mp3"));
        assert_eq!(
            sanitize_file_name("../../etc/passwd").as_deref(),
            Some("_.._etc_passwd")
        );
        assert_eq!(
            sanitize_file_name("my song $(rm -rf).wav").as_deref(),
            Some("my_song___rm_-rf_.wav")
        );
        assert_eq!(sanitize_file_name(".hidden").as_deref(), Some("hidden"));
        assert_eq!(sanitize_file_name(""), None);
        assert_eq!(sanitize_file_name("///"), None);
        assert_eq!(sanitize_file_name("..."), None);
    }

    #[test]
    fn long_names_are_truncated() {
        let name = "a".repeat(300);
        assert_eq!(sanitize_file_name(&name).map(|n| n.len()), Some(100));
    }

    #[test]
    fn job_paths_are_derived_from_the_id() {
        let workspace = Workspace::new("/work", Arc::new(MemoryFs::new()));
        let id = JobId::new();
        let paths = workspace.job_paths(id, "track.wav");
        assert_eq!(
            paths.input,
            PathBuf::from(format!("/work/input/{id}-track.wav"))
        );
        assert_eq!(
            paths.output,
            PathBuf::from(format!("/work/output/{id}-track.wav"))
        );
        assert_ne!(workspace.job_paths(JobId::new(), "track.wav"), paths);
    }

    #[tokio::test]
    async fn local_reset_is_idempotent_and_wipes_contents() {
        let tmp = tempfile::tempdir().unwrap();
        let workspace = Workspace::local(tmp.path().join("ws"));

        workspace.reset().await.unwrap();
        let leftover = workspace.input_dir().join("old.wav");
        std::fs::write(&leftover, b"stale").unwrap();

        workspace.reset().await.unwrap();
        for dir in workspace.dirs() {
            assert!(dir.is_dir());
            assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 0);
        }
        assert!(!leftover.exists());
    }

    #[tokio::test]
    async fn local_cleanup_ignores_missing_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let workspace = Workspace::local(tmp.path());
        workspace.reset().await.unwrap();

        let file = workspace.input_dir().join("a.wav");
        std::fs::write(&file, b"data").unwrap();
        let dir = workspace.output_dir().join("nested");
        std::fs::create_dir_all(dir.join("deeper")).unwrap();
        let missing = workspace.output_dir().join("missing.wav");

        workspace
            .cleanup_artifacts(&[&file, &dir, &missing])
            .await;

        assert!(!file.exists());
        assert!(!dir.exists());
        assert!(workspace.output_dir().is_dir());
    }

    #[tokio::test]
    async fn memory_fs_tracks_trees() {
        let fs = MemoryFs::new();
        let workspace = Workspace::new("/work", Arc::new(fs.clone()));
        workspace.reset().await.unwrap();

        let file = workspace.input_dir().join("x.wav");
        fs.add_file(&file);
        assert!(workspace.exists(&file).await);

        workspace.reset().await.unwrap();
        assert!(!workspace.exists(&file).await);
        assert!(workspace.exists(&workspace.input_dir()).await);

        fs.add_file(&file);
        workspace.cleanup_artifacts(&[&file]).await;
        assert!(!workspace.exists(&file).await);
        assert_eq!(fs.paths().len(), 4);
    }
}
