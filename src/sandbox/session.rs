use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

use uuid::Uuid;

use super::workspace::{LIBRARY_DIR, SOURCE_DIR, TEST_DIR, WorkspaceHandle};
use crate::error::EngineError;
use crate::models::SourceFile;

/// Hands out isolated, uniquely-named copies of workspaces
pub struct SessionIsolator {
    root: PathBuf,
    test_file_suffix: String,
}

impl SessionIsolator {
    pub fn new(root: impl Into<PathBuf>, test_file_suffix: &str) -> std::io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        Ok(Self {
            root,
            test_file_suffix: test_file_suffix.to_string(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Copies the workspace into a fresh session directory.
    ///
    /// Course libraries added since the workspace was created are synced in
    /// first. The copy runs on the blocking pool and owns both the workspace
    /// lock and the [`Session`] until it finishes. A failed copy, or one whose
    /// caller went away, drops the session there and removes the directory
    /// only once nothing writes into it any more.
    pub async fn open_session(&self, handle: &WorkspaceHandle) -> Result<Session, EngineError> {
        let guard = handle.lock().await;
        handle.ensure_present()?;
        handle.sync_libraries().await?;

        let id = Uuid::new_v4();
        let session = Session {
            id,
            dir: self.root.join(id.to_string()),
            test_file_suffix: self.test_file_suffix.clone(),
            released: false,
        };

        let src = handle.path().to_path_buf();
        let session = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            super::copy_project(&src, &session.dir).map(|_| session)
        })
        .await
        .map_err(std::io::Error::other)??;

        log::debug!(
            "Opened session {id} for owner {} course {}",
            handle.key().owner,
            handle.key().course
        );
        Ok(session)
    }

    /// Removes session directories older than `max_age`, left behind by a
    /// process that died mid-run. Returns how many were removed.
    pub fn sweep_stale(&self, max_age: Duration) -> std::io::Result<usize> {
        let now = SystemTime::now();
        let mut removed = 0;

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let is_session = entry
                .file_name()
                .to_str()
                .is_some_and(|name| Uuid::parse_str(name).is_ok());
            if !is_session || !entry.file_type()?.is_dir() {
                continue;
            }

            let age = entry
                .metadata()?
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age < max_age {
                continue;
            }

            match fs::remove_dir_all(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => log::error!("Failed to sweep {}: {e}", entry.path().display()),
            }
        }

        if removed > 0 {
            log::info!("Swept {removed} stale session(s)");
        }
        Ok(removed)
    }
}

/// Exclusive working copy used by exactly one compile/test invocation.
///
/// Dropping a session removes its directory, so early returns, errors,
/// panics and timeouts all release it; [`Session::close`] does the same but
/// reports failures to the caller.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    dir: PathBuf,
    test_file_suffix: String,
    released: bool,
}

impl Session {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn source_dir(&self) -> PathBuf {
        self.dir.join(SOURCE_DIR)
    }

    pub fn test_dir(&self) -> PathBuf {
        self.dir.join(TEST_DIR)
    }

    pub fn library_dir(&self) -> PathBuf {
        self.dir.join(LIBRARY_DIR)
    }

    /// Deletes every test definition so only the current run's test exists.
    /// Returns the number of files removed.
    pub fn purge_tests(&self) -> std::io::Result<usize> {
        let mut removed = 0;

        let test_dir = self.test_dir();
        if test_dir.exists() {
            removed += count_files(&test_dir)?;
            fs::remove_dir_all(&test_dir)?;
        }
        fs::create_dir_all(&test_dir)?;

        // Test files smuggled into the source root count too
        removed += remove_matching(&self.source_dir(), &self.test_file_suffix)?;

        if removed > 0 {
            log::debug!("Purged {removed} test file(s) from session {}", self.id);
        }
        Ok(removed)
    }

    /// Writes submitted files under the source root
    pub fn write_sources(&self, files: &[SourceFile]) -> Result<(), EngineError> {
        let source_dir = self.source_dir();
        for file in files {
            let relative = checked_relative_path(&file.name)?;
            let path = source_dir.join(relative);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, &file.content)?;
        }
        Ok(())
    }

    /// Writes one file under the test root and returns its project-relative path
    pub fn write_test_file(&self, file_name: &str, content: &str) -> Result<PathBuf, EngineError> {
        let relative = checked_relative_path(file_name)?;
        let path = self.test_dir().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, content)?;
        Ok(Path::new(TEST_DIR).join(relative))
    }

    pub fn close(mut self) -> std::io::Result<()> {
        self.release()
    }

    fn release(&mut self) -> std::io::Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {
                log::debug!("Closed session {}", self.id);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::error!("Failed to remove session {}: {e}", self.id);
        }
    }
}

/// Rejects any submitted file name that would not stay under the source root
pub fn validate_file_names(files: &[SourceFile]) -> Result<(), EngineError> {
    for file in files {
        checked_relative_path(&file.name)?;
    }
    Ok(())
}

/// Accepts only plain relative paths that stay inside their root
fn checked_relative_path(name: &str) -> Result<&Path, EngineError> {
    let path = Path::new(name);
    let plain = !name.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if plain {
        Ok(path)
    } else {
        Err(EngineError::InvalidFileName(name.to_string()))
    }
}

fn count_files(dir: &Path) -> std::io::Result<usize> {
    let mut count = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            count += count_files(&entry.path())?;
        } else {
            count += 1;
        }
    }
    Ok(count)
}

fn remove_matching(dir: &Path, suffix: &str) -> std::io::Result<usize> {
    if !dir.is_dir() {
        return Ok(0);
    }

    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            removed += remove_matching(&path, suffix)?;
        } else if entry.file_name().to_string_lossy().ends_with(suffix) {
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolchainConfig;
    use crate::sandbox::WorkspaceStore;

    async fn fixture() -> (tempfile::TempDir, WorkspaceStore, SessionIsolator) {
        let root = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::new(
            root.path().join("ws"),
            vec![],
            &ToolchainConfig::default(),
        )
        .unwrap();
        let sessions = SessionIsolator::new(root.path().join("sessions"), ".t.sol").unwrap();
        (root, store, sessions)
    }

    #[tokio::test]
    async fn sessions_are_unique_and_removed() {
        let (_root, store, sessions) = fixture().await;
        let handle = store.get_or_create("erin", "1").await.unwrap();

        let a = sessions.open_session(&handle).await.unwrap();
        let b = sessions.open_session(&handle).await.unwrap();
        assert_ne!(a.path(), b.path());
        assert!(a.source_dir().is_dir());

        let (a_dir, b_dir) = (a.path().to_path_buf(), b.path().to_path_buf());
        a.close().unwrap();
        drop(b);
        assert!(!a_dir.exists());
        assert!(!b_dir.exists());
    }

    #[tokio::test]
    async fn session_writes_do_not_touch_workspace() {
        let (_root, store, sessions) = fixture().await;
        let handle = store.get_or_create("frank", "1").await.unwrap();

        let session = sessions.open_session(&handle).await.unwrap();
        session
            .write_sources(&[SourceFile {
                name: "Counter.sol".to_string(),
                content: "contract Counter {}".to_string(),
            }])
            .unwrap();
        assert!(session.source_dir().join("Counter.sol").is_file());
        assert!(!handle.path().join(SOURCE_DIR).join("Counter.sol").exists());
    }

    #[tokio::test]
    async fn purges_stale_tests() {
        let (_root, store, sessions) = fixture().await;
        let handle = store.get_or_create("gina", "1").await.unwrap();
        fs::write(handle.path().join(TEST_DIR).join("Old.t.sol"), "old").unwrap();
        fs::write(handle.path().join(SOURCE_DIR).join("Sneaky.t.sol"), "x").unwrap();
        fs::write(handle.path().join(SOURCE_DIR).join("Real.sol"), "x").unwrap();

        let session = sessions.open_session(&handle).await.unwrap();
        assert_eq!(session.purge_tests().unwrap(), 2);
        assert!(session.test_dir().is_dir());
        assert!(!session.source_dir().join("Sneaky.t.sol").exists());
        assert!(session.source_dir().join("Real.sol").exists());
    }

    #[tokio::test]
    async fn rejects_escaping_file_names() {
        let (_root, store, sessions) = fixture().await;
        let handle = store.get_or_create("hank", "1").await.unwrap();
        let session = sessions.open_session(&handle).await.unwrap();

        for name in ["../evil.sol", "/etc/passwd", ""] {
            let result = session.write_sources(&[SourceFile {
                name: name.to_string(),
                content: String::new(),
            }]);
            assert!(matches!(result, Err(EngineError::InvalidFileName(_))), "{name}");
        }
    }

    #[tokio::test]
    async fn abandoned_open_leaves_no_session_behind() {
        let (_root, store, sessions) = fixture().await;
        let handle = store.get_or_create("jude", "1").await.unwrap();
        let lib = handle.library_dir().join("big");
        fs::create_dir_all(&lib).unwrap();
        for i in 0..200 {
            fs::write(lib.join(format!("F{i}.sol")), "// lib").unwrap();
        }

        // Gives up while the copy is still running on the blocking pool
        let _ = tokio::time::timeout(Duration::ZERO, sessions.open_session(&handle)).await;

        // The copy keeps the workspace locked until it is done
        drop(handle.lock().await);
        for _ in 0..100 {
            if fs::read_dir(sessions.root()).unwrap().count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(fs::read_dir(sessions.root()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn sweeps_only_old_sessions() {
        let (_root, store, sessions) = fixture().await;
        let handle = store.get_or_create("ivy", "1").await.unwrap();
        let session = sessions.open_session(&handle).await.unwrap();
        fs::create_dir_all(sessions.root().join("not-a-session")).unwrap();

        assert_eq!(sessions.sweep_stale(Duration::from_secs(3600)).unwrap(), 0);
        assert_eq!(sessions.sweep_stale(Duration::ZERO).unwrap(), 1);
        assert!(!session.path().exists());
        assert!(sessions.root().join("not-a-session").exists());
    }
}
