use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::config::ToolchainConfig;
use crate::error::EngineError;

pub const SOURCE_DIR: &str = "src";
pub const LIBRARY_DIR: &str = "lib";
pub const TEST_DIR: &str = "test";
pub const CONFIG_DIR: &str = "config";
pub const SETTINGS_FILE: &str = "project.json";
pub const REMAPPINGS_FILE: &str = "remappings.txt";

/// Owner that keeps admin-managed course projects
pub const COURSE_PROJECT_OWNER: &str = "__course__";

/// Toolchain settings persisted in `config/project.json`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProjectSettings {
    pub toolchain_version: Option<String>,
    pub optimizer: bool,
    pub optimizer_runs: u32,
}

impl ProjectSettings {
    pub fn from_toolchain(toolchain: &ToolchainConfig) -> Self {
        Self {
            toolchain_version: toolchain.default_version.clone(),
            optimizer: toolchain.optimizer,
            optimizer_runs: toolchain.optimizer_runs,
        }
    }

    /// Renders the toolchain manifest placed at the project root
    pub fn render_manifest(&self) -> String {
        let mut manifest = format!(
            "[profile.default]\nsrc = \"{SOURCE_DIR}\"\ntest = \"{TEST_DIR}\"\nlibs = [\"{LIBRARY_DIR}\"]\nout = \"out\"\ncache_path = \"cache\"\noptimizer = {}\noptimizer_runs = {}\n",
            self.optimizer, self.optimizer_runs
        );
        if let Some(version) = &self.toolchain_version {
            manifest.push_str(&format!("solc_version = \"{version}\"\n"));
        }
        manifest
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkspaceKey {
    pub owner: String,
    pub course: String,
}

/// The course project an owner workspace takes its libraries from
#[derive(Clone)]
struct SeedProject {
    path: PathBuf,
    lock: Arc<tokio::sync::Mutex<()>>,
}

/// A durable project directory for one `(owner, course)` pair
#[derive(Clone)]
pub struct WorkspaceHandle {
    key: WorkspaceKey,
    path: PathBuf,
    seed: Option<SeedProject>,
    settings: ProjectSettings,
    manifest_name: String,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl std::fmt::Debug for WorkspaceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceHandle")
            .field("key", &self.key)
            .field("path", &self.path)
            .finish()
    }
}

impl WorkspaceHandle {
    pub fn key(&self) -> &WorkspaceKey {
        &self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn library_dir(&self) -> PathBuf {
        self.path.join(LIBRARY_DIR)
    }

    /// Exclusive access to the durable directory; held while a session copy
    /// is taken, while dependencies are installed and while destroying.
    pub async fn lock(&self) -> OwnedMutexGuard<()> {
        self.lock.clone().lock_owned().await
    }

    /// Recreates the tree if it was destroyed since the handle was issued.
    /// Callers must hold [`WorkspaceHandle::lock`].
    pub fn ensure_present(&self) -> Result<(), EngineError> {
        if self.path.is_dir() {
            return Ok(());
        }
        create_atomically(&self.path, &self.settings, &self.manifest_name)
    }

    /// Copies course-project libraries this workspace does not have yet and
    /// refreshes its `remappings.txt`. Returns how many libraries were added.
    /// Callers must hold [`WorkspaceHandle::lock`]; the course project's own
    /// lock is taken here so a half-finished install is never copied.
    pub async fn sync_libraries(&self) -> Result<usize, EngineError> {
        let Some(seed) = &self.seed else {
            return Ok(0);
        };
        let _seed_guard = seed.lock.lock().await;
        if !seed.path.is_dir() {
            return Ok(0);
        }

        let added = sync_from(&seed.path, &self.path)?;
        if added > 0 {
            log::info!(
                "Synced {added} new course library directories into owner {} course {}",
                self.key.owner,
                self.key.course
            );
        }
        Ok(added)
    }
}

/// Maps `(owner, course)` onto durable directories under one root.
///
/// Layout: `{root}/course-{course}` for the admin course project and
/// `{root}/owner-{owner}/course-{course}` for each owner's copy.
pub struct WorkspaceStore {
    root: PathBuf,
    ephemeral_prefixes: Vec<String>,
    settings: ProjectSettings,
    manifest_name: String,
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl WorkspaceStore {
    pub fn new(
        root: impl Into<PathBuf>,
        ephemeral_prefixes: Vec<String>,
        toolchain: &ToolchainConfig,
    ) -> std::io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        Ok(Self {
            root,
            ephemeral_prefixes,
            settings: ProjectSettings::from_toolchain(toolchain),
            manifest_name: toolchain.manifest_name.clone(),
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Anonymous and guest owners do not keep their workspace between runs
    pub fn is_ephemeral_owner(&self, owner: &str) -> bool {
        owner.is_empty()
            || owner == "anonymous"
            || self
                .ephemeral_prefixes
                .iter()
                .any(|prefix| owner.starts_with(prefix.as_str()))
    }

    pub fn course_project_path(&self, course: &str) -> PathBuf {
        self.root.join(format!("course-{course}"))
    }

    pub fn workspace_path(&self, owner: &str, course: &str) -> PathBuf {
        self.root
            .join(format!("owner-{owner}"))
            .join(format!("course-{course}"))
    }

    pub fn exists(&self, owner: &str, course: &str) -> bool {
        self.workspace_path(owner, course).is_dir()
    }

    /// The admin-managed project that owner workspaces of `course` are seeded from
    pub async fn course_project(&self, course: &str) -> Result<WorkspaceHandle, EngineError> {
        validate_identifier(course)?;
        let key = WorkspaceKey {
            owner: COURSE_PROJECT_OWNER.to_string(),
            course: course.to_string(),
        };
        self.ensure(key, self.course_project_path(course), None)
            .await
    }

    pub async fn get_or_create(
        &self,
        owner: &str,
        course: &str,
    ) -> Result<WorkspaceHandle, EngineError> {
        validate_identifier(owner)?;
        validate_identifier(course)?;

        let key = WorkspaceKey {
            owner: owner.to_string(),
            course: course.to_string(),
        };
        let seed_path = self.course_project_path(course);
        let seed = Some(SeedProject {
            lock: self.lock_for(&seed_path),
            path: seed_path,
        });
        self.ensure(key, self.workspace_path(owner, course), seed)
            .await
    }

    async fn ensure(
        &self,
        key: WorkspaceKey,
        path: PathBuf,
        seed: Option<SeedProject>,
    ) -> Result<WorkspaceHandle, EngineError> {
        let handle = WorkspaceHandle {
            key,
            lock: self.lock_for(&path),
            path,
            seed,
            settings: self.settings.clone(),
            manifest_name: self.manifest_name.clone(),
        };

        let _guard = handle.lock().await;
        if !handle.path.is_dir() {
            handle.ensure_present()?;
            log::info!(
                "Created workspace for owner {} course {} at {}",
                handle.key.owner,
                handle.key.course,
                handle.path.display()
            );
            handle.sync_libraries().await?;
        }

        Ok(handle)
    }

    pub async fn destroy(&self, handle: &WorkspaceHandle) -> Result<(), EngineError> {
        let _guard = handle.lock().await;
        match fs::remove_dir_all(&handle.path) {
            Ok(()) => {
                log::info!(
                    "Destroyed workspace for owner {} course {}",
                    handle.key.owner,
                    handle.key.course
                );
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn lock_for(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

/// Ids end up as path segments, so only a conservative alphabet is accepted
pub fn validate_identifier(id: &str) -> Result<(), EngineError> {
    let valid = !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(EngineError::InvalidIdentifier(id.to_string()))
    }
}

/// Builds the tree under a temporary sibling and renames it into place, so a
/// concurrent reader never observes a half-built workspace.
fn create_atomically(
    path: &Path,
    settings: &ProjectSettings,
    manifest_name: &str,
) -> Result<(), EngineError> {
    let parent = path.parent().unwrap_or(path);
    let tmp = parent.join(format!(".tmp-{}", Uuid::new_v4()));

    let built = fs::create_dir_all(parent)
        .and_then(|_| scaffold(&tmp, settings, manifest_name))
        .and_then(|_| fs::rename(&tmp, path));

    match built {
        Ok(()) => Ok(()),
        // Lost the race against another creator: keep the winner's tree
        Err(_) if path.is_dir() => {
            let _ = fs::remove_dir_all(&tmp);
            Ok(())
        }
        Err(source) => {
            let _ = fs::remove_dir_all(&tmp);
            Err(EngineError::WorkspaceCreateFailed {
                path: path.to_path_buf(),
                source,
            })
        }
    }
}

fn scaffold(dir: &Path, settings: &ProjectSettings, manifest_name: &str) -> std::io::Result<()> {
    for sub in [SOURCE_DIR, LIBRARY_DIR, TEST_DIR, CONFIG_DIR] {
        fs::create_dir_all(dir.join(sub))?;
    }

    fs::write(
        dir.join(CONFIG_DIR).join(SETTINGS_FILE),
        serde_json::to_vec_pretty(settings)?,
    )?;
    fs::write(dir.join(manifest_name), settings.render_manifest())?;
    Ok(())
}

/// Libraries installed into the course project are shared with every owner.
/// Each missing library is copied under a temporary name and renamed into
/// place; libraries the owner already has are left alone.
fn sync_from(seed: &Path, dir: &Path) -> std::io::Result<usize> {
    let mut added = 0;

    let seed_libs = seed.join(LIBRARY_DIR);
    if seed_libs.is_dir() {
        let libs = dir.join(LIBRARY_DIR);
        fs::create_dir_all(&libs)?;
        for entry in fs::read_dir(&seed_libs)? {
            let entry = entry?;
            let target = libs.join(entry.file_name());
            if !entry.file_type()?.is_dir() || target.exists() {
                continue;
            }

            let tmp = libs.join(format!(".tmp-{}", Uuid::new_v4()));
            let copied =
                super::copy_dir_all(&entry.path(), &tmp).and_then(|_| fs::rename(&tmp, &target));
            if let Err(e) = copied {
                let _ = fs::remove_dir_all(&tmp);
                return Err(e);
            }
            added += 1;
        }
    }

    let remappings = fs::read(seed.join(REMAPPINGS_FILE)).ok();
    let current = fs::read(dir.join(REMAPPINGS_FILE)).ok();
    if let Some(remappings) = remappings
        && current.as_ref() != Some(&remappings)
    {
        fs::write(dir.join(REMAPPINGS_FILE), remappings)?;
    }

    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(root: &Path) -> WorkspaceStore {
        WorkspaceStore::new(
            root,
            vec!["guest".to_string()],
            &ToolchainConfig::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn creates_scaffold_once() {
        let root = tempfile::tempdir().unwrap();
        let store = store(root.path());

        let handle = store.get_or_create("alice", "7").await.unwrap();
        assert_eq!(handle.path(), store.workspace_path("alice", "7"));
        for sub in [SOURCE_DIR, LIBRARY_DIR, TEST_DIR, CONFIG_DIR] {
            assert!(handle.path().join(sub).is_dir(), "missing {sub}");
        }
        assert!(handle.path().join("foundry.toml").is_file());
        assert!(handle.path().join(CONFIG_DIR).join(SETTINGS_FILE).is_file());

        fs::write(handle.path().join(SOURCE_DIR).join("Keep.sol"), "x").unwrap();
        let again = store.get_or_create("alice", "7").await.unwrap();
        assert!(again.path().join(SOURCE_DIR).join("Keep.sol").is_file());

        // No temporary trees left behind
        let leftovers = fs::read_dir(handle.path().parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp-"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn concurrent_creation_yields_one_directory() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(store(root.path()));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.get_or_create("bob", "1").await.map(|h| h.path().to_path_buf())
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }

        let entries = fs::read_dir(root.path().join("owner-bob")).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[tokio::test]
    async fn seeds_libraries_from_course_project() {
        let root = tempfile::tempdir().unwrap();
        let store = store(root.path());

        let project = store.course_project("3").await.unwrap();
        let lib = project.library_dir().join("forge-std").join("src");
        fs::create_dir_all(&lib).unwrap();
        fs::write(lib.join("Test.sol"), "// lib").unwrap();
        fs::write(project.path().join(REMAPPINGS_FILE), "forge-std/=lib/forge-std/src/\n").unwrap();

        let handle = store.get_or_create("carol", "3").await.unwrap();
        assert!(handle.library_dir().join("forge-std/src/Test.sol").is_file());
        assert!(handle.path().join(REMAPPINGS_FILE).is_file());
    }

    #[tokio::test]
    async fn existing_workspace_picks_up_new_course_libraries() {
        let root = tempfile::tempdir().unwrap();
        let store = store(root.path());

        let project = store.course_project("4").await.unwrap();
        let handle = store.get_or_create("dora", "4").await.unwrap();
        assert!(!handle.library_dir().join("solmate").exists());

        fs::create_dir_all(project.library_dir().join("solmate/src")).unwrap();
        fs::write(project.path().join(REMAPPINGS_FILE), "solmate/=lib/solmate/src/\n").unwrap();
        // An owner's own copy of a library is never overwritten
        fs::create_dir_all(handle.library_dir().join("solady")).unwrap();
        fs::create_dir_all(project.library_dir().join("solady/src")).unwrap();

        let _guard = handle.lock().await;
        assert_eq!(handle.sync_libraries().await.unwrap(), 1);
        assert!(handle.library_dir().join("solmate/src").is_dir());
        assert!(!handle.library_dir().join("solady/src").exists());
        assert_eq!(
            fs::read_to_string(handle.path().join(REMAPPINGS_FILE)).unwrap(),
            "solmate/=lib/solmate/src/\n"
        );
        assert_eq!(handle.sync_libraries().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn destroy_removes_tree() {
        let root = tempfile::tempdir().unwrap();
        let store = store(root.path());

        let handle = store.get_or_create("guest-1", "2").await.unwrap();
        assert!(store.is_ephemeral_owner("guest-1"));
        assert!(!store.is_ephemeral_owner("dave"));
        store.destroy(&handle).await.unwrap();
        assert!(!store.exists("guest-1", "2"));
        // Destroying twice is harmless
        store.destroy(&handle).await.unwrap();
    }

    #[test]
    fn rejects_path_like_identifiers() {
        assert!(validate_identifier("../etc").is_err());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("a/b").is_err());
        assert!(validate_identifier("user_42-x").is_ok());
    }
}
