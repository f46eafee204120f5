mod runner;
mod session;
mod workspace;

pub use runner::{ProcessOutput, run};
pub use session::{Session, SessionIsolator, validate_file_names};
pub use workspace::{
    COURSE_PROJECT_OWNER, LIBRARY_DIR, ProjectSettings, REMAPPINGS_FILE, SOURCE_DIR, TEST_DIR,
    WorkspaceHandle, WorkspaceKey, WorkspaceStore, validate_identifier,
};

use std::fs;
use std::path::Path;

/// Build output that is never carried into a session copy
const BUILD_OUTPUT_DIRS: &[&str] = &["out", "cache"];

/// Copies a project tree, leaving top-level build output behind
pub(crate) fn copy_project(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        if entry.file_type()?.is_dir() {
            if !BUILD_OUTPUT_DIRS.iter().any(|d| name == *d) {
                copy_dir_all(&entry.path(), &dst.join(&name))?;
            }
        } else {
            fs::copy(entry.path(), dst.join(&name))?;
        }
    }
    Ok(())
}

/// Recursively copies `src` into `dst`, creating `dst` if needed
pub(crate) fn copy_dir_all(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dst)?;
    if !src.is_dir() {
        return Ok(());
    }

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}
