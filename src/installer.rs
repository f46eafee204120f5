//! Library installation for admin course projects.
//!
//! Owner workspaces copy `lib/` and `remappings.txt` from their course project
//! when they are created, so libraries only ever need to be cloned once per
//! course.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::InstallerConfig;
use crate::sandbox::{LIBRARY_DIR, REMAPPINGS_FILE, WorkspaceHandle, run};

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub name: String,
    pub source_url: Option<String>,
    pub version: Option<String>,
}

impl Dependency {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            source_url: None,
            version: None,
        }
    }
}

pub struct KnownLibrary {
    pub name: &'static str,
    pub url: &'static str,
    pub remapping: &'static str,
}

pub const KNOWN_LIBRARIES: &[KnownLibrary] = &[
    KnownLibrary {
        name: "forge-std",
        url: "https://github.com/foundry-rs/forge-std",
        remapping: "forge-std/=lib/forge-std/src/",
    },
    KnownLibrary {
        name: "openzeppelin-contracts",
        url: "https://github.com/OpenZeppelin/openzeppelin-contracts",
        remapping: "@openzeppelin/contracts/=lib/openzeppelin-contracts/contracts/",
    },
    KnownLibrary {
        name: "openzeppelin-contracts-upgradeable",
        url: "https://github.com/OpenZeppelin/openzeppelin-contracts-upgradeable",
        remapping: "@openzeppelin/contracts-upgradeable/=lib/openzeppelin-contracts-upgradeable/contracts/",
    },
    KnownLibrary {
        name: "solmate",
        url: "https://github.com/transmissions11/solmate",
        remapping: "solmate/=lib/solmate/src/",
    },
    KnownLibrary {
        name: "solady",
        url: "https://github.com/Vectorized/solady",
        remapping: "solady/=lib/solady/src/",
    },
    KnownLibrary {
        name: "ds-test",
        url: "https://github.com/dapphub/ds-test",
        remapping: "ds-test/=lib/ds-test/src/",
    },
];

/// Installed into every course project
pub const DEFAULT_LIBRARIES: [&str; 2] = ["forge-std", "openzeppelin-contracts"];

pub fn known_library(name: &str) -> Option<&'static KnownLibrary> {
    KNOWN_LIBRARIES.iter().find(|lib| lib.name == name)
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct FailedDependency {
    pub name: String,
    pub reason: String,
}

/// Per-dependency results; a failed entry never aborts the others
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    pub installed: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<FailedDependency>,
}

impl InstallReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    fn fail(&mut self, name: &str, reason: impl Into<String>) {
        let reason = reason.into();
        log::warn!("Skipping dependency {name}: {reason}");
        self.failed.push(FailedDependency {
            name: name.to_string(),
            reason,
        });
    }
}

pub struct DependencyInstaller {
    git: String,
    timeout: Duration,
}

impl DependencyInstaller {
    pub fn new(config: &InstallerConfig) -> Self {
        Self {
            git: config.git_binary.clone(),
            timeout: config.clone_timeout(),
        }
    }

    /// Prepends the default pair to `explicit`, dropping duplicates by name.
    /// An explicit entry overrides the default of the same name.
    pub fn with_defaults(explicit: &[Dependency]) -> Vec<Dependency> {
        let mut deps: Vec<Dependency> = DEFAULT_LIBRARIES
            .iter()
            .filter(|name| !explicit.iter().any(|d| d.name == **name))
            .map(|name| Dependency::named(name))
            .collect();

        for dep in explicit {
            if !deps.iter().any(|d| d.name == dep.name) {
                deps.push(dep.clone());
            }
        }
        deps
    }

    fn resolve_source(dep: &Dependency) -> Option<String> {
        dep.source_url
            .clone()
            .or_else(|| known_library(&dep.name).map(|lib| lib.url.to_string()))
    }

    /// Clones each dependency into `lib/{name}` of the workspace, then
    /// regenerates `remappings.txt` for everything present in `lib/`.
    pub async fn install_dependencies(
        &self,
        handle: &WorkspaceHandle,
        deps: &[Dependency],
    ) -> InstallReport {
        let _guard = handle.lock().await;
        let mut report = InstallReport::default();

        if let Err(e) = handle.ensure_present() {
            for dep in deps {
                report.fail(&dep.name, e.to_string());
            }
            return report;
        }

        for dep in deps {
            if !is_plain_name(&dep.name) {
                report.fail(&dep.name, "invalid library name");
                continue;
            }
            let Some(url) = Self::resolve_source(dep) else {
                report.fail(&dep.name, "unknown dependency without source_url");
                continue;
            };

            let target = handle.library_dir().join(&dep.name);
            if target.is_dir() {
                log::debug!("Dependency {} already present, skipped", dep.name);
                report.skipped.push(dep.name.clone());
                continue;
            }

            match self.clone_into(handle.path(), dep, &url).await {
                Ok(()) => {
                    log::info!(
                        "Installed {} into course {}",
                        dep.name,
                        handle.key().course
                    );
                    report.installed.push(dep.name.clone());
                }
                Err(reason) => {
                    // Partial clones would be mistaken for installed libraries
                    if let Err(e) = fs::remove_dir_all(&target)
                        && e.kind() != std::io::ErrorKind::NotFound
                    {
                        log::error!("Failed to remove partial clone {}: {e}", target.display());
                    }
                    report.fail(&dep.name, reason);
                }
            }
        }

        if let Err(e) = write_remappings(handle.path()) {
            log::error!(
                "Failed to write remappings for course {}: {e}",
                handle.key().course
            );
        }

        log::info!(
            "Dependency install for course {}: {} installed, {} skipped, {} failed",
            handle.key().course,
            report.installed.len(),
            report.skipped.len(),
            report.failed.len()
        );
        report
    }

    async fn clone_into(&self, cwd: &Path, dep: &Dependency, url: &str) -> Result<(), String> {
        let mut args = vec!["clone".to_string(), "--depth".to_string(), "1".to_string()];
        if let Some(version) = &dep.version {
            args.push("--branch".to_string());
            args.push(version.clone());
        }
        args.push(url.to_string());
        args.push(format!("{LIBRARY_DIR}/{}", dep.name));

        let output = run(&self.git, &args, cwd, self.timeout)
            .await
            .map_err(|e| e.to_string())?;
        if output.success() {
            Ok(())
        } else {
            Err(format!(
                "{} exited with {:?}: {}",
                self.git,
                output.exit_code,
                output.stderr.trim()
            ))
        }
    }
}

fn is_plain_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Writes one remapping per library directory, sorted for stable output
pub fn write_remappings(project: &Path) -> std::io::Result<()> {
    let lib_dir = project.join(LIBRARY_DIR);
    let mut lines = Vec::new();

    if lib_dir.is_dir() {
        for entry in fs::read_dir(&lib_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let line = match known_library(&name) {
                Some(lib) => lib.remapping.to_string(),
                None if entry.path().join("src").is_dir() => {
                    format!("{name}/={LIBRARY_DIR}/{name}/src/")
                }
                None => format!("{name}/={LIBRARY_DIR}/{name}/"),
            };
            lines.push(line);
        }
    }

    lines.sort();
    let mut content = lines.join("\n");
    if !content.is_empty() {
        content.push('\n');
    }
    fs::write(project.join(REMAPPINGS_FILE), content)
}
