use std::fs;
use std::path::Path;

use super::*;
use crate::models::{ArtifactSet, CompilationOutcome};
use crate::parser::parse_build_output;
use crate::sandbox::{Session, run};

impl Pipeline {
    /// Compiles `files` inside `session`.
    ///
    /// Callers resolve the contract through [`validate_submission`] before
    /// staging a session. Stale tests are purged and the build is forced, so
    /// the outcome always reflects exactly this submission.
    pub async fn compile(
        &self,
        session: &Session,
        files: &[SourceFile],
        toolchain_version: Option<&str>,
    ) -> Result<CompilationOutcome, EngineError> {
        ensure_sources(files)?;
        session.purge_tests()?;
        session.write_sources(files)?;

        let args = self.build_args(toolchain_version);
        let output = run(
            &self.toolchain.binary,
            &args,
            session.path(),
            self.toolchain.build_timeout(),
        )
        .await?;

        let report = parse_build_output(&output.stdout, &output.stderr);
        let contracts = match report.contracts {
            Some(contracts) => contracts,
            None => list_artifacts(&session.path().join("out")),
        };

        let outcome = CompilationOutcome::new(
            output.exit_code,
            report.errors,
            report.warnings,
            ArtifactSet { contracts },
            &output.combined(),
        );

        log::info!(
            "Session {} compiled in {:?}: succeeded={}, {} error(s), {} warning(s)",
            session.id(),
            output.elapsed,
            outcome.succeeded,
            outcome.errors.len(),
            outcome.warnings.len()
        );
        Ok(outcome)
    }

    /// Build command line: forced rebuild, structured output, pinned version
    fn build_args(&self, toolchain_version: Option<&str>) -> Vec<String> {
        let mut args = self.toolchain.build_args.clone();
        args.push(self.toolchain.force_flag.clone());
        if let Some(json_flag) = &self.toolchain.json_flag {
            args.push(json_flag.clone());
        }

        let version = toolchain_version.or(self.toolchain.default_version.as_deref());
        if let (Some(flag), Some(version)) = (&self.toolchain.version_flag, version) {
            args.push(flag.clone());
            args.push(version.to_string());
        }
        args
    }
}

/// Contract names from the artifact tree (`out/A.sol/A.json`)
fn list_artifacts(out_dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(out_dir) else {
        return Vec::new();
    };

    let mut contracts: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| fs::read_dir(e.path()).ok())
        .flatten()
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let path = e.path();
            (path.extension()? == "json")
                .then(|| path.file_stem()?.to_str().map(str::to_string))
                .flatten()
        })
        .collect();

    contracts.sort();
    contracts.dedup();
    contracts
}
