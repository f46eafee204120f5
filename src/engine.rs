//! Request orchestration.
//!
//! Every run follows the same path: validate and persist the submission,
//! resolve the owner's workspace, stage a session, compile, test when asked to and the
//! compile succeeded, tear the session down, then record the run. Ephemeral
//! owners lose their workspace at the end of every run, whatever the result.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;

use crate::config::Config;
use crate::database::RecordStore;
use crate::error::EngineError;
use crate::installer::{Dependency, DependencyInstaller, InstallReport};
use crate::models::{CompilationOutcome, RunKind, SourceFile, TestReport, TestSpec};
use crate::pipeline::{Pipeline, validate_submission};
use crate::sandbox::{
    Session, SessionIsolator, WorkspaceHandle, WorkspaceStore, validate_identifier,
};

const ANONYMOUS_OWNER: &str = "anonymous";

/// A compile or test request for one lesson
#[derive(Deserialize, Debug, Clone)]
pub struct RunRequest {
    #[serde(default)]
    pub owner_id: String,
    pub course_id: String,
    pub lesson_id: i64,
    /// Empty means "use the stored submission"
    #[serde(default)]
    pub files: Vec<SourceFile>,
    pub contract_name: Option<String>,
    pub toolchain_version: Option<String>,
}

impl RunRequest {
    pub fn owner(&self) -> &str {
        if self.owner_id.trim().is_empty() {
            ANONYMOUS_OWNER
        } else {
            &self.owner_id
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct ProjectRequest {
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
}

pub struct Engine {
    store: Arc<RecordStore>,
    workspaces: WorkspaceStore,
    sessions: SessionIsolator,
    pipeline: Pipeline,
    installer: DependencyInstaller,
}

impl Engine {
    pub fn new(config: &Config, store: Arc<RecordStore>) -> std::io::Result<Self> {
        let workspaces = WorkspaceStore::new(
            config.storage.workspace_root(),
            config.storage.ephemeral_owner_prefixes.clone(),
            &config.toolchain,
        )?;
        let sessions = SessionIsolator::new(
            config.storage.session_root(),
            &config.toolchain.test_file_suffix,
        )?;

        Ok(Self {
            store,
            workspaces,
            sessions,
            pipeline: Pipeline::new(config.toolchain.clone()),
            installer: DependencyInstaller::new(&config.installer),
        })
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn workspaces(&self) -> &WorkspaceStore {
        &self.workspaces
    }

    pub fn sessions(&self) -> &SessionIsolator {
        &self.sessions
    }

    /// Compiles the submission; never runs tests
    pub async fn compile(&self, request: &RunRequest) -> Result<CompilationOutcome, EngineError> {
        let owner = request.owner();
        validate_identifier(owner)?;
        validate_identifier(&request.course_id)?;
        let (files, _) = self.submission(request).await?;

        let handle = self
            .workspaces
            .get_or_create(owner, &request.course_id)
            .await?;
        let result = self.compile_in_session(&handle, request, &files).await;
        self.release(&handle).await;

        let outcome = result?;
        self.record(
            request,
            RunKind::Compile,
            outcome.succeeded,
            json!({
                "errors": outcome.errors.len(),
                "warnings": outcome.warnings.len(),
                "exit_code": outcome.exit_code,
            }),
        )
        .await;
        Ok(outcome)
    }

    /// Compiles the submission and, only if that succeeded, runs the
    /// lesson's evaluator test against it
    pub async fn test(&self, request: &RunRequest) -> Result<TestReport, EngineError> {
        let owner = request.owner();
        validate_identifier(owner)?;
        validate_identifier(&request.course_id)?;
        let test_spec = self
            .store
            .get_lesson_test(request.lesson_id)
            .await?
            .ok_or(EngineError::TestSpecNotFound(request.lesson_id))?;

        let (files, contract_name) = self.submission(request).await?;

        let handle = self
            .workspaces
            .get_or_create(owner, &request.course_id)
            .await?;
        let result = self
            .test_in_session(&handle, request, &files, &contract_name, &test_spec)
            .await;
        self.release(&handle).await;

        let report = result?;
        let (succeeded, summary) = match &report {
            TestReport::CompilationFailed { compilation } => (
                false,
                json!({ "stage": "compilation_failed", "errors": compilation.errors.len() }),
            ),
            TestReport::Tested { result, .. } => (
                result.succeeded,
                json!({ "stage": "tested", "summary": result.summary }),
            ),
        };
        self.record(request, RunKind::Test, succeeded, summary).await;
        Ok(report)
    }

    async fn compile_in_session(
        &self,
        handle: &WorkspaceHandle,
        request: &RunRequest,
        files: &[SourceFile],
    ) -> Result<CompilationOutcome, EngineError> {
        let session = self.sessions.open_session(handle).await?;
        let outcome = self
            .pipeline
            .compile(&session, files, request.toolchain_version.as_deref())
            .await?;
        close(session);
        Ok(outcome)
    }

    async fn test_in_session(
        &self,
        handle: &WorkspaceHandle,
        request: &RunRequest,
        files: &[SourceFile],
        contract_name: &str,
        test_spec: &TestSpec,
    ) -> Result<TestReport, EngineError> {
        let session = self.sessions.open_session(handle).await?;
        let compilation = self
            .pipeline
            .compile(&session, files, request.toolchain_version.as_deref())
            .await?;

        if !compilation.succeeded {
            close(session);
            return Ok(TestReport::CompilationFailed { compilation });
        }

        let result = self.pipeline.test(&session, contract_name, test_spec).await?;
        close(session);
        Ok(TestReport::Tested {
            compilation,
            result,
        })
    }

    /// Creates (or refreshes) the course project and installs its libraries,
    /// always including the default pair
    pub async fn create_course_project(
        &self,
        course_id: &str,
        dependencies: &[Dependency],
    ) -> Result<InstallReport, EngineError> {
        let handle = self.workspaces.course_project(course_id).await?;
        let deps = DependencyInstaller::with_defaults(dependencies);
        Ok(self.installer.install_dependencies(&handle, &deps).await)
    }

    /// Request files take precedence; an empty request falls back to the
    /// stored submission. Files are persisted only after every input check
    /// passed. Ephemeral owners share ids, so nothing is saved or loaded for
    /// them. Returns the files and the contract under test.
    async fn submission(
        &self,
        request: &RunRequest,
    ) -> Result<(Vec<SourceFile>, String), EngineError> {
        let owner = request.owner();
        let keeps_code = !self.workspaces.is_ephemeral_owner(owner);

        if !request.files.is_empty() {
            let contract_name =
                validate_submission(request.contract_name.as_deref(), &request.files)?;
            if keeps_code {
                self.store
                    .save_student_code(owner, request.lesson_id, &request.files)
                    .await?;
            }
            return Ok((request.files.clone(), contract_name));
        }

        let stored = if keeps_code {
            self.store
                .get_student_code(owner, request.lesson_id)
                .await?
        } else {
            None
        };
        let files = stored.ok_or(EngineError::NoSourceProvided)?;
        let contract_name = validate_submission(request.contract_name.as_deref(), &files)?;
        Ok((files, contract_name))
    }

    async fn release(&self, handle: &WorkspaceHandle) {
        if !self.workspaces.is_ephemeral_owner(&handle.key().owner) {
            return;
        }
        if let Err(e) = self.workspaces.destroy(handle).await {
            log::error!(
                "Failed to destroy ephemeral workspace {}: {e}",
                handle.path().display()
            );
        }
    }

    /// History is best effort: a store outage must not hide a finished run
    async fn record(
        &self,
        request: &RunRequest,
        kind: RunKind,
        succeeded: bool,
        summary: serde_json::Value,
    ) {
        if let Err(e) = self
            .store
            .record_run(request.owner(), request.lesson_id, kind, succeeded, &summary)
            .await
        {
            log::warn!(
                "Failed to record {kind:?} run of owner {} lesson {}: {e}",
                request.owner(),
                request.lesson_id
            );
        }
    }
}

fn close(session: Session) {
    let id = session.id();
    if let Err(e) = session.close() {
        log::error!("Failed to close session {id}: {e}");
    }
}
