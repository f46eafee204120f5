use serde::{Deserialize, Serialize};

/// One submitted file, named relative to the project's source root
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub name: String,
    pub content: String,
}

/// The evaluator test registered for a lesson
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TestSpec {
    pub lesson_id: i64,
    pub source: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub code: Option<String>,
    pub message: String,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub severity: Severity,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactSet {
    pub contracts: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CompilationOutcome {
    pub succeeded: bool,
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
    pub artifacts: Option<ArtifactSet>,
    pub exit_code: Option<i32>,
}

impl CompilationOutcome {
    /// Builds an outcome, holding `succeeded == (no errors && exit code 0)`.
    ///
    /// A non-zero exit with nothing parseable still has to surface as an error,
    /// so the raw toolchain output becomes a synthetic diagnostic.
    pub fn new(
        exit_code: Option<i32>,
        mut errors: Vec<Diagnostic>,
        warnings: Vec<Diagnostic>,
        artifacts: ArtifactSet,
        raw_output: &str,
    ) -> Self {
        let exited_ok = exit_code == Some(0);
        if !exited_ok && errors.is_empty() {
            let message = raw_output.trim();
            errors.push(Diagnostic {
                code: None,
                message: if message.is_empty() {
                    format!("toolchain exited with status {exit_code:?}")
                } else {
                    message.to_string()
                },
                file: None,
                line: None,
                column: None,
                severity: Severity::Error,
            });
        }

        let succeeded = exited_ok && errors.is_empty();
        Self {
            succeeded,
            errors,
            warnings,
            artifacts: succeeded.then_some(artifacts),
            exit_code,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    pub name: String,
    pub status: TestStatus,
    pub gas_used: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TestSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TestRunOutcome {
    pub succeeded: bool,
    pub tests: Vec<TestCase>,
    pub summary: TestSummary,
}

impl TestRunOutcome {
    /// Derives the summary from the cases; counts are never tracked separately
    pub fn from_cases(tests: Vec<TestCase>) -> Self {
        let passed = tests
            .iter()
            .filter(|t| t.status == TestStatus::Passed)
            .count();
        let summary = TestSummary {
            total: tests.len(),
            passed,
            failed: tests.len() - passed,
        };

        Self {
            succeeded: summary.total > 0 && summary.failed == 0,
            tests,
            summary,
        }
    }
}

/// Terminal result of a test request
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum TestReport {
    /// Compile failed, so no test ran
    CompilationFailed { compilation: CompilationOutcome },
    Tested {
        compilation: CompilationOutcome,
        result: TestRunOutcome,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum RunKind {
    Compile,
    Test,
}

/// One row of run history
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct RunRecord {
    pub owner_id: String,
    pub lesson_id: i64,
    pub kind: RunKind,
    pub succeeded: bool,
    pub summary: String,
    pub created_time: String,
}
