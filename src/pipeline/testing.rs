use super::*;
use crate::models::{TestRunOutcome, TestSpec};
use crate::parser::parse_test_output;
use crate::sandbox::{Session, run};

impl Pipeline {
    /// Runs the evaluator test against the contract compiled in `session`.
    ///
    /// Must only follow a successful compile in the same session. The test
    /// file name is derived from the contract and passed to the toolchain's
    /// match-path selector, so exactly this one file runs.
    pub async fn test(
        &self,
        session: &Session,
        contract_name: &str,
        test_spec: &TestSpec,
    ) -> Result<TestRunOutcome, EngineError> {
        let file_name = self.test_file_name(contract_name);
        let test_path = session.write_test_file(&file_name, &test_spec.source)?;
        let test_path = test_path.to_string_lossy().into_owned();

        let args = self.test_args(&test_path);
        let output = run(
            &self.toolchain.binary,
            &args,
            session.path(),
            self.toolchain.test_timeout(),
        )
        .await?;

        let outcome = TestRunOutcome::from_cases(parse_test_output(&output.combined()));
        log::info!(
            "Session {} ran {} for lesson {} in {:?}: {}/{} passed",
            session.id(),
            test_path,
            test_spec.lesson_id,
            output.elapsed,
            outcome.summary.passed,
            outcome.summary.total
        );
        Ok(outcome)
    }

    fn test_args(&self, test_path: &str) -> Vec<String> {
        let mut args = self.toolchain.test_args.clone();
        args.push(self.toolchain.match_path_flag.clone());
        args.push(test_path.to_string());
        args
    }
}
