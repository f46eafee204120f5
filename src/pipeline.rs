mod compile;
mod testing;

use std::sync::LazyLock;

use regex::Regex;

use crate::config::ToolchainConfig;
use crate::error::EngineError;
use crate::models::SourceFile;
use crate::sandbox::validate_file_names;

/// `contract Name` anywhere on a line, but not `abstract contract`,
/// `interface` or `library`
static CONTRACT_DECLARATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?P<abstract>abstract\s+)?contract\s+(?P<name>[A-Za-z_$][A-Za-z0-9_$]*)")
        .unwrap()
});

/// Drives the toolchain's build and test commands inside a session
pub struct Pipeline {
    toolchain: ToolchainConfig,
}

impl Pipeline {
    pub fn new(toolchain: ToolchainConfig) -> Self {
        Self { toolchain }
    }

    /// `{ContractName}Test` plus the toolchain's test-file suffix
    pub fn test_file_name(&self, contract_name: &str) -> String {
        format!("{contract_name}Test{}", self.toolchain.test_file_suffix)
    }
}

/// Fails with `NoSourceProvided` when there is nothing to compile
pub fn ensure_sources(files: &[SourceFile]) -> Result<(), EngineError> {
    if files.is_empty() || files.iter().all(|f| f.content.trim().is_empty()) {
        return Err(EngineError::NoSourceProvided);
    }
    Ok(())
}

/// Every input check a run needs before anything is persisted or staged.
/// Returns the contract under test.
pub fn validate_submission(
    explicit: Option<&str>,
    files: &[SourceFile],
) -> Result<String, EngineError> {
    ensure_sources(files)?;
    validate_file_names(files)?;
    resolve_contract_name(explicit, files)
}

/// Picks the contract under test: an explicit name wins, otherwise the first
/// concrete `contract` declared in the submission.
pub fn resolve_contract_name(
    explicit: Option<&str>,
    files: &[SourceFile],
) -> Result<String, EngineError> {
    if let Some(name) = explicit.map(str::trim).filter(|n| !n.is_empty()) {
        let valid = name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$');
        return if valid {
            Ok(name.to_string())
        } else {
            Err(EngineError::NoContractName)
        };
    }

    files
        .iter()
        .flat_map(|f| CONTRACT_DECLARATION.captures_iter(&f.content))
        .find(|caps| caps.name("abstract").is_none())
        .map(|caps| caps["name"].to_string())
        .ok_or(EngineError::NoContractName)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(content: &str) -> SourceFile {
        SourceFile {
            name: "Main.sol".to_string(),
            content: content.to_string(),
        }
    }

    #[test]
    fn finds_first_concrete_contract() {
        let files = [file(
            "pragma solidity ^0.8.0;\ninterface IVault {}\nabstract contract Base {}\ncontract Vault is Base {}\ncontract Other {}",
        )];
        assert_eq!(resolve_contract_name(None, &files).unwrap(), "Vault");
    }

    #[test]
    fn declaration_may_share_a_line_with_the_pragma() {
        let files = [file(
            "pragma solidity ^0.8.0; abstract contract Base {} contract Counter is Base {}",
        )];
        assert_eq!(resolve_contract_name(None, &files).unwrap(), "Counter");
        // Not fooled by identifiers that merely end in "contract"
        let files = [file("library L { uint256 mycontract; }")];
        assert!(resolve_contract_name(None, &files).is_err());
    }

    #[test]
    fn explicit_name_wins() {
        let files = [file("contract Vault {}")];
        assert_eq!(
            resolve_contract_name(Some("Token"), &files).unwrap(),
            "Token"
        );
        assert!(matches!(
            resolve_contract_name(Some("../x"), &files),
            Err(EngineError::NoContractName)
        ));
    }

    #[test]
    fn no_contract_is_an_error() {
        let files = [file("library Math {}\ninterface I {}")];
        assert!(matches!(
            resolve_contract_name(None, &files),
            Err(EngineError::NoContractName)
        ));
    }

    #[test]
    fn empty_submission_is_rejected() {
        assert!(matches!(
            ensure_sources(&[]),
            Err(EngineError::NoSourceProvided)
        ));
        assert!(matches!(
            ensure_sources(&[file("   \n")]),
            Err(EngineError::NoSourceProvided)
        ));
        assert!(ensure_sources(&[file("contract A {}")]).is_ok());
    }

    #[test]
    fn submission_checks_run_in_order() {
        let mut escaping = file("contract A {}");
        escaping.name = "../A.sol".to_string();
        assert!(matches!(
            validate_submission(None, &[escaping]),
            Err(EngineError::InvalidFileName(_))
        ));
        assert!(matches!(
            validate_submission(Some("A"), &[file("  ")]),
            Err(EngineError::NoSourceProvided)
        ));
        assert_eq!(
            validate_submission(Some("Counter"), &[file("library Math {}")]).unwrap(),
            "Counter"
        );
    }

    #[test]
    fn test_file_is_derived_from_contract() {
        let pipeline = Pipeline::new(ToolchainConfig::default());
        assert_eq!(pipeline.test_file_name("Counter"), "CounterTest.t.sol");
    }
}
