//! Turns toolchain output into structured diagnostics and test results.
//!
//! Output formats drift between toolchain versions, so both parsers are small
//! ordered chains of matchers. Build output prefers the structured JSON
//! report and falls back to formatted text. Test output tries per-test PASS
//! and FAIL lines, then a name-token fallback, and finally reports zero tests
//! rather than failing.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::models::{Diagnostic, Severity, TestCase, TestStatus};

static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").unwrap());

/// `--> src/Counter.sol:10:5:` as printed under every formatted diagnostic
static LOCATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-->\s*(?P<file>[^\s:]+):(?P<line>\d+):(?P<col>\d+)").unwrap());

/// `Error (2314): Expected ';' but got '}'` or `Warning: ...`
static DIAGNOSTIC_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<sev>Error|Warning)(?:\s*\((?P<code>\d+)\))?:\s*(?P<msg>.+)$").unwrap()
});

/// `src/A.sol:3:1: ParserError: Expected pragma` as printed by older compilers
static INLINE_DIAGNOSTIC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<file>[^\s:]+):(?P<line>\d+):(?P<col>\d+):\s*(?P<kind>\w*Error|Warning):\s*(?P<msg>.+)$",
    )
    .unwrap()
});

static PASS_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[PASS\]\s+(?P<name>[A-Za-z_]\w*)\([^)]*\)(?:\s*\((?P<meta>[^)]*)\))?").unwrap()
});

/// The reason may itself contain brackets (fuzz counterexamples print
/// `args=[123]`), so it runs up to the last `]` before the test name.
static FAIL_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[FAIL(?P<reason>.*)\]\s+(?P<name>[A-Za-z_]\w*)\(").unwrap()
});

/// Gas figure inside the trailing parentheses: `gas: 123` or fuzz `μ: 123, ~: 120`
static GAS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:gas|µ|μ):\s*(?P<gas>\d+)").unwrap());

static TEST_NAME_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?P<name>test[A-Za-z0-9_]*)\s*\(").unwrap());

static AGGREGATE_OK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:suite|test) result:\s*ok\b").unwrap());

/// Everything extracted from one build invocation
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BuildReport {
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
    /// Contract names from the JSON report, when there was one
    pub contracts: Option<Vec<String>>,
}

impl BuildReport {
    fn push(&mut self, diagnostic: Diagnostic) {
        match diagnostic.severity {
            Severity::Error => self.errors.push(diagnostic),
            Severity::Warning => self.warnings.push(diagnostic),
        }
    }
}

pub fn strip_ansi(text: &str) -> String {
    ANSI_ESCAPE.replace_all(text, "").into_owned()
}

/// Parses build output, preferring the JSON report on stdout
pub fn parse_build_output(stdout: &str, stderr: &str) -> BuildReport {
    let stdout = strip_ansi(stdout);
    let stderr = strip_ansi(stderr);

    if let Some(report) = parse_json_report(&stdout) {
        return report;
    }

    let mut report = parse_text_diagnostics(&stdout);
    let from_stderr = parse_text_diagnostics(&stderr);
    report.errors.extend(from_stderr.errors);
    report.warnings.extend(from_stderr.warnings);
    report
}

/// Reads the first JSON object in `text`, if it looks like a compiler report
pub fn parse_json_report(text: &str) -> Option<BuildReport> {
    let start = text.find('{')?;
    let value = serde_json::Deserializer::from_str(&text[start..])
        .into_iter::<Value>()
        .next()?
        .ok()?;

    let object = value.as_object()?;
    if !object.contains_key("errors") && !object.contains_key("contracts") {
        return None;
    }

    let mut report = BuildReport::default();
    for entry in object
        .get("errors")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        if let Some(diagnostic) = json_diagnostic(entry) {
            report.push(diagnostic);
        }
    }

    let contracts: BTreeSet<String> = object
        .get("contracts")
        .and_then(Value::as_object)
        .into_iter()
        .flat_map(|files| files.values())
        .filter_map(Value::as_object)
        .flat_map(|names| names.keys().cloned())
        .collect();
    report.contracts = Some(contracts.into_iter().collect());

    Some(report)
}

fn json_diagnostic(entry: &Value) -> Option<Diagnostic> {
    let severity = match entry.get("severity").and_then(Value::as_str)? {
        "error" => Severity::Error,
        "warning" => Severity::Warning,
        _ => return None, // "info"
    };

    let formatted = entry
        .get("formattedMessage")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let location = LOCATION.captures(formatted);

    let file = entry
        .pointer("/sourceLocation/file")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| location.as_ref().map(|c| c["file"].to_string()));
    let message = entry
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| formatted.lines().next().unwrap_or_default().to_string());

    Some(Diagnostic {
        code: entry
            .get("errorCode")
            .and_then(Value::as_str)
            .map(str::to_string),
        message,
        file,
        line: location.as_ref().and_then(|c| c["line"].parse().ok()),
        column: location.as_ref().and_then(|c| c["col"].parse().ok()),
        severity,
    })
}

/// Parses formatted text diagnostics.
///
/// A header line opens a diagnostic; the first `-->` location line that
/// follows it supplies file, line and column.
pub fn parse_text_diagnostics(text: &str) -> BuildReport {
    let mut report = BuildReport::default();
    let mut pending: Option<Diagnostic> = None;

    for raw in text.lines() {
        let line = raw.trim();

        if let Some(caps) = INLINE_DIAGNOSTIC.captures(line) {
            if let Some(done) = pending.take() {
                report.push(done);
            }
            let severity = if &caps["kind"] == "Warning" {
                Severity::Warning
            } else {
                Severity::Error
            };
            report.push(Diagnostic {
                code: None,
                message: caps["msg"].trim().to_string(),
                file: Some(caps["file"].to_string()),
                line: caps["line"].parse().ok(),
                column: caps["col"].parse().ok(),
                severity,
            });
            continue;
        }

        if let Some(caps) = DIAGNOSTIC_HEADER.captures(line) {
            let message = caps["msg"].trim();
            // Summary banners, not diagnostics
            if message.starts_with("Compiler run") {
                continue;
            }
            if let Some(done) = pending.take() {
                report.push(done);
            }
            pending = Some(Diagnostic {
                code: caps.name("code").map(|c| c.as_str().to_string()),
                message: message.to_string(),
                file: None,
                line: None,
                column: None,
                severity: if &caps["sev"] == "Warning" {
                    Severity::Warning
                } else {
                    Severity::Error
                },
            });
            continue;
        }

        if let Some(caps) = LOCATION.captures(line)
            && let Some(diagnostic) = pending.as_mut()
            && diagnostic.line.is_none()
        {
            diagnostic.file = Some(caps["file"].to_string());
            diagnostic.line = caps["line"].parse().ok();
            diagnostic.column = caps["col"].parse().ok();
        }
    }

    if let Some(done) = pending.take() {
        report.push(done);
    }
    report
}

/// Parses test output through the matcher chain described in the module docs
pub fn parse_test_output(output: &str) -> Vec<TestCase> {
    let output = strip_ansi(output);

    let tests = parse_result_lines(&output);
    if !tests.is_empty() {
        return tests;
    }

    let fallback = parse_name_tokens(&output);
    if fallback.is_empty() {
        log::debug!("No test results recognised in toolchain output");
    } else {
        log::warn!(
            "Per-test markers missing, inferred {} result(s) from the aggregate marker",
            fallback.len()
        );
    }
    fallback
}

fn parse_result_lines(output: &str) -> Vec<TestCase> {
    let mut tests = Vec::new();

    for line in output.lines() {
        if let Some(caps) = PASS_LINE.captures(line) {
            let gas_used = caps
                .name("meta")
                .and_then(|meta| GAS.captures(meta.as_str()))
                .and_then(|gas| gas["gas"].parse().ok())
                .unwrap_or(0);
            tests.push(TestCase {
                name: caps["name"].to_string(),
                status: TestStatus::Passed,
                gas_used,
                error_message: None,
            });
        } else if let Some(caps) = FAIL_LINE.captures(line) {
            tests.push(TestCase {
                name: caps["name"].to_string(),
                status: TestStatus::Failed,
                gas_used: 0,
                error_message: failure_reason(&caps["reason"]),
            });
        }
    }

    tests
}

/// `. Reason: x`, `: x` or nothing
fn failure_reason(raw: &str) -> Option<String> {
    let reason = raw
        .trim_start_matches('.')
        .trim()
        .trim_start_matches("Reason:")
        .trim_start_matches(':')
        .trim();
    (!reason.is_empty()).then(|| reason.to_string())
}

/// Last resort: every distinct `test*` function name gets the status implied
/// by the aggregate marker. This misattributes status when several tests run
/// and only some fail.
fn parse_name_tokens(output: &str) -> Vec<TestCase> {
    let all_ok = AGGREGATE_OK.is_match(output);
    let mut seen = BTreeSet::new();
    let mut tests = Vec::new();

    for caps in TEST_NAME_TOKEN.captures_iter(output) {
        let name = caps["name"].to_string();
        if seen.insert(name.clone()) {
            tests.push(TestCase {
                name,
                status: if all_ok {
                    TestStatus::Passed
                } else {
                    TestStatus::Failed
                },
                gas_used: 0,
                error_message: None,
            });
        }
    }

    tests
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const TEXT_BUILD: &str = "\
Compiling 1 files with Solc 0.8.24
Error: Compiler run failed:
Error (2314): Expected ';' but got '}'
 --> src/Counter.sol:12:5:
   |
12 |     }
   |     ^

Warning (2072): Unused local variable.
  --> src/Counter.sol:7:9:
   |
 7 |         uint256 unused = 1;
   |         ^^^^^^^^^^^^^^
";

    #[test]
    fn text_diagnostics_carry_line_and_column() {
        let report = parse_build_output("", TEXT_BUILD);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.warnings.len(), 1);

        let error = &report.errors[0];
        assert_eq!(error.code.as_deref(), Some("2314"));
        assert_eq!(error.message, "Expected ';' but got '}'");
        assert_eq!(error.file.as_deref(), Some("src/Counter.sol"));
        assert_eq!((error.line, error.column), (Some(12), Some(5)));

        let warning = &report.warnings[0];
        assert_eq!(warning.code.as_deref(), Some("2072"));
        assert_eq!((warning.line, warning.column), (Some(7), Some(9)));
    }

    #[test]
    fn json_report_is_preferred() {
        let stdout = r#"{
          "errors": [{
            "sourceLocation": {"file": "src/Counter.sol", "start": 210, "end": 211},
            "type": "ParserError",
            "component": "general",
            "severity": "error",
            "errorCode": "2314",
            "message": "Expected ';' but got '}'",
            "formattedMessage": "ParserError: Expected ';' but got '}'\n --> src/Counter.sol:9:3:\n"
          }, {
            "severity": "info",
            "message": "ignored",
            "formattedMessage": "Info: ignored"
          }],
          "sources": {},
          "contracts": {"src/Counter.sol": {"Counter": {}, "Helper": {}}}
        }"#;

        let report = parse_build_output(stdout, "Error (9999): should be ignored");
        assert_eq!(report.errors.len(), 1);
        assert!(report.warnings.is_empty());
        // Line comes from the formatted message, never from the byte offset
        assert_eq!(report.errors[0].line, Some(9));
        assert_eq!(report.errors[0].column, Some(3));
        assert_eq!(
            report.contracts,
            Some(vec!["Counter".to_string(), "Helper".to_string()])
        );
    }

    #[test]
    fn inline_compiler_format() {
        let report = parse_text_diagnostics(
            "src/A.sol:3:1: ParserError: Expected pragma\nsrc/A.sol:5:2: Warning: shadowing",
        );
        assert_eq!(report.errors[0].line, Some(3));
        assert_eq!(report.warnings[0].column, Some(2));
    }

    #[test]
    fn ansi_codes_are_ignored() {
        let report = parse_text_diagnostics(&strip_ansi(
            "\x1b[31mError (1234)\x1b[0m: bad\n --> src/A.sol:1:2:",
        ));
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].line, Some(1));
    }

    #[test]
    fn pass_and_fail_lines() {
        let output = "\
Ran 3 tests for test/CounterTest.t.sol:CounterTest
[PASS] testIncrement() (gas: 31303)
[FAIL. Reason: assertion failed] testSetNumber(uint256) (runs: 4, μ: 0, ~: 0)
[PASS] testFuzz_Set(uint256) (runs: 256, μ: 30899, ~: 31288)
[FAIL: revert: nope] testRevert() (gas: 8000)
Suite result: FAILED. 2 passed; 2 failed; 0 skipped";

        let tests = parse_test_output(output);
        assert_eq!(tests.len(), 4);
        assert_eq!(tests[0].name, "testIncrement");
        assert_eq!(tests[0].gas_used, 31303);
        assert_eq!(tests[1].status, TestStatus::Failed);
        assert_eq!(tests[1].gas_used, 0);
        assert_eq!(tests[1].error_message.as_deref(), Some("assertion failed"));
        assert_eq!(tests[2].gas_used, 30899);
        assert_eq!(tests[3].error_message.as_deref(), Some("revert: nope"));
        assert_eq!(tests[3].gas_used, 0);
    }

    #[test]
    fn fuzz_counterexample_failure_is_not_dropped() {
        let output = "\
[PASS] testIncrement() (gas: 31303)
[FAIL: assertion failed; counterexample: calldata=0xabcdef args=[123]] testFuzz_Set(uint256) (runs: 0, μ: 0, ~: 0)
Suite result: FAILED. 1 passed; 1 failed; 0 skipped";

        let tests = parse_test_output(output);
        assert_eq!(tests.len(), 2);
        assert_eq!(tests[1].name, "testFuzz_Set");
        assert_eq!(tests[1].status, TestStatus::Failed);
        assert_eq!(
            tests[1].error_message.as_deref(),
            Some("assertion failed; counterexample: calldata=0xabcdef args=[123]")
        );

        let outcome = crate::models::TestRunOutcome::from_cases(tests);
        assert!(!outcome.succeeded);
        assert_eq!(outcome.summary.failed, 1);
    }

    #[test]
    fn fallback_uses_aggregate_marker() {
        let output = "running testDeposit() ... testWithdraw()\nSuite result: ok. 2 passed";
        let tests = parse_test_output(output);
        assert_eq!(tests.len(), 2);
        assert!(tests.iter().all(|t| t.status == TestStatus::Passed));

        let failed = parse_test_output("testDeposit() reverted\nSuite result: FAILED");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].status, TestStatus::Failed);
    }

    #[test]
    fn unrecognised_output_yields_no_tests() {
        assert!(parse_test_output("No tests found in project!").is_empty());
        assert!(parse_test_output("").is_empty());
    }
}
