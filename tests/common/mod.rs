#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use labrunner::config::Config;
use labrunner::database::RecordStore;
use labrunner::engine::{Engine, RunRequest};
use labrunner::models::SourceFile;
use tempfile::TempDir;

/// Stands in for the real toolchain. Behaviour is keyed on markers in the
/// submitted sources:
/// - `SLOW` hangs the build
/// - `SYNTAX_ERROR` fails the build with one located error
/// - `UNUSED` adds one warning to a successful build
/// - `GOOD` makes the evaluator test pass, anything else fails it
///
/// Every build writes `out/` and `cache/`, and `MUTATE` writes into the
/// project sources, to prove that none of it reaches the durable workspace.
pub const FAKE_TOOLCHAIN: &str = r#"
mode="$1"
shift
case "$mode" in
  build)
    if grep -rq SLOW src; then exec sleep 30; fi
    sleep 0.2
    if grep -rq SYNTAX_ERROR src; then
      echo "Compiler run failed:" >&2
      echo "Error (2314): Expected ';' but got '}'" >&2
      echo "  --> src/Counter.sol:4:5:" >&2
      exit 1
    fi
    if grep -rq UNUSED src; then
      echo "Warning (2072): Unused local variable."
      echo "  --> src/Counter.sol:6:9:"
    fi
    if grep -rq MUTATE src; then echo "mutated" > src/Generated.sol; fi
    mkdir -p out/Counter.sol cache
    echo '{}' > out/Counter.sol/Counter.json
    echo '{}' > cache/solidity-files-cache.json
    echo "Compiler run successful!"
    exit 0
    ;;
  test)
    for last; do :; done
    if [ ! -f "$last" ]; then echo "no test file at $last" >&2; exit 1; fi
    count=$(find test -type f | wc -l)
    echo "Ran 2 tests for $last"
    if [ "$count" -eq 1 ]; then
      echo "[PASS] testOnlyThisFile() (gas: 1000)"
    else
      echo "[FAIL. Reason: found $count test files] testOnlyThisFile() (gas: 0)"
    fi
    if grep -rq GOOD src; then
      echo "[PASS] testIncrement() (gas: 31245)"
    else
      echo "[FAIL. Reason: assertion failed] testIncrement() (gas: 0)"
    fi
    exit 0
    ;;
esac
echo "unknown mode $mode" >&2
exit 2
"#;

pub const COUNTER_TEST: &str = r#"pragma solidity ^0.8.0;
import "forge-std/Test.sol";
import "../src/Counter.sol";
contract CounterTest is Test {
    function testIncrement() public {}
}
"#;

pub struct Harness {
    pub root: TempDir,
    pub engine: Arc<Engine>,
    pub store: Arc<RecordStore>,
}

impl Harness {
    pub fn workspace_root(&self) -> PathBuf {
        self.root.path().join("workspaces")
    }

    pub fn session_root(&self) -> PathBuf {
        self.root.path().join("sessions")
    }

    /// Session directories still on disk
    pub fn live_sessions(&self) -> usize {
        fs::read_dir(self.session_root())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
    path
}

pub fn test_config(root: &Path) -> Config {
    let script = write_script(root, "fake-forge.sh", FAKE_TOOLCHAIN);
    let script = script.to_string_lossy().into_owned();

    let mut config = Config::default();
    config.storage.workspace_root = Some(root.join("workspaces"));
    config.storage.session_root = Some(root.join("sessions"));
    config.storage.database_path = Some(root.join("records.sqlite3"));
    config.toolchain.binary = "/bin/sh".to_string();
    config.toolchain.build_args = vec![script.clone(), "build".to_string()];
    config.toolchain.test_args = vec![script, "test".to_string(), "-vv".to_string()];
    config.toolchain.json_flag = None;
    config.toolchain.build_timeout_secs = 10;
    config.toolchain.test_timeout_secs = 10;
    config.retry.base_delay_ms = 10;
    config.retry.max_delay_ms = 50;
    config.retry.max_attempts = 3;
    config
}

pub async fn harness_with(configure: impl FnOnce(&mut Config)) -> Harness {
    let root = tempfile::tempdir().unwrap();
    let mut config = test_config(root.path());
    configure(&mut config);

    let store = Arc::new(
        RecordStore::open(config.storage.database_path(), config.retry.clone())
            .await
            .unwrap(),
    );
    let engine = Arc::new(Engine::new(&config, store.clone()).unwrap());

    Harness {
        root,
        engine,
        store,
    }
}

pub async fn harness() -> Harness {
    harness_with(|_| {}).await
}

pub fn counter(marker: &str) -> Vec<SourceFile> {
    vec![SourceFile {
        name: "Counter.sol".to_string(),
        content: format!(
            "pragma solidity ^0.8.0;\n\ncontract Counter {{\n    uint256 public count; // {marker}\n    function increment() public {{ count += 1; }}\n}}\n"
        ),
    }]
}

pub fn request(owner: &str, lesson_id: i64, files: Vec<SourceFile>) -> RunRequest {
    RunRequest {
        owner_id: owner.to_string(),
        course_id: "solidity-101".to_string(),
        lesson_id,
        files,
        contract_name: None,
        toolchain_version: None,
    }
}

/// Every file under `dir`, relative, with contents, for before/after comparison
pub fn snapshot(dir: &Path) -> Vec<(PathBuf, Vec<u8>)> {
    fn walk(base: &Path, dir: &Path, out: &mut Vec<(PathBuf, Vec<u8>)>) {
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(base, &path, out);
            } else {
                let relative = path.strip_prefix(base).unwrap().to_path_buf();
                out.push((relative, fs::read(&path).unwrap()));
            }
        }
    }

    let mut files = Vec::new();
    walk(dir, dir, &mut files);
    files.sort();
    files
}
