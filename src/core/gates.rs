//! Build/test gates run before accepted changes are committed.

use anyhow::Result;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

const NPM_PLACEHOLDER_TEST: &str = "no test specified";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GateCommands {
    pub build: Option<String>,
    pub test: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    Passed,
    Failed(String),
    NotDetected,
    /// The test command ran but found nothing to run.
    NoTests,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Confidence {
    High,
    Medium,
    Failed,
}

impl Confidence {
    pub fn as_str(self) -> &'static str {
        match self {
            Confidence::High => "HIGH",
            Confidence::Medium => "MEDIUM",
            Confidence::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GateReport {
    pub build: GateOutcome,
    pub test: GateOutcome,
    pub confidence: Confidence,
}

impl GateReport {
    pub fn failure_reason(&self) -> Option<String> {
        let mut reasons = Vec::new();
        if let GateOutcome::Failed(e) = &self.build {
            reasons.push(format!("build failed: {}", e));
        }
        if let GateOutcome::Failed(e) = &self.test {
            reasons.push(format!("tests failed: {}", e));
        }
        (!reasons.is_empty()).then(|| reasons.join("; "))
    }
}

pub fn confidence(build: &GateOutcome, test: &GateOutcome) -> Confidence {
    use GateOutcome::*;
    match (build, test) {
        (Failed(_), _) | (_, Failed(_)) => Confidence::Failed,
        (Passed | NoTests | NotDetected, Passed | NoTests) => Confidence::High,
        (Passed | NoTests, NotDetected) => Confidence::Medium,
        (NotDetected, NotDetected) => Confidence::Medium,
    }
}

fn makefile_targets(text: &str) -> (bool, bool) {
    let has = |target: &str| {
        text.lines()
            .any(|l| l.starts_with(target) && l[target.len()..].starts_with(':'))
    };
    (has("build"), has("test"))
}

/// First manifest that provides a command wins, per command.
pub fn detect(root: &Path) -> GateCommands {
    let mut cmds = GateCommands::default();
    let mut offer = |build: Option<&str>, test: Option<&str>| {
        if cmds.build.is_none() {
            cmds.build = build.map(str::to_string);
        }
        if cmds.test.is_none() {
            cmds.test = test.map(str::to_string);
        }
    };

    if root.join("Cargo.toml").exists() {
        offer(Some("cargo build --quiet"), Some("cargo test --quiet"));
    }
    if let Ok(text) = std::fs::read_to_string(root.join("package.json")) {
        let scripts = serde_json::from_str::<serde_json::Value>(&text)
            .ok()
            .and_then(|v| v.get("scripts").cloned());
        let script = |name: &str| {
            scripts
                .as_ref()
                .and_then(|s| s.get(name))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };
        let build = script("build").map(|_| "npm run build");
        let test = script("test")
            .filter(|t| !t.contains(NPM_PLACEHOLDER_TEST))
            .map(|_| "npm test");
        offer(build, test);
    }
    if root.join("go.mod").exists() {
        offer(Some("go build ./..."), Some("go test ./..."));
    }
    if root.join("pyproject.toml").exists() {
        offer(Some("python3 -m compileall -q ."), Some("python3 -m pytest -q"));
    }
    if let Ok(text) = std::fs::read_to_string(root.join("Makefile")) {
        let (build, test) = makefile_targets(&text);
        offer(build.then_some("make build"), test.then_some("make test"));
    }
    cmds
}

fn ran_no_tests(code: Option<i32>, output: &str) -> bool {
    let lower = output.to_lowercase();
    // pytest exits 5 when nothing was collected.
    code == Some(5)
        || lower.contains("no tests ran")
        || lower.contains("[no test files]")
        || (lower.contains("running 0 tests")
            && lower
                .lines()
                .filter(|l| l.starts_with("running "))
                .all(|l| l.trim() == "running 0 tests"))
}

async fn run(command: &str, root: &Path, timeout: Duration, is_test: bool) -> GateOutcome {
    info!("Gate: {}", command);
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command).current_dir(root).kill_on_drop(true);
    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Err(_) => return GateOutcome::Failed(format!("'{}' timed out after {}s", command, timeout.as_secs())),
        Ok(Err(e)) => return GateOutcome::Failed(format!("could not run '{}': {}", command, e)),
        Ok(Ok(o)) => o,
    };
    let combined = format!(
        "{}\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    if is_test && ran_no_tests(output.status.code(), &combined) {
        return GateOutcome::NoTests;
    }
    if output.status.success() {
        GateOutcome::Passed
    } else {
        let tail: String = combined
            .trim()
            .lines()
            .rev()
            .take(5)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join("\n");
        warn!("Gate '{}' failed: {}", command, tail);
        GateOutcome::Failed(tail)
    }
}

pub struct GateRunner {
    timeout: Duration,
}

impl GateRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn evaluate(&self, root: &Path) -> Result<GateReport> {
        let cmds = detect(root);
        let build = match &cmds.build {
            Some(c) => run(c, root, self.timeout, false).await,
            None => GateOutcome::NotDetected,
        };
        // A broken build makes the test run meaningless.
        let test = match (&build, &cmds.test) {
            (GateOutcome::Failed(_), Some(_)) => GateOutcome::Failed("skipped: build failed".to_string()),
            (_, Some(c)) => run(c, root, self.timeout, true).await,
            (_, None) => GateOutcome::NotDetected,
        };
        let confidence = confidence(&build, &test);
        info!("Gate confidence: {}", confidence.as_str());
        Ok(GateReport {
            build,
            test,
            confidence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use GateOutcome::*;

    #[test]
    fn confidence_table() {
        let f = || Failed("x".to_string());
        assert_eq!(confidence(&Passed, &Passed), Confidence::High);
        assert_eq!(confidence(&Passed, &NoTests), Confidence::High);
        assert_eq!(confidence(&Passed, &NotDetected), Confidence::Medium);
        assert_eq!(confidence(&NotDetected, &NotDetected), Confidence::Medium);
        assert_eq!(confidence(&f(), &Passed), Confidence::Failed);
        assert_eq!(confidence(&Passed, &f()), Confidence::Failed);
        assert_eq!(confidence(&NotDetected, &f()), Confidence::Failed);
    }

    #[test]
    fn detects_commands_from_manifests() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(detect(dir.path()), GateCommands::default());

        std::fs::write(
            dir.path().join("package.json"),
            r#"{"scripts": {"build": "tsc", "test": "echo \"Error: no test specified\" && exit 1"}}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("Makefile"), "build:\n\tcc x.c\ntest:\n\t./t\n").unwrap();
        let cmds = detect(dir.path());
        assert_eq!(cmds.build.as_deref(), Some("npm run build"));
        assert_eq!(cmds.test.as_deref(), Some("make test"));
    }

    #[test]
    fn no_tests_heuristics() {
        assert!(ran_no_tests(Some(5), "collected 0 items"));
        assert!(ran_no_tests(Some(0), "ok  \tpkg\t[no test files]"));
        assert!(ran_no_tests(Some(0), "running 0 tests\n\ntest result: ok. 0 passed"));
        assert!(!ran_no_tests(Some(0), "running 3 tests\ntest result: ok. 3 passed"));
    }

    #[tokio::test]
    async fn makefile_gates_run() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Makefile"), "build:\n\ttrue\ntest:\n\tfalse\n").unwrap();
        let report = GateRunner::new(Duration::from_secs(30))
            .evaluate(dir.path())
            .await
            .unwrap();
        if report.build == Passed {
            assert!(matches!(report.test, Failed(_)));
            assert_eq!(report.confidence, Confidence::Failed);
            assert!(report.failure_reason().unwrap().contains("tests failed"));
        }
    }
}
