//! Integration tests for the `clawlets` CLI binary.
//!
//! These run the CLI as a subprocess and check exit codes, stdout and key
//! files on disk. Every test gets its own runtime directory so key material
//! never leaks between tests or into the real home directory.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::io::Write as _;
use std::path::Path;
use std::process::{Command, Stdio};

use serde_json::Value;

/// Helper: locate the `clawlets` binary built by `cargo test`.
fn clawlets_bin() -> String {
    let path = env!("CARGO_BIN_EXE_clawlets");
    assert!(
        Path::new(path).exists(),
        "clawlets binary not found at {path}"
    );
    path.to_owned()
}

fn command(runtime_dir: &Path, args: &[&str]) -> Command {
    let mut cmd = Command::new(clawlets_bin());
    cmd.args(args)
        .env("CLAWLETS_RUNTIME_DIR", runtime_dir)
        .env_remove("CLAWLETS_PROJECT_ID")
        .env_remove("CLAWLETS_RUNNER_NAME")
        .env_remove("CLAWLETS_SECRETS_NONCE")
        .env_remove("CLAWLETS_SECRETS_PORT")
        .env_remove("CLAWLETS_ALLOWED_ORIGIN")
        .env_remove("RUST_LOG");
    cmd
}

/// Helper: run clawlets with args and return (`exit_code`, stdout, stderr).
fn run(runtime_dir: &Path, args: &[&str]) -> (i32, String, String) {
    let output = command(runtime_dir, args)
        .stdin(Stdio::null())
        .output()
        .expect("failed to execute clawlets");

    let code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (code, stdout, stderr)
}

/// Helper: like [`run`], feeding `input` on stdin.
fn run_with_stdin(runtime_dir: &Path, args: &[&str], input: &str) -> (i32, String, String) {
    let mut child = command(runtime_dir, args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to spawn clawlets");
    child
        .stdin
        .take()
        .unwrap()
        .write_all(input.as_bytes())
        .unwrap();
    let output = child.wait_with_output().unwrap();

    let code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (code, stdout, stderr)
}

fn parse_json(stdout: &str) -> Value {
    serde_json::from_str(stdout.trim())
        .unwrap_or_else(|e| panic!("stdout is not JSON ({e}): {stdout}"))
}

// ── Version & help ───────────────────────────────────────────────────

#[test]
fn test_version_flag() {
    let dir = tempfile::tempdir().unwrap();
    let (code, stdout, _) = run(dir.path(), &["--version"]);
    assert_eq!(code, 0, "clawlets --version should exit 0");
    assert!(
        stdout.contains("clawlets"),
        "version output should contain 'clawlets': {stdout}"
    );
}

#[test]
fn test_help_lists_commands() {
    let dir = tempfile::tempdir().unwrap();
    let (code, stdout, _) = run(dir.path(), &["--help"]);
    assert_eq!(code, 0, "clawlets --help should exit 0");
    for cmd in ["key", "seal", "unseal", "exec", "run"] {
        assert!(stdout.contains(cmd), "help should list '{cmd}': {stdout}");
    }
}

#[test]
fn test_exec_requires_command() {
    let dir = tempfile::tempdir().unwrap();
    let (code, _, stderr) = run(dir.path(), &["exec"]);
    assert_ne!(code, 0, "exec without a command should fail");
    assert!(!stderr.is_empty());
}

// ── Key ──────────────────────────────────────────────────────────────

#[test]
fn test_key_path_is_scoped_by_project_and_runner() {
    let dir = tempfile::tempdir().unwrap();
    let (code, stdout, stderr) = run(
        dir.path(),
        &["--project", "acme", "--runner", "build-1", "key", "path"],
    );
    assert_eq!(code, 0, "key path failed: {stderr}");

    let path = stdout.trim();
    assert!(path.starts_with(dir.path().to_str().unwrap()), "{path}");
    assert!(path.contains("acme"), "{path}");
    assert!(path.contains("build-1"), "{path}");
    assert!(
        !Path::new(path).exists(),
        "key path must not create the key"
    );
}

#[test]
fn test_key_path_sanitizes_traversal() {
    let dir = tempfile::tempdir().unwrap();
    let (code, stdout, stderr) = run(
        dir.path(),
        &["--project", "../escape", "--runner", "..", "key", "path"],
    );
    assert_eq!(code, 0, "key path failed: {stderr}");

    let path = Path::new(stdout.trim());
    assert!(path.starts_with(dir.path()), "{}", path.display());
    assert!(
        path.components()
            .all(|c| c != std::path::Component::ParentDir),
        "path must not traverse upward: {}",
        path.display()
    );
}

#[test]
fn test_key_show_is_stable_across_invocations() {
    let dir = tempfile::tempdir().unwrap();

    let (code, first, stderr) = run(dir.path(), &["key", "show"]);
    assert_eq!(code, 0, "key show failed: {stderr}");
    let first = parse_json(&first);
    assert_eq!(first["alg"], "rsa-oaep-3072/aes-256-gcm");
    assert_eq!(first["kid"].as_str().unwrap().len(), 43);
    assert!(first["publicKeySpkiB64"].as_str().unwrap().len() > 400);

    let (_, path, _) = run(dir.path(), &["key", "path"]);
    assert!(Path::new(path.trim()).exists(), "key file should exist");

    let (code, second, _) = run(dir.path(), &["key", "show"]);
    assert_eq!(code, 0);
    assert_eq!(first, parse_json(&second), "advertisement must not change");
}

// ── Seal / unseal ────────────────────────────────────────────────────

#[test]
fn test_seal_unseal_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let (_, advert, _) = run(dir.path(), &["key", "show"]);
    let advert = parse_json(&advert);
    let public_key = advert["publicKeySpkiB64"].as_str().unwrap();
    let kid = advert["kid"].as_str().unwrap();

    let payload = r#"{"API_TOKEN":"s3cret"}"#;
    let (code, envelope, stderr) = run(
        dir.path(),
        &[
            "seal",
            "--public-key",
            public_key,
            "--kid",
            kid,
            "--aad",
            "job-1",
            "--data",
            payload,
        ],
    );
    assert_eq!(code, 0, "seal failed: {stderr}");
    let envelope = envelope.trim();
    assert!(!envelope.contains('='), "envelope must be unpadded base64url");

    let (code, stdout, stderr) = run(
        dir.path(),
        &["unseal", "--aad", "job-1", "--envelope", envelope],
    );
    assert_eq!(code, 0, "unseal failed: {stderr}");
    assert_eq!(stdout.trim(), payload);

    // Envelope on stdin works too.
    let (code, stdout, _) = run_with_stdin(dir.path(), &["unseal", "--aad", "job-1"], envelope);
    assert_eq!(code, 0);
    assert_eq!(stdout.trim(), payload);
}

#[test]
fn test_unseal_rejects_wrong_aad() {
    let dir = tempfile::tempdir().unwrap();
    let (_, advert, _) = run(dir.path(), &["key", "show"]);
    let public_key = parse_json(&advert)["publicKeySpkiB64"]
        .as_str()
        .unwrap()
        .to_owned();

    let (code, envelope, _) = run_with_stdin(
        dir.path(),
        &["seal", "--public-key", &public_key, "--aad", "job-1"],
        "payload",
    );
    assert_eq!(code, 0);

    let (code, stdout, stderr) = run(
        dir.path(),
        &["unseal", "--aad", "job-2", "--envelope", envelope.trim()],
    );
    assert_eq!(code, 1, "unseal with the wrong aad must fail");
    assert!(stdout.is_empty(), "nothing may be printed on failure");
    assert!(stderr.contains("failed to unseal"), "{stderr}");
}

#[test]
fn test_seal_refuses_mismatched_kid() {
    let dir = tempfile::tempdir().unwrap();
    let (_, advert, _) = run(dir.path(), &["key", "show"]);
    let public_key = parse_json(&advert)["publicKeySpkiB64"]
        .as_str()
        .unwrap()
        .to_owned();

    let (code, stdout, stderr) = run(
        dir.path(),
        &[
            "seal",
            "--public-key",
            &public_key,
            "--kid",
            "not-the-kid",
            "--aad",
            "job-1",
            "--data",
            "x",
        ],
    );
    assert_eq!(code, 1);
    assert!(stdout.is_empty());
    assert!(stderr.contains("refusing to seal"), "{stderr}");
}

#[test]
fn test_unseal_reports_rotated_key() {
    let old = tempfile::tempdir().unwrap();
    let new = tempfile::tempdir().unwrap();
    let (_, advert, _) = run(old.path(), &["key", "show"]);
    let public_key = parse_json(&advert)["publicKeySpkiB64"]
        .as_str()
        .unwrap()
        .to_owned();
    let (_, envelope, _) = run(
        old.path(),
        &["seal", "--public-key", &public_key, "--aad", "job-1", "--data", "x"],
    );

    let (code, _, stderr) = run(
        new.path(),
        &["unseal", "--aad", "job-1", "--envelope", envelope.trim()],
    );
    assert_eq!(code, 1);
    assert!(stderr.contains("re-seal"), "{stderr}");
}

// ── Exec ─────────────────────────────────────────────────────────────

#[cfg(unix)]
#[test]
fn test_exec_prints_result_json() {
    let dir = tempfile::tempdir().unwrap();
    let (code, stdout, stderr) = run(
        dir.path(),
        &["exec", "--", "sh", "-c", "printf out; printf err >&2; exit 3"],
    );
    assert_eq!(code, 0, "a non-zero child exit is a result, not an error: {stderr}");

    let result = parse_json(&stdout);
    assert_eq!(result["exitCode"], 3);
    assert_eq!(result["stdoutTail"], "out");
    assert_eq!(result["stderrTail"], "err");
}

#[cfg(unix)]
#[test]
fn test_exec_timeout_fails() {
    let dir = tempfile::tempdir().unwrap();
    let (code, stdout, stderr) = run(
        dir.path(),
        &["exec", "--timeout-ms", "200", "--", "sleep", "5"],
    );
    assert_eq!(code, 1);
    assert!(stdout.is_empty());
    assert!(stderr.contains("timed out"), "{stderr}");
}

#[cfg(unix)]
#[test]
fn test_exec_full_stdout_limit() {
    let dir = tempfile::tempdir().unwrap();
    let (code, _, stderr) = run(
        dir.path(),
        &[
            "exec",
            "--full-stdout",
            "--max-stdout-bytes",
            "4",
            "--",
            "printf",
            "123456789",
        ],
    );
    assert_eq!(code, 1);
    assert!(stderr.contains("stdout exceeded 4 bytes"), "{stderr}");

    let (code, stdout, _) = run(
        dir.path(),
        &["exec", "--full-stdout", "--", "printf", "123456789"],
    );
    assert_eq!(code, 0);
    assert_eq!(parse_json(&stdout)["stdout"], "123456789");
}

#[cfg(unix)]
#[test]
fn test_exec_huge_timeout_runs_normally() {
    let dir = tempfile::tempdir().unwrap();
    let (code, stdout, stderr) = run(
        dir.path(),
        &["exec", "--timeout-ms", &u64::MAX.to_string(), "--", "true"],
    );
    assert_eq!(code, 0, "exec failed: {stderr}");
    assert_eq!(parse_json(&stdout)["exitCode"], 0);
}

#[cfg(unix)]
#[test]
fn test_exec_stdin_is_opt_in() {
    let dir = tempfile::tempdir().unwrap();

    let (code, stdout, stderr) = run_with_stdin(
        dir.path(),
        &["exec", "--inherit-stdin", "--", "cat"],
        "piped input",
    );
    assert_eq!(code, 0, "exec failed: {stderr}");
    assert_eq!(parse_json(&stdout)["stdoutTail"], "piped input");

    let (code, stdout, _) = run_with_stdin(dir.path(), &["exec", "--", "cat"], "piped input");
    assert_eq!(code, 0);
    assert_eq!(parse_json(&stdout)["stdoutTail"], "");
}

// ── Run ──────────────────────────────────────────────────────────────

#[cfg(unix)]
#[test]
fn test_run_without_secrets_and_no_prompt_fails() {
    let dir = tempfile::tempdir().unwrap();
    let (code, stdout, stderr) = run(
        dir.path(),
        &[
            "run", "--job", "job-9", "--wait-ms", "300", "--no-prompt", "--port", "0", "--nonce",
            "n0nce", "--", "true",
        ],
    );
    assert_eq!(code, 1);
    assert!(stdout.is_empty());
    assert!(stderr.contains("no secrets received for job 'job-9'"), "{stderr}");
    assert!(stderr.contains("/secrets/submit"), "{stderr}");
}

#[cfg(unix)]
#[test]
fn test_run_falls_back_to_stdin_prompt() {
    let dir = tempfile::tempdir().unwrap();
    let (code, stdout, stderr) = run_with_stdin(
        dir.path(),
        &[
            "run",
            "--job",
            "job-1",
            "--wait-ms",
            "0",
            "--port",
            "0",
            "--nonce",
            "n0nce",
            "--clean-env",
            "--",
            "/bin/sh",
            "-c",
            "printf '%s' \"$GREETING\"",
        ],
        "{\"GREETING\":\"hello\"}\n",
    );
    assert_eq!(code, 0, "run failed: {stderr}");
    assert_eq!(parse_json(&stdout)["stdoutTail"], "hello");
}

#[cfg(unix)]
#[test]
fn test_run_skips_non_utf8_environment() {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt as _;

    let dir = tempfile::tempdir().unwrap();
    let mut child = command(
        dir.path(),
        &[
            "run",
            "--job",
            "job-1",
            "--wait-ms",
            "0",
            "--port",
            "0",
            "--nonce",
            "n0nce",
            "--",
            "/bin/sh",
            "-c",
            "printf '%s:%s' \"$GREETING\" \"$PLAIN\"",
        ],
    )
    .env("NOT_UTF8", OsStr::from_bytes(b"\xff\xfe"))
    .env("PLAIN", "kept")
    .stdin(Stdio::piped())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .spawn()
    .unwrap();
    child
        .stdin
        .take()
        .unwrap()
        .write_all(b"{\"GREETING\":\"hello\"}\n")
        .unwrap();
    let output = child.wait_with_output().unwrap();

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(output.status.code(), Some(0), "run failed: {stderr}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(parse_json(&stdout)["stdoutTail"], "hello:kept");
}
