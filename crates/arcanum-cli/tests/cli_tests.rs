//! Integration tests for the `arcanum` CLI binary.
//!
//! These tests run the CLI as a subprocess against a throwaway redb file,
//! checking exit codes and the JSON printed on stdout.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::fs;
use std::path::Path;
use std::process::Command;

use serde_json::Value;

const KEK: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

/// Helper: locate the `arcanum` binary built by `cargo test`.
fn arcanum_bin() -> String {
    let path = env!("CARGO_BIN_EXE_arcanum");
    assert!(
        Path::new(path).exists(),
        "arcanum binary not found at {path}"
    );
    path.to_owned()
}

/// Helper: run arcanum with args and return (`exit_code`, stdout, stderr).
fn run(args: &[&str]) -> (i32, String, String) {
    let output = Command::new(arcanum_bin())
        .args(args)
        .env_remove("ARCANUM_STORAGE_PATH")
        .env_remove("ARCANUM_KEK")
        .env_remove("ARCANUM_UNSEAL_SHARES")
        .env_remove("ARCANUM_AUDIT_LOG")
        .env_remove("ARCANUM_LOG_LEVEL")
        .output()
        .expect("failed to execute arcanum");

    let code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (code, stdout, stderr)
}

fn json(stdout: &str) -> Value {
    serde_json::from_str(stdout).unwrap_or_else(|e| panic!("stdout is not JSON ({e}): {stdout}"))
}

/// A fresh store plus its unseal shares, joined for `--share`.
struct Store {
    _dir: tempfile::TempDir,
    path: String,
    shares: String,
}

impl Store {
    fn init(shares: u8, threshold: u8) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arcanum.redb").display().to_string();
        let (code, stdout, stderr) = run(&[
            "--storage",
            &path,
            "--kek",
            KEK,
            "init",
            "--shares",
            &shares.to_string(),
            "--threshold",
            &threshold.to_string(),
        ]);
        assert_eq!(code, 0, "init failed: {stderr}");
        let out = json(&stdout);
        let list: Vec<String> = out["shares"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s.as_str().unwrap().to_owned())
            .collect();
        assert_eq!(list.len(), usize::from(shares));
        Self {
            _dir: dir,
            path,
            shares: list[..usize::from(threshold)].join(","),
        }
    }

    /// Run with storage, KEK and enough shares to unseal.
    fn run(&self, args: &[&str]) -> (i32, String, String) {
        let mut full = vec![
            "--storage",
            self.path.as_str(),
            "--kek",
            KEK,
            "--share",
            self.shares.as_str(),
        ];
        full.extend_from_slice(args);
        run(&full)
    }
}

// ── Version & help ───────────────────────────────────────────────────

#[test]
fn test_version_flag() {
    let (code, stdout, _) = run(&["--version"]);
    assert_eq!(code, 0);
    assert!(stdout.contains("arcanum"), "version output: {stdout}");
}

#[test]
fn test_help_lists_command_groups() {
    let (code, stdout, _) = run(&["--help"]);
    assert_eq!(code, 0);
    for group in ["init", "status", "kv", "transit", "pki", "policy"] {
        assert!(stdout.contains(group), "help should mention '{group}'");
    }
}

#[test]
fn test_missing_subcommand_fails() {
    let (code, _, stderr) = run(&[]);
    assert_ne!(code, 0);
    assert!(stderr.contains("Usage"), "stderr: {stderr}");
}

// ── Seal lifecycle ───────────────────────────────────────────────────

#[test]
fn test_missing_kek_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("arcanum.redb").display().to_string();
    let (code, _, stderr) = run(&["--storage", &path, "status"]);
    assert_eq!(code, 1);
    assert!(stderr.contains("ARCANUM_KEK"), "stderr: {stderr}");
}

#[test]
fn test_status_before_init() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("arcanum.redb").display().to_string();
    let (code, stdout, _) = run(&["--storage", &path, "--kek", KEK, "status"]);
    assert_eq!(code, 0);
    let status = json(&stdout);
    assert_eq!(status["initialized"], false);
    assert_eq!(status["sealed"], true);
}

#[test]
fn test_status_with_shares_reports_unsealed() {
    let store = Store::init(3, 2);
    let (code, stdout, stderr) = store.run(&["status"]);
    assert_eq!(code, 0, "stderr: {stderr}");
    let status = json(&stdout);
    assert_eq!(status["initialized"], true);
    assert_eq!(status["sealed"], false);
    assert_eq!(status["threshold"], 2);
}

#[test]
fn test_second_init_fails() {
    let store = Store::init(2, 2);
    let (code, _, stderr) = run(&["--storage", &store.path, "--kek", KEK, "init"]);
    assert_eq!(code, 1);
    assert!(stderr.contains("initialization failed"), "stderr: {stderr}");
}

#[test]
fn test_engine_commands_need_shares() {
    let store = Store::init(2, 2);
    let (code, _, stderr) = run(&[
        "--storage",
        &store.path,
        "--kek",
        KEK,
        "kv",
        "get",
        "app/db",
    ]);
    assert_eq!(code, 1);
    assert!(stderr.contains("sealed"), "stderr: {stderr}");
}

#[test]
fn test_too_few_shares_stay_sealed() {
    let store = Store::init(3, 3);
    let one = store.shares.split(',').next().unwrap().to_owned();
    let (code, _, stderr) = run(&[
        "--storage",
        &store.path,
        "--kek",
        KEK,
        "--share",
        &one,
        "kv",
        "list",
    ]);
    assert_eq!(code, 1);
    assert!(stderr.contains("threshold not reached"), "stderr: {stderr}");
}

// ── KV ───────────────────────────────────────────────────────────────

#[test]
fn test_kv_put_get_across_invocations() {
    let store = Store::init(3, 2);

    let (code, stdout, stderr) = store.run(&["kv", "put", "app/db", "user=admin", "pass=s3cr3t"]);
    assert_eq!(code, 0, "stderr: {stderr}");
    assert_eq!(json(&stdout)["version"], 1);

    let (code, stdout, _) = store.run(&["kv", "put", "app/db", "user=root", "--cas", "1"]);
    assert_eq!(code, 0);
    assert_eq!(json(&stdout)["version"], 2);

    let (code, stdout, _) = store.run(&["kv", "get", "app/db", "--version", "1"]);
    assert_eq!(code, 0);
    let secret = json(&stdout);
    assert_eq!(secret["data"]["user"], "admin");
    assert_eq!(secret["data"]["pass"], "s3cr3t");

    let (code, stdout, _) = store.run(&["kv", "get", "app/db"]);
    assert_eq!(code, 0);
    assert_eq!(json(&stdout)["data"]["user"], "root");
}

#[test]
fn test_kv_stale_cas_is_rejected() {
    let store = Store::init(2, 2);
    assert_eq!(store.run(&["kv", "put", "cfg", "a=1"]).0, 0);
    let (code, _, stderr) = store.run(&["kv", "put", "cfg", "a=2", "--cas", "0"]);
    assert_eq!(code, 1, "stderr: {stderr}");
}

#[test]
fn test_kv_destroy_shows_in_metadata() {
    let store = Store::init(2, 2);
    assert_eq!(store.run(&["kv", "put", "cfg", "a=1"]).0, 0);
    assert_eq!(store.run(&["kv", "put", "cfg", "a=2"]).0, 0);

    let (code, stdout, stderr) = store.run(&["kv", "destroy", "cfg", "--versions", "1"]);
    assert_eq!(code, 0, "stderr: {stderr}");
    let meta = json(&stdout);
    assert_eq!(meta["versions"]["1"]["destroyed"], true);
    assert_eq!(meta["versions"]["2"]["destroyed"], false);

    let (code, _, _) = store.run(&["kv", "get", "cfg", "--version", "1"]);
    assert_eq!(code, 1);
}

#[test]
fn test_kv_list_and_metadata_update() {
    let store = Store::init(2, 2);
    assert_eq!(store.run(&["kv", "put", "team/a", "k=v"]).0, 0);
    assert_eq!(store.run(&["kv", "put", "team/b", "k=v"]).0, 0);

    let (code, stdout, _) = store.run(&["kv", "list", "team/"]);
    assert_eq!(code, 0);
    let listed = json(&stdout);
    assert_eq!(listed.as_array().unwrap().len(), 2);

    let (code, stdout, _) = store.run(&["kv", "metadata", "team/a", "--max-versions", "3"]);
    assert_eq!(code, 0);
    assert_eq!(json(&stdout)["max_versions"], 3);
}

#[test]
fn test_kv_bad_pair_is_rejected() {
    let store = Store::init(2, 2);
    let (code, _, stderr) = store.run(&["kv", "put", "cfg", "novalue"]);
    assert_eq!(code, 1);
    assert!(stderr.contains("key=value"), "stderr: {stderr}");
}

// ── Transit ──────────────────────────────────────────────────────────

#[test]
fn test_transit_encrypt_decrypt_after_rotation() {
    let store = Store::init(2, 2);
    assert_eq!(store.run(&["transit", "create", "orders"]).0, 0);

    // "hello" in base64.
    let (code, stdout, _) = store.run(&["transit", "encrypt", "orders", "aGVsbG8="]);
    assert_eq!(code, 0);
    let ciphertext = json(&stdout)["ciphertext"].as_str().unwrap().to_owned();
    assert!(ciphertext.starts_with("vault:v1:"));

    let (code, stdout, _) = store.run(&["transit", "rotate", "orders"]);
    assert_eq!(code, 0);
    assert_eq!(json(&stdout)["latest_version"], 2);

    let (code, stdout, _) = store.run(&["transit", "decrypt", "orders", &ciphertext]);
    assert_eq!(code, 0);
    assert_eq!(json(&stdout)["plaintext"], "aGVsbG8=");
}

#[test]
fn test_transit_sign_verify() {
    let store = Store::init(2, 2);
    assert_eq!(
        store
            .run(&["transit", "create", "signer", "--type", "ed25519"])
            .0,
        0
    );

    let (code, stdout, _) = store.run(&["transit", "sign", "signer", "aGVsbG8="]);
    assert_eq!(code, 0);
    let signature = json(&stdout)["signature"].as_str().unwrap().to_owned();

    let (code, stdout, _) = store.run(&["transit", "verify", "signer", "aGVsbG8=", &signature]);
    assert_eq!(code, 0);
    assert_eq!(json(&stdout)["valid"], true);

    // "bye" in base64.
    let (code, stdout, _) = store.run(&["transit", "verify", "signer", "Ynll", &signature]);
    assert_eq!(code, 0);
    assert_eq!(json(&stdout)["valid"], false);
}

#[test]
fn test_transit_prehash_travels_in_signature() {
    let store = Store::init(2, 2);
    assert_eq!(
        store
            .run(&["transit", "create", "signer", "--type", "ed25519"])
            .0,
        0
    );

    let (code, stdout, stderr) =
        store.run(&["transit", "sign", "signer", "aGVsbG8=", "--hash", "sha2-256"]);
    assert_eq!(code, 0, "stderr: {stderr}");
    let signature = json(&stdout)["signature"].as_str().unwrap().to_owned();
    assert!(signature.starts_with("vault:v1:sha2-256:"), "{signature}");

    let (code, stdout, _) = store.run(&["transit", "verify", "signer", "aGVsbG8=", &signature]);
    assert_eq!(code, 0);
    assert_eq!(json(&stdout)["valid"], true);
}

#[test]
fn test_transit_rejects_non_base64_plaintext() {
    let store = Store::init(2, 2);
    assert_eq!(store.run(&["transit", "create", "k"]).0, 0);
    let (code, _, stderr) = store.run(&["transit", "encrypt", "k", "not base64!"]);
    assert_eq!(code, 1);
    assert!(stderr.contains("base64"), "stderr: {stderr}");
}

// ── PKI ──────────────────────────────────────────────────────────────

#[test]
fn test_pki_issue_revoke_crl() {
    let store = Store::init(2, 2);

    let (code, stdout, stderr) =
        store.run(&["pki", "root", "root", "--common-name", "Example Root"]);
    assert_eq!(code, 0, "stderr: {stderr}");
    assert!(json(&stdout)["certificate_pem"]
        .as_str()
        .unwrap()
        .contains("BEGIN CERTIFICATE"));

    let (code, _, stderr) = store.run(&[
        "pki",
        "role",
        "web",
        "--ca",
        "root",
        "--max-ttl-secs",
        "86400",
        "--allowed-domains",
        "example.com",
        "--allow-subdomains",
    ]);
    assert_eq!(code, 0, "stderr: {stderr}");

    let (code, stdout, stderr) =
        store.run(&["pki", "issue", "web", "--common-name", "api.example.com"]);
    assert_eq!(code, 0, "stderr: {stderr}");
    let serial = json(&stdout)["serial"].as_str().unwrap().to_owned();

    let (code, _, _) = store.run(&["pki", "issue", "web", "--common-name", "api.evil.org"]);
    assert_eq!(code, 1);

    let (code, stdout, _) = store.run(&["pki", "revoke", &serial]);
    assert_eq!(code, 0);
    assert_eq!(json(&stdout)["revoked"], true);

    let (code, stdout, _) = store.run(&["pki", "crl", "root"]);
    assert_eq!(code, 0);
    let crl = json(&stdout);
    assert_eq!(crl["crl_number"], 1);
    assert_eq!(crl["revoked"][0]["serial"], serial.as_str());
}

#[test]
fn test_pki_intermediate_under_root() {
    let store = Store::init(2, 2);
    assert_eq!(
        store
            .run(&["pki", "root", "root", "--common-name", "Root", "--max-path-length", "1"])
            .0,
        0
    );
    let (code, stdout, stderr) = store.run(&[
        "pki",
        "intermediate",
        "issuing",
        "--parent",
        "root",
        "--common-name",
        "Issuing CA",
        "--ttl-secs",
        "86400",
    ]);
    assert_eq!(code, 0, "stderr: {stderr}");
    assert_eq!(json(&stdout)["max_path_length"], 0);

    // Path length 0 leaves no room for another CA below.
    let (code, _, _) = store.run(&[
        "pki",
        "intermediate",
        "deeper",
        "--parent",
        "issuing",
        "--common-name",
        "Deeper",
        "--ttl-secs",
        "3600",
    ]);
    assert_eq!(code, 1);
}

// ── Policy ───────────────────────────────────────────────────────────

const POLICY: &str = r#"
path "secret/+" {
  capabilities = ["read", "list"]
}

path "secret/admin/*" {
  capabilities = ["deny"]
}
"#;

#[test]
fn test_policy_validate_reports_rules() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("app.hcl");
    fs::write(&file, POLICY).unwrap();

    let (code, stdout, stderr) = run(&["policy", "validate", file.to_str().unwrap()]);
    assert_eq!(code, 0, "stderr: {stderr}");
    let out = json(&stdout);
    assert_eq!(out["valid"], true);
    assert_eq!(out["rules"], 2);
}

#[test]
fn test_policy_validate_rejects_unknown_capability() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("bad.hcl");
    fs::write(&file, "path \"a/*\" { capabilities = [\"fly\"] }").unwrap();

    let (code, _, stderr) = run(&["policy", "validate", file.to_str().unwrap()]);
    assert_eq!(code, 1);
    assert!(stderr.contains("invalid policy"), "stderr: {stderr}");
}

#[test]
fn test_policy_evaluate_deny_overrides_grant() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("app.hcl");
    fs::write(&file, POLICY).unwrap();
    let file = file.to_str().unwrap();

    let eval = |resource: &str| {
        let (code, stdout, stderr) = run(&[
            "policy",
            "evaluate",
            "--file",
            file,
            "--action",
            "read",
            "--resource",
            resource,
        ]);
        assert_eq!(code, 0, "stderr: {stderr}");
        json(&stdout)
    };

    assert_eq!(eval("secret/app/db")["allowed"], true);
    let denied = eval("secret/admin/keys");
    assert_eq!(denied["allowed"], false);
    assert!(denied["reason"].as_str().unwrap().contains("denied"));
    assert_eq!(eval("other/path")["allowed"], false);
}

#[test]
fn test_policy_commands_need_no_kek() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("app.hcl");
    fs::write(&file, POLICY).unwrap();
    let (code, _, _) = run(&["policy", "validate", file.to_str().unwrap()]);
    assert_eq!(code, 0);
}
