//! `Arcanum` CLI: operate a local `Arcanum` store from the command line.
//!
//! Every invocation opens the redb store, wires a [`Vault`] around it,
//! unseals it with the shares supplied on the command line or in the
//! environment, runs one command and prints the result as JSON. Nothing
//! stays unsealed between invocations.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use arcanum_core::audit::AuditManager;
use arcanum_core::audit_file::FileAuditBackend;
use arcanum_core::config::EngineConfig;
use arcanum_core::kek::StaticKek;
use arcanum_core::kv::{MetadataUpdate, SecretData};
use arcanum_core::pki::{
    IntermediateCaRequest, IssueRequest, PkiKeyType, PkiRole, RootCaRequest, SignCsrRequest,
};
use arcanum_core::policy::{
    self, Decision, Policy, ROOT_POLICY_NAME, Request, StaticIdentityResolver,
};
use arcanum_core::transit::{HashAlgorithm, KeyOptions, KeyType};
use arcanum_core::vault::Vault;
use arcanum_storage::{RedbBackend, StorageBackend};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

// ── CLI structure ────────────────────────────────────────────────────

/// Arcanum: sealed secrets, transit crypto and a private CA in one file.
#[derive(Parser)]
#[command(
    name = "arcanum",
    version,
    about = "Arcanum CLI: manage a sealed secrets store, transit keys and certificate authorities",
    long_about = None,
    after_help = "Environment variables:\n  \
         ARCANUM_STORAGE_PATH   Database file (default: arcanum.redb)\n  \
         ARCANUM_KEK            Hex key-encryption key (64 hex chars)\n  \
         ARCANUM_UNSEAL_SHARES  Comma-separated unseal shares\n  \
         ARCANUM_LOG_LEVEL      Log filter for stderr (default: info)\n\n\
         Examples:\n  \
         arcanum init --shares 5 --threshold 3\n  \
         arcanum kv put myapp/config db_host=10.0.0.1 db_port=5432\n  \
         arcanum transit encrypt my-key $(echo -n 'hello' | base64)"
)]
struct Cli {
    /// Path of the redb database file.
    #[arg(long, env = "ARCANUM_STORAGE_PATH", default_value = "arcanum.redb")]
    storage: PathBuf,

    /// Hex-encoded 256-bit key-encryption key protecting the master key.
    #[arg(long, env = "ARCANUM_KEK", hide_env_values = true)]
    kek: Option<String>,

    /// Unseal share. Repeat the flag or pass a comma-separated list.
    #[arg(
        long = "share",
        env = "ARCANUM_UNSEAL_SHARES",
        value_delimiter = ',',
        hide_env_values = true
    )]
    shares: Vec<String>,

    /// Append audit events as JSON lines to this file.
    #[arg(long, env = "ARCANUM_AUDIT_LOG")]
    audit_log: Option<PathBuf>,

    /// Actor recorded in audit events.
    #[arg(long, env = "ARCANUM_ACTOR", default_value = "operator")]
    actor: String,

    /// Log filter directive for the JSON logs written to stderr.
    #[arg(long, env = "ARCANUM_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new store and print its unseal shares.
    Init {
        /// Number of unseal key shares to generate.
        #[arg(long, default_value = "5")]
        shares: u8,
        /// Minimum shares required to unseal.
        #[arg(long, default_value = "3")]
        threshold: u8,
    },
    /// Show seal status. Supplied shares are applied first.
    Status,
    /// Versioned key/value secrets.
    Kv {
        #[command(subcommand)]
        action: KvCommands,
    },
    /// Encryption as a service.
    Transit {
        #[command(subcommand)]
        action: TransitCommands,
    },
    /// Certificate authorities, roles and issued certificates.
    Pki {
        #[command(subcommand)]
        action: PkiCommands,
    },
    /// Check policy documents offline.
    Policy {
        #[command(subcommand)]
        action: PolicyCommands,
    },
}

#[derive(Subcommand)]
enum KvCommands {
    /// Write a new version of a secret.
    Put {
        path: String,
        /// Key=value pairs.
        #[arg(required = true)]
        data: Vec<String>,
        /// Expected current version (0 = must not exist).
        #[arg(long)]
        cas: Option<u64>,
    },
    /// Read the current or a specific version.
    Get {
        path: String,
        #[arg(long)]
        version: Option<u64>,
    },
    /// List secret paths under a prefix.
    List {
        #[arg(default_value = "")]
        prefix: String,
    },
    /// Soft-delete versions (the current one when none are given).
    Delete {
        path: String,
        #[arg(long, value_delimiter = ',')]
        versions: Vec<u64>,
    },
    /// Permanently destroy versions.
    Destroy {
        path: String,
        #[arg(long, value_delimiter = ',', required = true)]
        versions: Vec<u64>,
    },
    /// Read metadata, optionally updating settings first.
    Metadata {
        path: String,
        #[arg(long)]
        max_versions: Option<u32>,
        #[arg(long)]
        cas_required: Option<bool>,
        #[arg(long)]
        delete_version_after_secs: Option<u64>,
    },
}

#[derive(Subcommand)]
enum TransitCommands {
    /// Create a named key.
    Create {
        name: String,
        #[arg(long = "type", default_value = "aes256-gcm96")]
        key_type: String,
        #[arg(long)]
        derived: bool,
        #[arg(long)]
        exportable: bool,
    },
    /// Encrypt base64 plaintext.
    Encrypt {
        name: String,
        plaintext: String,
        /// Base64 derivation context.
        #[arg(long)]
        context: Option<String>,
        #[arg(long)]
        version: Option<u32>,
    },
    /// Decrypt a `vault:v{n}:...` ciphertext; prints base64 plaintext.
    Decrypt {
        name: String,
        ciphertext: String,
        #[arg(long)]
        context: Option<String>,
    },
    /// Add a new key version.
    Rotate { name: String },
    /// Sign base64 input.
    Sign {
        name: String,
        input: String,
        /// Prehash algorithm (sha2-256, sha2-384, sha2-512).
        #[arg(long)]
        hash: Option<String>,
    },
    /// Verify a signature over base64 input. The prehash is read from the
    /// signature.
    Verify {
        name: String,
        input: String,
        signature: String,
    },
}

#[derive(Subcommand)]
enum PkiCommands {
    /// Create a self-signed root CA.
    Root {
        name: String,
        #[arg(long)]
        common_name: String,
        #[arg(long)]
        organization: Option<String>,
        #[arg(long = "key-type", default_value = "ec-p256")]
        key_type: String,
        #[arg(long, default_value = "315360000")]
        ttl_secs: u64,
        #[arg(long, default_value = "2")]
        max_path_length: u8,
    },
    /// Create an intermediate CA signed by `--parent`.
    Intermediate {
        name: String,
        #[arg(long)]
        parent: String,
        #[arg(long)]
        common_name: String,
        #[arg(long)]
        organization: Option<String>,
        #[arg(long = "key-type", default_value = "ec-p256")]
        key_type: String,
        #[arg(long, default_value = "157680000")]
        ttl_secs: u64,
        #[arg(long, default_value = "0")]
        max_path_length: u8,
    },
    /// Create or replace an issuance role.
    Role {
        name: String,
        #[arg(long)]
        ca: String,
        #[arg(long)]
        max_ttl_secs: u64,
        #[arg(long, default_value = "0")]
        ttl_secs: u64,
        #[arg(long, value_delimiter = ',')]
        allowed_domains: Vec<String>,
        #[arg(long)]
        allow_bare_domains: bool,
        #[arg(long)]
        allow_subdomains: bool,
        #[arg(long)]
        allow_wildcard: bool,
        #[arg(long)]
        allow_localhost: bool,
        #[arg(long)]
        allow_ip_sans: bool,
        #[arg(long)]
        allow_any_name: bool,
        #[arg(long = "key-type", default_value = "ec-p256")]
        key_type: String,
    },
    /// Issue a leaf certificate with a freshly generated key.
    Issue {
        role: String,
        #[arg(long)]
        common_name: String,
        #[arg(long, value_delimiter = ',')]
        alt_names: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        ip_sans: Vec<String>,
        #[arg(long)]
        ttl_secs: Option<u64>,
    },
    /// Sign a PEM certificate signing request.
    Sign {
        role: String,
        /// File holding the PEM CSR.
        #[arg(long)]
        csr: PathBuf,
        #[arg(long)]
        ttl_secs: Option<u64>,
    },
    /// Revoke a leaf certificate by serial.
    Revoke { serial: String },
    /// Build the CRL of a CA.
    Crl { ca: String },
}

#[derive(Subcommand)]
enum PolicyCommands {
    /// Parse a policy document and report its rules.
    Validate { file: PathBuf },
    /// Evaluate a request against one or more policy documents.
    Evaluate {
        /// Policy files; their grants are combined.
        #[arg(long = "file", required = true)]
        files: Vec<PathBuf>,
        #[arg(long)]
        action: String,
        #[arg(long)]
        resource: String,
        /// Request parameters as key=value.
        #[arg(long = "param")]
        params: Vec<String>,
        #[arg(long)]
        wrapping_ttl: Option<u64>,
    },
}

// ── Entry point ──────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .json()
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let Cli {
        storage,
        kek,
        shares,
        audit_log,
        actor,
        command,
        ..
    } = cli;
    let open = || open_vault(&storage, kek.as_deref(), audit_log.as_deref(), &actor);

    match command {
        Commands::Policy { action } => cmd_policy(action),
        Commands::Init {
            shares: count,
            threshold,
        } => {
            let vault = open().await?;
            let result = vault
                .seal
                .init(count, threshold)
                .await
                .context("initialization failed")?;
            print_json(&json!({
                "shares": result.shares,
                "threshold": result.threshold,
            }));
            Ok(())
        }
        Commands::Status => {
            let vault = open().await?;
            if !shares.is_empty() && vault.seal.is_initialized().await? {
                submit_shares(&vault, &shares).await?;
            }
            print_json(&vault.seal.status().await?);
            Ok(())
        }
        Commands::Kv { action } => {
            let vault = unsealed(open().await?, &shares).await?;
            cmd_kv(&vault, &actor, action).await
        }
        Commands::Transit { action } => {
            let vault = unsealed(open().await?, &shares).await?;
            cmd_transit(&vault, &actor, action).await
        }
        Commands::Pki { action } => {
            let vault = unsealed(open().await?, &shares).await?;
            cmd_pki(&vault, &actor, action).await
        }
    }
}

// ── Vault wiring ─────────────────────────────────────────────────────

async fn open_vault(
    storage: &Path,
    kek: Option<&str>,
    audit_log: Option<&Path>,
    actor: &str,
) -> Result<Vault> {
    let kek = kek.context("no key-encryption key: pass --kek or set ARCANUM_KEK")?;
    let kek = StaticKek::from_hex(kek).context("invalid key-encryption key")?;

    let backend = RedbBackend::open(storage)
        .with_context(|| format!("cannot open storage at {}", storage.display()))?;
    let storage: Arc<dyn StorageBackend> = Arc::new(backend);

    let audit = Arc::new(AuditManager::new());
    if let Some(path) = audit_log {
        audit
            .add_backend(Arc::new(FileAuditBackend::new(path)))
            .await;
    }

    // The operator acts under the built-in root policy.
    let resolver = StaticIdentityResolver::new().with(actor, &[ROOT_POLICY_NAME]);

    Ok(Vault::new(
        storage,
        Arc::new(kek),
        Arc::new(resolver),
        audit,
        EngineConfig::from_env(),
    ))
}

async fn unsealed(vault: Vault, shares: &[String]) -> Result<Vault> {
    if vault.seal.is_sealed().await {
        if shares.is_empty() {
            bail!("vault is sealed: pass --share or set ARCANUM_UNSEAL_SHARES");
        }
        submit_shares(&vault, shares).await?;
        if vault.seal.is_sealed().await {
            bail!(
                "vault is still sealed: {} share(s) supplied, threshold not reached",
                shares.len()
            );
        }
    }
    Ok(vault)
}

async fn submit_shares(vault: &Vault, shares: &[String]) -> Result<()> {
    for (i, share) in shares.iter().enumerate() {
        let progress = vault
            .seal
            .unseal(share.trim())
            .await
            .with_context(|| format!("unseal share #{} rejected", i + 1))?;
        if progress.is_none() {
            break;
        }
    }
    Ok(())
}

/// Check the operator against the policy gate before an engine call.
async fn gate(vault: &Vault, actor: &str, action: &str, resource: &str) -> Result<()> {
    vault.authorize(actor, action, resource).await?;
    Ok(())
}

// ── KV ───────────────────────────────────────────────────────────────

async fn cmd_kv(vault: &Vault, actor: &str, action: KvCommands) -> Result<()> {
    let kv = &vault.kv;
    match action {
        KvCommands::Put { path, data, cas } => {
            gate(vault, actor, "write", &format!("kv/data/{path}")).await?;
            let data: SecretData = parse_kv_pairs(&data)?
                .into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect();
            print_json(&kv.write(actor, &path, &data, cas).await?);
        }
        KvCommands::Get { path, version } => {
            gate(vault, actor, "read", &format!("kv/data/{path}")).await?;
            print_json(&kv.read(actor, &path, version).await?);
        }
        KvCommands::List { prefix } => {
            gate(vault, actor, "list", &format!("kv/metadata/{prefix}")).await?;
            print_json(&kv.list_secrets(&prefix).await?);
        }
        KvCommands::Delete { path, versions } => {
            gate(vault, actor, "delete", &format!("kv/data/{path}")).await?;
            kv.delete_versions(actor, &path, &versions).await?;
            print_json(&kv.read_metadata(&path).await?);
        }
        KvCommands::Destroy { path, versions } => {
            gate(vault, actor, "delete", &format!("kv/destroy/{path}")).await?;
            kv.destroy_versions(actor, &path, &versions).await?;
            print_json(&kv.read_metadata(&path).await?);
        }
        KvCommands::Metadata {
            path,
            max_versions,
            cas_required,
            delete_version_after_secs,
        } => {
            let update = MetadataUpdate {
                cas_required,
                max_versions,
                delete_version_after_secs,
                custom_metadata: None,
            };
            let changes = update.cas_required.is_some()
                || update.max_versions.is_some()
                || update.delete_version_after_secs.is_some();
            if changes {
                gate(vault, actor, "update", &format!("kv/metadata/{path}")).await?;
                print_json(&kv.update_metadata(actor, &path, update).await?);
            } else {
                gate(vault, actor, "read", &format!("kv/metadata/{path}")).await?;
                print_json(&kv.read_metadata(&path).await?);
            }
        }
    }
    Ok(())
}

// ── Transit ──────────────────────────────────────────────────────────

async fn cmd_transit(vault: &Vault, actor: &str, action: TransitCommands) -> Result<()> {
    let transit = &vault.transit;
    match action {
        TransitCommands::Create {
            name,
            key_type,
            derived,
            exportable,
        } => {
            gate(vault, actor, "create", &format!("transit/keys/{name}")).await?;
            let key_type: KeyType = key_type.parse()?;
            let options = KeyOptions {
                key_type,
                derived,
                exportable,
            };
            transit.create_key(actor, &name, options).await?;
            print_json(&transit.read_key(&name).await?);
        }
        TransitCommands::Encrypt {
            name,
            plaintext,
            context,
            version,
        } => {
            gate(vault, actor, "update", &format!("transit/encrypt/{name}")).await?;
            let plaintext = decode_b64("plaintext", &plaintext)?;
            let context = context.map(|c| decode_b64("context", &c)).transpose()?;
            let ciphertext = transit
                .encrypt(&name, &plaintext, context.as_deref(), version)
                .await?;
            print_json(&json!({ "ciphertext": ciphertext }));
        }
        TransitCommands::Decrypt {
            name,
            ciphertext,
            context,
        } => {
            gate(vault, actor, "update", &format!("transit/decrypt/{name}")).await?;
            let context = context.map(|c| decode_b64("context", &c)).transpose()?;
            let plaintext = transit
                .decrypt(actor, &name, &ciphertext, context.as_deref())
                .await?;
            print_json(&json!({ "plaintext": BASE64.encode(plaintext) }));
        }
        TransitCommands::Rotate { name } => {
            gate(vault, actor, "update", &format!("transit/keys/{name}/rotate")).await?;
            let version = transit.rotate_key(actor, &name).await?;
            print_json(&json!({ "name": name, "latest_version": version }));
        }
        TransitCommands::Sign { name, input, hash } => {
            gate(vault, actor, "update", &format!("transit/sign/{name}")).await?;
            let input = decode_b64("input", &input)?;
            let prehash = parse_hash(hash.as_deref())?;
            let signature = transit.sign(&name, &input, prehash, None).await?;
            print_json(&json!({ "signature": signature }));
        }
        TransitCommands::Verify {
            name,
            input,
            signature,
        } => {
            gate(vault, actor, "update", &format!("transit/verify/{name}")).await?;
            let input = decode_b64("input", &input)?;
            let valid = transit.verify(&name, &input, &signature).await?;
            print_json(&json!({ "valid": valid }));
        }
    }
    Ok(())
}

fn parse_hash(hash: Option<&str>) -> Result<Option<HashAlgorithm>> {
    Ok(hash.map(str::parse).transpose()?)
}

// ── PKI ──────────────────────────────────────────────────────────────

async fn cmd_pki(vault: &Vault, actor: &str, action: PkiCommands) -> Result<()> {
    let pki = &vault.pki;
    match action {
        PkiCommands::Root {
            name,
            common_name,
            organization,
            key_type,
            ttl_secs,
            max_path_length,
        } => {
            gate(vault, actor, "create", &format!("pki/root/{name}")).await?;
            let request = RootCaRequest {
                name,
                common_name,
                organization,
                key_type: key_type.parse::<PkiKeyType>()?,
                ttl_secs,
                max_path_length,
            };
            print_json(&pki.create_root_ca(actor, request).await?);
        }
        PkiCommands::Intermediate {
            name,
            parent,
            common_name,
            organization,
            key_type,
            ttl_secs,
            max_path_length,
        } => {
            gate(vault, actor, "create", &format!("pki/intermediate/{name}")).await?;
            let request = IntermediateCaRequest {
                name,
                parent,
                common_name,
                organization,
                key_type: key_type.parse::<PkiKeyType>()?,
                ttl_secs,
                max_path_length,
            };
            print_json(&pki.create_intermediate_ca(actor, request).await?);
        }
        PkiCommands::Role {
            name,
            ca,
            max_ttl_secs,
            ttl_secs,
            allowed_domains,
            allow_bare_domains,
            allow_subdomains,
            allow_wildcard,
            allow_localhost,
            allow_ip_sans,
            allow_any_name,
            key_type,
        } => {
            gate(vault, actor, "write", &format!("pki/roles/{name}")).await?;
            let mut role = PkiRole::new(name, ca, max_ttl_secs);
            role.ttl_secs = ttl_secs;
            role.allowed_domains = allowed_domains;
            role.allow_bare_domains = allow_bare_domains;
            role.allow_subdomains = allow_subdomains;
            role.allow_wildcard_certificates = allow_wildcard;
            role.allow_localhost = allow_localhost;
            role.allow_ip_sans = allow_ip_sans;
            role.allow_any_name = allow_any_name;
            role.key_type = key_type.parse::<PkiKeyType>()?;

            let saved = if pki.read_role(&role.name).await.is_ok() {
                pki.update_role(actor, role).await?
            } else {
                pki.create_role(actor, role).await?
            };
            print_json(&saved);
        }
        PkiCommands::Issue {
            role,
            common_name,
            alt_names,
            ip_sans,
            ttl_secs,
        } => {
            gate(vault, actor, "update", &format!("pki/issue/{role}")).await?;
            let request = IssueRequest {
                role,
                common_name,
                alt_names,
                ip_sans,
                ttl_secs,
            };
            print_json(&pki.issue(actor, request).await?);
        }
        PkiCommands::Sign { role, csr, ttl_secs } => {
            gate(vault, actor, "update", &format!("pki/sign/{role}")).await?;
            let csr_pem = std::fs::read_to_string(&csr)
                .with_context(|| format!("cannot read CSR from {}", csr.display()))?;
            let request = SignCsrRequest {
                role,
                csr_pem,
                ttl_secs,
                ..SignCsrRequest::default()
            };
            print_json(&pki.sign_csr(actor, request).await?);
        }
        PkiCommands::Revoke { serial } => {
            gate(vault, actor, "update", &format!("pki/revoke/{serial}")).await?;
            print_json(&pki.revoke_certificate(actor, &serial).await?);
        }
        PkiCommands::Crl { ca } => {
            gate(vault, actor, "read", &format!("pki/crl/{ca}")).await?;
            print_json(&pki.generate_crl(&ca).await?);
        }
    }
    Ok(())
}

// ── Policy ───────────────────────────────────────────────────────────

fn cmd_policy(action: PolicyCommands) -> Result<()> {
    match action {
        PolicyCommands::Validate { file } => {
            let policy = load_policy(&file)?;
            let paths: Vec<&str> = policy.rules.iter().map(|r| r.pattern.as_str()).collect();
            print_json(&json!({
                "valid": true,
                "rules": policy.rules.len(),
                "paths": paths,
            }));
        }
        PolicyCommands::Evaluate {
            files,
            action,
            resource,
            params,
            wrapping_ttl,
        } => {
            let policies = files
                .iter()
                .map(|f| load_policy(f).map(Arc::new))
                .collect::<Result<Vec<_>>>()?;

            let mut request = Request::new(action, resource);
            for (name, value) in parse_kv_pairs(&params)? {
                request = request.with_parameter(name, value);
            }
            if let Some(ttl) = wrapping_ttl {
                request = request.with_wrapping_ttl(ttl);
            }

            let output = match policy::evaluate_request(&policies, &request)? {
                Decision::Allow => json!({ "allowed": true }),
                Decision::Deny(reason) => json!({
                    "allowed": false,
                    "reason": reason.to_string(),
                }),
            };
            print_json(&output);
        }
    }
    Ok(())
}

fn load_policy(path: &Path) -> Result<Policy> {
    let document = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read policy file {}", path.display()))?;
    Policy::parse(&document).with_context(|| format!("invalid policy {}", path.display()))
}

// ── Helpers ──────────────────────────────────────────────────────────

fn parse_kv_pairs(pairs: &[String]) -> Result<Vec<(String, String)>> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .ok_or_else(|| anyhow::anyhow!("invalid key=value pair: '{pair}'"))
        })
        .collect()
}

fn decode_b64(what: &str, encoded: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(encoded.trim())
        .with_context(|| format!("{what} must be base64"))
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{s}"),
        Err(e) => eprintln!("failed to format JSON: {e}"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn kv_pairs_split_on_first_equals() {
        let pairs = parse_kv_pairs(&["a=1".to_owned(), "url=x=y".to_owned()]).unwrap();
        assert_eq!(
            pairs,
            vec![
                ("a".to_owned(), "1".to_owned()),
                ("url".to_owned(), "x=y".to_owned())
            ]
        );
        assert!(parse_kv_pairs(&["novalue".to_owned()]).is_err());
    }

    #[test]
    fn shares_accept_comma_lists_and_repeats() {
        let cli = Cli::try_parse_from([
            "arcanum", "--share", "a,b", "--share", "c", "status",
        ])
        .unwrap();
        assert_eq!(cli.shares, vec!["a", "b", "c"]);
    }

    #[test]
    fn hash_names_parse() {
        assert!(parse_hash(None).unwrap().is_none());
        assert!(parse_hash(Some("sha2-384")).unwrap().is_some());
        assert!(parse_hash(Some("md5")).is_err());
    }
}
