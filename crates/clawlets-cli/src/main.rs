//! Clawlets CLI: operator tooling around the runner.
//!
//! Shows the runner key and its advertisement, seals and unseals envelopes
//! against it, runs commands through the bounded process executor, and runs
//! whole jobs: wait for secrets on the loopback buffer (or stdin), then
//! execute with those secrets in the environment.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::io::Read as _;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};

use clawlets_core::envelope::{self, SealedEnvelope};
use clawlets_core::exec::{
    DEFAULT_MAX_STDERR_BYTES, DEFAULT_MAX_STDOUT_BYTES, ExecSpec, StdinMode,
    exec_capture_stdout, exec_capture_tail,
};
use clawlets_core::keypair::{KeypairStore, RunnerKeypair};
use clawlets_runner::LocalSecretsBuffer;
use clawlets_runner::config::{BufferConfig, DEFAULT_ALLOWED_ORIGIN, DEFAULT_SECRETS_PORT};

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const RED: &str = "\x1b[31m";

// ── CLI structure ────────────────────────────────────────────────────

/// Clawlets runner tooling.
#[derive(Parser)]
#[command(
    name = "clawlets",
    version,
    about = "Clawlets CLI: runner keys, sealed secrets and bounded job execution",
    long_about = None,
    after_help = format!(
        "{DIM}Environment variables:{RESET}\n  \
         CLAWLETS_RUNTIME_DIR     Key storage root (default: ~/.clawlets)\n  \
         CLAWLETS_PROJECT_ID      Project the runner belongs to\n  \
         CLAWLETS_RUNNER_NAME     Runner name within the project\n  \
         CLAWLETS_SECRETS_NONCE   Nonce the dashboard must echo on submit\n\n\
         {DIM}Examples:{RESET}\n  \
         clawlets key show\n  \
         clawlets exec --timeout-ms 5000 -- ls -la\n  \
         clawlets run --job job-42 -- ./deploy.sh"
    ),
)]
struct Cli {
    /// Root directory for runner key material.
    #[arg(long, global = true, env = "CLAWLETS_RUNTIME_DIR")]
    runtime_dir: Option<PathBuf>,

    /// Project the runner belongs to.
    #[arg(long, global = true, env = "CLAWLETS_PROJECT_ID", default_value = "default")]
    project: String,

    /// Runner name within the project.
    #[arg(long, global = true, env = "CLAWLETS_RUNNER_NAME", default_value = "runner")]
    runner: String,

    /// Log filter for diagnostics on stderr.
    #[arg(long, global = true, env = "CLAWLETS_LOG_LEVEL", default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect the runner keypair.
    Key {
        #[command(subcommand)]
        action: KeyCommands,
    },

    /// Seal a payload to a runner public key.
    Seal {
        /// Base64url SPKI DER public key from the runner advertisement.
        #[arg(long)]
        public_key: String,

        /// Refuse to seal unless the key hashes to this key id.
        #[arg(long)]
        kid: Option<String>,

        /// Associated data bound to the envelope, usually the job id.
        #[arg(long)]
        aad: String,

        /// Payload to seal. Read from stdin when omitted.
        #[arg(long)]
        data: Option<String>,
    },

    /// Unseal an envelope with the local runner key.
    Unseal {
        /// Associated data the envelope was sealed with.
        #[arg(long)]
        aad: String,

        /// Envelope to open. Read from stdin when omitted.
        #[arg(long)]
        envelope: Option<String>,

        /// Accept envelopes sealed to a different key id.
        #[arg(long)]
        skip_kid_check: bool,
    },

    /// Run a command with bounded output and a deadline.
    Exec {
        #[command(flatten)]
        limits: ExecArgs,

        /// Capture all of stdout and fail past the limit instead of keeping a tail.
        #[arg(long)]
        full_stdout: bool,

        /// Pass this process's stdin to the command instead of `/dev/null`.
        #[arg(long)]
        inherit_stdin: bool,

        /// Command and arguments.
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// Wait for job secrets, then run a command with them in its environment.
    Run {
        /// Job the secrets are submitted for.
        #[arg(long)]
        job: String,

        /// How long to poll the buffer before falling back to stdin.
        #[arg(long, default_value_t = 60_000)]
        wait_ms: u64,

        /// Fail instead of prompting on stdin when nothing was submitted.
        #[arg(long)]
        no_prompt: bool,

        /// Loopback port of the secrets buffer (0 picks a free port).
        #[arg(long, env = "CLAWLETS_SECRETS_PORT", default_value_t = DEFAULT_SECRETS_PORT)]
        port: u16,

        /// Nonce submitters must send in `X-Clawlets-Nonce`.
        #[arg(long, env = "CLAWLETS_SECRETS_NONCE", hide_env_values = true)]
        nonce: String,

        /// Browser origin allowed to submit secrets.
        #[arg(long, env = "CLAWLETS_ALLOWED_ORIGIN", default_value = DEFAULT_ALLOWED_ORIGIN)]
        origin: String,

        /// Start the command with only the submitted secrets as its environment.
        #[arg(long)]
        clean_env: bool,

        #[command(flatten)]
        limits: ExecArgs,

        /// Command and arguments.
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
}

#[derive(Subcommand)]
enum KeyCommands {
    /// Print where the runner key lives.
    Path,
    /// Load or create the key and print its advertisement as JSON.
    Show,
}

#[derive(Args)]
struct ExecArgs {
    /// Kill the command after this many milliseconds.
    #[arg(long, default_value_t = 300_000)]
    timeout_ms: u64,

    /// Stdout limit in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_STDOUT_BYTES)]
    max_stdout_bytes: usize,

    /// Stderr tail size in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_STDERR_BYTES)]
    max_stderr_bytes: usize,
}

impl ExecArgs {
    fn spec(&self, command: &[String]) -> Result<ExecSpec> {
        let Some((program, args)) = command.split_first() else {
            bail!("no command specified; usage: clawlets exec -- <command> [args...]");
        };
        Ok(ExecSpec::new(program)
            .args(args)
            .timeout(Duration::from_millis(self.timeout_ms))
            .max_stdout_bytes(self.max_stdout_bytes)
            .max_stderr_bytes(self.max_stderr_bytes))
    }
}

// ── Entry point ──────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let key_store =
        match KeypairStore::for_runner(cli.runtime_dir.as_deref(), &cli.project, &cli.runner) {
            Ok(store) => store,
            Err(e) => {
                return report(&anyhow::Error::new(e).context("failed to resolve runner key path"));
            }
        };

    match run(&key_store, cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => report(&e),
    }
}

fn report(e: &anyhow::Error) -> ExitCode {
    eprintln!("{RED}{BOLD}✗ Error:{RESET} {e:#}");
    ExitCode::FAILURE
}

async fn run(key_store: &KeypairStore, cmd: Commands) -> Result<()> {
    match cmd {
        Commands::Key { action } => cmd_key(key_store, action).await,
        Commands::Seal {
            public_key,
            kid,
            aad,
            data,
        } => cmd_seal(&public_key, kid.as_deref(), &aad, data),
        Commands::Unseal {
            aad,
            envelope,
            skip_kid_check,
        } => cmd_unseal(key_store, &aad, envelope, skip_kid_check).await,
        Commands::Exec {
            limits,
            full_stdout,
            inherit_stdin,
            command,
        } => {
            let stdin = if inherit_stdin {
                StdinMode::Inherit
            } else {
                StdinMode::Ignore
            };
            cmd_exec(&limits, full_stdout, stdin, &command).await
        }
        Commands::Run {
            job,
            wait_ms,
            no_prompt,
            port,
            nonce,
            origin,
            clean_env,
            limits,
            command,
        } => {
            let buffer = BufferConfig::new(port, nonce, origin);
            let job = JobRun {
                job_id: job,
                wait: Duration::from_millis(wait_ms),
                allow_prompt: !no_prompt,
                clean_env,
            };
            cmd_run(buffer, &job, &limits, &command).await
        }
    }
}

// ── Key ──────────────────────────────────────────────────────────────

async fn load_key(key_store: &KeypairStore) -> Result<RunnerKeypair> {
    key_store
        .load_or_create()
        .await
        .with_context(|| format!("failed to load runner key at {}", key_store.path().display()))
}

async fn cmd_key(key_store: &KeypairStore, action: KeyCommands) -> Result<()> {
    match action {
        KeyCommands::Path => {
            println!("{}", key_store.path().display());
        }
        KeyCommands::Show => {
            let keypair = load_key(key_store).await?;
            println!("{}", serde_json::to_string_pretty(&keypair.advertisement())?);
        }
    }
    Ok(())
}

// ── Envelopes ────────────────────────────────────────────────────────

fn read_stdin(what: &str) -> Result<String> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .with_context(|| format!("failed to read {what} from stdin"))?;
    Ok(input)
}

fn cmd_seal(public_key: &str, kid: Option<&str>, aad: &str, data: Option<String>) -> Result<()> {
    let payload = match data {
        Some(data) => data,
        None => read_stdin("payload")?,
    };

    let sealed = envelope::seal(public_key.trim(), aad, payload.as_bytes())
        .context("failed to seal payload")?;

    if let Some(expected) = kid {
        let actual = SealedEnvelope::decode(&sealed)?.kid;
        if actual != expected {
            bail!("public key has key id {actual}, expected {expected}; refusing to seal");
        }
    }

    println!("{sealed}");
    Ok(())
}

async fn cmd_unseal(
    key_store: &KeypairStore,
    aad: &str,
    envelope_b64: Option<String>,
    skip_kid_check: bool,
) -> Result<()> {
    let envelope_b64 = match envelope_b64 {
        Some(envelope) => envelope,
        None => read_stdin("envelope")?,
    };
    let keypair = load_key(key_store).await?;

    let payload = if skip_kid_check {
        envelope::unseal_with_key(keypair.private_key(), aad, envelope_b64.trim(), None, None)
    } else {
        keypair.unseal(aad, envelope_b64.trim())
    }
    .context("failed to unseal envelope")?;

    println!("{payload}");
    Ok(())
}

// ── Exec ─────────────────────────────────────────────────────────────

async fn cmd_exec(
    limits: &ExecArgs,
    full_stdout: bool,
    stdin: StdinMode,
    command: &[String],
) -> Result<()> {
    let spec = limits.spec(command)?.stdin(stdin);
    let program = spec.program().to_owned();

    let json = if full_stdout {
        let output = exec_capture_stdout(&spec)
            .await
            .with_context(|| format!("{program} failed"))?;
        serde_json::to_string_pretty(&output)?
    } else {
        let output = exec_capture_tail(&spec)
            .await
            .with_context(|| format!("{program} failed"))?;
        serde_json::to_string_pretty(&output)?
    };

    println!("{json}");
    Ok(())
}

// ── Run ──────────────────────────────────────────────────────────────

struct JobRun {
    job_id: String,
    wait: Duration,
    allow_prompt: bool,
    clean_env: bool,
}

async fn cmd_run(
    config: BufferConfig,
    job: &JobRun,
    limits: &ExecArgs,
    command: &[String],
) -> Result<()> {
    let mut spec = limits.spec(command)?;

    let buffer = LocalSecretsBuffer::start(config)
        .await
        .context("failed to start secrets buffer")?;
    eprintln!(
        "{DIM}Waiting for secrets for job {} at {}{RESET}",
        job.job_id,
        buffer.submit_url()
    );
    if job.allow_prompt {
        eprintln!("{DIM}Or paste them here as one JSON object line after the wait.{RESET}");
    }

    let received = buffer
        .wait_or_prompt(&job.job_id, job.wait, job.allow_prompt)
        .await;
    buffer.stop().await.context("failed to stop secrets buffer")?;
    let secrets = received.context("no secrets for job")?;
    tracing::info!(job_id = %job.job_id, count = secrets.len(), "running job");

    // Any env call switches the child to an explicit environment, so a clean
    // run with no secrets still starts empty. Non-UTF-8 entries are skipped.
    if !job.clean_env {
        spec = spec.envs(std::env::vars_os().filter_map(|(key, value)| {
            Some((key.into_string().ok()?, value.into_string().ok()?))
        }));
    }
    spec = spec.envs(secrets.iter());
    drop(secrets);

    let output = exec_capture_tail(&spec)
        .await
        .with_context(|| format!("job {} failed", job.job_id))?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
