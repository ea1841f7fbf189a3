use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use artifact_sandbox::backoff::Backoff;
use artifact_sandbox::{ArtifactSpec, Sandbox, SandboxConfig, SandboxError, TaskEnv};

fn print_help() {
    println!(
        "\
artifact-sandbox v{}

Fetches an artifact into a task directory without letting it escape.

USAGE:
    artifact-sandbox [OPTIONS] SOURCE DEST

ARGUMENTS:
    SOURCE    Artifact URL, optionally forced with git::, hg::, s3:: or gcs::
    DEST      Destination relative to the task directory

OPTIONS:
    -c, --config PATH      TOML configuration file
    -t, --task-dir DIR     Task root directory [default: current directory]
    -u, --user NAME        Runtime user for --chown [default: nobody]
        --chown            Hand placed files to the runtime user
        --insecure         Skip TLS certificate validation
        --mode MODE        any, file or dir [default: any]
        --header K=V       Extra HTTP request header (repeatable)
        --env K=V          Task variable for ${{K}} interpolation (repeatable)
        --retries N        Retry failed fetches N times [default: 0]
    -h, --help             Print this help message and exit
    -V, --version          Print version and exit

ENVIRONMENT VARIABLES:
    RUST_LOG    Log level filter for tracing
                (e.g. debug, artifact_sandbox=debug,warn)

EXAMPLES:
    artifact-sandbox https://example.com/app.tar.gz local/app
    artifact-sandbox --chown -u nobody git::https://example.com/repo.git?ref=v1 local/repo",
        env!("CARGO_PKG_VERSION"),
    );
}

struct Args {
    config: Option<String>,
    task_dir: Option<String>,
    user: String,
    retries: u32,
    env: Vec<(String, String)>,
    artifact: ArtifactSpec,
}

fn split_pair(flag: &str, value: &str) -> Result<(String, String)> {
    value
        .split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| anyhow!("{flag} expects KEY=VALUE, got '{value}'"))
}

fn parse_args(raw: Vec<String>) -> Result<Args> {
    let mut args = Args {
        config: None,
        task_dir: None,
        user: "nobody".to_string(),
        retries: 0,
        env: Vec::new(),
        artifact: ArtifactSpec::default(),
    };
    let mut positional = Vec::new();
    let mut iter = raw.into_iter();

    while let Some(arg) = iter.next() {
        let mut value = |flag: &str| iter.next().ok_or_else(|| anyhow!("{flag} requires a value"));
        match arg.as_str() {
            "--version" | "-V" => {
                println!("artifact-sandbox v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--config" | "-c" => args.config = Some(value(&arg)?),
            "--task-dir" | "-t" => args.task_dir = Some(value(&arg)?),
            "--user" | "-u" => args.user = value(&arg)?,
            "--chown" => args.artifact.chown = true,
            "--insecure" => args.artifact.insecure = true,
            "--mode" => {
                args.artifact.mode = value(&arg)?.parse().map_err(|e: String| anyhow!(e))?
            }
            "--header" => {
                let (k, v) = split_pair(&arg, &value(&arg)?)?;
                args.artifact.headers.insert(k, v);
            }
            "--env" => {
                let pair = split_pair(&arg, &value(&arg)?)?;
                args.env.push(pair);
            }
            "--retries" => {
                args.retries = value(&arg)?.parse().context("--retries expects a number")?
            }
            flag if flag.starts_with('-') && flag.len() > 1 => bail!("unknown option {flag}"),
            _ => positional.push(arg.clone()),
        }
    }

    match <[String; 2]>::try_from(positional) {
        Ok([source, destination]) => {
            args.artifact.source = source;
            args.artifact.destination = destination;
        }
        Err(_) => bail!("expected SOURCE and DEST (see --help)"),
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args(std::env::args().skip(1).collect())?;

    // Initialize logging (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("artifact_sandbox=info")),
        )
        .init();

    let config = match args.config {
        Some(ref path) => {
            info!("Loading configuration from {path}");
            SandboxConfig::load(path).with_context(|| format!("cannot load {path}"))?
        }
        None => SandboxConfig::default(),
    };
    if config.disable_filesystem_isolation {
        warn!("Filesystem isolation is disabled");
    } else if config.disable_artifact_inspection {
        warn!("Artifact inspection is disabled");
    }

    let task_dir = match args.task_dir {
        Some(dir) => std::path::PathBuf::from(dir),
        None => std::env::current_dir()?,
    };
    let task_dir = task_dir
        .canonicalize()
        .with_context(|| format!("task directory {}", task_dir.display()))?;

    let mut env = TaskEnv::new(&task_dir);
    for (name, value) in args.env {
        env.insert(name, value);
    }

    let sandbox = Sandbox::new(Arc::new(config));
    let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30), args.retries);

    loop {
        let result = tokio::select! {
            result = sandbox.get(&env, &args.artifact, &args.user) => result,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received, exiting");
                return Ok(());
            }
        };

        let err = match result {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        // Only network hiccups are worth another attempt
        let retriable = matches!(
            err.root_cause(),
            SandboxError::Transport { .. } | SandboxError::Timeout { .. }
        );
        let delay = match backoff.next_retry() {
            Some(delay) if retriable => delay,
            _ => {
                error!("Artifact fetch failed: {err}");
                return Err(err.into());
            }
        };
        warn!(
            "Artifact fetch failed: {err}; retrying in {}s (attempt {} of {})",
            delay.as_secs(),
            backoff.attempt(),
            args.retries
        );
        tokio::time::sleep(delay).await;
    }
}
