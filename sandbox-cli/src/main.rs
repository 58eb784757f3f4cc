//! Operator CLI for the extension sandbox
//!
//! Runs a script file, an inline snippet or an installed extension inside a
//! fresh sandbox context and prints the execution result as JSON.
//!
//! Usage:
//!   sandbox run hello.js --args '{"name":"jane"}'
//!   sandbox eval 'return 1 + 2'
//!   sandbox load ./extensions/weather --call forecast --args '["Oslo"]'
//!   sandbox eval 'return 1' --stats
//!   sandbox config

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use colored::Colorize;
use extension_sandbox::{
    ContextOptions, ExtensionDescriptor, SandboxConfig, SandboxExecutionResult, SandboxService,
};
use logger_redacted::{init_tracing, LoggerConfig};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "sandbox")]
#[command(about = "Run extension code inside the capability-restricted sandbox")]
struct Cli {
    /// Configuration file layered over defaults (SANDBOX__* env vars win)
    #[arg(long, global = true, env = "SANDBOX_CONFIG")]
    config: Option<PathBuf>,

    /// Extension id the context is bound to
    #[arg(long, global = true, default_value = "cli")]
    extension: String,

    /// User id executions are rate limited under
    #[arg(long, global = true)]
    user: Option<String>,

    /// Permission granted to the context (repeatable)
    #[arg(long = "permission", global = true)]
    permissions: Vec<String>,

    /// Print engine statistics to stderr after the run
    #[arg(long, global = true)]
    stats: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a script file as a function body
    Run {
        file: PathBuf,

        /// JSON object whose keys become local variables
        #[arg(long)]
        args: Option<String>,

        /// Per-execution timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Run an inline snippet as a function body
    Eval {
        code: String,

        /// JSON object whose keys become local variables
        #[arg(long)]
        args: Option<String>,
    },

    /// Load an installed extension and optionally call one of its functions
    Load {
        install_dir: PathBuf,

        /// Entry file relative to the install directory
        #[arg(long)]
        entry: Option<String>,

        /// Function to call after loading
        #[arg(long)]
        call: Option<String>,

        /// JSON arguments for --call; an array is spread
        #[arg(long, requires = "call")]
        args: Option<String>,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    init_tracing(&LoggerConfig::from_env())?;

    let cli = Cli::parse();
    let config = SandboxConfig::load(cli.config.as_deref()).context("loading configuration")?;

    if let Command::Config = cli.command {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(ExitCode::SUCCESS);
    }

    let service = SandboxService::builder().config(config).reaper(false).build()?;
    let outcome = run_command(&service, &cli).await;
    if cli.stats {
        eprintln!("{}", serde_json::to_string_pretty(&service.get_stats())?);
    }
    service.shutdown().await;

    let result = outcome?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    report_status(&result);

    Ok(if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn run_command(service: &SandboxService, cli: &Cli) -> anyhow::Result<SandboxExecutionResult> {
    let options = ContextOptions::default().with_permissions(cli.permissions.iter().cloned());
    let user = cli.user.as_deref();

    match &cli.command {
        Command::Run {
            file,
            args,
            timeout_ms,
        } => {
            let code = std::fs::read_to_string(file)
                .with_context(|| format!("reading {}", file.display()))?;
            let options = match timeout_ms {
                Some(ms) => options.with_timeout(Duration::from_millis(*ms)),
                None => options,
            };
            let context_id = service.create_context(&cli.extension, user, options).await?;
            info!(context_id = %context_id, file = %file.display(), "Running script");
            let result = service
                .execute(&context_id, &code, parse_args(args.as_deref())?)
                .await?;
            service.destroy_context(&context_id).await;
            Ok(result)
        }
        Command::Eval { code, args } => {
            let context_id = service.create_context(&cli.extension, user, options).await?;
            let result = service
                .execute(&context_id, code, parse_args(args.as_deref())?)
                .await?;
            service.destroy_context(&context_id).await;
            Ok(result)
        }
        Command::Load {
            install_dir,
            entry,
            call,
            args,
        } => {
            let descriptor = describe(&cli.extension, install_dir, entry.as_deref(), &cli.permissions);
            let context_id = service
                .create_context_for(&descriptor, user, ContextOptions::default())
                .await?;

            let loaded = service.load_descriptor(&context_id, &descriptor).await?;
            let result = match call {
                Some(function) if loaded.success => {
                    info!(context_id = %context_id, function = function.as_str(), "Calling exported function");
                    service
                        .call_function(&context_id, function, parse_args(args.as_deref())?)
                        .await?
                }
                _ => loaded,
            };
            service.destroy_context(&context_id).await;
            Ok(result)
        }
        Command::Config => anyhow::bail!("config is handled before the service starts"),
    }
}

fn describe(
    extension_id: &str,
    install_dir: &Path,
    entry: Option<&str>,
    permissions: &[String],
) -> ExtensionDescriptor {
    let descriptor = ExtensionDescriptor::new(extension_id, install_dir)
        .with_permissions(permissions.iter().cloned());
    match entry {
        Some(entry) => descriptor.with_entry_point(entry),
        None => descriptor,
    }
}

fn parse_args(raw: Option<&str>) -> anyhow::Result<serde_json::Value> {
    match raw {
        Some(raw) => serde_json::from_str(raw).context("--args must be valid JSON"),
        None => Ok(serde_json::Value::Null),
    }
}

fn report_status(result: &SandboxExecutionResult) {
    let elapsed = format!("{}ms", result.execution_time.as_millis());
    match &result.error {
        None => eprintln!("{} in {}", "ok".green().bold(), elapsed),
        Some(error) => eprintln!("{} {} in {}", "failed".red().bold(), error, elapsed),
    }
}
