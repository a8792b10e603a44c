//! layerkit CLI.

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "layerkit")]
#[command(about = "Layered build-cache pipeline for Rust services", long_about = None)]
struct Cli {
    /// Path to the build recipe
    #[arg(long, global = true, env = "LAYERKIT_RECIPE", default_value = "layerkit.kdl")]
    recipe: PathBuf,

    /// Dependency layer cache directory [default: <project>/.layerkit/cache]
    #[arg(long, global = true, env = "LAYERKIT_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Where toolchain commands run
    #[arg(long, global = true, env = "LAYERKIT_EXECUTOR", value_enum, default_value_t = ExecutorKind::Local)]
    executor: ExecutorKind,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ExecutorKind {
    /// Run commands as local processes
    Local,
    /// Run commands in the toolchain image via Docker
    Docker,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Args, Clone, Debug, Default)]
pub struct PathArgs {
    /// Build workspace [default: <project>/.layerkit/workspace]
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Output directory [default: <project>/.layerkit/out]
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline: dependencies, compile, image assembly
    Build {
        #[command(flatten)]
        paths: PathArgs,
    },
    /// Build or restore only the dependency layer
    Deps {
        #[command(flatten)]
        paths: PathArgs,
    },
    /// Validate the recipe and the manifest pair
    Validate,
    /// Manage the dependency layer cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
    /// Show an assembled runtime image and check it is minimal
    Inspect {
        /// Image directory [default: <project>/.layerkit/out/image]
        path: Option<PathBuf>,
        /// Print the image as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// List stored dependency layers, newest first
    List,
    /// Print the layer key the current manifest pair maps to
    Key,
    /// Delete old layers
    Prune {
        /// Keep at most this many layers
        #[arg(long)]
        keep: Option<usize>,
        /// Delete layers older than this many days
        #[arg(long)]
        max_age_days: Option<u64>,
    },
    /// Delete one layer
    Remove {
        /// Layer key
        key: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_format, cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let ctx = commands::Context {
        recipe: cli.recipe,
        cache_dir: cli.cache_dir,
        executor: cli.executor,
    };

    match cli.command {
        Commands::Build { paths } => {
            commands::build::run_build(&ctx, &paths, None).await?;
        }
        Commands::Deps { paths } => {
            let stop = layerkit_core::pipeline::PipelineState::DependenciesBuilt;
            commands::build::run_build(&ctx, &paths, Some(stop)).await?;
        }
        Commands::Validate => {
            commands::validate(&ctx)?;
        }
        Commands::Cache { command } => match command {
            CacheCommands::List => commands::cache::list(&ctx)?,
            CacheCommands::Key => commands::cache::key(&ctx)?,
            CacheCommands::Prune { keep, max_age_days } => {
                commands::cache::prune(&ctx, keep, max_age_days)?;
            }
            CacheCommands::Remove { key } => commands::cache::remove(&ctx, &key)?,
        },
        Commands::Inspect { path, json } => {
            commands::inspect::inspect(&ctx, path, json)?;
        }
    }

    Ok(())
}

fn init_tracing(format: LogFormat, verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_env("LAYERKIT_LOG").unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Exit status for a failed command: 2 manifest, 3 compile, 4 assembly,
/// 1 anything else.
fn exit_code(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<layerkit_core::Error>()
        .map(|e| e.kind().exit_code() as u8)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use layerkit_core::Error;

    #[test]
    fn test_cli_parses_globals_after_subcommand() {
        let cli = Cli::try_parse_from([
            "layerkit",
            "build",
            "--recipe",
            "svc/layerkit.kdl",
            "--executor",
            "docker",
            "--out",
            "dist",
            "-vv",
        ])
        .unwrap();

        assert_eq!(cli.recipe, PathBuf::from("svc/layerkit.kdl"));
        assert_eq!(cli.executor, ExecutorKind::Docker);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Build { paths } => {
                assert_eq!(paths.out, Some(PathBuf::from("dist")));
                assert!(paths.workspace.is_none());
            }
            _ => panic!("expected build"),
        }
    }

    #[test]
    fn test_cache_prune_arguments() {
        let cli = Cli::try_parse_from(["layerkit", "cache", "prune", "--keep", "3"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Cache {
                command: CacheCommands::Prune {
                    keep: Some(3),
                    max_age_days: None
                }
            }
        ));
    }

    #[test]
    fn test_exit_codes_follow_error_kind() {
        let manifest: anyhow::Error = Error::Manifest("bad lock".to_string()).into();
        let compile = anyhow::Error::from(Error::Compile("E0425".to_string())).context("build");
        let assembly: anyhow::Error = Error::Assembly("no CA".to_string()).into();
        let other = anyhow::anyhow!("docker unavailable");

        assert_eq!(exit_code(&manifest), 2);
        assert_eq!(exit_code(&compile), 3);
        assert_eq!(exit_code(&assembly), 4);
        assert_eq!(exit_code(&other), 1);
    }
}
