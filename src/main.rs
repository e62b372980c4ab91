//! Repo Sandbox - per-user repository clones with an HTTP API.
//!
//! Usage:
//!   repo-sandbox serve --repos-root ./repos --seed seed.json [--port 8080]
//!   repo-sandbox check-path <root> <path>

use clap::{Parser, Subcommand};
use repo_sandbox::config::{Config, Seed, COMMAND_TIMEOUT_SECS, DEFAULT_BRANCH_PREFIX, SESSION_TTL_SECS};
use repo_sandbox::http_server;
use repo_sandbox::path_guard::{self, PathResolution};
use repo_sandbox::registry::MemoryRegistry;
use repo_sandbox::session::{RemoteSessionResolver, SessionResolver, StaticTokens};
use repo_sandbox::state::AppState;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "repo-sandbox")]
#[command(about = "Per-user repository sandbox with HTTP API")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to listen on
        #[arg(long, env = "REPO_SANDBOX_PORT", default_value = "8080")]
        port: u16,

        /// Directory holding the working clones
        #[arg(long, env = "REPOS_ROOT", default_value = "repos")]
        repos_root: PathBuf,

        /// JSON file with users, tokens and repository records
        #[arg(long, env = "REPO_SANDBOX_SEED")]
        seed: Option<PathBuf>,

        /// Session introspection endpoint; replaces the seed's static tokens
        #[arg(long, env = "REPO_SANDBOX_AUTH_URL")]
        auth_url: Option<String>,

        /// Wall-clock limit for terminal commands, in seconds
        #[arg(long, env = "COMMAND_TIMEOUT_SECS", default_value_t = COMMAND_TIMEOUT_SECS)]
        command_timeout: u64,

        /// How long a resolved token is cached, in seconds
        #[arg(long, env = "SESSION_TTL_SECS", default_value_t = SESSION_TTL_SECS)]
        session_ttl: u64,

        /// Prefix of the branch created after a fresh clone
        #[arg(long, env = "BRANCH_PREFIX", default_value = DEFAULT_BRANCH_PREFIX)]
        branch_prefix: String,
    },
    /// Print whether a client path would be accepted under a root
    CheckPath { root: PathBuf, path: String },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Serve {
            port,
            repos_root,
            seed,
            auth_url,
            command_timeout,
            session_ttl,
            branch_prefix,
        } => {
            let seed = match seed {
                Some(path) => match Seed::load(&path).await {
                    Ok(seed) => seed,
                    Err(e) => {
                        eprintln!("Error: {}", e);
                        exit(1);
                    }
                },
                None => Seed::default(),
            };

            if let Err(e) = tokio::fs::create_dir_all(&repos_root).await {
                eprintln!("Error: cannot create {}: {}", repos_root.display(), e);
                exit(1);
            }
            let repos_root = match tokio::fs::canonicalize(&repos_root).await {
                Ok(path) => path,
                Err(e) => {
                    eprintln!("Error: cannot resolve {}: {}", repos_root.display(), e);
                    exit(1);
                }
            };

            let config = Config::new(repos_root)
                .with_command_timeout(Duration::from_secs(command_timeout))
                .with_session_ttl(Duration::from_secs(session_ttl))
                .with_branch_prefix(branch_prefix);

            let resolver: Arc<dyn SessionResolver> = match auth_url {
                Some(url) => {
                    info!(%url, "Resolving sessions remotely");
                    Arc::new(RemoteSessionResolver::new(url))
                }
                None => Arc::new(StaticTokens::from_seed(&seed)),
            };
            let registry = Arc::new(MemoryRegistry::from_seed(&seed));
            info!(
                repos_root = %config.repos_root.display(),
                repositories = seed.repositories.len(),
                users = seed.users.len(),
                "Loaded seed"
            );

            let state = AppState::new(config, registry, resolver);
            if let Err(e) = http_server::run_server(port, state).await {
                error!(error = %e, "Server failed");
                exit(1);
            }
        }
        Commands::CheckPath { root, path } => match path_guard::validate(&path, &root) {
            PathResolution::Resolved(resolved) => println!("ok {}", resolved.display()),
            PathResolution::Rejected(reason) => {
                println!("rejected {}", reason);
                exit(2);
            }
        },
    }
}
