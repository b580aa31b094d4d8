//! Command-line interface for the `quire` binary.
//!
//! Every flag falls back to a `QUIRE_*` environment variable, then to the
//! library defaults.

use clap::{Args, Parser, Subcommand, ValueEnum, ValueHint};
use quire_build::{BuildConfig, CompilerConfig, QueueConfig};
use quire_collab::{PersistConfig, ServerConfig, StoreConfig};
use quire_core::AccessLevel;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Command-line arguments for the Quire binary.
#[derive(Debug, Parser)]
#[command(name = "quire", version, about = "Collaborative LaTeX editing and build server")]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the collaboration server.
    Serve(ServeArgs),
    /// Manage and compile projects in the data directory.
    Project(ProjectArgs),
    /// Compile a directory once and print the result as JSON.
    Compile(CompileArgs),
}

#[derive(Debug, Args, Clone)]
pub struct ServeArgs {
    /// Address for WebSocket sessions.
    #[arg(long, env = "QUIRE_BIND", default_value = "127.0.0.1:9090", value_name = "ADDR")]
    pub bind: String,

    /// RocksDB directory for projects.
    #[arg(long = "data-dir", env = "QUIRE_DATA_DIR", default_value = "quire_data", value_name = "PATH")]
    pub data_dir: PathBuf,

    /// Keep projects in memory only.
    #[arg(long = "in-memory", env = "QUIRE_IN_MEMORY", action = clap::ArgAction::SetTrue)]
    pub in_memory: bool,

    /// Refuse joins beyond this many peers per room (unlimited when unset).
    #[arg(long = "max-peers", env = "QUIRE_MAX_PEERS", value_name = "N")]
    pub max_peers: Option<usize>,

    /// Idle time before a live edit is saved.
    #[arg(long = "persist-debounce-ms", env = "QUIRE_PERSIST_DEBOUNCE_MS", default_value_t = 500)]
    pub persist_debounce_ms: u64,
}

#[derive(Debug, Args, Clone)]
pub struct ProjectArgs {
    /// RocksDB directory for projects.
    #[arg(long = "data-dir", env = "QUIRE_DATA_DIR", default_value = "quire_data", value_name = "PATH")]
    pub data_dir: PathBuf,

    #[command(subcommand)]
    pub action: ProjectCommand,
}

#[derive(Debug, Subcommand, Clone)]
pub enum ProjectCommand {
    /// Create a project seeded with `main.tex` and print it as JSON.
    Create {
        name: String,
        /// Owner id; a new one is generated when omitted.
        #[arg(long, value_name = "UUID")]
        owner: Option<Uuid>,
    },
    /// List stored projects.
    List,
    /// Grant a user access to a project.
    Share {
        project: Uuid,
        user: Uuid,
        #[arg(long, value_enum, default_value_t = GrantLevel::Viewer)]
        level: GrantLevel,
        /// Acting user; must own the project.
        #[arg(long = "as", value_name = "UUID")]
        requester: Uuid,
    },
    /// Compile a stored project and print the result as JSON.
    Compile {
        project: Uuid,
        /// Acting user; needs at least viewer access.
        #[arg(long = "as", value_name = "UUID")]
        requester: Uuid,
        /// Give up waiting for the build after this long.
        #[arg(long = "wait-seconds", default_value_t = 300)]
        wait_seconds: u64,
        #[command(flatten)]
        build: BuildArgs,
    },
}

/// Access levels that can be granted to other users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum GrantLevel {
    Viewer,
    Editor,
}

impl From<GrantLevel> for AccessLevel {
    fn from(level: GrantLevel) -> Self {
        match level {
            GrantLevel::Viewer => AccessLevel::Viewer,
            GrantLevel::Editor => AccessLevel::Editor,
        }
    }
}

#[derive(Debug, Args, Clone)]
pub struct CompileArgs {
    /// Directory holding the project files.
    #[arg(value_name = "DIR", value_hint = ValueHint::DirPath)]
    pub dir: PathBuf,

    /// Entry file, relative to DIR.
    #[arg(long, default_value = "main.tex", value_name = "FILE")]
    pub entry: String,

    /// Build directory name under the builds root; random when omitted.
    #[arg(long = "project-id", value_name = "UUID")]
    pub project_id: Option<Uuid>,

    #[command(flatten)]
    pub build: BuildArgs,
}

#[derive(Debug, Args, Clone)]
pub struct BuildArgs {
    /// Parent directory of per-project build directories.
    #[arg(long = "builds-root", env = "QUIRE_BUILDS_ROOT", default_value = "builds", value_name = "PATH")]
    pub builds_root: PathBuf,

    /// Compiler executable.
    #[arg(long, env = "QUIRE_COMPILER", default_value = "pdflatex", value_name = "PROGRAM")]
    pub compiler: String,

    /// Arguments passed before the entry file (space separated).
    #[arg(
        long = "compiler-args",
        env = "QUIRE_COMPILER_ARGS",
        default_value = "-interaction=nonstopmode",
        value_delimiter = ' ',
        allow_hyphen_values = true
    )]
    pub compiler_args: Vec<String>,

    /// Wall-clock limit per compiler pass.
    #[arg(long = "pass-timeout-seconds", env = "QUIRE_PASS_TIMEOUT_SECONDS", default_value_t = 30)]
    pub pass_timeout_seconds: u64,
}

impl BuildArgs {
    pub fn build_config(&self) -> BuildConfig {
        BuildConfig {
            builds_root: self.builds_root.clone(),
            compiler: CompilerConfig {
                program: self.compiler.clone(),
                args: self
                    .compiler_args
                    .iter()
                    .filter(|arg| !arg.is_empty())
                    .cloned()
                    .collect(),
                pass_timeout: Duration::from_secs(self.pass_timeout_seconds),
            },
            ..BuildConfig::default()
        }
    }
}

impl ServeArgs {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind.clone(),
            max_peers_per_room: self.max_peers,
            persist: PersistConfig {
                debounce: Duration::from_millis(self.persist_debounce_ms),
                ..PersistConfig::default()
            },
            ..ServerConfig::default()
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        store_config(&self.data_dir)
    }
}

impl ProjectArgs {
    pub fn store_config(&self) -> StoreConfig {
        store_config(&self.data_dir)
    }

    /// Build settings for `project compile`; defaults for everything else.
    pub fn build_config(&self) -> BuildConfig {
        match &self.action {
            ProjectCommand::Compile { build, .. } => build.build_config(),
            _ => BuildConfig::default(),
        }
    }

    /// One worker: a single command submits at most one job.
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            workers: 1,
            ..QueueConfig::default()
        }
    }
}

fn store_config(data_dir: &std::path::Path) -> StoreConfig {
    StoreConfig {
        path: data_dir.to_path_buf(),
        ..StoreConfig::default()
    }
}
