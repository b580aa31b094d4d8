use anyhow::{bail, Context, Result};
use clap::Parser;
use quire_build::{BuildJob, BuildOrchestrator, BuildQueue, BuildResult};
use quire_collab::{
    CollabServer, EditPersister, MemoryProjectStore, PersistConfig, ProjectStore, RocksProjectStore,
};
use quire_core::Project;
use quire_server::cli::{CliArgs, Command, CompileArgs, ProjectArgs, ProjectCommand, ServeArgs};
use quire_server::local::read_project_dir;
use quire_server::ControlPlane;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = CliArgs::parse();
    match args.command {
        Command::Serve(serve_args) => {
            serve(serve_args).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Project(project_args) => project(project_args).await,
        Command::Compile(compile_args) => compile(compile_args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let store: Arc<dyn ProjectStore> = if args.in_memory {
        log::warn!("Using in-memory project store; edits are lost on exit");
        Arc::new(MemoryProjectStore::new())
    } else {
        let config = args.store_config();
        Arc::new(
            RocksProjectStore::open(config.clone())
                .with_context(|| format!("opening project store at {}", config.path.display()))?,
        )
    };

    let projects = store.list_projects().await?;
    log::info!("Serving {} stored project(s)", projects.len());

    let server = CollabServer::with_store(args.server_config(), store);
    let listener = server
        .bind()
        .await
        .with_context(|| format!("binding {}", args.bind))?;

    server
        .serve_with_shutdown(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for ctrl-c: {e}");
            }
        })
        .await;

    log::info!("Shutting down");
    server.shutdown().await;
    Ok(())
}

async fn project(args: ProjectArgs) -> Result<ExitCode> {
    let config = args.store_config();
    let store: Arc<dyn ProjectStore> = Arc::new(
        RocksProjectStore::open(config.clone())
            .with_context(|| format!("opening project store at {}", config.path.display()))?,
    );
    let orchestrator = Arc::new(BuildOrchestrator::new(args.build_config()));
    let queue = Arc::new(BuildQueue::new(orchestrator, args.queue_config()));
    let persister = EditPersister::spawn(store.clone(), PersistConfig::default());
    let control = ControlPlane::new(store, queue.clone(), persister.handle());

    let outcome = run_project_command(&control, args.action).await;
    queue.shutdown().await;
    persister.shutdown().await;
    outcome
}

async fn run_project_command(control: &ControlPlane, action: ProjectCommand) -> Result<ExitCode> {
    match action {
        ProjectCommand::Create { name, owner } => {
            let owner = owner.unwrap_or_else(Uuid::new_v4);
            let project = control.create_project(&name, owner).await?;
            println!("{}", serde_json::to_string_pretty(&summary(&project))?);
        }
        ProjectCommand::List => {
            for project in control.list_projects().await? {
                println!("{}\t{}\t{}", project.id, project.owner_id, project.name);
            }
        }
        ProjectCommand::Share {
            project,
            user,
            level,
            requester,
        } => {
            control
                .share_project(project, requester, user, level.into())
                .await?;
        }
        ProjectCommand::Compile {
            project,
            requester,
            wait_seconds,
            ..
        } => {
            let job_id = control.trigger_compile(project, requester).await?;
            log::info!("Waiting for compile {job_id}");
            let result = control
                .wait_for_compile(job_id, Duration::from_secs(wait_seconds))
                .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.is_success() {
                return Ok(ExitCode::FAILURE);
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn summary(project: &Project) -> serde_json::Value {
    serde_json::json!({
        "id": project.id,
        "name": project.name,
        "owner_id": project.owner_id,
        "files": project.files().iter().map(|f| f.name.as_str()).collect::<Vec<_>>(),
    })
}

async fn compile(args: CompileArgs) -> Result<ExitCode> {
    if !args.dir.is_dir() {
        bail!("{} is not a directory", args.dir.display());
    }

    let config = args.build.build_config();
    let files = read_project_dir(&args.dir, &[config.builds_root.clone()])
        .with_context(|| format!("reading {}", args.dir.display()))?;
    log::info!("Read {} file(s) from {}", files.len(), args.dir.display());

    let project_id = args.project_id.unwrap_or_else(Uuid::new_v4);
    let job = BuildJob::new(project_id, files, args.entry);
    let result = BuildOrchestrator::new(config).run(&job).await;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(match result {
        BuildResult::Success { .. } => ExitCode::SUCCESS,
        BuildResult::Error { .. } => ExitCode::FAILURE,
    })
}
