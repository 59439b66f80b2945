//! Conveyor CI CLI tool.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::client::{ApiClient, Target};

#[derive(Parser)]
#[command(name = "conveyor")]
#[command(about = "Conveyor CI CLI", long_about = None)]
struct Cli {
    /// API server URL
    #[arg(long, env = "CONVEYOR_API_URL", default_value = "http://localhost:8080")]
    api_url: String,

    /// Team owning the pipelines
    #[arg(long, short, env = "CONVEYOR_TEAM", default_value = "main", global = true)]
    team: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a pipeline configuration locally
    Validate {
        /// Path to the configuration file
        #[arg(default_value = "pipeline.kdl")]
        path: String,
        /// Variable assignment, NAME=VALUE
        #[arg(long = "var", short = 'v')]
        vars: Vec<String>,
        /// Also require resource types to resolve to the default base types
        #[arg(long)]
        strict: bool,
    },
    /// List pipelines
    Pipelines {
        /// Only this team's pipelines
        #[arg(long)]
        only_team: bool,
    },
    /// Create or update a pipeline
    SetPipeline {
        #[arg(long, short)]
        pipeline: String,
        /// Path to the configuration file
        #[arg(long, short)]
        config: String,
        #[arg(long = "var", short = 'v')]
        vars: Vec<String>,
    },
    PausePipeline {
        #[arg(long, short)]
        pipeline: String,
    },
    UnpausePipeline {
        #[arg(long, short)]
        pipeline: String,
    },
    /// Abort a pipeline's builds, release its containers and delete it
    DestroyPipeline {
        #[arg(long, short)]
        pipeline: String,
    },
    PauseJob {
        /// PIPELINE/JOB
        #[arg(long, short)]
        job: Target,
    },
    UnpauseJob {
        #[arg(long, short)]
        job: Target,
    },
    /// Request a manual build of a job
    TriggerJob {
        #[arg(long, short)]
        job: Target,
    },
    /// Run one scheduling pass for a job
    ScheduleJob {
        #[arg(long, short)]
        job: Target,
    },
    /// List a job's builds, newest first
    Builds {
        #[arg(long, short)]
        job: Target,
        #[arg(long)]
        since: Option<u64>,
        #[arg(long)]
        until: Option<u64>,
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Show a build
    Build { id: String },
    AbortBuild { id: String },
    /// Run a one-off task in a pipeline's context
    Execute {
        #[arg(long, short)]
        pipeline: String,
        #[arg(long, short)]
        image: String,
        #[arg(long)]
        privileged: bool,
        /// Command and arguments
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Check a resource for new versions now
    CheckResource {
        /// PIPELINE/RESOURCE
        #[arg(long, short)]
        resource: Target,
    },
    Versions {
        #[arg(long, short)]
        resource: Target,
    },
    /// Drop a task step's caches
    ClearTaskCache {
        #[arg(long, short)]
        job: Target,
        #[arg(long, short)]
        step: String,
        /// Only the cache for this path
        #[arg(long)]
        cache_path: Option<String>,
    },
    Containers {
        #[arg(long, conflicts_with_all = ["pipeline_id", "worker"])]
        all_team: bool,
        #[arg(long)]
        pipeline_id: Option<String>,
        #[arg(long)]
        worker: Option<String>,
    },
    Workers,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let team = cli.team.as_str();

    if let Commands::Validate { path, vars, strict } = &cli.command {
        return commands::validate(path, vars, *strict);
    }
    let client = ApiClient::new(&cli.api_url)?;

    match cli.command {
        Commands::Validate { .. } => {}
        Commands::Pipelines { only_team } => {
            commands::pipelines::list(&client, only_team.then(|| team.to_string())).await?;
        }
        Commands::SetPipeline {
            pipeline,
            config,
            vars,
        } => {
            commands::pipelines::set(&client, team, &pipeline, &config, &vars).await?;
        }
        Commands::PausePipeline { pipeline } => {
            commands::pipelines::set_paused(&client, team, &pipeline, true).await?;
        }
        Commands::UnpausePipeline { pipeline } => {
            commands::pipelines::set_paused(&client, team, &pipeline, false).await?;
        }
        Commands::DestroyPipeline { pipeline } => {
            commands::pipelines::destroy(&client, team, &pipeline).await?;
        }
        Commands::PauseJob { job } => {
            commands::jobs::set_paused(&client, team, &job, true).await?;
        }
        Commands::UnpauseJob { job } => {
            commands::jobs::set_paused(&client, team, &job, false).await?;
        }
        Commands::TriggerJob { job } => {
            commands::jobs::trigger(&client, team, &job).await?;
        }
        Commands::ScheduleJob { job } => {
            commands::jobs::schedule(&client, team, &job).await?;
        }
        Commands::Builds {
            job,
            since,
            until,
            limit,
        } => {
            commands::jobs::builds(&client, team, &job, since, until, limit).await?;
        }
        Commands::Build { id } => {
            commands::builds::show(&client, &id).await?;
        }
        Commands::AbortBuild { id } => {
            commands::builds::abort(&client, &id).await?;
        }
        Commands::Execute {
            pipeline,
            image,
            privileged,
            command,
        } => {
            commands::pipelines::execute(&client, team, &pipeline, &image, &command, privileged)
                .await?;
        }
        Commands::CheckResource { resource } => {
            commands::resources::check(&client, team, &resource).await?;
        }
        Commands::Versions { resource } => {
            commands::resources::versions(&client, team, &resource).await?;
        }
        Commands::ClearTaskCache {
            job,
            step,
            cache_path,
        } => {
            commands::jobs::clear_task_cache(&client, team, &job, &step, cache_path).await?;
        }
        Commands::Containers {
            all_team,
            pipeline_id,
            worker,
        } => {
            let team = (all_team || (pipeline_id.is_none() && worker.is_none()))
                .then(|| team.to_string());
            commands::workers::containers(&client, team, pipeline_id, worker).await?;
        }
        Commands::Workers => {
            commands::workers::list(&client).await?;
        }
    }

    Ok(())
}
