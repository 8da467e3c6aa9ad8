//! `conductor` CLI: a thin wrapper over [`conductor::workflow::WorkflowEngine`].
//!
//! Every subcommand builds the same stack — load config, init logging, open
//! the store, wire the real capabilities into an allocator, construct the
//! engine — then dispatches a single call and prints its result.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use conductor::allocator::Allocator;
use conductor::capabilities::{
    GitCliWorktreeCapability, MultiplexerCapability, ProcessAiLauncher, ProcessToolServerSpawner,
    SystemTmuxCapability,
};
use conductor::clock::SystemClock;
use conductor::config::Config;
use conductor::error::ErrorCode;
use conductor::store::{InstanceFilter, InstanceType, Store};
use conductor::workflow::{ExecuteConfig, ExecutionDescriptor, WorkflowEngine};

#[derive(Parser)]
#[command(name = "conductor", about = "Local orchestrator for autonomous coding agents")]
struct Cli {
    /// Explicit config file, overriding project and user config locations.
    #[arg(long, global = true)]
    config: Option<String>,

    /// Force debug-level logging regardless of configured level.
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Allocate resources and launch a new agent instance.
    Execute {
        /// "coding", "review", or "planning".
        #[arg(long, default_value = "coding")]
        instance_type: String,
        #[arg(long)]
        issue_number: Option<i64>,
        #[arg(long)]
        target_branch: Option<String>,
        #[arg(long)]
        base_branch: Option<String>,
        #[arg(long)]
        parent_instance_id: Option<String>,
        #[arg(long, default_value = "")]
        system_prompt: String,
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        max_reviews: Option<i64>,
    },
    /// Tear down an instance's resources and mark it terminated.
    Terminate {
        instance_id: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Print an instance's derived workflow state.
    Status { instance_id: String },
    /// Request a review for an instance currently in progress.
    Review {
        instance_id: String,
        #[arg(long)]
        max_reviews: Option<i64>,
    },
    /// List known instances, most recently created first.
    List {
        #[arg(long)]
        instance_type: Option<String>,
        #[arg(long)]
        limit: Option<i64>,
    },
}

struct Stack {
    store: Arc<Store>,
    engine: WorkflowEngine,
}

async fn build_stack(config: &Config) -> Result<Stack> {
    let db_path = config.database_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create database directory")?;
    }
    let store = Arc::new(Store::open(&db_path).await.context("failed to open store")?);

    let worktree = Arc::new(GitCliWorktreeCapability::new());
    let multiplexer: Arc<dyn MultiplexerCapability> = if config.multiplexer.socket.is_empty() {
        Arc::new(SystemTmuxCapability::new())
    } else {
        Arc::new(SystemTmuxCapability::with_socket(
            config.multiplexer.socket.clone(),
        ))
    };
    let ai_launcher = Arc::new(ProcessAiLauncher::new());
    let tool_server = Arc::new(ProcessToolServerSpawner::new());
    let clock = Arc::new(SystemClock);

    let allocator = Arc::new(Allocator::new(
        worktree,
        multiplexer,
        ai_launcher,
        tool_server,
        clock.clone(),
    ));

    let engine = WorkflowEngine::new(
        store.clone(),
        allocator,
        clock,
        config.agent.default_max_reviews,
    );

    Ok(Stack { store, engine })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    let _logging = conductor::logging::init_logging(&config, cli.debug)
        .context("failed to initialize logging")?;

    if let Err(err) = run(&cli.command, &config).await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run(command: &Command, config: &Config) -> Result<()> {
    match command {
        Command::Execute {
            instance_type,
            issue_number,
            target_branch,
            base_branch,
            parent_instance_id,
            system_prompt,
            prompt,
            max_reviews,
        } => {
            let stack = build_stack(config).await?;
            let instance_type: InstanceType = instance_type
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid instance type: {e}"))?;

            let exec_config = ExecuteConfig {
                instance_type,
                issue_number: *issue_number,
                target_branch: target_branch.clone(),
                base_branch: base_branch
                    .clone()
                    .unwrap_or_else(|| config.repo.base_branch.clone()),
                repo_path: config.repo_path(),
                worktrees_root: config.worktrees_root(),
                parent_instance_id: parent_instance_id.clone(),
                ai_command: config.agent.ai_command.clone(),
                ai_args: config.agent.ai_args.clone(),
                tool_server_command: config.agent.tool_server_command.clone(),
                tool_server_args: config.agent.tool_server_args.clone(),
                system_prompt: system_prompt.clone(),
                prompt: prompt.clone(),
                max_reviews: max_reviews.unwrap_or(config.agent.default_max_reviews),
            };

            let descriptor = stack
                .engine
                .execute(exec_config)
                .await
                .map_err(|e| anyhow::anyhow!("[{}] {e}", e.code()))?;
            println!("{}", serde_json::to_string_pretty(&descriptor_json(&descriptor))?);
        }
        Command::Terminate { instance_id, reason } => {
            let stack = build_stack(config).await?;
            stack
                .engine
                .terminate(instance_id, reason.as_deref())
                .await
                .map_err(|e| anyhow::anyhow!("[{}] {e}", e.code()))?;
            println!("terminated {instance_id}");
        }
        Command::Status { instance_id } => {
            let stack = build_stack(config).await?;
            match stack
                .engine
                .get_state(instance_id)
                .await
                .map_err(|e| anyhow::anyhow!("[{}] {e}", e.code()))?
            {
                Some(state) => println!(
                    "{}",
                    serde_json::json!({
                        "phase": state.phase.to_string(),
                        "review_count": state.review_count,
                        "max_reviews": state.max_reviews,
                        "current_review_instance_id": state.current_review_instance_id,
                        "last_activity": state.last_activity.to_rfc3339(),
                    })
                ),
                None => {
                    eprintln!("instance {instance_id} not found");
                    std::process::exit(1);
                }
            }
        }
        Command::Review {
            instance_id,
            max_reviews,
        } => {
            let stack = build_stack(config).await?;
            let review_id = stack
                .engine
                .request_review(
                    instance_id,
                    max_reviews.unwrap_or(config.agent.default_max_reviews),
                )
                .await
                .map_err(|e| anyhow::anyhow!("[{}] {e}", e.code()))?;
            println!("{review_id}");
        }
        Command::List {
            instance_type,
            limit,
        } => {
            let stack = build_stack(config).await?;
            let mut filter = InstanceFilter::default();
            if let Some(t) = instance_type {
                filter.types.push(
                    t.parse()
                        .map_err(|e| anyhow::anyhow!("invalid instance type: {e}"))?,
                );
            }
            filter.limit = *limit;

            let instances = stack
                .store
                .list_instances(filter)
                .await
                .map_err(|e| anyhow::anyhow!("[{}] {e}", e.code()))?;
            for instance in instances {
                println!(
                    "{}\t{}\t{}\t{}",
                    instance.id, instance.instance_type, instance.status, instance.created_at
                );
            }
        }
    }
    Ok(())
}

fn descriptor_json(descriptor: &ExecutionDescriptor) -> serde_json::Value {
    serde_json::json!({
        "id": descriptor.id,
        "instance_type": descriptor.instance_type.to_string(),
        "status": descriptor.status.to_string(),
        "worktree_path": descriptor.resources.worktree_path,
        "session_name": descriptor.resources.session_name,
        "branch": descriptor.resources.branch,
        "ai_session_id": descriptor.resources.ai_session_id,
        "started_at": descriptor.started_at.to_rfc3339(),
        "updated_at": descriptor.updated_at.to_rfc3339(),
    })
}
