//! `duet` -- run a Moderator/TechLead pair against a requirement and watch
//! its health.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context as _, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use duet_core::config::Config;
use duet_core::types::Alert;
use duet_daemon::{Context, Orchestrator};
use duet_telemetry::logging::{init, LogFormat};
use tracing::{info, warn};
use uuid::Uuid;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// duet -- two agents, one requirement, reviewed until it passes.
#[derive(Parser)]
#[command(name = "duet", version, about)]
struct Cli {
    /// Config file. Defaults to ~/.duet/config.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a project and follow it until it completes or stops.
    Run {
        /// Requirement text to implement.
        #[arg(short, long)]
        requirement: String,
        /// Target identifier the generated code is written under.
        #[arg(short, long)]
        target: String,
    },

    /// Continue a project left unfinished by an earlier run.
    Resume {
        project: Uuid,
    },

    /// Show phase, tasks and health of a project, or list all projects.
    Status {
        project: Option<Uuid>,
    },

    /// List unacknowledged alerts of a project.
    Alerts {
        project: Uuid,
        /// Include acknowledged alerts.
        #[arg(long)]
        all: bool,
    },

    /// Acknowledge an alert.
    Ack {
        alert: Uuid,
        /// Project the alert belongs to.
        #[arg(long)]
        project: Uuid,
        /// Who is acknowledging.
        #[arg(long)]
        actor: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path.clone())
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::load().context("loading ~/.duet/config.toml")?,
    };
    init(LogFormat::from_flag(cli.json_logs), "duet", &config.general.log_level);

    let ctx = Context::open(config).await?;
    let orchestrator = Orchestrator::new(ctx);

    match cli.command {
        Commands::Run { requirement, target } => {
            let handle = orchestrator
                .start_project(&requirement, &target)
                .await
                .context("starting project")?;
            println!("project {}", handle.project_id);
            follow(&orchestrator, handle).await?;
        }
        Commands::Resume { project } => {
            let handle = orchestrator
                .resume_project(project)
                .await
                .with_context(|| format!("resuming project {}", project))?;
            follow(&orchestrator, handle).await?;
        }
        Commands::Status { project: None } => {
            for (id, requirement, phase) in orchestrator.list_projects().await? {
                println!("{}  {:<12} {}", id, phase, requirement);
            }
        }
        Commands::Status { project: Some(project) } => print_status(&orchestrator, project).await?,
        Commands::Alerts { project, all } => {
            let alerts = if all {
                orchestrator.alert_history(project).await?
            } else {
                orchestrator.active_alerts(project).await?
            };
            if alerts.is_empty() {
                println!("no alerts");
            }
            for alert in &alerts {
                print_alert(alert);
            }
        }
        Commands::Ack { alert, project, actor } => {
            let acked = orchestrator
                .acknowledge_alert(project, alert, &actor)
                .await
                .with_context(|| format!("acknowledging alert {}", alert))?;
            print_alert(&acked);
        }
    }

    Ok(())
}

/// Wait for the project to finish, or for Ctrl-C, then drain the workers.
async fn follow(orchestrator: &Orchestrator, mut handle: duet_daemon::ProjectHandle) -> Result<()> {
    let project_id = handle.project_id;
    tokio::select! {
        phase = handle.wait_until_terminal(Duration::MAX) => {
            let phase = phase?;
            info!(%project_id, %phase, "project finished");
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "failed to listen for ctrl-c");
            }
            info!(%project_id, "interrupted, shutting down");
        }
    }
    orchestrator.shutdown().await;
    print_status(orchestrator, project_id).await
}

async fn print_status(orchestrator: &Orchestrator, project_id: Uuid) -> Result<()> {
    let project = orchestrator.project_status(project_id).await?;
    let health = orchestrator.health_score(project_id).await?;

    println!("project  {}", project.id);
    println!("target   {}", project.target);
    println!("phase    {}", project.phase);
    if let Some(reason) = &project.stop_reason {
        println!("stopped  {}", reason);
    }
    println!(
        "health   {} ({} critical, {} warning)",
        health.score, health.critical, health.warning
    );
    for task in &project.tasks {
        let pr = task
            .change_set
            .as_ref()
            .map(|c| c.to_string())
            .unwrap_or_default();
        println!("  [{:<9}] {} {}", task.status, task.description, pr);
    }

    let since = Utc::now() - chrono::Duration::hours(24);
    for name in ["error_rate", "review_rejection_rate"] {
        if let Some(latest) = orchestrator.metric_history(project_id, name, since).await?.last() {
            println!("{:<22} {:.3}", name, latest.value);
        }
    }
    Ok(())
}

fn print_alert(alert: &Alert) {
    let ack = match (&alert.acknowledged_by, alert.acknowledged_at) {
        (Some(by), Some(at)) => format!("acked by {} at {}", by, at.format("%Y-%m-%d %H:%M")),
        _ => "active".to_string(),
    };
    println!(
        "{}  {:<8} {}  {}  [{}]",
        alert.id,
        alert.severity,
        alert.created_at.format("%Y-%m-%d %H:%M"),
        alert.message,
        ack
    );
}
