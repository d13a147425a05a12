//! nxclaw CLI: auth, onboarding, status, objectives, skills, and the
//! runtime itself.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use nxclaw::channels::http::DashboardServer;
use nxclaw::channels::IncomingRequest;
use nxclaw::config::Config;
use nxclaw::fsutil;
use nxclaw::llm::AuthSnapshot;
use nxclaw::objectives::{ObjectiveQueue, ObjectiveStatus, ObjectiveUpdate};
use nxclaw::runtime::autonomous::AutonomousLoop;
use nxclaw::runtime::Runtime;
use nxclaw::skills::SkillManager;

#[derive(Parser, Debug)]
#[command(name = "nxclaw", version, about = "Persistent autonomous agent runtime")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record or inspect LLM provider credentials
    Auth {
        /// Provider family: anthropic, openai-codex, gemini-cli
        #[arg(long)]
        provider: Option<String>,

        /// Only print the current auth status
        #[arg(long)]
        status: bool,
    },

    /// Create the home directory layout and seed workspace files
    Onboard {
        /// Skip prompts; write defaults only
        #[arg(long)]
        quick: bool,
    },

    /// Print a one-page runtime status summary
    Status,

    /// Manage skill packages
    Skills {
        /// catalog | list | install | bootstrap | enable | disable | show | remove
        action: String,

        /// Skill id or install path, depending on the action
        value: Option<String>,
    },

    /// Manage objectives
    Objective {
        /// add | list | update
        action: String,

        /// Title (add), status filter (list), or objective id (update)
        value: Option<String>,

        #[arg(long)]
        description: Option<String>,

        #[arg(long)]
        priority: Option<u8>,

        #[arg(long)]
        status: Option<String>,

        #[arg(long)]
        note: Option<String>,
    },

    /// Start the runtime
    Start {
        /// Handle a single prompt, print the reply, and exit
        #[arg(long)]
        once: Option<String>,

        /// Do not start the Slack adapter (external adapters attach here)
        #[arg(long)]
        no_slack: bool,

        /// Do not start the Telegram adapter
        #[arg(long)]
        no_telegram: bool,

        /// Do not start the HTTP dashboard
        #[arg(long)]
        no_dashboard: bool,
    },
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = std::env::var("NXCLAW_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let home = Config::resolve_home();

    let runtime = tokio::runtime::Runtime::new().context("tokio runtime")?;
    runtime.block_on(run(cli, home))
}

async fn run(cli: Cli, home: PathBuf) -> anyhow::Result<()> {
    match cli.command {
        Command::Auth { provider, status } => cmd_auth(home, provider, status),
        Command::Onboard { quick } => cmd_onboard(home, quick),
        Command::Status => cmd_status(home),
        Command::Skills { action, value } => cmd_skills(home, &action, value),
        Command::Objective {
            action,
            value,
            description,
            priority,
            status,
            note,
        } => cmd_objective(home, &action, value, description, priority, status, note),
        Command::Start {
            once,
            no_slack,
            no_telegram,
            no_dashboard,
        } => cmd_start(home, once, no_slack, no_telegram, no_dashboard).await,
    }
}

fn parse_status(value: &str) -> anyhow::Result<ObjectiveStatus> {
    Ok(match value {
        "pending" => ObjectiveStatus::Pending,
        "in_progress" => ObjectiveStatus::InProgress,
        "blocked" => ObjectiveStatus::Blocked,
        "completed" => ObjectiveStatus::Completed,
        "failed" => ObjectiveStatus::Failed,
        "cancelled" => ObjectiveStatus::Cancelled,
        other => anyhow::bail!("unknown status '{other}'"),
    })
}

fn cmd_auth(home: PathBuf, provider: Option<String>, status_only: bool) -> anyhow::Result<()> {
    let config = Config::load(home);
    config.ensure_layout()?;
    let mut snapshot = AuthSnapshot::refresh(&config.auth_path());

    if !status_only {
        if let Some(provider) = provider {
            let known = ["anthropic", "openai-codex", "gemini-cli"];
            if !known.contains(&provider.as_str()) {
                anyhow::bail!("unknown provider '{provider}' (expected one of {known:?})");
            }
            let env_var = match provider.as_str() {
                "anthropic" => "ANTHROPIC_API_KEY",
                "openai-codex" => "OPENAI_API_KEY",
                _ => "GEMINI_API_KEY",
            };
            let present = std::env::var(env_var)
                .map(|v| !v.trim().is_empty())
                .unwrap_or(false);
            if !present {
                anyhow::bail!("{env_var} is not set; export it and re-run `nxclaw auth`");
            }
            snapshot.providers.insert(provider.clone(), true);
            snapshot.active = Some(provider);
        }
        snapshot.save(&config.auth_path())?;
    }

    println!("auth status:");
    for family in ["anthropic", "openai-codex", "gemini-cli"] {
        let mark = if snapshot.is_authenticated(family) { "ok" } else { "—" };
        println!("  {family:14} {mark}");
    }
    match snapshot.select(&config.default_provider) {
        Some(family) => println!("active provider: {family}"),
        None => println!("active provider: none (set an API key and re-run)"),
    }
    Ok(())
}

const SEED_FILES: &[(&str, &str)] = &[
    ("IDENTITY.md", "# Identity\n\nYou are nxclaw, a persistent agent runtime.\n"),
    ("USER.md", "# User\n\n<!-- Who you work for. Fill in over time. -->\n"),
    ("AGENTS.md", "# Operating notes\n\n- Record durable facts as memory notes.\n- Prefer background tasks for long commands.\n"),
    ("BOOTSTRAP.md", "# Bootstrap\n\nFirst-run checklist lives here.\n"),
    ("HEARTBEAT.md", "# Heartbeat checklist\n\n<!-- Items the autonomous loop should check. -->\n"),
    ("TOOLS.md", "# Tools\n\nTool usage notes and conventions.\n"),
    ("MEMORY.md", ""),
    ("SOUL.md", "# Soul\n\nPrinciples and long-lived identity.\n"),
];

fn cmd_onboard(home: PathBuf, quick: bool) -> anyhow::Result<()> {
    let config = Config::load(home.clone());
    config.ensure_layout()?;
    config.save()?;

    for (name, seed) in SEED_FILES {
        let path = config.workspace_dir().join(name);
        if !path.exists() && !seed.is_empty() {
            fsutil::write_atomic(&path, seed.as_bytes())?;
        }
    }

    let docs = home.join("docs");
    let runbook = docs.join("RUNBOOK.md");
    if !runbook.exists() {
        fsutil::write_atomic(
            &runbook,
            b"# Runbook\n\n- `nxclaw start` runs the runtime.\n- `nxclaw status` shows health.\n- State lives under `state/`; memory under `workspace/memory/`.\n",
        )?;
    }
    let start_here = docs.join("START_HERE.md");
    if !start_here.exists() {
        fsutil::write_atomic(
            &start_here,
            b"# Start here\n\n1. `nxclaw auth` with an API key exported.\n2. `nxclaw start --once \"hello\"` for a smoke test.\n3. `nxclaw start` and open the dashboard.\n",
        )?;
    }

    if !quick {
        println!("workspace seeded; edit {}/IDENTITY.md and USER.md to taste", config.workspace_dir().display());
    }
    println!("onboarded at {}", home.display());
    Ok(())
}

fn cmd_status(home: PathBuf) -> anyhow::Result<()> {
    let config = Config::load(home.clone());
    let snapshot = AuthSnapshot::refresh(&config.auth_path());
    let objectives = ObjectiveQueue::load(config.objectives_path());
    let stats = objectives.stats();

    println!("home:       {}", home.display());
    println!(
        "provider:   {}",
        snapshot
            .select(&config.default_provider)
            .unwrap_or_else(|| "unauthenticated".to_string())
    );
    println!("objectives: {} total", stats.total);
    for (status, count) in &stats.by_status {
        println!("  {status:12} {count}");
    }

    let tasks: Option<serde_json::Value> = fsutil::read_json(&config.tasks_path())?;
    let task_count = tasks
        .as_ref()
        .and_then(|t| t["tasks"].as_array().map(|a| a.len()))
        .unwrap_or(0);
    println!("tasks:      {task_count} stored");
    println!(
        "dashboard:  http://{}:{}",
        config.dashboard.host, config.dashboard.port
    );
    Ok(())
}

fn cmd_skills(home: PathBuf, action: &str, value: Option<String>) -> anyhow::Result<()> {
    let config = Config::load(home);
    config.ensure_layout()?;
    let manager = SkillManager::new(
        config.skills_dir(),
        config.skills_state_path(),
        config.skills.clone(),
    );

    match action {
        "catalog" | "list" => {
            let skills = manager.list();
            if skills.is_empty() {
                println!("no skills installed");
            }
            for skill in skills {
                let mark = if skill.enabled { "enabled " } else { "disabled" };
                println!("{:10} {:20} {}", mark, skill.id, skill.description);
            }
        }
        "install" => {
            let path = value.context("usage: nxclaw skills install <dir>")?;
            let info = manager.install_from_dir(&PathBuf::from(path))?;
            println!("installed {} ({})", info.id, info.title);
        }
        "bootstrap" => {
            // Install every package found in the given directory.
            let root = PathBuf::from(value.context("usage: nxclaw skills bootstrap <dir>")?);
            let mut installed = 0;
            for entry in std::fs::read_dir(&root)?.flatten() {
                if entry.path().is_dir() && entry.path().join("SKILL.md").exists() {
                    match manager.install_from_dir(&entry.path()) {
                        Ok(info) => {
                            println!("installed {}", info.id);
                            installed += 1;
                        }
                        Err(e) => println!("skipped {}: {e}", entry.path().display()),
                    }
                }
            }
            println!("{installed} skill(s) installed");
        }
        "enable" => {
            let id = value.context("usage: nxclaw skills enable <id>")?;
            manager.enable(&id)?;
            println!("enabled {id}");
        }
        "disable" => {
            let id = value.context("usage: nxclaw skills disable <id>")?;
            manager.disable(&id)?;
            println!("disabled {id}");
        }
        "show" => {
            let id = value.context("usage: nxclaw skills show <id>")?;
            println!("{}", manager.show(&id)?);
        }
        "remove" => {
            let id = value.context("usage: nxclaw skills remove <id>")?;
            manager.remove(&id)?;
            println!("removed {id}");
        }
        other => anyhow::bail!("unknown skills action '{other}'"),
    }
    Ok(())
}

fn cmd_objective(
    home: PathBuf,
    action: &str,
    value: Option<String>,
    description: Option<String>,
    priority: Option<u8>,
    status: Option<String>,
    note: Option<String>,
) -> anyhow::Result<()> {
    let config = Config::load(home);
    config.ensure_layout()?;
    let mut queue = ObjectiveQueue::load(config.objectives_path());

    match action {
        "add" => {
            let title = value.context("usage: nxclaw objective add <title>")?;
            let objective = queue.add(
                &title,
                description.as_deref().unwrap_or(""),
                priority.unwrap_or(3),
                "cli",
            )?;
            println!("added {} ({})", objective.id, objective.title);
        }
        "list" => {
            let filter = match value.or(status) {
                Some(value) => Some(parse_status(&value)?),
                None => None,
            };
            for objective in queue.list(filter) {
                println!(
                    "{}  p{}  {:12}  {}",
                    objective.id,
                    objective.priority,
                    objective.status.as_str(),
                    objective.title
                );
            }
        }
        "update" => {
            let id = value.context("usage: nxclaw objective update <id> --status s")?;
            let update = ObjectiveUpdate {
                status: match status {
                    Some(value) => Some(parse_status(&value)?),
                    None => None,
                },
                priority,
                description,
                note,
                ..Default::default()
            };
            let objective = queue.update(&id, update)?;
            println!("updated {} -> {}", objective.id, objective.status.as_str());
        }
        other => anyhow::bail!("unknown objective action '{other}'"),
    }
    Ok(())
}

async fn cmd_start(
    home: PathBuf,
    once: Option<String>,
    no_slack: bool,
    no_telegram: bool,
    no_dashboard: bool,
) -> anyhow::Result<()> {
    let config = Config::load(home);
    let dashboard_config = config.dashboard.clone();
    let autonomous_enabled = config.autonomous.enabled;

    let runtime = Runtime::new(config)?;
    runtime.start().await;

    if let Some(text) = once {
        let request = IncomingRequest::new("cli", "once", "operator");
        let reply = runtime.handle_incoming(&request, &text).await;
        println!("{reply}");
        runtime.shutdown().await;
        if reply.starts_with("Runtime error:") || reply.starts_with("Authentication required") {
            std::process::exit(1);
        }
        return Ok(());
    }

    // External chat adapters register themselves against the runtime; the
    // flags only gate which ones a wrapper process wires up.
    if no_slack {
        tracing::info!("slack adapter disabled");
    }
    if no_telegram {
        tracing::info!("telegram adapter disabled");
    }

    let autonomous = AutonomousLoop::new(Arc::clone(&runtime));
    let mut dashboard = if no_dashboard {
        None
    } else {
        Some(
            DashboardServer::start(
                Arc::clone(&runtime),
                Arc::clone(&autonomous),
                &dashboard_config.host,
                dashboard_config.port,
                dashboard_config.token.clone(),
            )
            .await?,
        )
    };

    let loop_handle = if autonomous_enabled {
        Some(autonomous.spawn())
    } else {
        tracing::info!("autonomous loop disabled");
        None
    };

    tracing::info!("nxclaw running; ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("signal handler")?;

    if let Some(handle) = loop_handle {
        handle.abort();
    }
    if let Some(server) = dashboard.as_mut() {
        server.shutdown().await;
    }
    runtime.shutdown().await;
    Ok(())
}
