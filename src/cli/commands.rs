//! CLI command handlers.

use anyhow::{bail, Context, Result};
use comfy_table::{presets::UTF8_FULL, Table};
use console::style;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use crate::adapters::bus::MemoryBus;
use crate::adapters::minds::{AnthropicConfig, MindRegistry};
use crate::adapters::sqlite::{self, AuditLog, CellEventRepo, Migrator, SpawnRequestRepo};
use crate::adapters::store::MemoryStore;
use crate::api::{self, ApiState};
use crate::domain::models::{Cell, Evolution, Formation, Mission, Swarm};
use crate::domain::ports::{Bus, GeneHashEvaluator, Mind, ResourceStore};
use crate::runtime::{CellLauncher, CellRuntime, CellRuntimeOptions, ToolRegistry};
use crate::services::{
    cell_tree::CellTreeStore, config::Config, BudgetLedger, Controller, ControllerOptions,
    EventConsumer, EvolutionController, FormationController, MetricRegistry, MissionController,
    RecursionValidator, SwarmController,
};

async fn open_pool(config: &Config) -> Result<sqlx::SqlitePool> {
    let database_url = format!("sqlite:{}", config.database.path);
    let pool = sqlite::create_pool(
        &database_url,
        Some(sqlite::PoolConfig {
            max_connections: config.database.max_connections,
            ..sqlite::PoolConfig::default()
        }),
    )
    .await
    .context("Failed to open database")?;
    Migrator::new(pool.clone())
        .run()
        .await
        .context("Failed to run migrations")?;
    Ok(pool)
}

fn anthropic_config(config: &Config) -> AnthropicConfig {
    AnthropicConfig {
        api_key: std::env::var("ANTHROPIC_API_KEY").unwrap_or_default(),
        default_model: config.mind.model.clone(),
        timeout_secs: config.mind.timeout_secs,
        requests_per_second: config.mind.requests_per_second,
        max_retries: config.mind.max_retries,
        ..AnthropicConfig::default()
    }
}

// ============================================================================
// serve
// ============================================================================

/// Boot the whole control plane in one process and run until ctrl-c.
#[allow(clippy::too_many_lines)]
pub async fn handle_serve(config: Config) -> Result<()> {
    let pool = open_pool(&config).await?;
    let bus: Arc<dyn Bus> = MemoryBus::new();

    // Operational stores and core services.
    let ledger = BudgetLedger::new(pool.clone());
    let tree = CellTreeStore::new(pool.clone());
    let events = CellEventRepo::new(pool.clone());
    let spawn_requests = SpawnRequestRepo::new(pool.clone());
    let audit = AuditLog::new(pool.clone());
    let validator = Arc::new(
        RecursionValidator::new(tree.clone(), ledger.clone(), spawn_requests.clone())
            .with_platform_cap(config.platform.max_cells),
    );

    // Typed resource stores.
    let cells: Arc<dyn ResourceStore<Cell>> = Arc::new(MemoryStore::new());
    let formations: Arc<dyn ResourceStore<Formation>> = Arc::new(MemoryStore::new());
    let missions: Arc<dyn ResourceStore<Mission>> = Arc::new(MemoryStore::new());
    let swarms: Arc<dyn ResourceStore<Swarm>> = Arc::new(MemoryStore::new());
    let evolutions: Arc<dyn ResourceStore<Evolution>> = Arc::new(MemoryStore::new());

    let controller_options = ControllerOptions {
        resync_interval: Some(std::time::Duration::from_secs(config.controllers.swarm_tick_secs)),
        retry_base: std::time::Duration::from_secs(config.controllers.retry_base_secs),
        max_retries: config.controllers.max_retries,
    };

    // Cell launcher (in-process worker substitute).
    let minds = Arc::new(MindRegistry::new(anthropic_config(&config)));
    let launcher = Arc::new(CellLauncher::new(
        Arc::clone(&cells),
        Arc::clone(&bus),
        minds,
        ToolRegistry::with_builtins(),
        config.runtime.clone(),
    ));
    let launcher_handle = Controller::new(
        "cell-launcher",
        Arc::clone(&cells),
        Arc::clone(&launcher) as Arc<dyn crate::services::Reconcile<Cell>>,
        controller_options.clone(),
    )
    .start();

    // Controllers.
    let formation_handle = Controller::new(
        "formation",
        Arc::clone(&formations),
        Arc::new(FormationController::new(
            Arc::clone(&formations),
            Arc::clone(&cells),
            Arc::clone(&bus),
            PathBuf::from(".mitos/workspaces"),
        )) as Arc<dyn crate::services::Reconcile<Formation>>,
        controller_options.clone(),
    )
    .start();

    let mission_handle = Controller::new(
        "mission",
        Arc::clone(&missions),
        Arc::new(MissionController::new(Arc::clone(&missions), Arc::clone(&bus)))
            as Arc<dyn crate::services::Reconcile<Mission>>,
        controller_options.clone(),
    )
    .start();

    let swarm_handle = Controller::new(
        "swarm",
        Arc::clone(&swarms),
        Arc::new(SwarmController::new(
            Arc::clone(&swarms),
            Arc::clone(&cells),
            Arc::clone(&bus),
            MetricRegistry::new(),
        )) as Arc<dyn crate::services::Reconcile<Swarm>>,
        controller_options.clone(),
    )
    .start();

    let evolution_handle = Controller::new(
        "evolution",
        Arc::clone(&evolutions),
        Arc::new(EvolutionController::new(
            Arc::clone(&evolutions),
            Arc::new(GeneHashEvaluator),
        )) as Arc<dyn crate::services::Reconcile<Evolution>>,
        controller_options,
    )
    .start();

    let consumer_handle = EventConsumer::new(Arc::clone(&bus), events.clone())
        .start()
        .await
        .context("Failed to start event consumer")?;

    // API surface.
    let api_state = ApiState {
        bus: Arc::clone(&bus),
        ledger,
        tree,
        events,
        spawn_requests,
        audit,
        validator,
        cells: Arc::clone(&cells),
    };
    let addr: SocketAddr = format!("{}:{}", config.api.host, config.api.port)
        .parse()
        .context("Invalid API address")?;
    let api_task = tokio::spawn(api::serve(api_state, addr));

    tracing::info!("control plane running; ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("Failed to listen for ctrl-c")?;
    tracing::info!("shutting down");

    // Stop flags first, in-flight reconciles finish, then the bus drains.
    mission_handle.stop().await;
    formation_handle.stop().await;
    swarm_handle.stop().await;
    evolution_handle.stop().await;
    launcher_handle.stop().await;
    launcher.stop_all().await;
    consumer_handle.stop().await;
    api_task.abort();
    bus.drain().await.ok();

    Ok(())
}

// ============================================================================
// worker
// ============================================================================

fn required_env(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("missing required environment variable {name}"))
}

/// Run one cell worker from CELL_* environment. Exits non-zero when the
/// required environment is absent.
pub async fn handle_worker(config: Config) -> Result<()> {
    let cell_name = required_env("CELL_NAME")?;
    let namespace = std::env::var("CELL_NAMESPACE").unwrap_or_else(|_| "default".to_string());
    let system_prompt = std::env::var("CELL_SYSTEM_PROMPT").unwrap_or_default();
    let provider = std::env::var("CELL_MIND_PROVIDER").unwrap_or_else(|_| config.mind.provider.clone());

    let bus: Arc<dyn Bus> = MemoryBus::new();
    let minds = MindRegistry::new(anthropic_config(&config));
    let mind: Arc<dyn Mind> = minds.create(&provider).context("Failed to create mind")?;

    let options = CellRuntimeOptions {
        cell_name: cell_name.clone(),
        namespace,
        formation_ref: std::env::var("CELL_FORMATION").ok(),
        system_prompt,
        model: Some(config.mind.model.clone()),
        temperature: None,
        max_tokens: 4096,
        tool_names: vec!["echo".to_string(), "current_time".to_string(), "send_message".to_string()],
        memory: crate::domain::models::MemorySpec {
            max_messages: config.runtime.max_messages,
            summarize_after: config.runtime.summarize_after,
        },
        budget: None,
        max_iterations: config.runtime.max_iterations,
        ack_wait: std::time::Duration::from_secs(config.runtime.ack_wait_secs),
        durable_inbox: config.runtime.durable_inbox,
    };

    let runtime = CellRuntime::new(options, Arc::clone(&bus), mind, &ToolRegistry::with_builtins());
    let handle = runtime.start();

    tracing::info!(cell = %cell_name, "worker running; ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("Failed to listen for ctrl-c")?;

    handle.stop().await;
    bus.drain().await.ok();
    Ok(())
}

// ============================================================================
// migrate / validate
// ============================================================================

pub async fn handle_migrate(config: Config) -> Result<()> {
    let pool = open_pool(&config).await?;
    let version = Migrator::new(pool).current_version().await?;
    println!("schema at version {version}");
    Ok(())
}

/// Parse a manifest and report what it declares.
pub fn handle_validate(file: &str, json: bool) -> Result<()> {
    let raw = std::fs::read_to_string(file).with_context(|| format!("cannot read {file}"))?;
    let value: serde_yaml::Value = serde_yaml::from_str(&raw).context("not valid YAML")?;

    let kind = value
        .get("kind")
        .and_then(serde_yaml::Value::as_str)
        .context("manifest has no kind")?
        .to_string();

    let summary = match kind.as_str() {
        "Cell" => {
            let cell: Cell = serde_yaml::from_str(&raw)?;
            format!("Cell {}/{}", cell.metadata.namespace, cell.metadata.name)
        }
        "Formation" => {
            let formation: Formation = serde_yaml::from_str(&raw)?;
            format!(
                "Formation {}/{} ({} cells)",
                formation.metadata.namespace,
                formation.metadata.name,
                formation.spec.desired_count()
            )
        }
        "Mission" => {
            let mission: Mission = serde_yaml::from_str(&raw)?;
            format!(
                "Mission {}/{} -> cell {}",
                mission.metadata.namespace, mission.metadata.name, mission.spec.entrypoint.cell
            )
        }
        "Swarm" => {
            let swarm: Swarm = serde_yaml::from_str(&raw)?;
            format!(
                "Swarm {}/{} ({}..{} replicas)",
                swarm.metadata.namespace,
                swarm.metadata.name,
                swarm.spec.min_replicas,
                swarm.spec.max_replicas
            )
        }
        "Evolution" => {
            let evolution: Evolution = serde_yaml::from_str(&raw)?;
            format!(
                "Evolution {}/{} ({} genes)",
                evolution.metadata.namespace,
                evolution.metadata.name,
                evolution.spec.genes.len()
            )
        }
        other => bail!("unknown kind '{other}'"),
    };

    if json {
        println!("{}", serde_json::json!({ "ok": true, "kind": kind, "summary": summary }));
    } else {
        println!("{} {summary}", style("valid").green());
    }
    Ok(())
}

// ============================================================================
// budget / tree / events
// ============================================================================

pub async fn handle_budget_show(config: Config, cell: &str, json: bool) -> Result<()> {
    let pool = open_pool(&config).await?;
    let ledger = BudgetLedger::new(pool);

    let Some(balance) = ledger.get_balance(cell).await? else {
        bail!("no budget record for cell '{cell}'");
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&balance)?);
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["cell", "allocated", "spent", "delegated", "available"]);
    table.add_row(vec![
        balance.cell_id.clone(),
        format!("{:.4}", balance.allocated),
        format!("{:.4}", balance.spent),
        format!("{:.4}", balance.delegated),
        format!("{:.4}", balance.available()),
    ]);
    println!("{table}");
    Ok(())
}

pub async fn handle_budget_history(config: Config, cell: &str, limit: i64, json: bool) -> Result<()> {
    let pool = open_pool(&config).await?;
    let ledger = BudgetLedger::new(pool);
    let history = ledger.get_history(cell, limit).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&history)?);
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["id", "op", "amount", "from", "to", "after", "at"]);
    for entry in history {
        table.add_row(vec![
            entry.id.to_string(),
            entry.operation.to_string(),
            format!("{:.4}", entry.amount),
            entry.from_cell_id.unwrap_or_default(),
            entry.to_cell_id.unwrap_or_default(),
            format!("{:.4}", entry.balance_after),
            entry.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        ]);
    }
    println!("{table}");
    Ok(())
}

pub async fn handle_budget_init(config: Config, cell: &str, amount: f64, json: bool) -> Result<()> {
    let pool = open_pool(&config).await?;
    let ledger = BudgetLedger::new(pool.clone());
    ledger.init_root(cell, amount).await?;
    AuditLog::new(pool)
        .record("cli", "budget.init", cell, Some(&amount.to_string()))
        .await?;

    if json {
        println!("{}", serde_json::json!({ "ok": true, "cell": cell, "allocated": amount }));
    } else {
        println!("{} root '{cell}' allocated {amount:.4}", style("ok").green());
    }
    Ok(())
}

pub async fn handle_tree(config: Config, cell: &str, json: bool) -> Result<()> {
    let pool = open_pool(&config).await?;
    let tree = CellTreeStore::new(pool);
    let nodes = tree.subtree(cell).await?;
    if nodes.is_empty() {
        bail!("cell '{cell}' not in tree");
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&nodes)?);
        return Ok(());
    }

    for node in nodes {
        let indent = "  ".repeat(node.depth as usize);
        println!(
            "{indent}{} {}",
            style(&node.cell_id).cyan(),
            style(format!("(depth {}, {} descendants)", node.depth, node.descendant_count)).dim()
        );
    }
    Ok(())
}

pub async fn handle_events(config: Config, cell: &str, namespace: &str, limit: i64, json: bool) -> Result<()> {
    let pool = open_pool(&config).await?;
    let repo = CellEventRepo::new(pool);
    let events = repo.list_for_cell(namespace, cell, limit).await?;

    if json {
        let items: Vec<serde_json::Value> = events
            .iter()
            .map(|e| {
                serde_json::json!({
                    "id": e.id,
                    "type": e.event_type,
                    "payload": e.payload,
                    "createdAt": e.created_at,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["id", "type", "payload", "at"]);
    for event in events {
        table.add_row(vec![
            event.id.to_string(),
            event.event_type.clone(),
            event.payload.to_string(),
            event.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        ]);
    }
    println!("{table}");
    Ok(())
}
