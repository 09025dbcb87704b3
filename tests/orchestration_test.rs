//! Full-stack orchestration: a formation materializes cells, the launcher
//! boots their runtimes, and an exec message round-trips through a cell.

use std::sync::Arc;
use std::time::Duration;

use mitos::adapters::bus::MemoryBus;
use mitos::adapters::minds::{AnthropicConfig, MindRegistry};
use mitos::adapters::store::MemoryStore;
use mitos::domain::models::{
    Cell, CellPhase, CellSpec, CellTemplate, Envelope, Formation, FormationSpec, MindSelector,
    ObjectMeta, TopologyKind, TopologySpec,
};
use mitos::domain::ports::{Bus, ResourceStore};
use mitos::runtime::{CellLauncher, ToolRegistry};
use mitos::services::config::RuntimeConfig;
use mitos::services::{Controller, ControllerOptions, FormationController};

fn formation() -> Formation {
    let template_spec = CellSpec {
        system_prompt: "You are a scout.".to_string(),
        mind: MindSelector { provider: "mock".to_string(), ..MindSelector::default() },
        ..CellSpec::default()
    };
    Formation::new(
        ObjectMeta::named("recon", "default"),
        FormationSpec {
            cells: vec![CellTemplate {
                name: "scout".to_string(),
                replicas: 2,
                spec: template_spec,
            }],
            topology: TopologySpec { kind: TopologyKind::FullMesh, ..TopologySpec::default() },
            budget: None,
            workspace: None,
        },
    )
}

#[tokio::test]
async fn formation_to_running_cells_round_trip() {
    let formations = Arc::new(MemoryStore::<Formation>::new());
    let cells = Arc::new(MemoryStore::<Cell>::new());
    let bus = MemoryBus::new();

    let options = ControllerOptions {
        resync_interval: Some(Duration::from_millis(100)),
        retry_base: Duration::from_millis(20),
        max_retries: 2,
    };

    let formation_controller = Controller::new(
        "formation",
        formations.clone() as Arc<dyn ResourceStore<Formation>>,
        Arc::new(FormationController::new(
            formations.clone() as Arc<dyn ResourceStore<Formation>>,
            cells.clone() as Arc<dyn ResourceStore<Cell>>,
            bus.clone() as Arc<dyn Bus>,
            std::env::temp_dir().join("mitos-orchestration-test"),
        )),
        options.clone(),
    )
    .start();

    let launcher = Arc::new(CellLauncher::new(
        cells.clone() as Arc<dyn ResourceStore<Cell>>,
        bus.clone() as Arc<dyn Bus>,
        Arc::new(MindRegistry::new(AnthropicConfig::default())),
        ToolRegistry::with_builtins(),
        RuntimeConfig::default(),
    ));
    let launcher_controller = Controller::new(
        "cell-launcher",
        cells.clone() as Arc<dyn ResourceStore<Cell>>,
        launcher.clone(),
        options,
    )
    .start();

    // Declare the formation; the controllers do the rest.
    formations.create(formation()).await.unwrap();

    // Wait for both scouts to be materialized and marked Running.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let live = cells.list(Some("default")).await.unwrap();
        let running = live.iter().filter(|c| c.phase() == CellPhase::Running).count();
        if live.len() == 2 && running == 2 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "cells never became ready: {live:?}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Message a scout directly over the bus, as the exec endpoint would.
    let mut outbox = bus.subscribe("cell.default.scout-0.outbox").await.unwrap();
    let envelope = Envelope::message("api", "scout-0", "report in");
    bus.publish("cell.default.scout-0.inbox", &envelope).await.unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(3), outbox.next())
        .await
        .expect("reply within 3s")
        .expect("outbox open");
    assert_eq!(reply.to, "api");
    assert!(!reply.content().is_empty());

    formation_controller.stop().await;
    launcher_controller.stop().await;
    launcher.stop_all().await;
}
