use anyhow::Result;
use microgrid_sim::{config, controller, repo, telemetry};
use config::Config;
use controller::SimulationRegistry;
use repo::Repositories;
use telemetry::init_tracing;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cfg = Config::load()?;
    info!(backend = %cfg.storage.backend, "starting micro-grid simulation");

    let repos = Repositories::connect(&cfg.storage).await?;
    let registry = SimulationRegistry::new();
    let sim = registry.restore(cfg.simulation.clone(), repos).await?;
    info!(time = %sim.time(), status = %sim.status(), "simulation running");

    telemetry::shutdown_signal().await;

    registry.stop().await?;
    let stats = sim.stats();
    info!(
        steps = stats.step.run_count,
        checkpoints = stats.checkpoint.run_count,
        "shutdown complete"
    );
    Ok(())
}
