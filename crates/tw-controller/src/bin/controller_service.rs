use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::info;

use tw_api::HttpOptimizer;
use tw_collect::CollectorSet;
use tw_controller::workers::{run_experiment_worker, run_resync, run_trial_worker};
use tw_controller::{ControllerConfig, ExperimentController, WorkQueue};
use tw_engine::{BasicRenderer, MemoryWorkspace, TrialEngine, WorkspaceClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = ControllerConfig::from_env();
    let optimizer = Arc::new(HttpOptimizer::new(config.api.clone())?);
    let collectors = Arc::new(CollectorSet::new(config.credentials.clone()));
    let workspace: Arc<dyn WorkspaceClient> = Arc::new(MemoryWorkspace::new());

    let engine = Arc::new(TrialEngine::new(
        workspace.clone(),
        optimizer.clone(),
        collectors,
        Arc::new(BasicRenderer::new()),
    ));
    let controller = Arc::new(ExperimentController::new(
        workspace.clone(),
        optimizer.clone(),
    ));

    let experiment_queue = WorkQueue::new();
    let trial_queue = WorkQueue::new();

    for _ in 0..config.experiment_workers {
        tokio::spawn(run_experiment_worker(
            experiment_queue.clone(),
            controller.clone(),
            workspace.clone(),
        ));
    }
    for _ in 0..config.trial_workers {
        tokio::spawn(run_trial_worker(
            trial_queue.clone(),
            engine.clone(),
            workspace.clone(),
        ));
    }
    tokio::spawn(run_resync(
        workspace.clone(),
        experiment_queue.clone(),
        trial_queue.clone(),
        config.resync_period,
    ));

    let listener = TcpListener::bind(&config.health_addr).await?;
    info!(addr = %config.health_addr, "tunewise controller listening");

    loop {
        let (mut socket, _) = listener.accept().await?;

        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];
            let _ = socket.read(&mut buffer).await;

            let body = r#"{"status":"ok","service":"controller"}"#;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            );

            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        });
    }
}
