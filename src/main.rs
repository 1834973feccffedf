//! Binary entrypoint: parses config, binds the broker, supervises both
//! stream workers, and serves `/metrics` on a separate port.
//!
//! Grounded on `mem_etcd::main`: `clap::Parser` CLI, `#[tokio::main]`,
//! metrics router bound on its own listener, run until shutdown.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::info;

use txstream_broker::config::{Cli, Config};
use txstream_broker::control_loop::{self, Broker};
use txstream_broker::types::Mode;
use txstream_broker::upstream::HttpPollingSource;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    txstream_broker::metrics::init();

    let cli = Cli::parse();
    let config = Config::load(cli).context("failed to load configuration")?;
    info!("starting broker on port {}", config.proxy.port);

    let metrics_port = config.proxy.metrics_port;
    let metrics_listener = tokio::net::TcpListener::bind(("0.0.0.0", metrics_port))
        .await
        .context("failed to bind metrics listener")?;
    tokio::spawn(async move {
        if let Err(err) = axum::serve(metrics_listener, txstream_broker::metrics::router()).await
        {
            log::error!("metrics server exited: {err}");
        }
    });

    let broker = Arc::new(Broker::bind(config).await.context("failed to bind broker socket")?);

    let mut supervisors = Vec::new();
    if broker.config.proxy.enable_head {
        supervisors.push(tokio::spawn(spawn_supervisor(broker.clone(), Mode::Head)));
    }
    if broker.config.proxy.enable_irreversible {
        supervisors.push(tokio::spawn(spawn_supervisor(
            broker.clone(),
            Mode::Irreversible,
        )));
    }

    control_loop::run(&broker).await;

    for supervisor in supervisors {
        let _ = supervisor.await;
    }
    Ok(())
}

async fn spawn_supervisor(broker: Arc<Broker>, mode: Mode) {
    let node_url = broker.config.node.url.clone();
    let poll_interval_ms = broker.config.node.poll_interval_ms;
    control_loop::supervise(
        broker,
        mode,
        move || Box::new(HttpPollingSource::new(node_url.clone(), poll_interval_ms)),
        std::time::Duration::from_millis(poll_interval_ms),
    )
    .await;
}
