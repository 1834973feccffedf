//! CLI demo: register with the broker, optionally filter by operation
//! type, and print every transaction received until interrupted.
//!
//! Grounded on `mem_etcd::stress-client`'s `clap::Parser` `Args` +
//! `#[tokio::main]` shape, generalized from a fixed-iteration load
//! generator into a long-running subscriber loop.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::{info, warn};

use txstream_broker::types::{Mode, SubscriberName};
use txstream_client::{SelfTest, SelfTestOutcome, StreamClient};

#[derive(Debug, Parser)]
#[command(name = "txstream-client", about = "Demo subscriber for the transaction stream broker")]
struct Args {
    #[arg(long, env = "BROKER_ADDR")]
    broker: SocketAddr,

    #[arg(long, env = "SUBSCRIBER_NAME")]
    name: String,

    #[arg(long, value_enum, default_value = "head")]
    mode: ModeArg,

    /// Operation types to filter on; empty means "all".
    #[arg(long)]
    subs: Vec<String>,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum ModeArg {
    Head,
    Irreversible,
}

impl From<ModeArg> for Mode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Head => Mode::Head,
            ModeArg::Irreversible => Mode::Irreversible,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let name = SubscriberName::new(args.name).context("subscriber name must not be empty")?;
    let client = StreamClient::connect(args.broker, name.clone(), args.mode.into())
        .await
        .context("failed to bind client socket")?;

    client.register().await.context("registration failed")?;
    info!("registered {name} with {}", args.broker);

    if !args.subs.is_empty() {
        client
            .add_subs(args.subs.clone())
            .await
            .context("failed to set subscription filter")?;
        info!("filtering on {:?}", args.subs);
    }

    let mut self_test = SelfTest::new(Duration::from_secs(30), Duration::from_secs(5));

    loop {
        tokio::select! {
            notice = client.recv_notice(Duration::from_secs(5)) => {
                match notice {
                    Ok(notice) => {
                        self_test.note_activity();
                        println!("{}", serde_json::to_string(&notice)?);
                    }
                    Err(txstream_client::ClientError::Timeout) => {}
                    Err(err) => warn!("recv error: {err}"),
                }
            }
        }

        match self_test.tick(&client).await {
            SelfTestOutcome::Reregistered => info!("broker forgot us; re-registered"),
            SelfTestOutcome::Failed(err) => warn!("self-test probe failed: {err}"),
            SelfTestOutcome::Healthy | SelfTestOutcome::Waiting => {}
        }
    }
}
