//! Per-mode stream worker: consumes the upstream transaction source,
//! detects block boundaries, sweeps subscriber leases, and fans matching
//! transactions out over the broker's shared send socket.
//!
//! Structurally grounded on `mem_etcd::watch_service::watch`'s notify loop
//! (`tokio::select!` over upstream input vs. a cancel signal) and on
//! `store.rs`'s sequential per-change notify task; there is no
//! revision/WAL state to carry here, only the lease sweep.

use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::net::UdpSocket;

use crate::codec::{encode_notice, Notice};
use crate::metrics;
use crate::registry::Registry;
use crate::types::{Mode, SubscriberName, Transaction};
use crate::upstream::TransactionSource;

/// Runs until the upstream source ends or `stop` fires, driving one mode's
/// full lifecycle: block-boundary lease sweep, refresh/evict notices, and
/// per-transaction fan-out to matching subscribers.
///
/// Per spec, the worker's own lifetime is tied to a non-empty cohort: if
/// the registry empties out for this mode, the worker exits and is
/// restarted by the control loop on the next matching `register`.
pub async fn run(
    mode: Mode,
    registry: Arc<Registry>,
    socket: Arc<UdpSocket>,
    mut source: Box<dyn TransactionSource>,
    ttl_tolerance: i64,
    mut stop_rx: tokio::sync::broadcast::Receiver<()>,
) {
    info!("stream worker for {mode} starting");
    metrics::STREAM_WORKER_UP.with_label_values(&[mode.as_str()]).set(1);

    let mut last_block: Option<u64> = None;

    loop {
        if registry.count(mode) == 0 {
            info!("stream worker for {mode} stopping: no subscribers left");
            break;
        }

        let next = tokio::select! {
            biased;
            _ = stop_rx.recv() => {
                info!("stream worker for {mode} stopping: global stop");
                break;
            }
            next = source.next() => next,
        };

        let tx = match next {
            Ok(Some(tx)) => tx,
            Ok(None) => {
                info!("stream worker for {mode} stopping: upstream source ended");
                break;
            }
            Err(err) => {
                warn!("stream worker for {mode} upstream error: {err}");
                metrics::UPSTREAM_ERRORS.inc();
                continue;
            }
        };

        if let Some(block_num) = tx.block_num() {
            if last_block != Some(block_num) {
                last_block = Some(block_num);
                sweep_leases(mode, &registry, &socket, ttl_tolerance).await;
            }
        }

        fan_out(mode, &registry, &socket, &tx).await;
    }

    metrics::STREAM_WORKER_UP.with_label_values(&[mode.as_str()]).set(0);
}

async fn sweep_leases(mode: Mode, registry: &Registry, socket: &UdpSocket, ttl_tolerance: i64) {
    let sweep = registry.decrement_leases(mode, ttl_tolerance);

    for name in &sweep.refresh {
        metrics::REFRESH_NOTICES.with_label_values(&[mode.as_str()]).inc();
        send_to_name(registry, socket, name, Notice::RefreshReq { name: name.clone() }).await;
    }
    for (name, endpoint) in &sweep.evicted_endpoints {
        metrics::EVICTIONS.with_label_values(&[mode.as_str()]).inc();
        debug!("evicted {name} ({mode}) on lease expiry");
        send(
            socket,
            *endpoint,
            &Notice::ClientDelete { name: name.clone() },
        )
        .await;
    }
    metrics::ACTIVE_SUBSCRIBERS
        .with_label_values(&[mode.as_str()])
        .set(registry.count(mode) as i64);
}

async fn send_to_name(
    registry: &Registry,
    socket: &UdpSocket,
    name: &SubscriberName,
    notice: Notice,
) {
    let Some(record) = registry.info(name) else {
        return;
    };
    send(socket, record.endpoint, &notice).await;
}

async fn fan_out(mode: Mode, registry: &Registry, socket: &UdpSocket, tx: &Transaction) {
    let op_type = tx.op_type();
    let subscribers = registry.matching(mode, op_type);
    for (name, endpoint) in subscribers {
        let notice = Notice::StreamData {
            name,
            data: tx.clone(),
        };
        send(socket, endpoint, &notice).await;
    }
    metrics::TRANSACTIONS_FANNED_OUT
        .with_label_values(&[mode.as_str()])
        .inc();
}

async fn send(socket: &UdpSocket, endpoint: SocketAddr, notice: &Notice) {
    match encode_notice(notice) {
        Ok(bytes) => {
            if let Err(err) = socket.send_to(&bytes, endpoint).await {
                warn!("failed to send notice to {endpoint}: {err}");
            }
        }
        Err(err) => warn!("failed to encode notice for {endpoint}: {err}"),
    }
}
