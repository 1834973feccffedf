//! Control loop: owns the single receiving `UdpSocket`, decodes inbound
//! control frames, dispatches them, and replies on the same socket.
//!
//! Grounded on `mem_etcd::main`'s server bootstrap (bind, construct
//! services, spawn workers, run until shutdown, join), adapted from a
//! `tonic::transport::Server::serve` accept loop to a UDP `recv_from` loop.

use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, warn};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::codec::{decode_commands, encode_notice, MAX_CONTROL_FRAME};
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::metrics;
use crate::registry::Registry;
use crate::types::Mode;
use crate::upstream::TransactionSource;

/// Control sockets see bursty fan-out traffic from the stream workers, so
/// the receive buffer is widened past the OS default before binding.
fn bind_with_large_recv_buffer(port: u16) -> std::io::Result<std::net::UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_recv_buffer_size(1 << 20)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), port).into())?;
    Ok(socket.into())
}

/// Everything the control loop needs to run for the lifetime of the
/// process. Built once in `main`, then handed to [`run`].
pub struct Broker {
    pub registry: Arc<Registry>,
    pub socket: Arc<UdpSocket>,
    pub config: Config,
    pub stop_tx: tokio::sync::broadcast::Sender<()>,
}

impl Broker {
    pub async fn bind(config: Config) -> std::io::Result<Self> {
        let socket = bind_with_large_recv_buffer(config.proxy.port)?;
        let socket = UdpSocket::from_std(socket)?;
        let (stop_tx, _rx) = tokio::sync::broadcast::channel(1);
        Ok(Self {
            registry: Arc::new(Registry::new()),
            socket: Arc::new(socket),
            config,
            stop_tx,
        })
    }

    fn enabled_modes(&self) -> Vec<Mode> {
        let mut modes = Vec::new();
        if self.config.proxy.enable_head {
            modes.push(Mode::Head);
        }
        if self.config.proxy.enable_irreversible {
            modes.push(Mode::Irreversible);
        }
        modes
    }

    /// Spawn a stream worker for `mode`. The worker task itself exits as
    /// soon as the mode's cohort empties out; [`supervise`] is responsible
    /// for calling this again once a new registration repopulates it.
    pub fn spawn_worker(
        &self,
        mode: Mode,
        make_source: impl FnOnce() -> Box<dyn TransactionSource> + Send + 'static,
    ) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let socket = self.socket.clone();
        let ttl_tolerance = self.config.proxy.ttl_tolerance;
        let stop_rx = self.stop_tx.subscribe();
        tokio::spawn(async move {
            crate::stream_worker::run(mode, registry, socket, make_source(), ttl_tolerance, stop_rx)
                .await;
        })
    }
}

/// Watches `mode`'s cohort size and (re)spawns its stream worker whenever
/// the cohort transitions from empty to non-empty, satisfying the "worker
/// lifetime tied to a non-empty cohort" rule without needing the
/// dispatcher itself to reach into task-spawning machinery.
pub async fn supervise(
    broker: Arc<Broker>,
    mode: Mode,
    make_source: impl Fn() -> Box<dyn TransactionSource> + Send + Sync + 'static,
    poll_interval: std::time::Duration,
) {
    let mut stop_rx = broker.stop_tx.subscribe();
    let mut worker: Option<JoinHandle<()>> = None;

    loop {
        let is_done = match &mut worker {
            Some(handle) => handle.is_finished(),
            None => true,
        };
        if is_done && broker.registry.count(mode) > 0 {
            let source = make_source();
            worker = Some(broker.spawn_worker(mode, move || source));
        }

        tokio::select! {
            biased;
            _ = stop_rx.recv() => break,
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }

    if let Some(handle) = worker {
        handle.abort();
    }
}

/// Main receive/dispatch loop: decode each inbound datagram as a batch of
/// commands, dispatch each in order, and send replies back to the sender.
pub async fn run(broker: &Broker) {
    let enabled = broker.enabled_modes();
    let mut buf = vec![0u8; MAX_CONTROL_FRAME];
    let mut stop_rx = broker.stop_tx.subscribe();

    loop {
        let (len, from) = tokio::select! {
            biased;
            _ = stop_rx.recv() => {
                debug!("control loop shutting down");
                break;
            }
            result = broker.socket.recv_from(&mut buf) => {
                match result {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!("recv_from failed: {err}");
                        continue;
                    }
                }
            }
        };

        handle_datagram(broker, &enabled, &buf[..len], from).await;
    }
}

async fn handle_datagram(broker: &Broker, enabled: &[Mode], bytes: &[u8], from: SocketAddr) {
    let commands = match decode_commands(bytes) {
        Ok(commands) => commands,
        Err(err) => {
            metrics::FRAMES_MALFORMED.inc();
            warn!("malformed frame from {from}: {err}");
            return;
        }
    };

    let dispatcher = Dispatcher {
        registry: &broker.registry,
        ttl: broker.config.proxy.ttl,
        enabled_modes: enabled,
        stop_tx: &broker.stop_tx,
    };

    for command in commands {
        metrics::FRAMES_RECEIVED.with_label_values(&["control"]).inc();
        for (dest, notice) in dispatcher.dispatch(command, from) {
            match encode_notice(&notice) {
                Ok(bytes) => {
                    if let Err(err) = broker.socket.send_to(&bytes, dest).await {
                        warn!("failed to reply to {dest}: {err}");
                    }
                }
                Err(err) => warn!("failed to encode reply for {dest}: {err}"),
            }
        }
    }
}
