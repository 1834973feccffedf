//! Protocol peer for the transaction stream broker.
//!
//! A single UDP socket is used for both sending commands and receiving
//! notices: the broker replies to (and fans `stream_data` out to) whatever
//! address a subscriber's `register` command came from, so there's no need
//! for the separate send/recv socket pair the original client used.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use log::{debug, info, warn};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;

use txstream_broker::codec::{
    decode_notice, encode_commands, Command, Notice, SubscriberSnapshot, MAX_DATA_FRAME,
};
use txstream_broker::types::{Mode, SubscriberName};

use crate::state_machine::{SelfTest, SelfTestOutcome};

/// How long the listen loop waits between notices before it starts
/// self-testing the broker, matching the original client's 30s recv
/// timeout.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("network error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {0}")]
    Codec(#[from] txstream_broker::codec::CodecError),
    #[error("broker returned an error: {0}")]
    Broker(String),
    #[error("timed out waiting for a reply")]
    Timeout,
    #[error("broker sent an unexpected reply: {0:?}")]
    Unexpected(Notice),
}

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// A registered (or about-to-register) subscriber's connection to the
/// broker.
pub struct StreamClient {
    socket: UdpSocket,
    broker_addr: SocketAddr,
    name: SubscriberName,
    mode: Mode,
    /// Set while paused (unregistered but still listening with no recv
    /// timeout), mirroring the original client's `self.paused` flag.
    paused: AtomicBool,
}

impl StreamClient {
    pub async fn connect(
        broker_addr: SocketAddr,
        name: SubscriberName,
        mode: Mode,
    ) -> Result<Self, ClientError> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        Ok(Self {
            socket,
            broker_addr,
            name,
            mode,
            paused: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &SubscriberName {
        &self.name
    }

    /// Register with the broker. Per spec, a successful registration gets
    /// no reply (mirroring the original client, which never waits on its
    /// `register` send either) — use [`Self::is_registered`] to confirm.
    /// Only a malformed request comes back as an `error` notice, which
    /// this still surfaces if it happens to arrive promptly.
    pub async fn register(&self) -> Result<(), ClientError> {
        self.send(Command::Register {
            name: self.name.clone(),
            mode: self.mode,
        })
        .await
    }

    /// Unregister and wait for the broker's `client_delete` acknowledgment.
    pub async fn unregister(&self) -> Result<(), ClientError> {
        match self
            .roundtrip(Command::Unregister {
                name: self.name.clone(),
            })
            .await?
        {
            Notice::ClientDelete { .. } => Ok(()),
            Notice::Error { data } => Err(ClientError::Broker(data)),
            other => Err(ClientError::Unexpected(other)),
        }
    }

    pub async fn refresh(&self) -> Result<(), ClientError> {
        self.send(Command::Refresh {
            name: self.name.clone(),
        })
        .await
    }

    pub async fn set_subs(&self, subs: Vec<String>) -> Result<(), ClientError> {
        self.send(Command::SetSubs {
            name: self.name.clone(),
            subs,
        })
        .await
    }

    pub async fn add_subs(&self, subs: Vec<String>) -> Result<(), ClientError> {
        self.send(Command::AddSubs {
            name: self.name.clone(),
            subs,
        })
        .await
    }

    pub async fn rem_subs(&self, subs: Vec<String>) -> Result<(), ClientError> {
        self.send(Command::RemSubs {
            name: self.name.clone(),
            subs,
        })
        .await
    }

    pub async fn info(&self) -> Result<SubscriberSnapshot, ClientError> {
        match self
            .roundtrip(Command::Info {
                name: self.name.clone(),
            })
            .await?
        {
            Notice::ClientInfo { data, .. } => Ok(data),
            Notice::Error { data } => Err(ClientError::Broker(data)),
            other => Err(ClientError::Unexpected(other)),
        }
    }

    /// Named ping: also proves `self.name` is still registered, since the
    /// broker echoes the name back unchanged.
    pub async fn ping(&self) -> Result<(), ClientError> {
        match self
            .roundtrip(Command::Ping {
                name: Some(self.name.clone()),
            })
            .await?
        {
            Notice::PingAnswer { .. } => Ok(()),
            other => Err(ClientError::Unexpected(other)),
        }
    }

    pub async fn is_registered(&self) -> Result<bool, ClientError> {
        match self
            .roundtrip(Command::IsRegistered {
                name: self.name.clone(),
            })
            .await?
        {
            Notice::Registered { data } => Ok(data),
            other => Err(ClientError::Unexpected(other)),
        }
    }

    /// Broadcasts a global `stop` to the broker. No reply is expected.
    pub async fn stop(&self) -> Result<(), ClientError> {
        let bytes = encode_commands(&[Command::Stop {}])?;
        self.socket.send_to(&bytes, self.broker_addr).await?;
        Ok(())
    }

    /// Pause streaming: unregister but keep the client's socket alive, so
    /// the subscriber name can be reclaimed with [`Self::unpause`] later
    /// without losing the local client state (subs are re-sent on
    /// unpause). Mirrors `proxy_client_class.py::pause`.
    pub async fn pause(&self) -> Result<(), ClientError> {
        if self.paused.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.send(Command::Unregister {
            name: self.name.clone(),
        })
        .await
    }

    /// Resume after [`Self::pause`]: re-register and re-apply `subs` in a
    /// single batched frame, matching the original client's unpause.
    pub async fn unpause(&self, subs: Vec<String>) -> Result<(), ClientError> {
        self.subscribe_batch(subs).await?;
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Register (and, if non-empty, set subscriptions) in one wire frame,
    /// the batched-registration pattern the listen loop, `unpause`, and
    /// `stream` all share with the original client.
    async fn subscribe_batch(&self, subs: Vec<String>) -> Result<(), ClientError> {
        let mut commands = vec![Command::Register {
            name: self.name.clone(),
            mode: self.mode,
        }];
        if !subs.is_empty() {
            commands.push(Command::SetSubs {
                name: self.name.clone(),
                subs,
            });
        }
        let bytes = encode_commands(&commands)?;
        self.socket.send_to(&bytes, self.broker_addr).await?;
        Ok(())
    }

    /// Block until the next notice addressed to this client arrives
    /// (`stream_data`, `refresh_req`, or `client_delete`), or `timeout`
    /// elapses.
    pub async fn recv_notice(&self, wait: Duration) -> Result<Notice, ClientError> {
        let mut buf = vec![0u8; MAX_DATA_FRAME];
        let n = timeout(wait, self.socket.recv(&mut buf))
            .await
            .map_err(|_| ClientError::Timeout)??;
        Ok(decode_notice(&buf[..n])?)
    }

    /// Like [`Self::recv_notice`] but with no timeout at all, for the
    /// `stream` adapter's blocking-generator semantics (the original sets
    /// `settimeout(None)` before its `stream()` loop).
    async fn recv_notice_blocking(&self) -> Result<Notice, ClientError> {
        let mut buf = vec![0u8; MAX_DATA_FRAME];
        let n = self.socket.recv(&mut buf).await?;
        Ok(decode_notice(&buf[..n])?)
    }

    async fn send(&self, command: Command) -> Result<(), ClientError> {
        let bytes = encode_commands(&[command])?;
        self.socket.send_to(&bytes, self.broker_addr).await?;
        Ok(())
    }

    async fn roundtrip(&self, command: Command) -> Result<Notice, ClientError> {
        self.send(command).await?;
        self.recv_notice(REPLY_TIMEOUT).await
    }

    /// Spawn a background task that keeps this subscription alive:
    /// registers (+ `subs`), forwards `stream_data`/`client_info`/`error`
    /// notices to the returned channel, auto-refreshes on `refresh_req`,
    /// and self-tests the broker on idle per [`SelfTest`]. Stop it with
    /// [`ListenHandle::stop`]. Grounded on
    /// `stream_client_class.py::_listen_thread`.
    pub fn start_listen(
        self: Arc<Self>,
        subs: Vec<String>,
    ) -> (ListenHandle, mpsc::UnboundedReceiver<Notice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stop = Arc::new(Notify::new());
        let stop_signal = Arc::clone(&stop);
        let task = tokio::spawn(async move {
            self.listen_loop(subs, tx, stop_signal).await;
        });
        (ListenHandle { task, stop }, rx)
    }

    /// Stop a subscription started by [`Self::start_listen`]: signal the
    /// loop, wait for it to unregister, and join it.
    pub async fn stop_listen(&self, handle: ListenHandle) {
        handle.stop().await;
    }

    async fn listen_loop(
        self: Arc<Self>,
        subs: Vec<String>,
        events: mpsc::UnboundedSender<Notice>,
        stop: Arc<Notify>,
    ) {
        info!("{}: listen loop starting", self.name);
        if let Err(err) = self.subscribe_batch(subs).await {
            warn!("{}: failed to subscribe: {err}", self.name);
            return;
        }

        let mut probe = SelfTest::new(IDLE_TIMEOUT, REPLY_TIMEOUT);
        loop {
            tokio::select! {
                biased;
                _ = stop.notified() => break,
                result = self.recv_notice(IDLE_TIMEOUT) => match result {
                    Ok(Notice::RefreshReq { .. }) => {
                        probe.note_activity();
                        let _ = self.refresh().await;
                        debug!("{}: refreshed subscription", self.name);
                    }
                    Ok(notice @ (Notice::ClientDelete { .. } | Notice::Stop { .. })) => {
                        let _ = events.send(notice);
                        break;
                    }
                    Ok(notice) => {
                        probe.note_activity();
                        let _ = events.send(notice);
                    }
                    Err(ClientError::Timeout) => match probe.tick(&self).await {
                        SelfTestOutcome::Failed(err) => {
                            warn!("{}: self-test failed: {err}", self.name);
                            break;
                        }
                        _ => {}
                    },
                    Err(err) => {
                        warn!("{}: listen loop socket error: {err}", self.name);
                        break;
                    }
                },
            }
        }

        if !self.paused.load(Ordering::SeqCst) {
            let _ = self
                .send(Command::Unregister {
                    name: self.name.clone(),
                })
                .await;
        }
        info!("{}: listen loop stopped", self.name);
    }

    /// A blocking (no-timeout) stream of `stream_data` transactions,
    /// registering with `subs` on first poll. Grounded on
    /// `stream_client_class.py::stream`'s generator.
    pub fn stream(self: Arc<Self>, subs: Vec<String>) -> impl Stream<Item = txstream_broker::types::Transaction> {
        async_stream::stream! {
            if let Err(err) = self.subscribe_batch(subs).await {
                warn!("{}: failed to subscribe: {err}", self.name);
                return;
            }
            loop {
                match self.recv_notice_blocking().await {
                    Ok(Notice::StreamData { data, .. }) => yield data,
                    Ok(Notice::RefreshReq { .. }) => {
                        let _ = self.refresh().await;
                    }
                    Ok(Notice::ClientDelete { .. } | Notice::Stop { .. }) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("{}: stream socket error: {err}", self.name);
                        break;
                    }
                }
            }
        }
    }
}

/// Handle to a background subscription started by [`StreamClient::start_listen`].
pub struct ListenHandle {
    task: tokio::task::JoinHandle<()>,
    stop: Arc<Notify>,
}

impl ListenHandle {
    /// Signal the listen loop to stop and wait for it to unregister and
    /// exit.
    pub async fn stop(self) {
        self.stop.notify_one();
        let _ = self.task.await;
    }
}
