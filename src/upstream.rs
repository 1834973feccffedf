//! Upstream transaction source contract.
//!
//! The upstream blockchain node is out of scope (spec §1): this module only
//! defines the contract the core depends on, plus one concrete adapter
//! (`HttpPollingSource`, grounded on `ADI-Foundation-Labs-ADI-Stack-Server`'s
//! `reqwest` dependency) so the binary is runnable end-to-end, and an
//! in-memory adapter for tests.

use async_trait::async_trait;

use crate::types::Transaction;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("upstream returned malformed transaction payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Contract the stream workers depend on: a single async stream of
/// transactions, already split by mode at construction time (one source per
/// `head`/`irreversible` worker).
#[async_trait]
pub trait TransactionSource: Send {
    async fn next(&mut self) -> Result<Option<Transaction>, UpstreamError>;
}

/// Polls a configured node URL on a fixed interval for new transactions,
/// tracking the highest `block_num` seen so it only yields forward
/// progress.
pub struct HttpPollingSource {
    client: reqwest::Client,
    url: String,
    poll_interval: std::time::Duration,
    last_block: Option<u64>,
}

impl HttpPollingSource {
    pub fn new(url: String, poll_interval_ms: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            poll_interval: std::time::Duration::from_millis(poll_interval_ms),
            last_block: None,
        }
    }
}

#[async_trait]
impl TransactionSource for HttpPollingSource {
    async fn next(&mut self) -> Result<Option<Transaction>, UpstreamError> {
        loop {
            let resp = self.client.get(&self.url).send().await?;
            let value: serde_json::Value = resp.json().await.map_err(|e| {
                UpstreamError::Malformed(serde_json::Error::io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    e.to_string(),
                )))
            })?;
            let tx = Transaction(value);
            let block_num = tx.block_num();
            if block_num.is_some() && block_num != self.last_block {
                self.last_block = block_num;
                return Ok(Some(tx));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Fixed, in-memory source for tests: yields each queued transaction once,
/// then `None` forever.
pub struct VecSource {
    items: std::collections::VecDeque<Transaction>,
}

impl VecSource {
    pub fn new(items: Vec<Transaction>) -> Self {
        Self {
            items: items.into(),
        }
    }
}

#[async_trait]
impl TransactionSource for VecSource {
    async fn next(&mut self) -> Result<Option<Transaction>, UpstreamError> {
        Ok(self.items.pop_front())
    }
}

/// Channel-backed source for tests that need to push transactions on demand
/// from outside the worker task.
pub struct ChannelSource {
    rx: tokio::sync::mpsc::Receiver<Transaction>,
}

impl ChannelSource {
    pub fn new(rx: tokio::sync::mpsc::Receiver<Transaction>) -> Self {
        Self { rx }
    }
}

#[async_trait]
impl TransactionSource for ChannelSource {
    async fn next(&mut self) -> Result<Option<Transaction>, UpstreamError> {
        Ok(self.rx.recv().await)
    }
}
