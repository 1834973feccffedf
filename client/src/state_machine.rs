//! Self-healing idle-timeout state machine.
//!
//! Grounded on `original_source/proxy_client_class.py`'s explicit
//! `ping_requested`/`ping_answered`/`info_requested`/`info_answered` flags,
//! reworked into a Rust state enum. The client drives this from an idle
//! loop: when no notice has arrived for a while, it starts probing the
//! broker (`ping`, then `info`/`is_registered`) and re-registers itself if
//! the broker no longer remembers it (e.g. the broker restarted).
use std::time::{Duration, Instant};

use crate::client::{ClientError, StreamClient};

/// S0: nothing outstanding. S1: a `ping` is in flight. S2: `ping`
/// answered, an `is_registered` check is in flight. S3: confirmed healthy
/// and still registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelfTestState {
    Idle,
    PingSent,
    InfoSent,
    Healthy,
}

#[derive(Debug)]
pub enum SelfTestOutcome {
    /// Nothing to do yet; still within the idle grace period.
    Waiting,
    /// Broker answered the ping and confirms we're still registered.
    Healthy,
    /// The broker forgot us (restarted, or our lease expired before we
    /// noticed); we re-registered successfully.
    Reregistered,
    /// A probe failed outright (network error, or re-registration itself
    /// failed).
    Failed(ClientError),
}

/// Drives one client's self-test state machine. Call [`tick`] periodically
/// (e.g. every second) from the client's idle loop; call [`note_activity`]
/// whenever any notice arrives on the socket, so a live data stream never
/// triggers unnecessary probing.
pub struct SelfTest {
    state: SelfTestState,
    last_activity: Instant,
    idle_timeout: Duration,
    probe_timeout: Duration,
}

impl SelfTest {
    pub fn new(idle_timeout: Duration, probe_timeout: Duration) -> Self {
        Self {
            state: SelfTestState::Idle,
            last_activity: Instant::now(),
            idle_timeout,
            probe_timeout,
        }
    }

    pub fn state(&self) -> SelfTestState {
        self.state
    }

    /// Reset the idle clock; call this whenever a notice (stream data,
    /// refresh_req, etc.) is observed on the socket.
    pub fn note_activity(&mut self) {
        self.last_activity = Instant::now();
        self.state = SelfTestState::Idle;
    }

    /// Advance the state machine by one step, issuing whatever probe is
    /// due and blocking (up to `probe_timeout`) for its reply.
    pub async fn tick(&mut self, client: &StreamClient) -> SelfTestOutcome {
        match self.state {
            SelfTestState::Idle => {
                if self.last_activity.elapsed() < self.idle_timeout {
                    return SelfTestOutcome::Waiting;
                }
                self.state = SelfTestState::PingSent;
                match client.ping().await {
                    Ok(()) => {
                        self.state = SelfTestState::InfoSent;
                        self.probe_registration(client).await
                    }
                    Err(ClientError::Timeout) => SelfTestOutcome::Waiting,
                    Err(err) => SelfTestOutcome::Failed(err),
                }
            }
            SelfTestState::PingSent | SelfTestState::InfoSent => {
                self.probe_registration(client).await
            }
            SelfTestState::Healthy => {
                if self.last_activity.elapsed() >= self.idle_timeout {
                    self.state = SelfTestState::Idle;
                }
                SelfTestOutcome::Healthy
            }
        }
    }

    async fn probe_registration(&mut self, client: &StreamClient) -> SelfTestOutcome {
        match client.is_registered().await {
            Ok(true) => {
                self.state = SelfTestState::Healthy;
                self.last_activity = Instant::now();
                SelfTestOutcome::Healthy
            }
            Ok(false) => match client.register().await {
                Ok(()) => {
                    self.state = SelfTestState::Healthy;
                    self.last_activity = Instant::now();
                    SelfTestOutcome::Reregistered
                }
                Err(err) => SelfTestOutcome::Failed(err),
            },
            Err(err) => SelfTestOutcome::Failed(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_idle_and_stays_idle_within_grace_period() {
        let probe = SelfTest::new(Duration::from_secs(60), Duration::from_secs(1));
        assert_eq!(probe.state(), SelfTestState::Idle);
    }

    #[test]
    fn note_activity_resets_to_idle() {
        let mut probe = SelfTest::new(Duration::from_millis(1), Duration::from_secs(1));
        probe.state = SelfTestState::Healthy;
        probe.note_activity();
        assert_eq!(probe.state(), SelfTestState::Idle);
    }
}
