//! Upstream connection supervisor.
//!
//! [`UpstreamClient`] owns the single logical session to the tool
//! aggregator. It connects with exponential backoff, reacts to the
//! session's events (catalog changed, connection closed), keeps a periodic
//! poll running as a fallback to push notifications, and tells the catalog
//! index when to rebuild through a [`RebuildReason`] channel.
//!
//! # State machine
//!
//! ```text
//!              connect()                       session ok
//! Disconnected ─────────▶ Connecting(n) ──────────────────▶ Connected
//!      ▲                    │   ▲                               │
//!      │                    └───┘ backoff 2s,4s,…,30s           │ Closed event
//!      │                                                        ▼
//!      └──── Reconnecting ◀──── 5s ──── Disconnected ◀──────────┘
//! ```
//!
//! The wire is behind two traits: a [`Connector`] produces an
//! [`UpstreamSession`] and hands it an event sender. The production
//! implementation is [`http::HttpConnector`].

pub mod http;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::UpstreamError;
use crate::models::{ConnectionState, RebuildReason, UpstreamOperation};

/// Events a live session pushes to its supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamEvent {
    /// The aggregator announced that its tool list changed.
    CatalogChanged,
    /// The transport broke; the session is unusable.
    Closed,
}

/// One live session to the aggregator.
#[async_trait]
pub trait UpstreamSession: Send + Sync {
    /// Fetch the full upstream catalog.
    async fn list_operations(&self) -> Result<Vec<UpstreamOperation>, UpstreamError>;

    /// Forward one call and return the aggregator's result verbatim.
    async fn invoke(&self, name: &str, arguments: Value) -> Result<Value, UpstreamError>;

    /// Tear the session down. Must not emit [`UpstreamEvent::Closed`].
    async fn close(&self) {}
}

/// Opens sessions to the aggregator.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a session. The session reports catalog changes and its own
    /// death on `events`.
    async fn connect(
        &self,
        events: mpsc::UnboundedSender<UpstreamEvent>,
    ) -> Result<Arc<dyn UpstreamSession>, UpstreamError>;
}

/// Timing knobs for the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorSettings {
    /// First retry delay; doubles after each failed attempt.
    pub base_delay: Duration,
    /// Upper bound for the retry delay.
    pub max_delay: Duration,
    /// Pause between a disconnect and the start of the reconnect loop.
    pub disconnect_delay: Duration,
    /// Fallback fingerprint check interval while connected.
    pub poll_interval: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            disconnect_delay: Duration::from_secs(5),
            poll_interval: Duration::from_secs(15),
        }
    }
}

impl SupervisorSettings {
    /// Delay after the `attempt`-th consecutive failure (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

struct LiveSession {
    session: Arc<dyn UpstreamSession>,
}

/// Connection supervisor for the upstream aggregator.
pub struct UpstreamClient {
    connector: Arc<dyn Connector>,
    settings: SupervisorSettings,
    live: RwLock<Option<LiveSession>>,
    state: watch::Sender<ConnectionState>,
    generation: AtomicU64,
    reconnecting: AtomicBool,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    connect_task: Mutex<Option<JoinHandle<()>>>,
    signals: mpsc::UnboundedSender<RebuildReason>,
}

impl UpstreamClient {
    /// Create a disconnected supervisor. Rebuild requests are sent on
    /// `signals`; see [`crate::catalog::run_sync_loop`].
    pub fn new(
        connector: Arc<dyn Connector>,
        settings: SupervisorSettings,
        signals: mpsc::UnboundedSender<RebuildReason>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            connector,
            settings,
            live: RwLock::new(None),
            state,
            generation: AtomicU64::new(0),
            reconnecting: AtomicBool::new(false),
            poll_task: Mutex::new(None),
            connect_task: Mutex::new(None),
            signals,
        })
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected() && self.live.read().is_some()
    }

    /// Wait until the supervisor reports `Connected`, up to `timeout`.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut rx = self.subscribe();
        let connected = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|s| s.is_connected())).await,
            Ok(Ok(_))
        );
        connected
    }

    /// Run the connect loop in the background.
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.track_connect_task(tokio::spawn(async move { this.connect().await }));
    }

    fn track_connect_task(&self, task: JoinHandle<()>) {
        if let Some(previous) = self.connect_task.lock().replace(task) {
            if !previous.is_finished() {
                previous.abort();
            }
        }
    }

    /// Connect, retrying with exponential backoff until a session is up.
    ///
    /// Never gives up; every failed attempt is logged with its delay.
    pub async fn connect(self: &Arc<Self>) {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            self.state.send_replace(ConnectionState::Connecting(attempt));
            info!(attempt, "connecting to upstream aggregator");

            let (events_tx, events_rx) = mpsc::unbounded_channel();
            match self.connector.connect(events_tx).await {
                Ok(session) => {
                    self.on_connected(session, events_rx);
                    return;
                }
                Err(e) => {
                    let delay = self.settings.backoff(attempt);
                    warn!(
                        attempt,
                        error = %e,
                        retry_in_secs = delay.as_secs(),
                        "upstream connect failed"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn on_connected(
        self: &Arc<Self>,
        session: Arc<dyn UpstreamSession>,
        mut events: mpsc::UnboundedReceiver<UpstreamEvent>,
    ) {
        // Any pending reconnect loop ends here; a close event on this
        // connection must be able to schedule the next one.
        self.reconnecting.store(false, Ordering::Release);
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        *self.live.write() = Some(LiveSession { session });
        self.state.send_replace(ConnectionState::Connected);
        info!(generation, "upstream connected");

        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(this) = weak.upgrade() else { break };
                match event {
                    UpstreamEvent::CatalogChanged => {
                        debug!("upstream catalog changed");
                        let _ = this.signals.send(RebuildReason::Notification);
                    }
                    UpstreamEvent::Closed => {
                        this.handle_disconnect(generation);
                    }
                }
            }
        });

        self.restart_polling();
        let _ = self.signals.send(RebuildReason::Connected);
    }

    fn restart_polling(&self) {
        let signals = self.signals.clone();
        let every = self.settings.poll_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if signals.send(RebuildReason::Poll).is_err() {
                    break;
                }
            }
        });
        if let Some(previous) = self.poll_task.lock().replace(task) {
            previous.abort();
        }
    }

    fn stop_polling(&self) {
        if let Some(task) = self.poll_task.lock().take() {
            task.abort();
        }
    }

    /// React to a broken transport of connection `generation`.
    ///
    /// Drops the session, stops polling, and schedules one reconnect loop
    /// after the disconnect delay. Events from older connections are ignored,
    /// and a second disconnect while a reconnect loop is pending or running
    /// does not start another one.
    pub fn handle_disconnect(self: &Arc<Self>, generation: u64) {
        if self.generation.load(Ordering::Acquire) != generation {
            debug!(generation, "ignoring close event from a stale connection");
            return;
        }

        if self.live.write().take().is_none() {
            debug!(generation, "connection already down");
            return;
        }
        self.stop_polling();
        self.state.send_replace(ConnectionState::Disconnected);
        warn!(generation, "upstream connection closed");

        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("reconnect already scheduled");
            return;
        }

        let this = Arc::clone(self);
        self.track_connect_task(tokio::spawn(async move {
            tokio::time::sleep(this.settings.disconnect_delay).await;
            this.state.send_replace(ConnectionState::Reconnecting);
            info!("reconnecting to upstream aggregator");
            this.connect().await;
        }));
    }

    /// Generation of the current (or most recent) connection.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn session(&self) -> Result<Arc<dyn UpstreamSession>, UpstreamError> {
        self.live
            .read()
            .as_ref()
            .map(|l| Arc::clone(&l.session))
            .ok_or(UpstreamError::NotConnected)
    }

    /// Fetch the current upstream catalog. Not retried.
    pub async fn list_operations(&self) -> Result<Vec<UpstreamOperation>, UpstreamError> {
        self.session()?.list_operations().await
    }

    /// Forward one call to the aggregator. Not retried: calls are not
    /// assumed idempotent.
    pub async fn invoke(&self, name: &str, arguments: Value) -> Result<Value, UpstreamError> {
        self.session()?.invoke(name, arguments).await
    }

    /// Stop connecting and polling, then close the session.
    pub async fn shutdown(&self) {
        if let Some(task) = self.connect_task.lock().take() {
            task.abort();
        }
        self.reconnecting.store(false, Ordering::Release);
        self.stop_polling();
        let live = self.live.write().take();
        self.state.send_replace(ConnectionState::Disconnected);
        if let Some(live) = live {
            live.session.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence_caps_at_max() {
        let s = SupervisorSettings::default();
        let delays: Vec<u64> = (1..=8).map(|n| s.backoff(n).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 30, 30, 30, 30]);
    }

    #[test]
    fn test_backoff_huge_attempt_does_not_overflow() {
        let s = SupervisorSettings::default();
        assert_eq!(s.backoff(u32::MAX), Duration::from_secs(30));
        assert_eq!(s.backoff(0), Duration::from_secs(2));
    }
}
