//! Connectivity detection and state management.
//!
//! The client is considered online only when the OS reports a network, the
//! probe host resolves, and a `HEAD` request against it answers with a
//! 2xx/3xx status, all within the probe timeout. Any failing step means
//! offline; probe errors are never surfaced to callers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Url;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::SyncError;

pub use crate::types::ConnectivityState;

/// The three checks behind a connectivity probe.
#[async_trait]
pub trait NetworkProbe: Send + Sync {
    /// Whether the OS has a usable network route.
    async fn os_reports_online(&self) -> bool;

    /// Whether the probe host resolves through DNS.
    async fn resolves(&self) -> bool;

    /// Whether a `HEAD` request to the probe URL answers with 200..400.
    async fn head_ok(&self) -> bool;
}

/// Probe backed by the real network stack.
#[derive(Debug, Clone)]
pub struct SystemProbe {
    host: String,
    url: Url,
    client: reqwest::Client,
}

impl SystemProbe {
    pub fn new(host: String, url: Url, timeout: Duration) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            // A redirect already proves the server is reachable.
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| SyncError::Network(format!("failed to build probe client: {e}")))?;
        Ok(Self { host, url, client })
    }
}

#[async_trait]
impl NetworkProbe for SystemProbe {
    async fn os_reports_online(&self) -> bool {
        // Connecting a UDP socket sends nothing; it only asks the OS for a route.
        let Ok(socket) = tokio::net::UdpSocket::bind("0.0.0.0:0").await else {
            return false;
        };
        socket.connect("1.1.1.1:53").await.is_ok()
    }

    async fn resolves(&self) -> bool {
        match tokio::net::lookup_host((self.host.as_str(), 443)).await {
            Ok(mut addrs) => addrs.next().is_some(),
            Err(err) => {
                tracing::debug!(host = %self.host, error = %err, "probe host did not resolve");
                false
            }
        }
    }

    async fn head_ok(&self) -> bool {
        match self.client.head(self.url.clone()).send().await {
            Ok(resp) => (200..400).contains(&resp.status().as_u16()),
            Err(err) => {
                tracing::debug!(url = %self.url, error = %err, "probe request failed");
                false
            }
        }
    }
}

/// Timing of the connectivity loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSettings {
    pub interval: Duration,
    /// Delay of the extra check after an online→offline transition.
    pub offline_recheck: Duration,
    pub probe_timeout: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            offline_recheck: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// Owns the process-wide [`ConnectivityState`].
///
/// The state starts offline and unchecked; it is only mutated here, and
/// subscribers see a change only on an online/offline transition.
pub struct ConnectivityMonitor {
    probe: Arc<dyn NetworkProbe>,
    settings: MonitorSettings,
    state: watch::Sender<ConnectivityState>,
    /// Serializes probes; waiters reuse the result of the probe they waited on.
    probe_lock: Mutex<()>,
    probes_completed: AtomicU64,
    shutdown: Notify,
}

impl ConnectivityMonitor {
    pub fn new(probe: Arc<dyn NetworkProbe>, settings: MonitorSettings) -> Self {
        let (state, _) = watch::channel(ConnectivityState::unknown());
        Self {
            probe,
            settings,
            state,
            probe_lock: Mutex::new(()),
            probes_completed: AtomicU64::new(0),
            shutdown: Notify::new(),
        }
    }

    /// Last known status; never blocks.
    pub fn current_status(&self) -> bool {
        self.state.borrow().online
    }

    pub fn state(&self) -> ConnectivityState {
        *self.state.borrow()
    }

    /// Receiver that wakes on every online/offline transition.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state.subscribe()
    }

    pub fn require_online(&self) -> Result<(), SyncError> {
        if self.current_status() {
            Ok(())
        } else {
            Err(SyncError::Offline)
        }
    }

    /// Probe now and return the fresh status.
    ///
    /// A caller arriving while a probe is in flight waits for it and returns
    /// its result instead of starting another one.
    pub async fn refresh_status(&self) -> bool {
        let seen = self.probes_completed.load(Ordering::Acquire);
        let _guard = self.probe_lock.lock().await;
        if self.probes_completed.load(Ordering::Acquire) != seen {
            return self.current_status();
        }

        let online = self.probe_once().await;
        self.record(online);
        self.probes_completed.fetch_add(1, Ordering::AcqRel);
        online
    }

    async fn probe_once(&self) -> bool {
        let checks = async {
            if !self.probe.os_reports_online().await {
                tracing::debug!("OS reports no network");
                return false;
            }
            if !self.probe.resolves().await {
                return false;
            }
            self.probe.head_ok().await
        };

        match tokio::time::timeout(self.settings.probe_timeout, checks).await {
            Ok(online) => online,
            Err(_) => {
                tracing::debug!(timeout = ?self.settings.probe_timeout, "connectivity probe timed out");
                false
            }
        }
    }

    fn record(&self, online: bool) {
        let now = Utc::now();
        let changed = self.state.send_if_modified(|state| {
            let changed = state.online != online;
            state.online = online;
            state.last_checked_at = Some(now);
            changed
        });
        if changed {
            tracing::info!(online, "network status changed");
        }
    }

    /// Spawn the background probe loop.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move { monitor.run().await })
    }

    /// Probe on a fixed interval until [`shutdown`](Self::shutdown) is called.
    pub async fn run(&self) {
        tracing::info!(interval = ?self.settings.interval, "connectivity monitor started");

        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                _ = ticker.tick() => {
                    let was_online = self.current_status();
                    let online = self.refresh_status().await;
                    if was_online && !online {
                        tokio::select! {
                            _ = self.shutdown.notified() => break,
                            _ = tokio::time::sleep(self.settings.offline_recheck) => {
                                self.refresh_status().await;
                            }
                        }
                    }
                }
            }
        }

        tracing::info!("connectivity monitor stopped");
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

impl std::fmt::Debug for ConnectivityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectivityMonitor")
            .field("settings", &self.settings)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    /// Scriptable probe that counts how often each check runs.
    #[derive(Debug)]
    pub(crate) struct FakeProbe {
        pub os: AtomicBool,
        pub dns: AtomicBool,
        pub head: AtomicBool,
        pub head_delay: Duration,
        pub os_calls: AtomicUsize,
        pub head_calls: AtomicUsize,
    }

    impl FakeProbe {
        pub(crate) fn online() -> Self {
            Self::with_delay(Duration::ZERO)
        }

        pub(crate) fn offline() -> Self {
            let probe = Self::online();
            probe.os.store(false, Ordering::SeqCst);
            probe
        }

        pub(crate) fn with_delay(head_delay: Duration) -> Self {
            Self {
                os: AtomicBool::new(true),
                dns: AtomicBool::new(true),
                head: AtomicBool::new(true),
                head_delay,
                os_calls: AtomicUsize::new(0),
                head_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl NetworkProbe for FakeProbe {
        async fn os_reports_online(&self) -> bool {
            self.os_calls.fetch_add(1, Ordering::SeqCst);
            self.os.load(Ordering::SeqCst)
        }

        async fn resolves(&self) -> bool {
            self.dns.load(Ordering::SeqCst)
        }

        async fn head_ok(&self) -> bool {
            self.head_calls.fetch_add(1, Ordering::SeqCst);
            if !self.head_delay.is_zero() {
                tokio::time::sleep(self.head_delay).await;
            }
            self.head.load(Ordering::SeqCst)
        }
    }

    /// Monitor that has already observed one probe with `probe`.
    pub(crate) async fn probed_monitor(probe: FakeProbe) -> Arc<ConnectivityMonitor> {
        let monitor = Arc::new(ConnectivityMonitor::new(Arc::new(probe), MonitorSettings::default()));
        monitor.refresh_status().await;
        monitor
    }

    #[tokio::test]
    async fn starts_offline_and_unchecked() {
        let monitor = ConnectivityMonitor::new(Arc::new(FakeProbe::online()), MonitorSettings::default());
        assert!(!monitor.current_status());
        assert_eq!(monitor.state().last_checked_at, None);
        assert!(matches!(monitor.require_online(), Err(SyncError::Offline)));

        assert!(monitor.refresh_status().await);
        assert!(monitor.state().last_checked_at.is_some());
        assert!(monitor.require_online().is_ok());
    }

    #[tokio::test]
    async fn dns_failure_means_offline_even_if_os_is_online() {
        let probe = Arc::new(FakeProbe::online());
        probe.dns.store(false, Ordering::SeqCst);
        let monitor = ConnectivityMonitor::new(probe.clone(), MonitorSettings::default());

        assert!(!monitor.refresh_status().await);
        assert_eq!(probe.head_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failing_head_means_offline() {
        let probe = Arc::new(FakeProbe::online());
        probe.head.store(false, Ordering::SeqCst);
        let monitor = ConnectivityMonitor::new(probe, MonitorSettings::default());
        assert!(!monitor.refresh_status().await);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_connectivity_check_times_out_as_offline() {
        let monitor = ConnectivityMonitor::new(
            Arc::new(FakeProbe::with_delay(Duration::from_secs(10))),
            MonitorSettings::default(),
        );
        assert!(!monitor.refresh_status().await);
    }

    #[tokio::test]
    async fn subscribers_only_see_transitions() {
        let probe = Arc::new(FakeProbe::online());
        let monitor = ConnectivityMonitor::new(probe.clone(), MonitorSettings::default());
        let mut rx = monitor.subscribe();

        monitor.refresh_status().await;
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().online);

        monitor.refresh_status().await;
        assert!(!rx.has_changed().unwrap());

        probe.os.store(false, Ordering::SeqCst);
        monitor.refresh_status().await;
        assert!(rx.has_changed().unwrap());
        assert!(!rx.borrow_and_update().online);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_refreshes_share_one_check() {
        let probe = Arc::new(FakeProbe::with_delay(Duration::from_millis(200)));
        let monitor = ConnectivityMonitor::new(probe.clone(), MonitorSettings::default());

        let (a, b) = tokio::join!(monitor.refresh_status(), monitor.refresh_status());

        assert!(a && b);
        assert_eq!(probe.os_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn going_offline_schedules_a_fast_recheck() {
        let probe = Arc::new(FakeProbe::online());
        let monitor = Arc::new(ConnectivityMonitor::new(probe.clone(), MonitorSettings::default()));
        let handle = monitor.start();

        // t=0: first tick, online.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(monitor.current_status());
        assert_eq!(probe.os_calls.load(Ordering::SeqCst), 1);

        // t=3: tick sees the network gone.
        probe.os.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!monitor.current_status());
        assert_eq!(probe.os_calls.load(Ordering::SeqCst), 2);

        // t=4: recheck, well before the next tick at t=6.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(probe.os_calls.load(Ordering::SeqCst), 3);

        monitor.shutdown();
        handle.await.unwrap();
    }
}
