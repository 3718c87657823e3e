//! Connectivity supervisor: keeps the device reachable.
//!
//! The device either sits on the configured upstream network as a station,
//! or (when that is impossible) serves a local fallback access point so the
//! operator can reach the configuration pages. The fallback is an overlay on
//! top of the station state: while the station is down, the AP stays up and
//! connection attempts keep being retried at a fixed interval.

use crate::config::{ApConfig, StationCredentials, SupervisorConfig};
use crate::traits::StationLink;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Poll cadence while waiting for the first association at boot.
pub const BOOT_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkPhase {
    Disconnected,
    Connecting,
    Connected,
}

/// Fallback AP and retry bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct ConnectivityState {
    pub captive_active: bool,
    /// The fallback AP is actually up; may lag `captive_active` after a
    /// failed start.
    pub ap_running: bool,
    pub reconnect_pending: bool,
    pub last_attempt: Option<Instant>,
}

/// Snapshot served to the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SupervisorStatus {
    pub phase: LinkPhase,
    pub captive_portal: bool,
    pub reconnect_pending: bool,
    pub wifi_connected: bool,
}

pub struct ConnectivitySupervisor {
    link: Arc<dyn StationLink>,
    ap: ApConfig,
    cfg: SupervisorConfig,
    state: ConnectivityState,
    phase: LinkPhase,
    /// Set by [`request_reconnect`](Self::request_reconnect); an existing
    /// association is for the old credentials and does not count.
    credentials_changed: bool,
}

impl ConnectivitySupervisor {
    pub fn new(link: Arc<dyn StationLink>, ap: ApConfig, cfg: SupervisorConfig) -> Self {
        Self {
            link,
            ap,
            cfg,
            state: ConnectivityState::default(),
            phase: LinkPhase::Disconnected,
            credentials_changed: false,
        }
    }

    pub fn is_captive(&self) -> bool {
        self.state.captive_active
    }

    pub fn state(&self) -> &ConnectivityState {
        &self.state
    }

    pub fn status(&self) -> SupervisorStatus {
        SupervisorStatus {
            phase: self.phase,
            captive_portal: self.state.captive_active,
            reconnect_pending: self.state.reconnect_pending,
            wifi_connected: self.phase == LinkPhase::Connected,
        }
    }

    /// First connection at startup. Waits up to the initial connect timeout;
    /// on failure, or without credentials, the fallback AP comes up.
    pub async fn boot(&mut self, creds: &StationCredentials) {
        if !creds.is_configured() {
            tracing::info!("No WiFi configuration found, enabling captive portal");
            self.enter_captive().await;
            return;
        }

        self.attempt(creds).await;

        let deadline = Instant::now() + self.cfg.initial_connect_timeout;
        loop {
            if self.probe().await {
                tracing::info!(ssid = %creds.ssid, "✅ WiFi connected");
                return;
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(BOOT_POLL_INTERVAL).await;
        }

        tracing::warn!(
            ssid = %creds.ssid,
            "Initial WiFi connection failed, enabling captive portal"
        );
        self.enter_captive().await;
        self.state.reconnect_pending = true;
    }

    /// One scheduler step.
    pub async fn tick(&mut self, creds: &StationCredentials) {
        let was_connected = self.phase == LinkPhase::Connected;
        let connected = self.probe().await;

        if connected && !self.credentials_changed {
            if !was_connected {
                tracing::info!("✅ WiFi connected");
            }
            self.state.reconnect_pending = false;
            if self.state.captive_active {
                self.leave_captive().await;
            }
            return;
        }

        if was_connected && !connected {
            tracing::warn!("WiFi connection lost");
        }

        if self.state.captive_active && !self.state.ap_running {
            self.start_ap().await;
        }

        if !creds.is_configured() {
            self.enter_captive().await;
            return;
        }

        self.enter_captive().await;

        let due = match self.state.last_attempt {
            None => true,
            Some(at) => at.elapsed() > self.cfg.reconnect_interval,
        };
        if self.state.reconnect_pending || due {
            self.attempt(creds).await;
            self.state.reconnect_pending = false;
            self.credentials_changed = false;
        }
    }

    /// Called after the station credentials changed: retry on the next tick
    /// and keep the configuration pages reachable meanwhile.
    pub async fn request_reconnect(&mut self) {
        self.state.reconnect_pending = true;
        self.state.last_attempt = None;
        self.credentials_changed = true;
        self.enter_captive().await;
    }

    async fn probe(&mut self) -> bool {
        let connected = match self.link.is_connected().await {
            Ok(c) => c,
            Err(e) => {
                tracing::debug!("Station status probe failed: {}", e);
                false
            }
        };
        if connected {
            self.phase = LinkPhase::Connected;
        } else if self.phase == LinkPhase::Connected {
            self.phase = LinkPhase::Disconnected;
        }
        connected
    }

    async fn attempt(&mut self, creds: &StationCredentials) {
        tracing::info!(ssid = %creds.ssid, "Connecting to WiFi");
        self.state.last_attempt = Some(Instant::now());
        match self.link.begin_connect(&creds.ssid, &creds.password).await {
            Ok(()) => self.phase = LinkPhase::Connecting,
            Err(e) => {
                tracing::warn!(ssid = %creds.ssid, "Connect attempt failed: {}", e);
                self.phase = LinkPhase::Disconnected;
            }
        }
    }

    async fn enter_captive(&mut self) {
        if self.state.captive_active {
            return;
        }
        tracing::info!(ssid = %self.ap.ssid, "Starting captive portal");
        // 即使热点启动失败也视为门户模式，热点在后续 tick 中重试
        self.state.captive_active = true;
        self.start_ap().await;
    }

    async fn start_ap(&mut self) {
        match self.link.start_access_point(&self.ap).await {
            Ok(()) => self.state.ap_running = true,
            Err(e) => tracing::error!("Failed to start fallback AP: {}", e),
        }
    }

    async fn leave_captive(&mut self) {
        if !self.state.captive_active {
            return;
        }
        tracing::info!("Stopping captive portal");
        if let Err(e) = self.link.stop_access_point().await {
            tracing::warn!("Failed to stop fallback AP: {}", e);
        }
        self.state.captive_active = false;
        self.state.ap_running = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::builtin_config;
    use crate::link::MockLink;

    fn creds(ssid: &str) -> StationCredentials {
        StationCredentials {
            ssid: ssid.into(),
            password: "secret-pw".into(),
        }
    }

    fn supervisor(link: &Arc<MockLink>) -> ConnectivitySupervisor {
        let app = builtin_config().unwrap();
        ConnectivitySupervisor::new(link.clone(), app.ap, SupervisorConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn boot_without_credentials_starts_captive_only() {
        let link = Arc::new(MockLink::new());
        let mut sup = supervisor(&link);

        sup.boot(&StationCredentials::default()).await;

        assert!(sup.is_captive());
        assert!(link.ap_active());
        assert!(!sup.state().reconnect_pending);
        assert!(link.attempts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn boot_connects_within_timeout() {
        let link = Arc::new(MockLink::new());
        link.accept("Home");
        let mut sup = supervisor(&link);

        sup.boot(&creds("Home")).await;

        assert!(!sup.is_captive());
        assert_eq!(sup.status().phase, LinkPhase::Connected);
        assert_eq!(link.ap_starts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_boot_enters_captive_and_arms_reconnect() {
        let link = Arc::new(MockLink::new());
        let mut sup = supervisor(&link);

        let t0 = Instant::now();
        sup.boot(&creds("Home")).await;

        assert!(t0.elapsed() >= SupervisorConfig::default().initial_connect_timeout);
        assert!(sup.is_captive());
        assert!(sup.state().reconnect_pending);
        assert_eq!(link.attempts(), vec!["Home".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn tick_retries_on_interval() {
        let link = Arc::new(MockLink::new());
        let mut sup = supervisor(&link);
        sup.boot(&creds("Home")).await;

        // pending from boot: retried on the first tick
        sup.tick(&creds("Home")).await;
        assert_eq!(link.attempts().len(), 2);
        assert!(!sup.state().reconnect_pending);

        sup.tick(&creds("Home")).await;
        assert_eq!(link.attempts().len(), 2);

        tokio::time::advance(Duration::from_secs(31)).await;
        sup.tick(&creds("Home")).await;
        assert_eq!(link.attempts().len(), 3);
        assert!(sup.is_captive());
    }

    #[tokio::test(start_paused = true)]
    async fn connection_closes_captive_portal() {
        let link = Arc::new(MockLink::new());
        let mut sup = supervisor(&link);
        sup.boot(&creds("Home")).await;
        assert!(link.ap_active());

        link.set_connected(true);
        sup.tick(&creds("Home")).await;

        assert!(!sup.is_captive());
        assert!(!link.ap_active());
        assert_eq!(link.ap_stops(), 1);
        assert!(sup.status().wifi_connected);
        assert!(!sup.status().reconnect_pending);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_link_reopens_captive() {
        let link = Arc::new(MockLink::new());
        link.accept("Home");
        let mut sup = supervisor(&link);
        sup.boot(&creds("Home")).await;

        link.set_connected(false);
        sup.tick(&creds("Home")).await;

        assert!(sup.is_captive());
        assert_eq!(sup.status().phase, LinkPhase::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn credential_change_is_retried_even_while_connected() {
        let link = Arc::new(MockLink::new());
        link.accept("Home");
        let mut sup = supervisor(&link);
        sup.boot(&creds("Home")).await;

        sup.request_reconnect().await;
        assert!(sup.is_captive());
        assert!(sup.state().reconnect_pending);
        assert!(sup.state().last_attempt.is_none());

        sup.tick(&creds("Office")).await;
        assert_eq!(link.attempts().last().map(String::as_str), Some("Office"));
        assert!(!sup.state().reconnect_pending);
        assert!(sup.is_captive());
    }

    #[tokio::test(start_paused = true)]
    async fn cleared_credentials_keep_captive_without_attempts() {
        let link = Arc::new(MockLink::new());
        let mut sup = supervisor(&link);
        sup.boot(&StationCredentials::default()).await;

        tokio::time::advance(Duration::from_secs(60)).await;
        sup.tick(&StationCredentials::default()).await;

        assert!(sup.is_captive());
        assert!(link.attempts().is_empty());
        assert_eq!(link.ap_starts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_ap_start_is_retried_on_tick() {
        let link = Arc::new(MockLink::new());
        link.fail_ap_starts(1);
        let mut sup = supervisor(&link);

        sup.boot(&StationCredentials::default()).await;
        assert!(sup.is_captive());
        assert!(!sup.state().ap_running);
        assert!(!link.ap_active());

        tokio::time::advance(Duration::from_secs(31)).await;
        sup.tick(&StationCredentials::default()).await;
        assert!(sup.state().ap_running);
        assert!(link.ap_active());
        assert_eq!(link.ap_starts(), 2);

        sup.tick(&StationCredentials::default()).await;
        assert_eq!(link.ap_starts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_failure_counts_as_disconnected() {
        let link = Arc::new(MockLink::new());
        link.set_probe_failure(true);
        let mut sup = supervisor(&link);

        sup.tick(&creds("Home")).await;
        assert!(sup.is_captive());
        assert!(!sup.status().wifi_connected);
    }
}
