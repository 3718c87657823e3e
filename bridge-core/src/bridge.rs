//! Router-facing half of the controller: settings, the router client and
//! the scan slot, behind one owner so every request sees a consistent view.

use crate::config::{ConfigStore, RuntimeConfig, SettingsChange, SettingsUpdate, StationCredentials};
use crate::profiles::{ProfileOutcome, ProfileReconciler};
use crate::scan::{
    SCAN_CSV_FILENAME, SCAN_POLL_INTERVAL_MS, SCAN_RESULT_GRACE_MS, ScanOrchestrator,
    ScanPoll, ScanRequest, ScanTiming, StartOutcome,
};
use crate::traits::RouterApi;
use crate::wireless::{self, ConnectRequest};
use crate::Result;
use serde_json::{Value, json};
use std::sync::Arc;

/// Signal range the UI maps onto its strength bars.
pub const SIGNAL_MIN_DBM: i32 = -90;
pub const SIGNAL_MAX_DBM: i32 = -30;

pub struct Bridge {
    store: ConfigStore,
    router: Arc<dyn RouterApi>,
    scans: ScanOrchestrator,
}

impl Bridge {
    pub fn new(store: ConfigStore, router: Arc<dyn RouterApi>) -> Self {
        Self {
            store,
            router,
            scans: ScanOrchestrator::new(),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        self.store.current()
    }

    pub fn station(&self) -> StationCredentials {
        self.store.current().wifi.clone()
    }

    /// Band presets and scan timing for the UI.
    pub fn ui_config(&self) -> Value {
        let cfg = self.store.current();
        let timing = ScanTiming::for_duration(cfg.scan_duration_secs);
        json!({
            "band_2ghz": cfg.bands.band_2ghz,
            "band_5ghz": cfg.bands.band_5ghz,
            "scan_duration_ms": timing.duration_ms,
            "scan_min_ready_ms": timing.min_ready_ms,
            "scan_result_grace_ms": SCAN_RESULT_GRACE_MS,
            "scan_timeout_ms": timing.timeout_ms,
            "scan_poll_interval_ms": SCAN_POLL_INTERVAL_MS,
            "scan_csv_filename": SCAN_CSV_FILENAME,
            "signal_min_dbm": SIGNAL_MIN_DBM,
            "signal_max_dbm": SIGNAL_MAX_DBM,
        })
    }

    /// Current settings with secrets reduced to presence flags.
    pub fn settings_view(&self) -> Value {
        let cfg = self.store.current();
        json!({
            "wifi": {
                "ssid": cfg.wifi.ssid,
                "has_password": !cfg.wifi.password.is_empty(),
            },
            "mikrotik": {
                "ip": cfg.router.address,
                "user": cfg.router.user,
                "has_password": !cfg.router.password.is_empty(),
                "has_token": !cfg.router.token.is_empty(),
                "wlan_interface": cfg.router.wlan_interface,
            },
            "bands": {
                "band_2ghz": cfg.bands.band_2ghz,
                "band_5ghz": cfg.bands.band_5ghz,
            },
            "scan": {
                "duration_seconds": cfg.scan_duration_secs,
            },
        })
    }

    /// Persists a partial settings update; a changed router account is
    /// pushed to the client right away.
    pub fn update_settings(&mut self, update: SettingsUpdate) -> Result<SettingsChange> {
        let change = self.store.apply(update)?;
        if change.router_changed {
            let endpoint = self.store.current().endpoint();
            tracing::info!(address = %endpoint.address, "Router account changed");
            self.router.configure(&endpoint);
        }
        Ok(change)
    }

    /// `band` falls back to the 2.4 GHz preset.
    pub async fn start_scan(&mut self, band: Option<&str>) -> Result<StartOutcome> {
        let cfg = self.store.current();
        let band = band
            .filter(|b| !b.is_empty())
            .unwrap_or(&cfg.bands.band_2ghz);
        let req = ScanRequest {
            interface: &cfg.router.wlan_interface,
            band,
            duration_secs: cfg.scan_duration_secs,
        };
        self.scans.start(self.router.as_ref(), &req).await
    }

    pub async fn scan_result(&mut self) -> ScanPoll {
        self.scans.result(self.router.as_ref()).await
    }

    pub async fn prefetch_scan(&mut self) {
        self.scans.prefetch(self.router.as_ref()).await;
    }

    pub fn is_scanning(&self) -> bool {
        self.scans.is_scanning()
    }

    pub async fn connect(&self, req: &ConnectRequest) -> Result<ProfileOutcome> {
        let cfg = self.store.current();
        wireless::connect(
            self.router.as_ref(),
            &cfg.router.wlan_interface,
            req,
            &cfg.bands.band_2ghz,
        )
        .await
    }

    pub async fn disconnect(&self) -> Result<()> {
        let iface = &self.store.current().router.wlan_interface;
        wireless::disconnect(self.router.as_ref(), iface).await
    }

    pub async fn delete_profile(&self, ssid: Option<&str>, name: Option<&str>) -> Result<String> {
        ProfileReconciler::new(self.router.as_ref())
            .delete_managed(ssid, name)
            .await
    }

    pub async fn router_status(&self) -> Value {
        wireless::router_status(self.router.as_ref()).await
    }
}
