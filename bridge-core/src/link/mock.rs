//! Scriptable [`StationLink`] for tests and hardware-less runs.

use crate::config::ApConfig;
use crate::traits::StationLink;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct LinkState {
    connected: bool,
    /// SSID that associates successfully; `None` accepts nothing.
    accepted: Option<String>,
    accept_all: bool,
    fail_probe: bool,
    /// Number of upcoming `start_access_point` calls that fail.
    failing_ap_starts: usize,
    attempts: Vec<String>,
    ap_active: bool,
    ap_starts: usize,
    ap_stops: usize,
}

#[derive(Debug, Default)]
pub struct MockLink {
    state: Mutex<LinkState>,
}

impl MockLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A link on which every connect attempt succeeds.
    pub fn accepting_all() -> Self {
        let link = Self::new();
        link.state().accept_all = true;
        link
    }

    fn state(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn accept(&self, ssid: &str) {
        self.state().accepted = Some(ssid.to_string());
    }

    pub fn set_connected(&self, connected: bool) {
        self.state().connected = connected;
    }

    /// Makes `is_connected` fail, as a dead wpa_supplicant socket would.
    pub fn set_probe_failure(&self, fail: bool) {
        self.state().fail_probe = fail;
    }

    /// Fails the next `count` access point starts, as a busy radio would.
    pub fn fail_ap_starts(&self, count: usize) {
        self.state().failing_ap_starts = count;
    }

    pub fn attempts(&self) -> Vec<String> {
        self.state().attempts.clone()
    }

    pub fn ap_active(&self) -> bool {
        self.state().ap_active
    }

    pub fn ap_starts(&self) -> usize {
        self.state().ap_starts
    }

    pub fn ap_stops(&self) -> usize {
        self.state().ap_stops
    }
}

#[async_trait]
impl StationLink for MockLink {
    async fn is_connected(&self) -> Result<bool> {
        let st = self.state();
        if st.fail_probe {
            return Err(Error::CommandFailed("wpa_cli status failed (mock)".into()));
        }
        Ok(st.connected)
    }

    async fn begin_connect(&self, ssid: &str, _password: &str) -> Result<()> {
        let mut st = self.state();
        st.attempts.push(ssid.to_string());
        st.connected = st.accept_all || st.accepted.as_deref() == Some(ssid);
        Ok(())
    }

    async fn start_access_point(&self, _ap: &ApConfig) -> Result<()> {
        let mut st = self.state();
        st.ap_starts += 1;
        if st.failing_ap_starts > 0 {
            st.failing_ap_starts -= 1;
            return Err(Error::CommandFailed("hostapd failed to start (mock)".into()));
        }
        st.ap_active = true;
        Ok(())
    }

    async fn stop_access_point(&self) -> Result<()> {
        let mut st = self.state();
        st.ap_active = false;
        st.ap_stops += 1;
        Ok(())
    }
}
