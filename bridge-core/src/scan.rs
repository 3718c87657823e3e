//! Non-blocking scan orchestration.
//!
//! A router scan runs for several seconds, far longer than any single HTTP
//! request to this device should take. The work is therefore split in two:
//! [`ScanOrchestrator::start`] triggers the scan and returns at once with the
//! timing bounds, and the caller then polls [`ScanOrchestrator::result`].
//! Each poll does at most one cheap check against the router, and none at
//! all before the scan could possibly have finished.

use crate::profiles::{ProfileReconciler, ProfileSummary};
use crate::router;
use crate::storage;
use crate::traits::{Method, RouterApi};
use crate::wireless;
use crate::Result;
use serde::Serialize;
use serde_json::json;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;

/// Extra time granted after the nominal scan duration before giving up.
pub const SCAN_RESULT_GRACE_MS: u64 = 5_000;
/// Cadence at which callers are told to poll.
pub const SCAN_POLL_INTERVAL_MS: u64 = 1_000;
/// Pause after switching bands so the router applies it before scanning.
pub const BAND_SETTLE_DELAY: Duration = Duration::from_millis(500);
/// The trigger call is fire-and-forget; this only bounds how long we wait
/// for the request to go out.
pub const TRIGGER_TIMEOUT: Duration = Duration::from_millis(500);
/// Export file the router writes, inside the scratch tmpfs.
pub const SCAN_CSV_FILENAME: &str = "tmp1/wifi-scan.csv";

/// Timing bounds of one scan, all in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScanTiming {
    pub duration_ms: u64,
    pub min_ready_ms: u64,
    pub timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl ScanTiming {
    pub fn for_duration(duration_secs: u32) -> Self {
        let duration_ms = u64::from(duration_secs.max(1)) * 1000;
        Self {
            duration_ms,
            // the router cannot have finished before its own scan duration
            min_ready_ms: duration_ms,
            timeout_ms: duration_ms + SCAN_RESULT_GRACE_MS + SCAN_POLL_INTERVAL_MS,
            poll_interval_ms: SCAN_POLL_INTERVAL_MS,
        }
    }

    fn min_ready(&self) -> Duration {
        Duration::from_millis(self.min_ready_ms)
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// What to scan.
#[derive(Debug, Clone)]
pub struct ScanRequest<'a> {
    pub interface: &'a str,
    pub band: &'a str,
    pub duration_secs: u32,
}

/// Response of a successful start.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanStarted {
    pub status: &'static str,
    #[serde(flatten)]
    pub timing: ScanTiming,
    pub csv_filename: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    Started(ScanStarted),
    AlreadyScanning,
}

/// Payload delivered once the export is available.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanReport {
    pub csv: String,
    pub band: String,
    /// Managed profiles for networks that appear in `csv`.
    pub profiles: Vec<ProfileSummary>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScanPoll {
    Pending,
    NoResult,
    Timeout,
    Ready(ScanReport),
}

#[derive(Debug, Clone)]
struct ActiveScan {
    started_at: Instant,
    band: String,
    artifact: String,
    timing: ScanTiming,
}

#[derive(Debug, Default)]
enum ScanState {
    #[default]
    Idle,
    InProgress(ActiveScan),
    /// Result fetched ahead of the caller's poll, awaiting delivery.
    Ready(ScanReport),
}

/// Exported scan file found on the router.
struct Artifact {
    id: String,
    csv: String,
}

/// Owns the single scan slot. At most one scan is in flight; callers hold
/// it by exclusive reference, so there is nothing to lock here.
#[derive(Debug, Default)]
pub struct ScanOrchestrator {
    state: ScanState,
}

impl ScanOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, ScanState::Idle)
    }

    pub fn is_scanning(&self) -> bool {
        matches!(self.state, ScanState::InProgress(_))
    }

    /// Triggers a scan and returns its timing without waiting for it.
    ///
    /// Refused (not queued) while a previous scan has not been delivered.
    /// Interface and storage problems abort before the scan slot is taken.
    pub async fn start(
        &mut self,
        api: &dyn RouterApi,
        req: &ScanRequest<'_>,
    ) -> Result<StartOutcome> {
        if !self.is_idle() {
            return Ok(StartOutcome::AlreadyScanning);
        }

        let iface = wireless::find_interface(api, req.interface).await?;

        if !req.band.is_empty() && iface.band != req.band {
            tracing::info!(from = %iface.band, to = req.band, "Switching router band before scan");
            wireless::set_band(api, &iface, req.band).await?;
            tokio::time::sleep(BAND_SETTLE_DELAY).await;
        }

        storage::ensure(api).await.inspect_err(|e| {
            tracing::warn!("tmpfs unavailable: {}", e);
        })?;

        let timing = ScanTiming::for_duration(req.duration_secs);
        let artifact = SCAN_CSV_FILENAME.to_string();

        // Taken before the trigger goes out, so a poll right after start
        // sees "pending" rather than "no scan".
        self.state = ScanState::InProgress(ActiveScan {
            started_at: Instant::now(),
            band: req.band.to_string(),
            artifact: artifact.clone(),
            timing,
        });

        trigger(api, req, &artifact).await;

        tracing::info!(
            band = req.band,
            duration_ms = timing.duration_ms,
            timeout_ms = timing.timeout_ms,
            "🔍 Scan started"
        );
        Ok(StartOutcome::Started(ScanStarted {
            status: "started",
            timing,
            csv_filename: artifact,
        }))
    }

    /// Polls for the scan result. A success payload is delivered exactly once.
    pub async fn result(&mut self, api: &dyn RouterApi) -> ScanPoll {
        if let Some(report) = self.take_ready() {
            return ScanPoll::Ready(report);
        }

        let Some(active) = self.active() else {
            return ScanPoll::NoResult;
        };

        let elapsed = active.started_at.elapsed();
        if elapsed < active.timing.min_ready() {
            return ScanPoll::Pending;
        }

        if elapsed > active.timing.timeout() {
            tracing::warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                limit_ms = active.timing.timeout_ms,
                "Scan timeout"
            );
            self.state = ScanState::Idle;
            storage::release_best_effort(api).await;
            return ScanPoll::Timeout;
        }

        match self.collect(api, &active).await {
            Some(report) => ScanPoll::Ready(report),
            None => ScanPoll::Pending,
        }
    }

    /// Same single check as [`result`](Self::result), run from the scheduler
    /// tick. A finished result is buffered for the next poll. Timeouts are
    /// left to `result`.
    pub async fn prefetch(&mut self, api: &dyn RouterApi) {
        let Some(active) = self.active() else {
            return;
        };
        let elapsed = active.started_at.elapsed();
        if elapsed < active.timing.min_ready() || elapsed > active.timing.timeout() {
            return;
        }
        if let Some(report) = self.collect(api, &active).await {
            tracing::debug!("Scan result prefetched");
            self.state = ScanState::Ready(report);
        }
    }

    fn take_ready(&mut self) -> Option<ScanReport> {
        match std::mem::take(&mut self.state) {
            ScanState::Ready(report) => Some(report),
            other => {
                self.state = other;
                None
            }
        }
    }

    fn active(&self) -> Option<ActiveScan> {
        match &self.state {
            ScanState::InProgress(active) => Some(active.clone()),
            _ => None,
        }
    }

    /// Looks for the export once; on success builds the report, frees the
    /// scan slot and cleans up the router side.
    async fn collect(&mut self, api: &dyn RouterApi, active: &ActiveScan) -> Option<ScanReport> {
        let artifact = find_artifact(api, &active.artifact).await?;

        let profiles = match ProfileReconciler::new(api).managed_profiles().await {
            Ok(profiles) => profiles,
            Err(e) => {
                tracing::warn!("Failed to list security profiles for scan result: {}", e);
                Vec::new()
            }
        };
        let seen = artifact_fields(&artifact.csv);
        let profiles = profiles
            .into_iter()
            .filter(|p| seen.contains(p.ssid.as_str()))
            .collect();

        self.state = ScanState::Idle;

        if !artifact.id.is_empty() {
            let body = json!({ "numbers": artifact.id });
            if let Err(e) = router::send(api, Method::Post, "/file/remove", Some(&body)).await {
                tracing::warn!("Failed to delete scan export: {}", e);
            }
        }
        storage::release_best_effort(api).await;

        tracing::info!(band = %active.band, "✅ Scan result collected");
        Some(ScanReport {
            csv: artifact.csv,
            band: active.band.clone(),
            profiles,
        })
    }
}

/// Issues the scan and does not wait for it to complete. The router keeps
/// scanning after the short request timeout fires; the export file is the
/// only result we rely on, so the response (or its absence) is discarded.
async fn trigger(api: &dyn RouterApi, req: &ScanRequest<'_>, artifact: &str) {
    let body = json!({
        ".id": req.interface,
        "duration": req.duration_secs.to_string(),
        "save-file": artifact,
    });
    if let Err(e) = api
        .request(Method::Post, "/interface/wireless/scan", Some(&body), TRIGGER_TIMEOUT)
        .await
    {
        tracing::debug!("Scan trigger not acknowledged (expected): {}", e);
    }
}

/// A listing failure counts as "not there yet"; the caller polls again.
async fn find_artifact(api: &dyn RouterApi, name: &str) -> Option<Artifact> {
    let files = match router::get_list(api, "/file").await {
        Ok(files) => files,
        Err(e) => {
            tracing::warn!("File listing failed, reporting pending: {}", e);
            return None;
        }
    };

    files
        .iter()
        .filter(|f| router::field(f, "name") == name)
        .find(|f| !router::field(f, "contents").is_empty())
        .map(|f| Artifact {
            id: router::field(f, ".id").to_string(),
            csv: router::field(f, "contents").to_string(),
        })
}

/// Every unquoted field of every row of the export.
fn artifact_fields(csv: &str) -> HashSet<&str> {
    csv.lines().flat_map(split_csv_line).filter(|f| !f.is_empty()).collect()
}

/// Splits one CSV row on commas outside double quotes, stripping the quotes.
fn split_csv_line(line: &str) -> Vec<&str> {
    let mut fields = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in line.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                fields.push(unquote(&line[start..i]));
                start = i + 1;
            }
            _ => {}
        }
    }
    fields.push(unquote(&line[start..]));
    fields
}

fn unquote(field: &str) -> &str {
    let f = field.trim();
    f.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::mock::MockRouter;

    const CSV: &str = "\"AA:BB:CC:00:00:01\",\"Home, Sweet\",\"2412/20/gn\",\"-50\"\n\
                       \"AA:BB:CC:00:00:02\",\"Cafe\",\"2437/20/gn\",\"-70\"\n";

    fn request(band: &str) -> ScanRequest<'_> {
        ScanRequest {
            interface: "wlan1",
            band,
            duration_secs: 4,
        }
    }

    fn router() -> MockRouter {
        MockRouter::new().with_interface("wlan1", "2ghz-b/g/n")
    }

    fn started(outcome: StartOutcome) -> ScanStarted {
        match outcome {
            StartOutcome::Started(s) => s,
            StartOutcome::AlreadyScanning => panic!("expected a started scan"),
        }
    }

    #[test]
    fn timing_bounds() {
        let t = ScanTiming::for_duration(4);
        assert_eq!(t.duration_ms, 4_000);
        assert_eq!(t.min_ready_ms, 4_000);
        assert_eq!(t.timeout_ms, 4_000 + SCAN_RESULT_GRACE_MS + SCAN_POLL_INTERVAL_MS);
        assert_eq!(t.poll_interval_ms, SCAN_POLL_INTERVAL_MS);
    }

    #[test]
    fn csv_fields_respect_quotes() {
        assert_eq!(
            split_csv_line(r#""a","b, c",d , "" "#),
            vec!["a", "b, c", "d", ""]
        );
        let fields = artifact_fields(CSV);
        assert!(fields.contains("Home, Sweet"));
        assert!(fields.contains("Cafe"));
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_is_rejected_without_side_effects() {
        let router = router();
        let mut scans = ScanOrchestrator::new();

        started(scans.start(&router, &request("2ghz-b/g/n")).await.unwrap());
        router.clear_calls();

        let again = scans.start(&router, &request("5ghz-a/n/ac")).await.unwrap();
        assert_eq!(again, StartOutcome::AlreadyScanning);
        assert!(router.calls().is_empty());
        assert!(scans.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn early_poll_does_not_touch_the_router() {
        let router = router();
        let mut scans = ScanOrchestrator::new();
        started(scans.start(&router, &request("2ghz-b/g/n")).await.unwrap());

        assert_eq!(scans.result(&router).await, ScanPoll::Pending);
        tokio::time::advance(Duration::from_millis(3_900)).await;
        assert_eq!(scans.result(&router).await, ScanPoll::Pending);

        assert_eq!(router.count(Method::Get, "/file"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn band_switch_precedes_trigger_with_settle_delay() {
        let router = router();
        let mut scans = ScanOrchestrator::new();

        let t0 = Instant::now();
        started(scans.start(&router, &request("5ghz-a/n/ac")).await.unwrap());
        assert!(t0.elapsed() >= BAND_SETTLE_DELAY);

        let calls = router.calls();
        let patch = calls
            .iter()
            .position(|c| c.method == Method::Patch && c.path.starts_with("/interface/wireless/"))
            .expect("band patch");
        let trigger = calls
            .iter()
            .position(|c| c.path == "/interface/wireless/scan")
            .expect("scan trigger");
        assert!(patch < trigger);
        assert_eq!(calls[patch].body, Some(json!({ "band": "5ghz-a/n/ac" })));
        assert_eq!(calls[trigger].timeout, TRIGGER_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn matching_band_skips_patch_and_delay() {
        let router = router();
        let mut scans = ScanOrchestrator::new();

        let t0 = Instant::now();
        started(scans.start(&router, &request("2ghz-b/g/n")).await.unwrap());
        assert!(t0.elapsed() < BAND_SETTLE_DELAY);
        assert!(router.calls().iter().all(|c| c.method != Method::Patch));
    }

    #[tokio::test(start_paused = true)]
    async fn lost_trigger_still_marks_scan_in_progress() {
        let router = router();
        router.reject(Method::Post, "/interface/wireless/scan");
        let mut scans = ScanOrchestrator::new();

        let s = started(scans.start(&router, &request("2ghz-b/g/n")).await.unwrap());
        assert_eq!(s.csv_filename, SCAN_CSV_FILENAME);
        assert_eq!(scans.result(&router).await, ScanPoll::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn storage_failure_aborts_before_state_changes() {
        let router = router();
        router.reject(Method::Post, "/disk/add");
        let mut scans = ScanOrchestrator::new();

        let err = scans.start(&router, &request("2ghz-b/g/n")).await.unwrap_err();
        assert!(matches!(err, crate::Error::ResourceUnavailable(_)));
        assert!(scans.is_idle());
        assert_eq!(router.count(Method::Post, "/interface/wireless/scan"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_interface_is_reported() {
        let router = MockRouter::new();
        let mut scans = ScanOrchestrator::new();
        let err = scans.start(&router, &request("2ghz-b/g/n")).await.unwrap_err();
        assert!(matches!(err, crate::Error::NotFound(_)));
        assert!(scans.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn result_is_delivered_exactly_once_and_cleans_up() {
        let router = router()
            .with_profile("client-Cafe", "none", "wifi-manager:ssid=Cafe")
            .with_profile("client-Gone", "none", "wifi-manager:ssid=Gone")
            .with_profile("default", "none", "");
        let mut scans = ScanOrchestrator::new();
        started(scans.start(&router, &request("2ghz-b/g/n")).await.unwrap());

        tokio::time::advance(Duration::from_millis(4_000)).await;
        assert_eq!(scans.result(&router).await, ScanPoll::Pending);

        router.add_file(SCAN_CSV_FILENAME, CSV);
        let ScanPoll::Ready(report) = scans.result(&router).await else {
            panic!("expected a ready result");
        };
        assert_eq!(report.csv, CSV);
        assert_eq!(report.band, "2ghz-b/g/n");
        assert_eq!(report.profiles.len(), 1);
        assert_eq!(report.profiles[0].ssid, "Cafe");

        assert!(router.files().is_empty());
        assert!(router.disks().is_empty());
        assert_eq!(scans.result(&router).await, ScanPoll::NoResult);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_export_is_still_pending() {
        let router = router();
        let mut scans = ScanOrchestrator::new();
        started(scans.start(&router, &request("2ghz-b/g/n")).await.unwrap());

        router.add_file(SCAN_CSV_FILENAME, "");
        tokio::time::advance(Duration::from_millis(4_500)).await;
        assert_eq!(scans.result(&router).await, ScanPoll::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_releases_storage_once() {
        let router = router();
        let mut scans = ScanOrchestrator::new();
        let s = started(scans.start(&router, &request("2ghz-b/g/n")).await.unwrap());

        tokio::time::advance(Duration::from_millis(s.timing.timeout_ms + 1)).await;
        assert_eq!(scans.result(&router).await, ScanPoll::Timeout);
        assert_eq!(router.count(Method::Post, "/disk/remove"), 1);
        assert!(scans.is_idle());

        assert_eq!(scans.result(&router).await, ScanPoll::NoResult);
        assert_eq!(router.count(Method::Post, "/disk/remove"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_cleanup_survives_unreachable_router() {
        let router = router();
        let mut scans = ScanOrchestrator::new();
        started(scans.start(&router, &request("2ghz-b/g/n")).await.unwrap());

        router.set_unreachable(true);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(scans.result(&router).await, ScanPoll::Timeout);
        assert!(scans.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_router_while_polling_reports_pending() {
        let router = router();
        let mut scans = ScanOrchestrator::new();
        started(scans.start(&router, &request("2ghz-b/g/n")).await.unwrap());

        router.set_unreachable(true);
        tokio::time::advance(Duration::from_millis(5_000)).await;
        assert_eq!(scans.result(&router).await, ScanPoll::Pending);
        assert!(scans.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn prefetch_buffers_result_for_next_poll() {
        let router = router();
        router.set_scan_artifact(Some(CSV));
        let mut scans = ScanOrchestrator::new();
        started(scans.start(&router, &request("2ghz-b/g/n")).await.unwrap());

        scans.prefetch(&router).await;
        assert_eq!(router.count(Method::Get, "/file"), 0);

        tokio::time::advance(Duration::from_millis(4_000)).await;
        scans.prefetch(&router).await;
        assert!(!scans.is_idle());
        assert!(!scans.is_scanning());

        let listings = router.count(Method::Get, "/file");
        assert!(matches!(scans.result(&router).await, ScanPoll::Ready(_)));
        assert_eq!(router.count(Method::Get, "/file"), listings);
        assert_eq!(scans.result(&router).await, ScanPoll::NoResult);
    }
}
