use bridge_core::bridge::Bridge;
use bridge_core::config::{AppConfig, ConfigStore, RouterEndpoint};
use bridge_core::frontends::DiskFrontend;
use bridge_core::supervisor::ConnectivitySupervisor;
use bridge_core::traits::{RouterApi, StationLink};
use bridge_core::web_server::{self, AppState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;

#[cfg(not(feature = "mock"))]
fn backends(
    app: &AppConfig,
    endpoint: RouterEndpoint,
) -> anyhow::Result<(Arc<dyn RouterApi>, Arc<dyn StationLink>)> {
    use bridge_core::link::WpaCliLink;
    use bridge_core::router::RestClient;

    tracing::info!("🚀 Using RouterOS REST client ({})", endpoint.address);
    let router = RestClient::new(endpoint)?;
    let link = WpaCliLink::new(app.ap.station_interface.clone());
    Ok((Arc::new(router), Arc::new(link)))
}

#[cfg(feature = "mock")]
fn backends(
    app: &AppConfig,
    _endpoint: RouterEndpoint,
) -> anyhow::Result<(Arc<dyn RouterApi>, Arc<dyn StationLink>)> {
    use bridge_core::link::MockLink;
    use bridge_core::router::mock::MockRouter;

    tracing::info!("🚀 Using in-memory router and link (mock)");
    let router = MockRouter::demo(&app.defaults.router.wlan_interface);
    Ok((Arc::new(router), Arc::new(MockLink::accepting_all())))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("🛑 Shutdown requested");
}

async fn tick_loop(state: Arc<AppState>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        state.tick().await;
    }
}

/// Wires everything together and serves until Ctrl-C.
pub async fn run(app: AppConfig) -> anyhow::Result<()> {
    let store = ConfigStore::load(&app.paths.runtime_config, app.defaults.clone());
    let (router, link) = backends(&app, store.current().endpoint())?;

    let hidden_asset = app
        .paths
        .runtime_config
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string);

    let state = Arc::new(AppState {
        bridge: Mutex::new(Bridge::new(store, router)),
        supervisor: Mutex::new(ConnectivitySupervisor::new(link, app.ap.clone(), app.supervisor)),
        frontend: Arc::new(DiskFrontend::new(&app.paths.ui_dir)),
        ap_ssid: app.ap.ssid.clone(),
        hidden_asset,
        prefetch: app.scan_prefetch,
    });

    // 启动时先尝试连接上游网络，失败则进入门户模式
    state.boot().await;

    let ticker = tokio::spawn(tick_loop(state.clone(), app.supervisor.tick_interval));

    println!("📡 Runner: Starting web server...");
    let result = web_server::start_web_server(state, app.ap.bind_addr, shutdown_signal()).await;
    ticker.abort();

    result??;
    tracing::info!("Bridge daemon stopped");
    Ok(())
}
