// 链路实现：wpa_cli 管理 STA，hostapd + dnsmasq 提供回退热点。
// STA 与 AP 使用不同接口（wlan0 / uap0），两者可以同时工作。

use crate::config::ApConfig;
use crate::traits::StationLink;
use crate::{Error, Result};
use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

const WPA_SUPPLICANT_CONF: &str = "/etc/wpa_supplicant.conf";

/// Processes and addressing owned while the fallback AP is up.
#[derive(Debug)]
struct RunningAp {
    config: ApConfig,
    hostapd: Child,
    dnsmasq: Child,
}

#[derive(Debug)]
pub struct WpaCliLink {
    station_iface: String,
    ap: Mutex<Option<RunningAp>>,
    dhcp: Mutex<Option<Child>>,
}

impl WpaCliLink {
    pub fn new(station_iface: impl Into<String>) -> Self {
        Self {
            station_iface: station_iface.into(),
            ap: Mutex::new(None),
            dhcp: Mutex::new(None),
        }
    }

    async fn wpa_cli(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("wpa_cli")
            .arg("-i")
            .arg(&self.station_iface)
            .args(args)
            .output()
            .await?;
        if !output.status.success() {
            let error_msg = String::from_utf8_lossy(&output.stderr);
            return Err(Error::CommandFailed(format!(
                "wpa_cli {} failed: {}",
                args.join(" "),
                error_msg
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        // wpa_cli 的失败经常以退出码 0 + "FAIL" 输出
        if stdout == "FAIL" {
            return Err(Error::CommandFailed(format!("wpa_cli {} returned FAIL", args.join(" "))));
        }
        Ok(stdout)
    }

    /// Starts wpa_supplicant if its control socket does not answer.
    async fn ensure_supplicant(&self) -> Result<()> {
        if self.wpa_cli(&["ping"]).await.is_ok() {
            return Ok(());
        }
        tracing::info!(iface = %self.station_iface, "Starting wpa_supplicant");
        let status = Command::new("wpa_supplicant")
            .arg("-B")
            .arg(format!("-i{}", self.station_iface))
            .arg(format!("-c{}", WPA_SUPPLICANT_CONF))
            .status()
            .await?;
        if !status.success() {
            return Err(Error::CommandFailed("wpa_supplicant failed to start".into()));
        }
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        Ok(())
    }

    /// Runs `ip`, accepting a failure whose stderr contains `tolerated`.
    async fn ip(&self, args: &[&str], tolerated: Option<&str>) -> Result<()> {
        let output = Command::new("ip").args(args).output().await?;
        if !output.status.success() {
            let error_msg = String::from_utf8_lossy(&output.stderr);
            if !tolerated.is_some_and(|t| error_msg.contains(t)) {
                return Err(Error::CommandFailed(format!(
                    "ip {} failed: {}",
                    args.join(" "),
                    error_msg
                )));
            }
        }
        Ok(())
    }

    /// Creates the AP interface on top of the station radio if missing.
    async fn ensure_ap_interface(&self, ap: &ApConfig) -> Result<()> {
        let exists = Command::new("ip")
            .args(["link", "show", ap.interface_name.as_str()])
            .output()
            .await?
            .status
            .success();
        if !exists {
            tracing::info!(iface = %ap.interface_name, "Creating AP interface");
            let status = Command::new("iw")
                .args([
                    "dev",
                    ap.station_interface.as_str(),
                    "interface",
                    "add",
                    ap.interface_name.as_str(),
                    "type",
                    "__ap",
                ])
                .status()
                .await?;
            if !status.success() {
                return Err(Error::CommandFailed(format!(
                    "Failed to create AP interface {}",
                    ap.interface_name
                )));
            }
        }
        self.ip(&["link", "set", &ap.interface_name, "up"], None).await
    }
}

#[async_trait]
impl StationLink for WpaCliLink {
    async fn is_connected(&self) -> Result<bool> {
        let status = self.wpa_cli(&["status"]).await?;
        Ok(station_is_up(&status))
    }

    async fn begin_connect(&self, ssid: &str, password: &str) -> Result<()> {
        self.ensure_supplicant().await?;

        // 旧网络全部移除，同时断开当前关联
        self.wpa_cli(&["remove_network", "all"]).await?;

        let id = self.wpa_cli(&["add_network"]).await?;
        let network_id: u32 = id.parse().map_err(|_| {
            Error::CommandFailed(format!("Failed to parse network ID from wpa_cli: {}", id))
        })?;
        let id = network_id.to_string();

        let ssid_arg = format!("\"{}\"", ssid);
        self.wpa_cli(&["set_network", &id, "ssid", &ssid_arg]).await?;
        if password.is_empty() {
            self.wpa_cli(&["set_network", &id, "key_mgmt", "NONE"]).await?;
        } else {
            let psk_arg = format!("\"{}\"", password);
            self.wpa_cli(&["set_network", &id, "psk", &psk_arg]).await?;
        }
        self.wpa_cli(&["select_network", &id]).await?;

        // udhcpc 在后台等待关联完成后获取地址
        let mut dhcp = self.dhcp.lock().await;
        if let Some(mut old) = dhcp.take() {
            let _ = old.kill().await;
        }
        let child = Command::new("udhcpc")
            .args(["-b", "-i", self.station_iface.as_str()])
            .kill_on_drop(true)
            .spawn()?;
        *dhcp = Some(child);

        tracing::info!(ssid, iface = %self.station_iface, "📶 Station connect issued");
        Ok(())
    }

    async fn start_access_point(&self, ap: &ApConfig) -> Result<()> {
        let mut running = self.ap.lock().await;
        if running.is_some() {
            return Ok(());
        }

        self.ensure_ap_interface(ap).await?;
        self.ip(
            &["addr", "add", &ap.gateway_cidr, "dev", &ap.interface_name],
            Some("File exists"),
        )
        .await?;

        tokio::fs::write(&ap.hostapd_conf_path, hostapd_conf(ap)).await?;
        let hostapd = Command::new("hostapd")
            .arg(&ap.hostapd_conf_path)
            .kill_on_drop(true)
            .spawn()?;

        // 所有域名都解析到网关，触发客户端的门户检测
        let gateway_ip = ap.gateway_cidr.split('/').next().unwrap_or("");
        let dnsmasq = Command::new("dnsmasq")
            .arg(format!("--interface={}", ap.interface_name))
            .arg(format!("--dhcp-range={}", ap.dhcp_range))
            .arg(format!("--address=/#/{}", gateway_ip))
            .arg("--bind-interfaces")
            .arg("--no-resolv")
            .arg("--no-hosts")
            .arg("--no-daemon")
            .kill_on_drop(true)
            .spawn()?;

        tracing::info!(ssid = %ap.ssid, iface = %ap.interface_name, "📡 Fallback AP started");
        *running = Some(RunningAp {
            config: ap.clone(),
            hostapd,
            dnsmasq,
        });
        Ok(())
    }

    async fn stop_access_point(&self) -> Result<()> {
        let Some(mut running) = self.ap.lock().await.take() else {
            return Ok(());
        };

        let _ = running.dnsmasq.kill().await;
        let _ = running.hostapd.kill().await;

        let ap = &running.config;
        self.ip(
            &["addr", "del", &ap.gateway_cidr, "dev", &ap.interface_name],
            Some("Cannot assign requested address"),
        )
        .await?;
        tracing::info!(iface = %ap.interface_name, "📡 Fallback AP stopped");
        Ok(())
    }
}

/// `wpa_cli status` reports an association and DHCP has produced an address.
fn station_is_up(status: &str) -> bool {
    let mut completed = false;
    let mut has_ip = false;
    for line in status.lines() {
        match line.split_once('=') {
            Some(("wpa_state", state)) => completed = state == "COMPLETED",
            Some(("ip_address", addr)) => has_ip = !addr.is_empty(),
            _ => {}
        }
    }
    completed && has_ip
}

fn hostapd_conf(ap: &ApConfig) -> String {
    let mut conf = format!(
        "interface={}\ndriver=nl80211\nssid={}\n\
         hw_mode=g\nchannel=6\nauth_algs=1\nignore_broadcast_ssid=0\n",
        ap.interface_name, ap.ssid
    );
    if !ap.psk.is_empty() {
        conf.push_str(&format!(
            "wpa=2\nwpa_passphrase={}\nwpa_key_mgmt=WPA-PSK\nrsn_pairwise=CCMP\n",
            ap.psk
        ));
    }
    conf
}
