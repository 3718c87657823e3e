//! Operations on the router's wireless interface.

use crate::profiles::{NetworkIdentity, ProfileOutcome, ProfileReconciler, ProfileSpec};
use crate::router;
use crate::traits::{Method, RouterApi};
use crate::{Error, Result};
use serde::Deserialize;
use serde_json::{Map, Value, json};

const INTERFACES_PATH: &str = "/interface/wireless";

/// The configured wireless interface as the router reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WirelessInterface {
    pub id: String,
    pub name: String,
    pub band: String,
}

/// Resolves `name` to the interface's `.id` and current band.
pub async fn find_interface(api: &dyn RouterApi, name: &str) -> Result<WirelessInterface> {
    let interfaces = router::get_list(api, INTERFACES_PATH).await?;

    let Some(iface) = interfaces.iter().find(|i| router::field(i, "name") == name) else {
        tracing::error!("Configured interface '{}' not found on router", name);
        return Err(Error::NotFound("Configured WLAN interface not found".into()));
    };

    let id = router::field(iface, ".id");
    if id.is_empty() {
        tracing::error!("Configured interface '{}' found but missing .id", name);
        return Err(Error::NotFound("Configured WLAN interface not found".into()));
    }

    Ok(WirelessInterface {
        id: id.to_string(),
        name: name.to_string(),
        band: router::field(iface, "band").to_string(),
    })
}

pub async fn set_band(api: &dyn RouterApi, iface: &WirelessInterface, band: &str) -> Result<()> {
    router::send(
        api,
        Method::Patch,
        &router::item_path(INTERFACES_PATH, &iface.id),
        Some(&json!({ "band": band })),
    )
    .await?;
    Ok(())
}

/// Body of `POST /api/connect`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    #[serde(default)]
    pub ssid: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub band: Option<String>,
    #[serde(default = "default_requires_password")]
    pub requires_password: bool,
    /// Whether the UI already knew a profile for this network.
    #[serde(default)]
    pub known: bool,
    #[serde(default)]
    pub profile_name: Option<String>,
}

fn default_requires_password() -> bool {
    true
}

/// Points the router's interface at `req.ssid` in station mode, creating
/// or updating the matching security profile first.
pub async fn connect(
    api: &dyn RouterApi,
    iface_name: &str,
    req: &ConnectRequest,
    default_band: &str,
) -> Result<ProfileOutcome> {
    let ssid = req.ssid.trim();
    if ssid.is_empty() {
        return Err(Error::InvalidInput("Missing ssid".into()));
    }

    let iface = find_interface(api, iface_name).await?;

    let identity = NetworkIdentity::new(ssid);
    let outcome = ProfileReconciler::new(api)
        .ensure(&ProfileSpec {
            identity: &identity,
            credential: req.password.as_deref(),
            requires_credential: req.requires_password,
            name_hint: req.profile_name.as_deref(),
        })
        .await?;

    let band = req
        .band
        .as_deref()
        .filter(|b| !b.is_empty())
        .unwrap_or(default_band);

    tracing::info!(
        ssid,
        band,
        profile = %outcome.name,
        known = req.known,
        "📡 Switching router interface to station mode"
    );
    let config = json!({
        "mode": "station",
        "ssid": ssid,
        "band": band,
        "security-profile": outcome.name,
        "disabled": "no",
    });
    router::send(
        api,
        Method::Patch,
        &router::item_path(INTERFACES_PATH, &iface.id),
        Some(&config),
    )
    .await?;

    Ok(outcome)
}

pub async fn disconnect(api: &dyn RouterApi, iface_name: &str) -> Result<()> {
    let iface = find_interface(api, iface_name).await?;
    router::send(
        api,
        Method::Patch,
        &router::item_path(INTERFACES_PATH, &iface.id),
        Some(&json!({ "disabled": "yes" })),
    )
    .await?;
    tracing::info!(interface = %iface.name, "Router interface disabled");
    Ok(())
}

/// Aggregated router view for the status page. Each section is fetched
/// independently; a failing one is reported in place instead of failing
/// the whole view.
pub async fn router_status(api: &dyn RouterApi) -> Value {
    const SECTIONS: [(&str, &str); 5] = [
        ("interfaces", "/interface/wireless"),
        ("registration", "/interface/wireless/registration-table"),
        ("addresses", "/ip/address"),
        ("routes", "/ip/route"),
        ("dns", "/ip/dns"),
    ];

    let mut out = Map::new();
    for (key, path) in SECTIONS {
        let value = match router::send(api, Method::Get, path, None).await {
            Ok(body) => serde_json::from_str(&body).unwrap_or(Value::String(body)),
            Err(e) => json!({ "error": e.to_string() }),
        };
        out.insert(key.to_string(), value);
    }
    Value::Object(out)
}
