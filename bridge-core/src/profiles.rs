//! Security profile reconciliation.
//!
//! Profiles created by this controller carry an identity marker in their
//! `comment` field (`wifi-manager:ssid=<ssid>`). The marker, not the display
//! name, is the durable key: names may be generated, edited by hand, or
//! reused, while the marker always points back to one network.

use crate::router::{self, Record};
use crate::traits::{Method, RouterApi};
use crate::{Error, Result};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashMap;

pub const MARKER_PREFIX: &str = "wifi-manager:ssid=";

const PROFILES_PATH: &str = "/interface/wireless/security-profiles";

/// Generated display names use at most this many characters of the SSID.
const NAME_SSID_CHARS: usize = 20;

/// Logical network a profile belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetworkIdentity {
    ssid: String,
}

impl NetworkIdentity {
    pub fn new(ssid: impl Into<String>) -> Self {
        Self { ssid: ssid.into() }
    }

    pub fn ssid(&self) -> &str {
        &self.ssid
    }

    /// Comment-field marker written to the router.
    pub fn marker(&self) -> String {
        format!("{}{}", MARKER_PREFIX, self.ssid)
    }

    pub fn from_marker(comment: &str) -> Option<Self> {
        comment.strip_prefix(MARKER_PREFIX).map(Self::new)
    }

    pub fn default_profile_name(&self) -> String {
        let short: String = self.ssid.chars().take(NAME_SSID_CHARS).collect();
        format!("client-{}", short)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecurityMode {
    Open,
    PreSharedKey,
    /// Any mode this controller does not manage (e.g. static keys).
    Other(String),
}

impl SecurityMode {
    pub fn from_wire(mode: &str) -> Self {
        match mode {
            "none" => SecurityMode::Open,
            "dynamic-keys" => SecurityMode::PreSharedKey,
            other => SecurityMode::Other(other.to_string()),
        }
    }

    pub fn as_wire(&self) -> &str {
        match self {
            SecurityMode::Open => "none",
            SecurityMode::PreSharedKey => "dynamic-keys",
            SecurityMode::Other(s) => s,
        }
    }

    pub fn for_network(requires_credential: bool) -> Self {
        if requires_credential {
            SecurityMode::PreSharedKey
        } else {
            SecurityMode::Open
        }
    }
}

/// A security profile as listed by the router.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileRecord {
    pub name: String,
    pub mode: SecurityMode,
    pub authentication_types: String,
    /// Present only for profiles carrying an identity marker.
    pub identity: Option<NetworkIdentity>,
}

impl ProfileRecord {
    fn from_record(r: &Record) -> Self {
        Self {
            name: router::field(r, "name").to_string(),
            mode: SecurityMode::from_wire(router::field(r, "mode")),
            authentication_types: router::field(r, "authentication-types").to_string(),
            identity: NetworkIdentity::from_marker(router::field(r, "comment")),
        }
    }

    pub fn is_managed(&self) -> bool {
        self.identity.is_some()
    }
}

/// Lookup table over one profile listing, keyed by identity and by name.
#[derive(Debug, Default)]
pub struct ProfileIndex {
    records: Vec<ProfileRecord>,
    by_identity: HashMap<NetworkIdentity, usize>,
    by_name: HashMap<String, usize>,
}

impl ProfileIndex {
    pub fn build(records: &[Record]) -> Self {
        let mut index = ProfileIndex::default();
        for r in records {
            let record = ProfileRecord::from_record(r);
            let pos = index.records.len();
            if let Some(identity) = &record.identity {
                index.by_identity.entry(identity.clone()).or_insert(pos);
            }
            if !record.name.is_empty() {
                index.by_name.entry(record.name.clone()).or_insert(pos);
            }
            index.records.push(record);
        }
        index
    }

    pub fn by_identity(&self, identity: &NetworkIdentity) -> Option<&ProfileRecord> {
        self.by_identity.get(identity).map(|&i| &self.records[i])
    }

    pub fn by_name(&self, name: &str) -> Option<&ProfileRecord> {
        self.by_name.get(name).map(|&i| &self.records[i])
    }

    /// Marker match wins over name match.
    pub fn lookup(&self, identity: &NetworkIdentity, name: &str) -> Option<&ProfileRecord> {
        self.by_identity(identity).or_else(|| self.by_name(name))
    }

    pub fn managed(&self) -> impl Iterator<Item = &ProfileRecord> {
        self.records.iter().filter(|r| r.is_managed())
    }
}

/// Entry of the profile summary attached to scan results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfileSummary {
    pub ssid: String,
    pub name: String,
    pub mode: String,
    #[serde(rename = "authentication-types")]
    pub authentication_types: String,
}

impl ProfileSummary {
    fn from_record(record: &ProfileRecord) -> Option<Self> {
        let identity = record.identity.as_ref()?;
        Some(Self {
            ssid: identity.ssid().to_string(),
            name: record.name.clone(),
            mode: record.mode.as_wire().to_string(),
            authentication_types: record.authentication_types.clone(),
        })
    }
}

/// What [`ProfileReconciler::ensure`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileAction {
    Updated,
    Created,
    /// Mode changed: the old profile was deleted and a new one created.
    Replaced,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileOutcome {
    pub name: String,
    pub action: ProfileAction,
}

/// Desired state of one network's profile.
#[derive(Debug, Clone)]
pub struct ProfileSpec<'a> {
    pub identity: &'a NetworkIdentity,
    pub credential: Option<&'a str>,
    pub requires_credential: bool,
    pub name_hint: Option<&'a str>,
}

pub struct ProfileReconciler<'a> {
    api: &'a dyn RouterApi,
}

impl<'a> ProfileReconciler<'a> {
    pub fn new(api: &'a dyn RouterApi) -> Self {
        Self { api }
    }

    pub async fn index(&self) -> Result<ProfileIndex> {
        let records = router::get_list(self.api, PROFILES_PATH).await?;
        Ok(ProfileIndex::build(&records))
    }

    /// Summaries of every marker-tagged profile.
    pub async fn managed_profiles(&self) -> Result<Vec<ProfileSummary>> {
        let index = self.index().await?;
        Ok(index.managed().filter_map(ProfileSummary::from_record).collect())
    }

    /// Makes the router's profile for `spec.identity` match the desired mode.
    ///
    /// The authentication mode of an existing profile is never patched in
    /// place; a mode change deletes the profile and creates a fresh one.
    /// Returns the profile name to attach to the wireless interface.
    pub async fn ensure(&self, spec: &ProfileSpec<'_>) -> Result<ProfileOutcome> {
        let name_hint = spec
            .name_hint
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| spec.identity.default_profile_name());
        let credential = spec.credential.filter(|c| !c.is_empty());
        let desired = SecurityMode::for_network(spec.requires_credential);

        let index = self.index().await?;
        let mut replaced = false;

        if let Some(existing) = index.lookup(spec.identity, &name_hint) {
            if existing.mode == desired {
                let payload = profile_payload(spec.identity, &desired, credential);
                tracing::debug!(profile = %existing.name, "Updating security profile");
                router::send(
                    self.api,
                    Method::Patch,
                    &router::item_path(PROFILES_PATH, &existing.name),
                    Some(&payload),
                )
                .await?;
                return Ok(ProfileOutcome {
                    name: existing.name.clone(),
                    action: ProfileAction::Updated,
                });
            }

            tracing::info!(
                profile = %existing.name,
                from = existing.mode.as_wire(),
                to = desired.as_wire(),
                "Security mode changed, recreating profile"
            );
            router::send(
                self.api,
                Method::Delete,
                &router::item_path(PROFILES_PATH, &existing.name),
                None,
            )
            .await?;
            replaced = true;
        }

        if desired == SecurityMode::PreSharedKey && credential.is_none() {
            tracing::error!(profile = %name_hint, "Password required for secured profile");
            return Err(Error::CredentialRequired(name_hint));
        }

        let mut payload = profile_payload(spec.identity, &desired, credential);
        payload["name"] = Value::from(name_hint.clone());
        router::send(
            self.api,
            Method::Post,
            &format!("{}/add", PROFILES_PATH),
            Some(&payload),
        )
        .await?;
        tracing::info!(
            profile = %name_hint,
            ssid = spec.identity.ssid(),
            "Security profile created"
        );

        Ok(ProfileOutcome {
            name: name_hint,
            action: if replaced {
                ProfileAction::Replaced
            } else {
                ProfileAction::Created
            },
        })
    }

    /// Deletes a marker-tagged profile, located by SSID and/or name.
    /// Profiles without a marker are never touched.
    pub async fn delete_managed(&self, ssid: Option<&str>, name: Option<&str>) -> Result<String> {
        let ssid = ssid.filter(|s| !s.is_empty());
        let name = name.filter(|n| !n.is_empty());
        if ssid.is_none() && name.is_none() {
            return Err(Error::InvalidInput("Missing profileName or ssid".into()));
        }

        let index = self.index().await?;
        let target = match (ssid, name) {
            (Some(ssid), name) => {
                let identity = NetworkIdentity::new(ssid);
                name.and_then(|n| index.by_name(n))
                    .filter(|r| r.identity.as_ref() == Some(&identity))
                    .or_else(|| index.by_identity(&identity))
            }
            (None, Some(name)) => index.by_name(name).filter(|r| r.is_managed()),
            (None, None) => None,
        };

        let Some(target) = target else {
            return Err(Error::NotFound("Managed profile not found".into()));
        };

        let path = router::item_path(PROFILES_PATH, &target.name);
        let response = router::send(self.api, Method::Delete, &path, None)
            .await
            .map_err(|e| {
                tracing::error!(profile = %target.name, "Failed to delete profile: {}", e);
                Error::CommandFailed(format!("Failed to delete profile: {}", e))
            })?;

        // RouterOS occasionally reports failures inside a 2xx body.
        if body_reports_error(&response) {
            tracing::error!(profile = %target.name, %response, "Failed to delete profile");
            return Err(Error::CommandFailed("Failed to delete profile".into()));
        }

        tracing::info!(profile = %target.name, "Security profile deleted");
        Ok(target.name.clone())
    }
}

fn profile_payload(
    identity: &NetworkIdentity,
    mode: &SecurityMode,
    credential: Option<&str>,
) -> Value {
    let mut payload = json!({ "comment": identity.marker() });
    match mode {
        SecurityMode::PreSharedKey => {
            payload["mode"] = Value::from("dynamic-keys");
            payload["authentication-types"] = Value::from("wpa-psk,wpa2-psk");
            if let Some(psk) = credential {
                payload["wpa-pre-shared-key"] = Value::from(psk);
                payload["wpa2-pre-shared-key"] = Value::from(psk);
            }
        }
        _ => {
            payload["mode"] = Value::from("none");
            payload["authentication-types"] = Value::from("");
            payload["wpa-pre-shared-key"] = Value::from("");
            payload["wpa2-pre-shared-key"] = Value::from("");
        }
    }
    payload
}

fn body_reports_error(body: &str) -> bool {
    matches!(
        serde_json::from_str::<Value>(body),
        Ok(Value::Object(map)) if map.contains_key("error")
    )
}
