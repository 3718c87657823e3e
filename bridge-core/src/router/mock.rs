//! In-memory model of the RouterOS REST surface this crate uses.
//! It records every call so tests can assert on call order and counts, and
//! backs the daemon's `mock` feature for running without hardware.

use super::Record;
use crate::config::RouterEndpoint;
use crate::traits::{Method, RouterApi};
use crate::{Error, Result};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// A single request as seen by [`MockRouter`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
    pub timeout: Duration,
}

#[derive(Default)]
struct MockState {
    interfaces: Vec<Record>,
    profiles: Vec<Record>,
    disks: Vec<Record>,
    files: Vec<Record>,
    calls: Vec<RecordedCall>,
    next_id: u32,
    /// CSV the next scan trigger writes to its `save-file`.
    scan_artifact: Option<String>,
    unreachable: bool,
    rejections: Vec<(Method, String)>,
    /// 2xx bodies returned verbatim instead of running the command.
    canned: Vec<(Method, String, String)>,
    endpoint: Option<RouterEndpoint>,
}

impl MockState {
    fn alloc_id(&mut self) -> String {
        self.next_id += 1;
        format!("*{:X}", self.next_id)
    }
}

#[derive(Default)]
pub struct MockRouter {
    state: Mutex<MockState>,
}

fn obj(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        _ => Record::new(),
    }
}

fn text(record: &Record, key: &str) -> String {
    super::field(record, key).to_string()
}

fn not_found(what: &str) -> Error {
    Error::RemoteRejected {
        status: 404,
        body: json!({ "error": 404, "message": "Not Found", "detail": what }).to_string(),
    }
}

fn bad_request(detail: &str) -> Error {
    Error::RemoteRejected {
        status: 400,
        body: json!({ "error": 400, "message": "Bad Request", "detail": detail }).to_string(),
    }
}

/// Last path segment after `prefix`, percent-decoded as the router would.
fn item_key(path: &str, prefix: &str) -> String {
    let raw = &path[prefix.len()..];
    urlencoding::decode(raw)
        .map(|k| k.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

fn merge(target: &mut Record, patch: Option<&Value>) {
    if let Some(Value::Object(fields)) = patch {
        for (k, v) in fields {
            target.insert(k.clone(), v.clone());
        }
    }
}

impl MockRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// A router with one wireless interface and a scan that yields a small
    /// artifact, for running the daemon without hardware.
    pub fn demo(interface: &str) -> Self {
        let router = Self::new().with_interface(interface, "2ghz-b/g/n");
        router.set_scan_artifact(Some(
            "\"AA:BB:CC:00:00:01\",\"HomeNet\",\"2412/20-Ce/gn\",\"-48\",\"\"\n\
             \"AA:BB:CC:00:00:02\",\"CafeGuest\",\"2437/20/gn\",\"-71\",\"\"\n\
             \"AA:BB:CC:00:00:03\",\"Neighbor\",\"2462/20/gn\",\"-84\",\"\"\n",
        ));
        router
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_interface(self, name: &str, band: &str) -> Self {
        {
            let mut st = self.state();
            let id = st.alloc_id();
            st.interfaces.push(obj(json!({
                ".id": id,
                "name": name,
                "band": band,
                "mode": "station",
                "disabled": "true",
            })));
        }
        self
    }

    pub fn with_profile(self, name: &str, mode: &str, comment: &str) -> Self {
        {
            let mut st = self.state();
            let id = st.alloc_id();
            let auth_types = if mode == "dynamic-keys" { "wpa-psk,wpa2-psk" } else { "" };
            st.profiles.push(obj(json!({
                ".id": id,
                "name": name,
                "mode": mode,
                "comment": comment,
                "authentication-types": auth_types,
            })));
        }
        self
    }

    pub fn with_disk(self, slot: &str) -> Self {
        {
            let mut st = self.state();
            let id = st.alloc_id();
            st.disks.push(obj(json!({
                ".id": id,
                "slot": slot,
                "mount-point": slot,
                "type": "tmpfs",
            })));
        }
        self
    }

    /// Places a file on the router, as a finished scan export would.
    pub fn add_file(&self, name: &str, contents: &str) {
        let mut st = self.state();
        let id = st.alloc_id();
        st.files.push(obj(json!({ ".id": id, "name": name, "contents": contents })));
    }

    pub fn set_scan_artifact(&self, csv: Option<&str>) {
        self.state().scan_artifact = csv.map(str::to_string);
    }

    /// Makes every call fail as if the router could not be reached.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    /// Answers 400 for `method` on any path starting with `path_prefix`.
    pub fn reject(&self, method: Method, path_prefix: &str) {
        self.state().rejections.push((method, path_prefix.to_string()));
    }

    /// Answers 2xx with `body` for `method` on paths starting with
    /// `path_prefix`, leaving the model untouched.
    pub fn respond_with(&self, method: Method, path_prefix: &str, body: &str) {
        self.state()
            .canned
            .push((method, path_prefix.to_string(), body.to_string()));
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state().calls.clone()
    }

    pub fn count(&self, method: Method, path: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.method == method && c.path == path)
            .count()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn interfaces(&self) -> Vec<Record> {
        self.state().interfaces.clone()
    }

    pub fn profiles(&self) -> Vec<Record> {
        self.state().profiles.clone()
    }

    pub fn disks(&self) -> Vec<Record> {
        self.state().disks.clone()
    }

    pub fn files(&self) -> Vec<Record> {
        self.state().files.clone()
    }

    pub fn endpoint(&self) -> Option<RouterEndpoint> {
        self.state().endpoint.clone()
    }

    fn handle(
        st: &mut MockState,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value> {
        const PROFILES: &str = "/interface/wireless/security-profiles/";
        const INTERFACES: &str = "/interface/wireless/";

        match (method, path) {
            (Method::Get, "/interface/wireless") => Ok(Value::from(st.interfaces.clone())),
            (Method::Get, "/interface/wireless/security-profiles") => {
                Ok(Value::from(st.profiles.clone()))
            }
            (Method::Post, "/interface/wireless/security-profiles/add") => {
                let mut record = Record::new();
                merge(&mut record, body);
                let name = text(&record, "name");
                if name.is_empty() {
                    return Err(bad_request("missing name"));
                }
                if st.profiles.iter().any(|p| text(p, "name") == name) {
                    return Err(bad_request("profile with the same name already exists"));
                }
                let id = st.alloc_id();
                record.insert(".id".into(), Value::from(id.clone()));
                st.profiles.push(record);
                Ok(json!({ "ret": id }))
            }
            (Method::Patch, p) if p.starts_with(PROFILES) => {
                let key = item_key(p, PROFILES);
                let profile = st
                    .profiles
                    .iter_mut()
                    .find(|r| text(r, "name") == key || text(r, ".id") == key)
                    .ok_or_else(|| not_found(&key))?;
                merge(profile, body);
                Ok(Value::from(profile.clone()))
            }
            (Method::Delete, p) if p.starts_with(PROFILES) => {
                let key = item_key(p, PROFILES);
                let before = st.profiles.len();
                st.profiles
                    .retain(|r| text(r, "name") != key && text(r, ".id") != key);
                if st.profiles.len() == before {
                    return Err(not_found(&key));
                }
                Ok(Value::Array(Vec::new()))
            }
            (Method::Post, "/interface/wireless/scan") => {
                let save_file = body
                    .and_then(|b| b.get("save-file"))
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                if let Some(csv) = st.scan_artifact.clone() {
                    if !save_file.is_empty() {
                        let id = st.alloc_id();
                        st.files
                            .push(obj(json!({ ".id": id, "name": save_file, "contents": csv })));
                    }
                }
                Ok(Value::Array(Vec::new()))
            }
            (Method::Patch, p) if p.starts_with(INTERFACES) => {
                let key = item_key(p, INTERFACES);
                let iface = st
                    .interfaces
                    .iter_mut()
                    .find(|r| text(r, ".id") == key || text(r, "name") == key)
                    .ok_or_else(|| not_found(&key))?;
                merge(iface, body);
                Ok(Value::from(iface.clone()))
            }
            (Method::Get, "/disk") => Ok(Value::from(st.disks.clone())),
            (Method::Post, "/disk/add") => {
                let id = st.alloc_id();
                let mut disk = obj(json!({ ".id": id, "slot": "tmp1", "mount-point": "tmp1" }));
                merge(&mut disk, body);
                st.disks.push(disk);
                Ok(json!({ "ret": id }))
            }
            (Method::Post, "/disk/remove") => {
                let id = body
                    .and_then(|b| b.get("numbers"))
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                let before = st.disks.len();
                st.disks.retain(|d| text(d, ".id") != id);
                if st.disks.len() == before {
                    return Err(not_found(&id));
                }
                // tmpfs 删除后其中的文件随之消失
                st.files.retain(|f| !text(f, "name").starts_with("tmp1/"));
                Ok(Value::Array(Vec::new()))
            }
            (Method::Get, "/file") => Ok(Value::from(st.files.clone())),
            (Method::Post, "/file/remove") => {
                let id = body
                    .and_then(|b| b.get("numbers"))
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                let before = st.files.len();
                st.files.retain(|f| text(f, ".id") != id);
                if st.files.len() == before {
                    return Err(not_found(&id));
                }
                Ok(Value::Array(Vec::new()))
            }
            (Method::Get, "/interface/wireless/registration-table")
            | (Method::Get, "/ip/address")
            | (Method::Get, "/ip/route") => Ok(Value::Array(Vec::new())),
            (Method::Get, "/ip/dns") => {
                Ok(json!({ "servers": "", "allow-remote-requests": "false" }))
            }
            _ => Err(bad_request("no such command")),
        }
    }
}

#[async_trait]
impl RouterApi for MockRouter {
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<String> {
        let mut st = self.state();
        st.calls.push(RecordedCall {
            method,
            path: path.to_string(),
            body: body.cloned(),
            timeout,
        });

        if st.unreachable {
            return Err(Error::RemoteUnreachable("connection refused (mock)".into()));
        }
        if st
            .rejections
            .iter()
            .any(|(m, prefix)| *m == method && path.starts_with(prefix.as_str()))
        {
            return Err(bad_request("rejected (mock)"));
        }
        if let Some((_, _, body)) = st
            .canned
            .iter()
            .find(|(m, prefix, _)| *m == method && path.starts_with(prefix.as_str()))
        {
            return Ok(body.clone());
        }

        Self::handle(&mut st, method, path, body).map(|v| v.to_string())
    }

    fn configure(&self, endpoint: &RouterEndpoint) {
        self.state().endpoint = Some(endpoint.clone());
    }
}
