use crate::config::{ApConfig, RouterEndpoint};
use async_trait::async_trait;
use serde_json::Value;
use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

// 在这里定义所有后端和前端共享的 trait。

/// HTTP verbs used against the RouterOS REST API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Patch,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

/// 路由器 REST API 客户端接口。
///
/// Every call is individually time-bounded: a request that exceeds `timeout`
/// fails with [`crate::Error::RemoteUnreachable`] instead of blocking.
#[async_trait]
pub trait RouterApi: Send + Sync {
    /// Issues `method` against `<router>/rest<path>` and returns the raw body.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        timeout: Duration,
    ) -> crate::Result<String>;

    /// Swaps the router address or account after a settings update.
    fn configure(&self, endpoint: &RouterEndpoint);
}

/// 设备自身的无线链路：站点 (STA) 连接与回退热点 (AP)。
#[async_trait]
pub trait StationLink: Send + Sync {
    /// 检查设备当前是否已连接到上游网络
    async fn is_connected(&self) -> crate::Result<bool>;

    /// Starts associating with `ssid`. Returns once the attempt is issued,
    /// not when it completes; completion is observed via `is_connected`.
    async fn begin_connect(&self, ssid: &str, password: &str) -> crate::Result<()>;

    /// 启动本地回退热点
    async fn start_access_point(&self, ap: &ApConfig) -> crate::Result<()>;

    /// 关闭本地回退热点
    async fn stop_access_point(&self) -> crate::Result<()>;
}

/// 前端资源提供者接口。
#[async_trait]
pub trait UiAssetProvider: Send + Sync {
    /// Retrieves a single UI asset.
    ///
    /// # Arguments
    /// * `path` - The path to the asset (e.g., "index.html", "style.css").
    ///
    /// # Returns
    /// A `Result` containing a tuple of (`Cow<'static, [u8]>`, `String`)
    /// representing the asset's content and its MIME type, or an `Error` if not found.
    async fn get_asset(&self, path: &str) -> crate::Result<(Cow<'static, [u8]>, String)>;
}
