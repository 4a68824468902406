//! Platform host matching.
//!
//! Defines which hosts the pipeline touches. Everything else is tunnelled
//! without decryption and passed through unchanged.

/// Host serving the web client pages and the JSON API.
pub const API_HOST: &str = "channels.weixin.qq.com";

/// Hosts serving the client's static scripts.
pub const ASSET_HOSTS: &[&str] = &["res.wx.qq.com"];

/// Strips a trailing port and lowercases `host`.
pub fn normalize_host(host: &str) -> String {
    host.split(':').next().unwrap_or(host).to_ascii_lowercase()
}

/// The set of hosts the pipeline processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformHosts {
    api: String,
    assets: Vec<String>,
}

impl Default for PlatformHosts {
    fn default() -> Self {
        Self {
            api: API_HOST.to_string(),
            assets: ASSET_HOSTS.iter().map(|h| h.to_string()).collect(),
        }
    }
}

impl PlatformHosts {
    /// Creates a host set with `api` and no asset hosts.
    pub fn new(api: impl Into<String>) -> Self {
        Self {
            api: normalize_host(&api.into()),
            assets: Vec::new(),
        }
    }

    /// Adds a static-asset host.
    pub fn with_asset_host(mut self, host: impl Into<String>) -> Self {
        self.assets.push(normalize_host(&host.into()));
        self
    }

    pub fn api_host(&self) -> &str {
        &self.api
    }

    /// Returns true for the API host (port and case ignored).
    pub fn is_api_host(&self, host: &str) -> bool {
        normalize_host(host) == self.api
    }

    /// Returns true for the API host or any asset host.
    pub fn is_platform_host(&self, host: &str) -> bool {
        let host = normalize_host(host);
        host == self.api || self.assets.iter().any(|h| *h == host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_port_and_case() {
        assert_eq!(normalize_host("Channels.Weixin.QQ.com:443"), "channels.weixin.qq.com");
        assert_eq!(normalize_host("example.com"), "example.com");
    }

    #[test]
    fn default_hosts() {
        let hosts = PlatformHosts::default();
        assert!(hosts.is_api_host("channels.weixin.qq.com"));
        assert!(hosts.is_api_host("channels.weixin.qq.com:443"));
        assert!(!hosts.is_api_host("res.wx.qq.com"));
        assert!(hosts.is_platform_host("res.wx.qq.com"));
        assert!(!hosts.is_platform_host("weixin.qq.com"));
        assert!(!hosts.is_platform_host("notchannels.weixin.qq.com"));
    }

    #[test]
    fn custom_hosts() {
        let hosts = PlatformHosts::new("API.local:8080").with_asset_host("cdn.local");
        assert_eq!(hosts.api_host(), "api.local");
        assert!(hosts.is_platform_host("cdn.local"));
        assert!(!hosts.is_platform_host("res.wx.qq.com"));
    }
}
