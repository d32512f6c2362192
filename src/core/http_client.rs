//! Outbound HTTP client factory.
//!
//! Three client shapes: direct (no proxy), system proxy (URL from the
//! `proxy_url` setting), and per-channel proxy. Direct and system-proxy
//! clients are process-wide singletons behind a read-write lock; the cached
//! system-proxy client is rebuilt when the setting value changes. Per-channel
//! clients are built fresh on every call since channels may carry short-lived
//! or rotating proxies.

use std::sync::RwLock;

use crate::core::error::{AppError, Result};

pub struct HttpClientFactory {
    direct: RwLock<Option<reqwest::Client>>,
    system: RwLock<Option<(String, reqwest::Client)>>,
}

impl Default for HttpClientFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClientFactory {
    pub fn new() -> Self {
        Self {
            direct: RwLock::new(None),
            system: RwLock::new(None),
        }
    }

    /// Cached proxy-less client.
    pub fn direct(&self) -> Result<reqwest::Client> {
        if let Some(client) = self.direct.read().unwrap().as_ref() {
            return Ok(client.clone());
        }

        let mut guard = self.direct.write().unwrap();
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .map_err(AppError::Request)?;
        *guard = Some(client.clone());
        Ok(client)
    }

    /// Cached client for the system proxy URL. `proxy_url` is the current
    /// value of the `proxy_url` setting; a changed value invalidates the
    /// cached client.
    pub fn system_proxy(&self, proxy_url: &str) -> Result<reqwest::Client> {
        if proxy_url.is_empty() {
            return Err(AppError::Internal("proxy url is empty".to_string()));
        }

        if let Some((cached_url, client)) = self.system.read().unwrap().as_ref() {
            if cached_url == proxy_url {
                return Ok(client.clone());
            }
        }

        let mut guard = self.system.write().unwrap();
        // Re-check after acquiring the write lock.
        if let Some((cached_url, client)) = guard.as_ref() {
            if cached_url == proxy_url {
                return Ok(client.clone());
            }
        }
        let client = build_proxy_client(proxy_url)?;
        *guard = Some((proxy_url.to_string(), client.clone()));
        Ok(client)
    }

    /// Fresh client for a channel-specific proxy URL. Never cached.
    pub fn custom_proxy(&self, proxy_url: &str) -> Result<reqwest::Client> {
        if proxy_url.is_empty() {
            return Err(AppError::Internal("proxy url is empty".to_string()));
        }
        build_proxy_client(proxy_url)
    }
}

fn build_proxy_client(proxy_url: &str) -> Result<reqwest::Client> {
    let scheme = proxy_url.split("://").next().unwrap_or("");
    let normalized = match scheme {
        "http" | "https" | "socks5" => proxy_url.to_string(),
        // Bare "socks" means SOCKS5.
        "socks" => proxy_url.replacen("socks://", "socks5://", 1),
        other => {
            return Err(AppError::Internal(format!(
                "unsupported proxy scheme: {other}"
            )))
        }
    };

    let proxy = reqwest::Proxy::all(&normalized)
        .map_err(|e| AppError::Internal(format!("invalid proxy url: {e}")))?;
    reqwest::Client::builder()
        .proxy(proxy)
        .build()
        .map_err(AppError::Request)
}
