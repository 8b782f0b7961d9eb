use crate::core::errors::TransportError;
use crate::core::kernel::rest::{Egress, EgressFactory};
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

/// Proxy protocols the egress tunnel understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyScheme {
    Socks4,
    Socks5,
    Socks5h,
    Http,
    Https,
}

impl ProxyScheme {
    fn parse(scheme: &str) -> Option<Self> {
        match scheme {
            "socks4" | "socks4a" => Some(Self::Socks4),
            "socks5" => Some(Self::Socks5),
            "socks5h" => Some(Self::Socks5h),
            "http" => Some(Self::Http),
            "https" => Some(Self::Https),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Socks4 => "socks4",
            Self::Socks5 => "socks5",
            Self::Socks5h => "socks5h",
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

/// One egress proxy, e.g. `socks5://10.0.0.1:1080`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyDescriptor {
    pub scheme: ProxyScheme,
    pub host: String,
    pub port: u16,
    url: String,
}

impl ProxyDescriptor {
    pub fn parse(raw: &str) -> Result<Self, TransportError> {
        let parsed = Url::parse(raw.trim()).map_err(|e| {
            TransportError::InvalidParameters(format!("Invalid proxy '{}': {}", raw, e))
        })?;

        let scheme = ProxyScheme::parse(parsed.scheme()).ok_or_else(|| {
            TransportError::InvalidParameters(format!(
                "Unsupported proxy scheme '{}'",
                parsed.scheme()
            ))
        })?;
        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| TransportError::InvalidParameters(format!("Proxy '{}' has no host", raw)))?
            .to_string();
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| TransportError::InvalidParameters(format!("Proxy '{}' has no port", raw)))?;

        Ok(Self {
            scheme,
            host,
            port,
            url: raw.trim().to_string(),
        })
    }

    /// Full proxy URL, credentials included
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl fmt::Display for ProxyDescriptor {
    // host only, credentials never reach the logs
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port)
    }
}

struct ActiveTunnel {
    proxy: ProxyDescriptor,
    egress: Arc<dyn Egress>,
    generation: u64,
}

/// Single-use proxy pool with at most one open tunnel
///
/// Descriptors are consumed on selection and never come back. Opening a new
/// tunnel always closes the current one first.
pub struct ProxyPool {
    remaining: Vec<ProxyDescriptor>,
    active: Option<ActiveTunnel>,
    factory: Arc<dyn EgressFactory>,
    generation: u64,
}

impl ProxyPool {
    pub fn new(proxies: Vec<ProxyDescriptor>, factory: Arc<dyn EgressFactory>) -> Self {
        Self {
            remaining: proxies,
            active: None,
            factory,
            generation: 0,
        }
    }

    /// Build a pool from raw strings, skipping (and logging) malformed entries
    pub fn from_strings(proxies: &[String], factory: Arc<dyn EgressFactory>) -> Self {
        let parsed = proxies
            .iter()
            .filter_map(|raw| match ProxyDescriptor::parse(raw) {
                Ok(proxy) => Some(proxy),
                Err(e) => {
                    warn!("Skipping proxy: {}", e);
                    None
                }
            })
            .collect();
        Self::new(parsed, factory)
    }

    pub fn remaining(&self) -> usize {
        self.remaining.len()
    }

    pub fn has_active(&self) -> bool {
        self.active.is_some()
    }

    /// Active tunnel and its generation number
    pub fn active(&self) -> Option<(Arc<dyn Egress>, u64)> {
        self.active
            .as_ref()
            .map(|tunnel| (tunnel.egress.clone(), tunnel.generation))
    }

    pub fn active_proxy(&self) -> Option<&ProxyDescriptor> {
        self.active.as_ref().map(|tunnel| &tunnel.proxy)
    }

    /// Close the current tunnel and open one through a random unused proxy
    ///
    /// Returns `None` once the pool is empty; the manager is then in direct mode.
    pub fn select_next(&mut self) -> Option<Arc<dyn Egress>> {
        self.close_active();

        while !self.remaining.is_empty() {
            let index = rand::thread_rng().gen_range(0..self.remaining.len());
            let proxy = self.remaining.remove(index);

            match self.factory.tunnel(&proxy) {
                Ok(egress) => {
                    self.generation += 1;
                    info!(proxy = %proxy, remaining = self.remaining.len(), "Switched proxy");
                    self.active = Some(ActiveTunnel {
                        proxy,
                        egress: egress.clone(),
                        generation: self.generation,
                    });
                    return Some(egress);
                }
                Err(e) => {
                    warn!(proxy = %proxy, "Discarding proxy, tunnel could not be opened: {}", e);
                }
            }
        }

        info!("No proxies left, switched to no proxy mode");
        None
    }

    /// Close and uninstall the active tunnel; later calls go direct
    pub fn drop_active(&mut self) {
        if self.close_active() {
            info!("No proxies left, switched to no proxy mode");
        }
    }

    fn close_active(&mut self) -> bool {
        match self.active.take() {
            Some(tunnel) => {
                tunnel.egress.close();
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for ProxyPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyPool")
            .field("remaining", &self.remaining.len())
            .field("active", &self.active_proxy().map(ToString::to_string))
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}
