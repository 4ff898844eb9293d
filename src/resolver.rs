//! Turns configured server descriptors into concrete connection targets.

use std::fmt;

use crate::config::ServerConfig;

/// Host used when a descriptor leaves the host empty or no server is given.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Fallback values applied to every unset descriptor field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolDefaults {
    pub user: String,
    pub pass: String,
    /// `None` for protocols without virtual hosts
    pub vhost: Option<String>,
    pub port: u16,
    pub tls_port: u16,
}

impl ProtocolDefaults {
    /// Replace the credentials and virtual host with the global ones when
    /// they are non-empty. The virtual host is only replaced for protocols
    /// that have one.
    pub fn with_overrides(mut self, user: &str, pass: &str, vhost: &str) -> Self {
        if !user.is_empty() {
            self.user = user.to_string();
        }
        if !pass.is_empty() {
            self.pass = pass.to_string();
        }
        if self.vhost.is_some() && !vhost.is_empty() {
            self.vhost = Some(vhost.to_string());
        }
        self
    }
}

/// One resolved broker endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct ServerTarget {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub user: String,
    pub pass: String,
    pub vhost: Option<String>,
}

impl ServerTarget {
    /// `host:port` form used for logging and socket addresses.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ServerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "tls" } else { "tcp" };
        write!(f, "{}://{}@{}:{}", scheme, self.user, self.host, self.port)?;
        if let Some(vhost) = &self.vhost {
            write!(f, "/{}", vhost.trim_start_matches('/'))?;
        }
        Ok(())
    }
}

// The password never shows up in logs.
impl fmt::Debug for ServerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls)
            .field("user", &self.user)
            .field("pass", &"***")
            .field("vhost", &self.vhost)
            .finish()
    }
}

/// Resolve `servers` against `defaults`, preserving order.
///
/// An empty list yields exactly one plain target on [`DEFAULT_HOST`]. This
/// function never fails: missing values fall back to the defaults.
pub fn resolve(servers: &[ServerConfig], defaults: &ProtocolDefaults) -> Vec<ServerTarget> {
    if servers.is_empty() {
        return vec![ServerTarget {
            host: DEFAULT_HOST.to_string(),
            port: defaults.port,
            tls: false,
            user: defaults.user.clone(),
            pass: defaults.pass.clone(),
            vhost: defaults.vhost.clone(),
        }];
    }

    servers
        .iter()
        .map(|server| {
            let port = match (server.port, server.ssl) {
                (0, true) => defaults.tls_port,
                (0, false) => defaults.port,
                (port, _) => port,
            };
            ServerTarget {
                host: non_empty(Some(&server.host)).unwrap_or(DEFAULT_HOST).to_string(),
                port,
                tls: server.ssl,
                user: non_empty(server.user.as_ref())
                    .unwrap_or(&defaults.user)
                    .to_string(),
                pass: non_empty(server.pass.as_ref())
                    .unwrap_or(&defaults.pass)
                    .to_string(),
                vhost: defaults.vhost.as_ref().map(|fallback| {
                    non_empty(server.vhost.as_ref())
                        .unwrap_or(fallback)
                        .to_string()
                }),
            }
        })
        .collect()
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(String::as_str).filter(|v| !v.is_empty())
}
