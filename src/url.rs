//! URL parsing for syncwire:// remotes

use crate::protocol::DEFAULT_PORT;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSpec {
    pub host: String,
    pub port: u16,
    /// Relative path on the server, without a leading slash. Empty means the root.
    pub path: String,
}

impl RemoteSpec {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Parse `syncwire://host[:port][/path]`. The scheme is case-insensitive and
/// the port defaults to 5001.
pub fn parse_remote_url(s: &str) -> Option<RemoteSpec> {
    let s_trim = s.trim();
    let scheme_end = s_trim.find(':')?;
    if !s_trim[..scheme_end].eq_ignore_ascii_case("syncwire") {
        return None;
    }
    let mut rest = &s_trim[scheme_end + 1..];
    if let Some(r) = rest.strip_prefix("//") {
        rest = r;
    }
    let (hp, p) = rest.split_once('/').unwrap_or((rest, ""));
    if hp.is_empty() {
        return None;
    }
    let (host, port) = match hp.rsplit_once(':') {
        Some((h, pr)) => (h.to_string(), pr.parse().ok()?),
        None => (hp.to_string(), DEFAULT_PORT),
    };
    if host.is_empty() {
        return None;
    }
    Some(RemoteSpec {
        host,
        port,
        path: p.trim_matches('/').to_string(),
    })
}
