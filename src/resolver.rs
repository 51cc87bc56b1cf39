//! Reverse DNS resolution (spec §4.4 initialization: "run `reverseResolve`
//! with a 1.5s budget and `[ip]` fallback"). DNS lookup internals are an
//! explicit non-goal of the core; embedders who want real PTR lookups
//! supply their own [`ReverseResolver`]. The default does nothing and lets
//! the bracketed-literal fallback apply.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;

/// The budget the connection state machine allots `resolve` before falling
/// back to the bracketed IP literal (spec: "1.5s budget").
pub const RESOLVE_BUDGET: Duration = Duration::from_millis(1500);

#[async_trait]
pub trait ReverseResolver: Send + Sync {
    /// Resolves `addr` to a client hostname, or `None` to use the
    /// `[ip]`/`[IPv6:ip]` literal fallback.
    async fn resolve(&self, addr: IpAddr) -> Option<String>;
}

/// The default resolver: always falls through to the bracketed literal.
pub struct NoopResolver;

#[async_trait]
impl ReverseResolver for NoopResolver {
    async fn resolve(&self, _addr: IpAddr) -> Option<String> {
        None
    }
}

/// Formats the `[ip]` (or `[IPv6:ip]`) fallback client-hostname literal.
pub fn bracketed_literal(addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(v4) => format!("[{v4}]"),
        IpAddr::V6(v6) => format!("[IPv6:{v6}]"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_resolver_always_falls_back() {
        let resolver = NoopResolver;
        assert_eq!(resolver.resolve("127.0.0.1".parse().unwrap()).await, None);
    }

    #[test]
    fn bracketed_literal_formats_v4_and_v6() {
        assert_eq!(bracketed_literal("192.168.1.1".parse().unwrap()), "[192.168.1.1]");
        assert_eq!(bracketed_literal("::1".parse().unwrap()), "[IPv6:::1]");
    }
}
