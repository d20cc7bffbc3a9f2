//! Outbound route selection.
//!
//! A multi-step operation picks one route up front and passes it back in
//! as the locked route for every later call, so every request of that
//! operation leaves through the same network path.

use std::fmt;

use rand::seq::SliceRandom;

/// An egress proxy, in URL form (`socks5://host:port`, `http://...`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyRoute(String);

impl ProxyRoute {
    pub fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProxyRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Chooses a route for operations that did not lock one.
#[derive(Debug, Clone, Default)]
pub struct ProxySelector {
    pool: Vec<ProxyRoute>,
    fallback: Option<ProxyRoute>,
}

impl ProxySelector {
    /// Empty entries are ignored.
    pub fn new(pool: &[String], fallback: Option<&str>) -> Self {
        Self {
            pool: pool
                .iter()
                .map(|p| p.trim())
                .filter(|p| !p.is_empty())
                .map(ProxyRoute::new)
                .collect(),
            fallback: fallback
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(ProxyRoute::new),
        }
    }

    /// Direct connections only.
    pub fn direct() -> Self {
        Self::default()
    }

    /// A random route from the pool, else the fallback, else `None` (direct).
    pub fn choose(&self) -> Option<ProxyRoute> {
        self.pool
            .choose(&mut rand::thread_rng())
            .cloned()
            .or_else(|| self.fallback.clone())
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty() && self.fallback.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_selector_is_direct() {
        assert_eq!(ProxySelector::direct().choose(), None);
        assert_eq!(ProxySelector::new(&[" ".to_string()], Some("")).choose(), None);
    }

    #[test]
    fn fallback_used_without_pool() {
        let sel = ProxySelector::new(&[], Some("http://10.0.0.1:3128"));
        assert_eq!(
            sel.choose(),
            Some(ProxyRoute::new("http://10.0.0.1:3128"))
        );
    }

    #[test]
    fn pool_wins_over_fallback() {
        let pool = vec![
            "socks5://a:1080".to_string(),
            "socks5://b:1080".to_string(),
        ];
        let sel = ProxySelector::new(&pool, Some("http://fallback:1"));
        for _ in 0..20 {
            let route = sel.choose().unwrap();
            assert!(route.as_str().starts_with("socks5://"));
        }
    }
}
