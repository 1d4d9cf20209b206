//! Request classification.
//!
//! The rule table is an ordered list of `(match kind, pattern, strategy)`
//! records built from the three configured pattern lists. Static-asset
//! markers come first, then live-data markers, then exact page routes; the
//! first matching rule wins and a request nothing matches gets
//! [`Strategy::Default`].

use reqwest::Method;

use crate::config::RoutesConfig;
use crate::network::Request;

/// How a classified request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  CacheFirst,
  NetworkFirst,
  StaleWhileRevalidate,
  /// Catch-all; behaves as network-first
  Default,
}

/// Result of classifying a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Not intercepted; the request goes to the network untouched
  Passthrough,
  Intercept(Strategy),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
  /// Pattern appears anywhere in the path
  Contains,
  /// Path equals the pattern
  Exact,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRule {
  pub kind: MatchKind,
  pub pattern: String,
  pub strategy: Strategy,
}

impl RouteRule {
  pub fn new(kind: MatchKind, pattern: impl Into<String>, strategy: Strategy) -> Self {
    Self {
      kind,
      pattern: pattern.into(),
      strategy,
    }
  }

  pub fn matches(&self, path: &str) -> bool {
    match self.kind {
      MatchKind::Contains => path.contains(self.pattern.as_str()),
      MatchKind::Exact => path == self.pattern,
    }
  }
}

#[derive(Debug, Clone, Default)]
pub struct RouteTable {
  rules: Vec<RouteRule>,
}

impl RouteTable {
  pub fn new(rules: Vec<RouteRule>) -> Self {
    Self { rules }
  }

  pub fn from_config(routes: &RoutesConfig) -> Self {
    let cache_first = routes
      .cache_first
      .iter()
      .map(|p| RouteRule::new(MatchKind::Contains, p, Strategy::CacheFirst));
    let network_first = routes
      .network_first
      .iter()
      .map(|p| RouteRule::new(MatchKind::Contains, p, Strategy::NetworkFirst));
    let pages = routes
      .stale_while_revalidate
      .iter()
      .map(|p| RouteRule::new(MatchKind::Exact, p, Strategy::StaleWhileRevalidate));

    Self::new(cache_first.chain(network_first).chain(pages).collect())
  }

  pub fn rules(&self) -> &[RouteRule] {
    &self.rules
  }

  /// Classify a request. Only `GET` over http(s) is intercepted.
  pub fn classify(&self, request: &Request) -> Route {
    if request.method != Method::GET || !matches!(request.url.scheme(), "http" | "https") {
      return Route::Passthrough;
    }
    Route::Intercept(self.strategy_for(request.url.path()))
  }

  /// First matching rule's strategy for a path.
  pub fn strategy_for(&self, path: &str) -> Strategy {
    self
      .rules
      .iter()
      .find(|rule| rule.matches(path))
      .map(|rule| rule.strategy)
      .unwrap_or(Strategy::Default)
  }
}
