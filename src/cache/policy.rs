//! Ordered predicate/strategy table deciding how a request is handled.

use reqwest::Method;
use url::Url;

use super::traits::Request;

/// How the agent treats a matched request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  /// Straight to the network, never cached
  Passthrough,
  /// Network, then runtime cache, then offline page for navigations
  NetworkFirst,
}

type Predicate = Box<dyn Fn(&Request) -> bool + Send + Sync>;

pub struct Route {
  pub name: &'static str,
  matches: Predicate,
  pub strategy: Strategy,
}

impl Route {
  pub fn new<F>(name: &'static str, strategy: Strategy, matches: F) -> Self
  where
    F: Fn(&Request) -> bool + Send + Sync + 'static,
  {
    Self {
      name,
      matches: Box::new(matches),
      strategy,
    }
  }

  pub fn matches(&self, request: &Request) -> bool {
    (self.matches)(request)
  }
}

/// Routes evaluated top to bottom; the first match wins.
pub struct RoutePolicy {
  routes: Vec<Route>,
  fallback: Strategy,
}

impl RoutePolicy {
  pub fn new(routes: Vec<Route>, fallback: Strategy) -> Self {
    Self { routes, fallback }
  }

  /// Mutations and backend API traffic always go live; everything else is
  /// network-first.
  pub fn standard(api_base: &Url) -> Self {
    let api_host = api_base.host_str().map(str::to_owned);
    let api_port = api_base.port_or_known_default();

    Self::new(
      vec![
        Route::new("non-get", Strategy::Passthrough, |req| {
          req.method != Method::GET
        }),
        Route::new("backend-api", Strategy::Passthrough, move |req| {
          api_host.is_some()
            && req.url.host_str() == api_host.as_deref()
            && req.url.port_or_known_default() == api_port
        }),
      ],
      Strategy::NetworkFirst,
    )
  }

  /// The matching route's name and strategy.
  pub fn resolve(&self, request: &Request) -> (&'static str, Strategy) {
    self
      .routes
      .iter()
      .find(|route| route.matches(request))
      .map(|route| (route.name, route.strategy))
      .unwrap_or(("default", self.fallback))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn policy() -> RoutePolicy {
    RoutePolicy::standard(&Url::parse("https://abc.supabase.co").unwrap())
  }

  #[test]
  fn test_mutations_pass_through() {
    let url = Url::parse("https://app.example.com/items").unwrap();
    for method in [Method::POST, Method::PUT, Method::PATCH, Method::DELETE] {
      let req = Request::new(method, url.clone());
      assert_eq!(policy().resolve(&req), ("non-get", Strategy::Passthrough));
    }
  }

  #[test]
  fn test_api_host_passes_through() {
    let req = Request::get_str("https://abc.supabase.co/rest/v1/items?select=*").unwrap();
    assert_eq!(policy().resolve(&req), ("backend-api", Strategy::Passthrough));
  }

  #[test]
  fn test_static_get_is_network_first() {
    let req = Request::get_str("https://app.example.com/assets/app.js").unwrap();
    assert_eq!(policy().resolve(&req), ("default", Strategy::NetworkFirst));

    // Same host name, different port is not the API
    let req = Request::get_str("https://abc.supabase.co:8443/x").unwrap();
    assert_eq!(policy().resolve(&req), ("default", Strategy::NetworkFirst));
  }

  #[test]
  fn test_first_match_wins() {
    let policy = RoutePolicy::new(
      vec![
        Route::new("images", Strategy::NetworkFirst, |req| {
          req.url.path().ends_with(".png")
        }),
        Route::new("everything", Strategy::Passthrough, |_| true),
      ],
      Strategy::NetworkFirst,
    );

    let png = Request::get_str("https://cdn.example.com/a.png").unwrap();
    let css = Request::get_str("https://cdn.example.com/a.css").unwrap();
    assert_eq!(policy.resolve(&png).0, "images");
    assert_eq!(policy.resolve(&css), ("everything", Strategy::Passthrough));
  }
}
