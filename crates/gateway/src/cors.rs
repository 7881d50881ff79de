use axum::http::{header, HeaderValue, Method};
use tower_http::cors::{AllowOrigin, CorsLayer};

const METHODS: [Method; 4] = [Method::GET, Method::POST, Method::PUT, Method::OPTIONS];

/// Build a [`CorsLayer`] from the configured allowed origins.
///
/// Origins may end in `:*` to match any port on that host.  A literal
/// `"*"` allows all origins.
pub fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.len() == 1 && allowed_origins[0] == "*" {
        tracing::warn!("CORS configured with wildcard \"*\"; all origins allowed");
        return CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods(METHODS)
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);
    }

    let (exact, wildcard_prefixes) = partition_origins(allowed_origins);
    let allow_origin = if wildcard_prefixes.is_empty() {
        AllowOrigin::list(exact)
    } else {
        AllowOrigin::predicate(move |origin, _| {
            origin_allowed(&exact, &wildcard_prefixes, origin)
        })
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(METHODS)
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

fn partition_origins(origins: &[String]) -> (Vec<HeaderValue>, Vec<String>) {
    let mut exact = Vec::new();
    let mut wildcard_prefixes = Vec::new();
    for origin in origins {
        if origin.ends_with(":*") {
            wildcard_prefixes.push(origin.trim_end_matches('*').to_owned());
        } else if let Ok(hv) = origin.parse::<HeaderValue>() {
            exact.push(hv);
        } else {
            tracing::warn!(origin = %origin, "invalid CORS origin, skipping");
        }
    }
    (exact, wildcard_prefixes)
}

fn origin_allowed(exact: &[HeaderValue], wildcard_prefixes: &[String], origin: &HeaderValue) -> bool {
    if exact.iter().any(|e| e.as_bytes() == origin.as_bytes()) {
        return true;
    }
    let origin_str = origin.to_str().unwrap_or("");
    wildcard_prefixes.iter().any(|prefix| {
        origin_str
            .strip_prefix(prefix.as_str())
            .map(|port| !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()))
            .unwrap_or(false)
    })
}
