use axum::{
    extract::{DefaultBodyLimit, Request, State as AxumState},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Router,
};
use governor::middleware::NoOpMiddleware;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::Drawer;

mod admin;
mod http;

pub struct Api {
    drawer: Arc<Drawer>,
}

#[derive(Clone)]
struct OriginConfig {
    allowed_origins: Arc<HashSet<String>>,
    allow_any_origin: bool,
}

type IpGovernorConfig =
    tower_governor::governor::GovernorConfig<SmartIpKeyExtractor, NoOpMiddleware>;

fn governor_config(period: Duration, burst_size: u32) -> Option<Arc<IpGovernorConfig>> {
    GovernorConfigBuilder::default()
        .period(period)
        .burst_size(burst_size)
        .key_extractor(SmartIpKeyExtractor)
        .finish()
        .or_else(|| {
            tracing::warn!("invalid rate-limit config; falling back to defaults");
            GovernorConfigBuilder::default()
                .key_extractor(SmartIpKeyExtractor)
                .finish()
        })
        .map(Arc::new)
}

impl Api {
    pub fn new(drawer: Arc<Drawer>) -> Self {
        Self { drawer }
    }

    pub fn router(&self) -> Router {
        let allowed_origins = parse_allowed_origins("ALLOWED_HTTP_ORIGINS");
        let allow_any_origin = allowed_origins.contains("*");
        let cors_origins = allowed_origins
            .iter()
            .filter(|origin| *origin != "*")
            .filter_map(|origin| match HeaderValue::from_str(origin) {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!("Invalid origin in ALLOWED_HTTP_ORIGINS: {}", origin);
                    None
                }
            })
            .collect::<Vec<_>>();
        let origin_config = OriginConfig {
            allowed_origins: Arc::new(allowed_origins),
            allow_any_origin,
        };

        let cors = if allow_any_origin {
            CorsLayer::new().allow_origin(AllowOrigin::any())
        } else {
            CorsLayer::new().allow_origin(AllowOrigin::list(cors_origins))
        }
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::HeaderName::from_static("x-request-id"),
        ])
        .expose_headers([header::HeaderName::from_static("x-request-id")]);

        // Environment variables override config
        let config = self.drawer.config();
        let http_rate_per_sec =
            parse_env_u64("RATE_LIMIT_HTTP_PER_SEC").or(config.http_rate_limit_per_second);
        let http_rate_burst =
            parse_env_u32("RATE_LIMIT_HTTP_BURST").or(config.http_rate_limit_burst);
        let auth_rate_per_min =
            parse_env_u64("RATE_LIMIT_AUTH_PER_MIN").or(config.auth_rate_limit_per_minute);
        let auth_rate_burst =
            parse_env_u32("RATE_LIMIT_AUTH_BURST").or(config.auth_rate_limit_burst);

        let governor_conf = match (http_rate_per_sec, http_rate_burst) {
            (Some(rate_per_second), Some(burst_size)) if rate_per_second > 0 && burst_size > 0 => {
                let nanos_per_request = (1_000_000_000u64 / rate_per_second).max(1);
                governor_config(Duration::from_nanos(nanos_per_request), burst_size)
            }
            _ => None,
        };

        // Registration and login get a stricter per-minute budget
        let auth_governor_conf = match (auth_rate_per_min, auth_rate_burst) {
            (Some(rate_per_minute), Some(burst_size)) if rate_per_minute > 0 && burst_size > 0 => {
                let nanos_per_request = (60_000_000_000u64 / rate_per_minute).max(1);
                let period = Duration::from_nanos(nanos_per_request);
                tracing::info!(
                    rate_per_minute,
                    burst_size,
                    period_ms = period.as_millis(),
                    "Register/login rate limit configured"
                );
                governor_config(period, burst_size)
            }
            _ => None,
        };

        let auth_routes = Router::new()
            .route("/register", post(http::register))
            .route("/admin/login", post(admin::login));
        let auth_routes = match auth_governor_conf {
            Some(config) => auth_routes.layer(GovernorLayer { config }),
            None => auth_routes,
        };

        let router = Router::new()
            .route("/healthz", get(http::healthz))
            .route("/status", get(http::status))
            .route("/metrics", get(http::metrics))
            .route("/admin/logout", post(admin::logout))
            .route("/admin/participants", get(admin::list_participants))
            .route("/admin/participants/:id", delete(admin::remove_participant))
            .route("/admin/participants/:id/email", put(admin::update_email))
            .route(
                "/admin/deadline",
                put(admin::set_deadline).delete(admin::clear_deadline),
            )
            .route("/admin/reset", post(admin::reset))
            .route("/admin/draw", post(admin::draw))
            .route("/admin/assignments", get(admin::assignments))
            .route("/admin/assignments/notify", post(admin::notify));

        let router = match governor_conf {
            Some(config) => router.layer(GovernorLayer { config }),
            None => router,
        };

        let router = router.merge(auth_routes);

        let router = router.layer(cors);
        let drawer = self.drawer.clone();
        let router = router.layer(middleware::from_fn(move |req, next| {
            let origin_config = origin_config.clone();
            let drawer = drawer.clone();
            async move { enforce_origin(origin_config, drawer, req, next).await }
        }));
        let router = match config.http_body_limit_bytes {
            Some(limit) if limit > 0 => router.layer(DefaultBodyLimit::max(limit)),
            _ => router,
        };
        let router = router.layer(middleware::from_fn_with_state(
            self.drawer.clone(),
            request_id_middleware,
        ));
        let router = router.layer(TraceLayer::new_for_http());

        router.with_state(self.drawer.clone())
    }
}

fn parse_allowed_origins(var: &str) -> HashSet<String> {
    std::env::var(var)
        .unwrap_or_default()
        .split(',')
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .collect()
}

fn parse_env_u64(var: &str) -> Option<u64> {
    std::env::var(var).ok().and_then(|v| v.parse().ok())
}

fn parse_env_u32(var: &str) -> Option<u32> {
    std::env::var(var).ok().and_then(|v| v.parse().ok())
}

/// Rejects browser requests from origins that are not allowed. Requests
/// without an `Origin` header (curl, the admin CLI) pass through.
async fn enforce_origin(
    config: OriginConfig,
    drawer: Arc<Drawer>,
    req: Request,
    next: Next,
) -> Response {
    let origin = req
        .headers()
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok());
    if let Some(origin) = origin {
        if !config.allow_any_origin && !config.allowed_origins.contains(origin) {
            drawer.http_metrics().inc_reject_origin();
            return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
        }
    }
    next.run(req).await
}

async fn request_id_middleware(
    AxumState(drawer): AxumState<Arc<Drawer>>,
    req: Request,
    next: Next,
) -> Response {
    let request_id = req
        .headers()
        .get(header::HeaderName::from_static("x-request-id"))
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();
    let mut response = next.run(req).await;
    match response.status() {
        StatusCode::UNAUTHORIZED => drawer.http_metrics().inc_unauthorized(),
        StatusCode::PAYLOAD_TOO_LARGE => drawer.http_metrics().inc_reject_body_limit(),
        StatusCode::TOO_MANY_REQUESTS => drawer.http_metrics().inc_reject_rate_limit(),
        _ => {}
    }
    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(
            header::HeaderName::from_static("x-request-id"),
            header_value,
        );
    }
    tracing::info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "http.request"
    );
    response
}
