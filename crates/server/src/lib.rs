//! HTTP surface for the order service.
//!
//! Thin layer over the business components: order lookups are intercepted by
//! a cache middleware that reports hits through the `X-Cache` header, writes
//! go through the same `OrderService` the message pipeline uses, and the
//! stat sink is exposed read-only. Request metrics are collected by a
//! middleware and served in Prometheus text format.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Path, Request, State, rejection::JsonRejection},
    http::{HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use cache::OrderCache;
use model::Order;
use prometheus::{CounterVec, HistogramOpts, HistogramVec, Opts, Registry};
use service::OrderService;
use stats::StatsReader;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

const X_CACHE: &str = "X-Cache";

/// HTTP server for working with orders and pipeline statistics.
pub struct Server {
    address: String,
    state: AppState,
}

/// Application state shared between request handlers.
#[derive(Clone)]
struct AppState {
    service: Arc<dyn OrderService>,
    cache: Arc<OrderCache>,
    stats: StatsReader,
    metrics: Arc<Metrics>,
}

/// Collects and exposes HTTP server metrics.
struct Metrics {
    registry: Registry,
    http_requests_total: CounterVec,
    http_request_duration_seconds: HistogramVec,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let http_requests_total = CounterVec::new(
            Opts::new("http_requests_total", "Total number of HTTP requests"),
            &["method", "endpoint", "status"],
        )
        .expect("Failed to create http_requests_total metric");

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP request duration in seconds",
            ),
            &["method", "endpoint"],
        )
        .expect("Failed to create http_request_duration_seconds metric");

        registry
            .register(Box::new(http_requests_total.clone()))
            .expect("Failed to register http_requests_total metric");
        registry
            .register(Box::new(http_request_duration_seconds.clone()))
            .expect("Failed to register http_request_duration_seconds metric");

        Self {
            registry,
            http_requests_total,
            http_request_duration_seconds,
        }
    }

    fn record_request(&self, method: &str, endpoint: &str, status: u16, duration: Duration) {
        self.http_requests_total
            .with_label_values(&[method, endpoint, &status.to_string()])
            .inc();
        self.http_request_duration_seconds
            .with_label_values(&[method, endpoint])
            .observe(duration.as_secs_f64());
    }
}

impl Server {
    /// Creates a new server bound to `address` once served.
    pub fn new(
        address: String,
        service: Arc<dyn OrderService>,
        cache: Arc<OrderCache>,
        stats: StatsReader,
    ) -> Self {
        info!(%address, "initializing HTTP server");

        Self {
            address,
            state: AppState {
                service,
                cache,
                stats,
                metrics: Arc::new(Metrics::new()),
            },
        }
    }

    /// Serves requests until the `shutdown` future resolves, then finishes
    /// in-flight requests and returns.
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Server { address, state } = self;
        let app = create_router(state);

        let listener = TcpListener::bind(&address)
            .await
            .context("Failed to bind HTTP address")?;
        info!(%address, "HTTP server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .context("Server error")?;

        info!("HTTP server shut down gracefully");
        Ok(())
    }
}

fn create_router(state: AppState) -> Router {
    let metrics = state.metrics.clone();

    Router::new()
        .route("/api/v1/order", post(create_order))
        .route("/api/v1/order/", get(find_all_orders))
        .route(
            "/api/v1/order/{order_uid}",
            get(find_order).layer(middleware::from_fn_with_state(state.clone(), cache_lookup)),
        )
        .route("/api/v1/stats", get(get_stats))
        .route("/api/v1/stats/counts", get(get_stat_counts))
        .route("/api/v1/producer/{count}", post(produce_orders))
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .layer(middleware::from_fn_with_state(
            metrics,
            metrics_middleware,
        ))
        .with_state(state)
}

/// Middleware collecting request count and latency per method and path.
async fn metrics_middleware(
    State(metrics): State<Arc<Metrics>>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let start = std::time::Instant::now();

    let response = next.run(request).await;

    metrics.record_request(&method, &path, response.status().as_u16(), start.elapsed());
    response
}

/// Middleware that resolves order lookups from the cache.
///
/// A hit is answered directly with `X-Cache: Cached`; a miss marks the
/// response with `X-Cache: None` and falls through to the handler, which
/// reads the store and repopulates the cache.
async fn cache_lookup(
    State(state): State<AppState>,
    Path(order_uid): Path<String>,
    request: Request,
    next: Next,
) -> Response {
    match state.cache.get(&order_uid).await {
        Some(order) => (StatusCode::OK, [(X_CACHE, "Cached")], Json(order)).into_response(),
        None => {
            let mut response = next.run(request).await;
            response
                .headers_mut()
                .insert(X_CACHE, HeaderValue::from_static("None"));
            response
        }
    }
}

async fn create_order(
    State(state): State<AppState>,
    payload: Result<Json<Order>, JsonRejection>,
) -> Response {
    let order = match payload {
        Ok(Json(order)) => order,
        Err(rejection @ JsonRejection::MissingJsonContentType(_)) => {
            warn!(error = %rejection, "order submitted without JSON content type");
            return (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "Content-Type must be application/json",
            )
                .into_response();
        }
        Err(rejection) => {
            error!(error = %rejection, "failed to bind order body");
            return (StatusCode::INTERNAL_SERVER_ERROR, rejection.to_string()).into_response();
        }
    };

    match state.service.save(&order).await {
        Ok(()) => (StatusCode::OK, Json(order)).into_response(),
        Err(e) => {
            error!(order_uid = %order.order_uid, error = %e, "failed to save order");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn find_order(State(state): State<AppState>, Path(order_uid): Path<String>) -> Response {
    if order_uid.is_empty() {
        return (StatusCode::BAD_REQUEST, "order id is required").into_response();
    }

    match state.service.find_by_id(&order_uid).await {
        Ok(order) => (StatusCode::OK, Json(order)).into_response(),
        Err(e) if e.is_not_found() => {
            warn!(%order_uid, "order not found");
            (StatusCode::NOT_FOUND, "order not found").into_response()
        }
        Err(e) => {
            error!(%order_uid, error = %e, "failed to load order");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn find_all_orders(State(state): State<AppState>) -> Response {
    match state.service.find_all().await {
        Ok(orders) => (StatusCode::OK, Json(orders)).into_response(),
        Err(e) => {
            error!(error = %e, "failed to load orders");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn get_stats(State(state): State<AppState>) -> Response {
    (StatusCode::OK, Json(state.stats.stats().await)).into_response()
}

async fn get_stat_counts(State(state): State<AppState>) -> Response {
    (StatusCode::OK, Json(state.stats.counts())).into_response()
}

async fn produce_orders(Path(count): Path<usize>) -> Response {
    match nats_producer::produce_test_orders(count).await {
        Ok(order_uids) => (
            StatusCode::OK,
            format!("Published {} test orders", order_uids.len()),
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "failed to publish test orders");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to publish test orders",
            )
                .into_response()
        }
    }
}

async fn handle_health() -> &'static str {
    "OK"
}

async fn handle_metrics(State(state): State<AppState>) -> Response {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&state.metrics.registry.gather(), &mut buffer) {
        error!(error = %e, "failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response();
    }

    match String::from_utf8(buffer) {
        Ok(metrics_text) => (StatusCode::OK, metrics_text).into_response(),
        Err(e) => {
            error!(error = %e, "metrics are not valid UTF-8");
            (StatusCode::INTERNAL_SERVER_ERROR, "Invalid metrics data").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use axum::http::Request as HttpRequest;
    use model::{Delivery, Item, Payment};
    use repository::RepositoryError;
    use service::ServiceError;
    use stats::{MessageStat, stats_channel};
    use tokio::sync::Mutex;
    use tower::ServiceExt;

    /// Service double over a plain map; misses report NotFound.
    #[derive(Default)]
    struct StubService {
        orders: Mutex<HashMap<String, Order>>,
    }

    #[async_trait]
    impl OrderService for StubService {
        async fn save(&self, order: &Order) -> Result<(), ServiceError> {
            self.orders
                .lock()
                .await
                .insert(order.order_uid.clone(), order.clone());
            Ok(())
        }

        async fn find_by_id(&self, order_uid: &str) -> Result<Order, ServiceError> {
            self.orders
                .lock()
                .await
                .get(order_uid)
                .cloned()
                .ok_or(ServiceError::Repository(RepositoryError::NotFound))
        }

        async fn find_all(&self) -> Result<Vec<Order>, ServiceError> {
            Ok(self.orders.lock().await.values().cloned().collect())
        }
    }

    fn sample_order(uid: &str) -> Order {
        Order {
            order_uid: uid.to_string(),
            track_number: "TRACK1".to_string(),
            entry: "WBIL".to_string(),
            delivery: Delivery {
                name: "Test User".to_string(),
                phone: "+1000000000".to_string(),
                zip: "0000".to_string(),
                city: "City".to_string(),
                address: "Street 1".to_string(),
                region: "Region".to_string(),
                email: "user@example.com".to_string(),
            },
            payment: Payment {
                transaction: "tx1".to_string(),
                request_id: String::new(),
                currency: "USD".to_string(),
                provider: "pay".to_string(),
                amount: Some(10),
                payment_dt: 1637907727,
                bank: "bank".to_string(),
                delivery_cost: Some(0),
                goods_total: Some(10),
                custom_fee: Some(0),
            },
            items: vec![Item {
                chrt_id: 1,
                track_number: "TRACK1".to_string(),
                price: 10,
                rid: "rid1".to_string(),
                name: "Item".to_string(),
                sale: 0,
                size: "M".to_string(),
                total_price: Some(10),
                nm_id: 42,
                brand: "Brand".to_string(),
                status: 202,
            }],
            locale: "en".to_string(),
            internal_signature: String::new(),
            customer_id: "cust".to_string(),
            delivery_service: "meest".to_string(),
            shardkey: "9".to_string(),
            sm_id: 99,
            date_created: chrono::Utc::now(),
            oof_shard: "1".to_string(),
        }
    }

    fn test_state(stats: StatsReader) -> AppState {
        AppState {
            service: Arc::new(StubService::default()),
            cache: Arc::new(OrderCache::new()),
            stats,
            metrics: Arc::new(Metrics::new()),
        }
    }

    fn empty_stats_reader() -> StatsReader {
        let (_pusher, reader, _collector) = stats_channel(1);
        reader
    }

    #[test]
    fn server_creation() {
        let server = Server::new(
            "0.0.0.0:8081".to_string(),
            Arc::new(StubService::default()),
            Arc::new(OrderCache::new()),
            empty_stats_reader(),
        );
        assert_eq!(server.address, "0.0.0.0:8081");
    }

    #[tokio::test]
    async fn post_without_json_content_type_is_415() {
        let app = create_router(test_state(empty_stats_reader()));

        let request = HttpRequest::builder()
            .method("POST")
            .uri("/api/v1/order")
            .body(Body::from("{}"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn post_order_echoes_it_back() {
        let state = test_state(empty_stats_reader());
        let app = create_router(state.clone());
        let order = sample_order("u1");

        let request = HttpRequest::builder()
            .method("POST")
            .uri("/api/v1/order")
            .header("Content-Type", "application/json")
            .body(Body::from(serde_json::to_vec(&order).unwrap()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let echoed: Order = serde_json::from_slice(&body).unwrap();
        assert_eq!(echoed, order);
        assert!(state.service.find_by_id("u1").await.is_ok());
    }

    #[tokio::test]
    async fn cached_order_is_served_with_cache_header() {
        let state = test_state(empty_stats_reader());
        state.cache.set(sample_order("u1")).await;
        let app = create_router(state);

        let request = HttpRequest::builder()
            .uri("/api/v1/order/u1")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(X_CACHE).unwrap(),
            &HeaderValue::from_static("Cached")
        );
    }

    #[tokio::test]
    async fn cache_miss_marks_the_response() {
        let app = create_router(test_state(empty_stats_reader()));

        let request = HttpRequest::builder()
            .uri("/api/v1/order/missing")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(X_CACHE).unwrap(),
            &HeaderValue::from_static("None")
        );
    }

    #[tokio::test]
    async fn stat_counts_are_exposed_as_json() {
        let (pusher, reader, collector) = stats_channel(4);
        let collector = tokio::spawn(collector.run());
        pusher.push(MessageStat::success("u1")).await;
        pusher.push(MessageStat::error("u2", "boom")).await;
        drop(pusher);
        collector.await.unwrap();

        let app = create_router(test_state(reader));
        let request = HttpRequest::builder()
            .uri("/api/v1/stats/counts")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let counts: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(counts["processed"], 2);
        assert_eq!(counts["failed"], 1);
    }

    #[tokio::test]
    async fn stats_map_lists_events_per_uid() {
        let (pusher, reader, collector) = stats_channel(4);
        let collector = tokio::spawn(collector.run());
        pusher.push(MessageStat::error("u4", "duplicate")).await;
        drop(pusher);
        collector.await.unwrap();

        let app = create_router(test_state(reader));
        let request = HttpRequest::builder()
            .uri("/api/v1/stats")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let stats: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(stats["u4"][0]["status"], "error");
    }

    #[tokio::test]
    async fn health_endpoint_responds() {
        let app = create_router(test_state(empty_stats_reader()));
        let request = HttpRequest::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
