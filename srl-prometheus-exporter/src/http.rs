//! HTTP endpoint serving scrapes.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::{Method, StatusCode, Uri};
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tower_http::cors::CorsLayer;
use tracing::{debug, warn};

use crate::agent::AgentHandle;
use crate::exposition;

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    agent: AgentHandle,
    metrics_path: Arc<str>,
}

/// Create the HTTP router.
///
/// Every request on `metrics_path` runs one scrape through the agent. The
/// path is matched literally, so `:` or `*` in it carry no route meaning.
pub fn create_router(agent: AgentHandle, metrics_path: &str) -> Router {
    let state = AppState {
        agent,
        metrics_path: Arc::from(metrics_path),
    };

    let mut router = Router::new();
    if metrics_path != "/health" {
        router = router.route("/health", get(health_handler));
    }

    router
        .fallback(metrics_handler)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn metrics_handler(State(state): State<AppState>, method: Method, uri: Uri) -> Response {
    if uri.path() != &*state.metrics_path {
        return StatusCode::NOT_FOUND.into_response();
    }
    if method != Method::GET && method != Method::HEAD {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    let report = match state.agent.scrape().await {
        Ok(report) => report,
        Err(e) => {
            warn!(error = %e, "Scrape rejected");
            return (StatusCode::SERVICE_UNAVAILABLE, "exporter is shutting down\n").into_response();
        }
    };

    match exposition::render(&report.samples) {
        Ok(body) => {
            debug!(
                scrape = report.scrape_count,
                samples = report.samples.len(),
                failures = report.failures,
                "Scrape served"
            );
            (StatusCode::OK, [(CONTENT_TYPE, exposition::CONTENT_TYPE)], body).into_response()
        }
        Err(e) => {
            warn!(error = %e, "Failed to render scrape");
            (StatusCode::SERVICE_UNAVAILABLE, "failed to render metrics\n").into_response()
        }
    }
}

async fn health_handler() -> Response {
    (StatusCode::OK, "OK").into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Command;
    use crate::agent::testing::handle_pair;
    use crate::collector::ScrapeReport;
    use crate::mapping::Sample;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn body_text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn answering_agent() -> AgentHandle {
        let (agent, mut commands) = handle_pair();
        tokio::spawn(async move {
            while let Some(command) = commands.recv().await {
                if let Command::Scrape(reply) = command {
                    let _ = reply.send(ScrapeReport {
                        scrape_count: 7,
                        samples: vec![Sample {
                            name: "lldp_neighbor_count".to_string(),
                            help: "neighbors".to_string(),
                            labels: vec![("interface_name".to_string(), "ethernet-1/1".to_string())],
                            value: 2.0,
                        }],
                        failures: 0,
                    });
                }
            }
        });
        agent
    }

    async fn get_status(router: Router, path: &str) -> StatusCode {
        router
            .oneshot(Request::get(path).body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn test_metrics_endpoint_runs_scrape() {
        let agent = answering_agent();

        let router = create_router(agent, "/metrics");
        let response = router
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers().get(CONTENT_TYPE).unwrap();
        assert_eq!(content_type.to_str().unwrap(), exposition::CONTENT_TYPE);

        let body = body_text(response).await;
        assert!(body.contains(r#"lldp_neighbor_count{interface_name="ethernet-1/1"} 2"#));
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (agent, _commands) = handle_pair();
        let router = create_router(agent, "/metrics");

        let response = router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "OK");
    }

    #[tokio::test]
    async fn test_custom_metrics_path() {
        let (agent, _commands) = handle_pair();
        let router = create_router(agent, "/prometheus/metrics");

        let response = router
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_route_syntax_in_path_is_literal() {
        for path in ["/metrics/*", "/*", "/a/:", "/metrics/:name", "/metrics/*rest"] {
            let router = create_router(answering_agent(), path);

            assert_eq!(get_status(router.clone(), path).await, StatusCode::OK, "{}", path);
            assert_eq!(get_status(router.clone(), "/metrics/x").await, StatusCode::NOT_FOUND, "{}", path);
            assert_eq!(get_status(router, "/health").await, StatusCode::OK, "{}", path);
        }
    }

    #[tokio::test]
    async fn test_metrics_on_health_path() {
        let router = create_router(answering_agent(), "/health");

        let response = router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.contains("lldp_neighbor_count"));
    }

    #[tokio::test]
    async fn test_post_is_not_allowed() {
        let router = create_router(answering_agent(), "/metrics");

        let response = router
            .oneshot(Request::post("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_closed_agent_is_unavailable() {
        let (agent, commands) = handle_pair();
        drop(commands);
        let router = create_router(agent, "/");

        let response = router
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
