use std::sync::Arc;

use axum::{extract::DefaultBodyLimit, middleware, routing::post, Router};

pub mod config;
pub mod errors;
pub mod gatekeeper;
pub mod http;
pub mod logging;
pub mod mcp;
pub mod procedures;
pub mod session;

use config::TransportOptions;
use mcp::router::{MessageRouter, RpcHandler};
use session::{Broadcaster, SessionRegistry};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub broadcaster: Broadcaster,
    pub router: Arc<MessageRouter>,
    pub options: Arc<TransportOptions>,
}

impl AppState {
    pub fn new(handler: Arc<dyn RpcHandler>, options: TransportOptions) -> Self {
        let registry = Arc::new(SessionRegistry::new(options.session_buffer));
        let broadcaster = Broadcaster::new(Arc::clone(&registry), options.reply_policy);
        let router = Arc::new(MessageRouter::new(handler, broadcaster.clone()));

        Self {
            registry,
            broadcaster,
            router,
            options: Arc::new(options),
        }
    }
}

pub fn build_app(state: AppState) -> Router {
    let endpoint = Router::new()
        .route(
            &state.options.endpoint_path,
            post(http::handlers::submit).get(http::handlers::subscribe),
        )
        .route_layer(middleware::from_fn(gatekeeper::enforce_gatekeeper));

    endpoint
        .layer(DefaultBodyLimit::max(state.options.max_body_bytes))
        .layer(middleware::from_fn(logging::request_logging_middleware))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::errors::HandlerError;
    use crate::gatekeeper::{BASELINE_PROTOCOL_VERSION, PROTOCOL_VERSION_HEADER};
    use crate::http::handlers::SESSION_ID_HEADER;
    use crate::mcp::router::RequestContext;
    use crate::procedures::DemoProcedures;
    use crate::session::ReplyPolicy;

    use super::*;

    struct SlowHandler;

    #[async_trait::async_trait]
    impl RpcHandler for SlowHandler {
        async fn call(
            &self,
            _method: &str,
            _params: Option<Value>,
            _ctx: RequestContext,
        ) -> Result<Value, HandlerError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Value::Null)
        }
    }

    fn state_with(handler: Arc<dyn RpcHandler>, reply_policy: ReplyPolicy) -> AppState {
        AppState::new(
            handler,
            TransportOptions {
                reply_policy,
                ..TransportOptions::default()
            },
        )
    }

    fn state() -> AppState {
        state_with(Arc::new(DemoProcedures::default()), ReplyPolicy::Correlated)
    }

    fn submit(body: &str) -> Request<Body> {
        Request::builder()
            .uri("/mcp")
            .method("POST")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request build")
    }

    fn subscribe() -> Request<Body> {
        Request::builder()
            .uri("/mcp")
            .method("GET")
            .header(header::ACCEPT, "text/event-stream")
            .body(Body::empty())
            .expect("request build")
    }

    async fn next_event(body: &mut Body) -> Value {
        let frame = tokio::time::timeout(Duration::from_secs(2), body.frame())
            .await
            .expect("event within timeout")
            .expect("stream open")
            .expect("frame");
        let bytes = frame.into_data().expect("data frame");
        let text = std::str::from_utf8(&bytes).expect("utf-8 event");
        let data = text
            .lines()
            .find_map(|line| line.strip_prefix("data: "))
            .expect("data line");
        serde_json::from_str(data).expect("json event data")
    }

    #[tokio::test]
    async fn request_is_acknowledged_before_handler_finishes() {
        let app = build_app(state_with(Arc::new(SlowHandler), ReplyPolicy::Correlated));

        let response = tokio::time::timeout(
            Duration::from_secs(1),
            app.oneshot(submit(r#"{"jsonrpc":"2.0","id":1,"method":"x"}"#)),
        )
        .await
        .expect("acknowledged without waiting for the handler")
        .expect("request execution");

        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn notification_is_acknowledged() {
        let response = build_app(state())
            .oneshot(submit(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#))
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request() {
        for body in [
            "{",
            r#"[{"jsonrpc":"2.0","id":1,"method":"ping"}]"#,
            r#"{"jsonrpc":"2.0","id":true,"method":"ping"}"#,
            r#"{"id":1,"method":"ping"}"#,
        ] {
            let response = build_app(state())
                .oneshot(submit(body))
                .await
                .expect("request execution");

            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body {body}");
            let body = response
                .into_body()
                .collect()
                .await
                .expect("collect body")
                .to_bytes();
            let body_json: Value = serde_json::from_slice(&body).expect("valid json response");
            assert_eq!(body_json["code"], "malformed_message");
        }
    }

    #[tokio::test]
    async fn client_response_is_bad_request() {
        let response = build_app(state())
            .oneshot(submit(r#"{"jsonrpc":"2.0","id":4,"result":{}}"#))
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn foreign_origin_is_forbidden_on_both_verbs() {
        for method in ["POST", "GET"] {
            let response = build_app(state())
                .oneshot(
                    Request::builder()
                        .uri("/mcp")
                        .method(method)
                        .header(header::ORIGIN, "http://evil.example.com")
                        .body(Body::from(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#))
                        .expect("request build"),
                )
                .await
                .expect("request execution");

            assert_eq!(response.status(), StatusCode::FORBIDDEN, "method {method}");
        }
    }

    #[tokio::test]
    async fn rejected_subscribe_never_registers_a_session() {
        let state = state();
        let registry = Arc::clone(&state.registry);

        let response = build_app(state)
            .oneshot(
                Request::builder()
                    .uri("/mcp")
                    .method("GET")
                    .header(PROTOCOL_VERSION_HEADER, "1999-01-01")
                    .body(Body::empty())
                    .expect("request build"),
            )
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn loopback_origin_and_baseline_version_are_accepted() {
        let response = build_app(state())
            .oneshot(
                Request::builder()
                    .uri("/mcp")
                    .method("POST")
                    .header(header::ORIGIN, "http://localhost:3000")
                    .header(PROTOCOL_VERSION_HEADER, BASELINE_PROTOCOL_VERSION)
                    .body(Body::from(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#))
                    .expect("request build"),
            )
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn unsupported_version_is_bad_request() {
        let response = build_app(state())
            .oneshot(
                Request::builder()
                    .uri("/mcp")
                    .method("POST")
                    .header(PROTOCOL_VERSION_HEADER, "2024-11-05")
                    .body(Body::from(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#))
                    .expect("request build"),
            )
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes();
        let body_json: Value = serde_json::from_slice(&body).expect("valid json response");
        assert_eq!(body_json["code"], "unsupported_protocol_version");
    }

    #[tokio::test]
    async fn other_paths_are_not_found() {
        for uri in ["/", "/health", "/mcp/extra"] {
            let response = build_app(state())
                .oneshot(
                    Request::builder()
                        .uri(uri)
                        .method("GET")
                        .body(Body::empty())
                        .expect("request build"),
                )
                .await
                .expect("request execution");

            assert_eq!(response.status(), StatusCode::NOT_FOUND, "uri {uri}");
        }
    }

    #[tokio::test]
    async fn other_methods_are_not_allowed() {
        for method in ["PUT", "DELETE", "PATCH"] {
            let response = build_app(state())
                .oneshot(
                    Request::builder()
                        .uri("/mcp")
                        .method(method)
                        .body(Body::empty())
                        .expect("request build"),
                )
                .await
                .expect("request execution");

            assert_eq!(
                response.status(),
                StatusCode::METHOD_NOT_ALLOWED,
                "method {method}"
            );
        }
    }

    #[tokio::test]
    async fn configured_path_replaces_default() {
        let app = build_app(AppState::new(
            Arc::new(DemoProcedures::default()),
            TransportOptions {
                endpoint_path: "/rpc".to_string(),
                ..TransportOptions::default()
            },
        ));

        let response = app
            .clone()
            .oneshot(submit(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#))
            .await
            .expect("request execution");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/rpc")
                    .method("POST")
                    .body(Body::from(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#))
                    .expect("request build"),
            )
            .await
            .expect("request execution");
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn subscribe_opens_event_stream_with_unique_session_ids() {
        let state = state();
        let registry = Arc::clone(&state.registry);
        let app = build_app(state);

        let first = app.clone().oneshot(subscribe()).await.expect("request execution");
        let second = app.oneshot(subscribe()).await.expect("request execution");

        for response in [&first, &second] {
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(
                response
                    .headers()
                    .get(header::CONTENT_TYPE)
                    .and_then(|value| value.to_str().ok()),
                Some("text/event-stream")
            );
        }

        let first_id = first.headers().get(SESSION_ID_HEADER).expect("session header");
        let second_id = second.headers().get(SESSION_ID_HEADER).expect("session header");
        assert_ne!(first_id, second_id);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn closing_the_stream_removes_the_session() {
        let state = state();
        let registry = Arc::clone(&state.registry);

        let response = build_app(state)
            .oneshot(subscribe())
            .await
            .expect("request execution");
        assert_eq!(registry.len(), 1);

        drop(response);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn reply_arrives_on_the_requesting_session_only() {
        let state = state();
        let app = build_app(state);

        let requester = app.clone().oneshot(subscribe()).await.expect("request execution");
        let session_id = requester
            .headers()
            .get(SESSION_ID_HEADER)
            .expect("session header")
            .clone();
        let mut requester_body = requester.into_body();

        let bystander = app.clone().oneshot(subscribe()).await.expect("request execution");
        let mut bystander_body = bystander.into_body();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/mcp")
                    .method("POST")
                    .header(SESSION_ID_HEADER, session_id)
                    .body(Body::from(
                        r#"{"jsonrpc":"2.0","id":"add-1","method":"math/add","params":{"a":1,"b":2}}"#,
                    ))
                    .expect("request build"),
            )
            .await
            .expect("request execution");
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let event = next_event(&mut requester_body).await;
        assert_eq!(event["jsonrpc"], "2.0");
        assert_eq!(event["id"], "add-1");
        assert_eq!(event["result"], json!({"sum": 3.0}));

        let silent =
            tokio::time::timeout(Duration::from_millis(100), bystander_body.frame()).await;
        assert!(silent.is_err(), "bystander must not see another client's reply");
    }

    #[tokio::test]
    async fn fan_out_policy_delivers_replies_to_every_session() {
        let app = build_app(state_with(
            Arc::new(DemoProcedures::default()),
            ReplyPolicy::FanOut,
        ));

        let mut first = app
            .clone()
            .oneshot(subscribe())
            .await
            .expect("request execution")
            .into_body();
        let mut second = app
            .clone()
            .oneshot(subscribe())
            .await
            .expect("request execution")
            .into_body();

        let response = app
            .oneshot(submit(r#"{"jsonrpc":"2.0","id":8,"method":"ping"}"#))
            .await
            .expect("request execution");
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        assert_eq!(next_event(&mut first).await["id"], 8);
        assert_eq!(next_event(&mut second).await["id"], 8);
    }

    #[tokio::test]
    async fn subscribe_after_shutdown_is_unavailable() {
        let state = state();
        state.registry.close_all();

        let response = build_app(state)
            .oneshot(subscribe())
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn shutdown_ends_open_streams() {
        let state = state();
        let registry = Arc::clone(&state.registry);

        let mut body = build_app(state)
            .oneshot(subscribe())
            .await
            .expect("request execution")
            .into_body();

        registry.close_all();

        let end = tokio::time::timeout(Duration::from_secs(1), body.frame())
            .await
            .expect("stream ends promptly");
        assert!(end.is_none());
    }
}
