//! Client-facing API: the endpoints OpenAI-style clients talk to.
//!
//! This is intentionally a thin layer: the relay flow lives in
//! [`crate::relay`]. Handlers translate HTTP concerns (headers, status codes,
//! body framing) into a call to the relay and back.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::header,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde_json::{json, Value};

use crate::{
    api::client_auth::{client_auth_middleware, ClientCredential},
    error::AppError,
    relay::{self, RelayOutcome, RelayState},
};

/// Build the client-facing axum router.
pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/healthz", get(crate::api::health::healthz))
        .route(
            "/v1/chat/completions",
            post(chat_completions).layer(middleware::from_fn(client_auth_middleware)),
        )
        .route("/v1/models", get(list_models))
        .with_state(state)
}

/// `POST /v1/chat/completions`: relay a chat request upstream.
///
/// With `"stream": true` the upstream SSE bytes are returned as they arrive;
/// otherwise the stream is reduced to one `chat.completion` document.
pub async fn chat_completions(
    State(state): State<Arc<RelayState>>,
    Extension(ClientCredential(key)): Extension<ClientCredential>,
    body: Bytes,
) -> Result<Response, AppError> {
    let body: Value = serde_json::from_slice(&body).context("request body is not valid JSON")?;

    match relay::relay(&state, body, &key).await? {
        RelayOutcome::Stream(stream) => Ok((
            [
                (header::CONTENT_TYPE, "text/event-stream"),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            Body::from_stream(stream),
        )
            .into_response()),
        RelayOutcome::Document(document) => Ok(Json(document).into_response()),
    }
}

/// `GET /v1/models`: the static model catalog from config.
pub async fn list_models(State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    let data: Vec<Value> = state
        .config
        .models
        .iter()
        .map(|m| {
            json!({
                "id": m.id,
                "object": "model",
                "created": m.created,
                "owned_by": m.owned_by,
            })
        })
        .collect();
    Json(json!({ "object": "list", "data": data }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
    };
    use serde_json::{json, Value};
    use tower::ServiceExt; // oneshot
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::{config::Config, relay::RelayState};

    // -----------------------------------------------------------------------
    // Test helpers
    // -----------------------------------------------------------------------

    const SSE_HELLO: &str = concat!(
        "data: {\"id\":\"chatcmpl-up\",\"created\":1700000000,\"model\":\"vendor-large\",",
        "\"choices\":[{\"delta\":{\"role\":\"assistant\",\"content\":\"Hel\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}],",
        "\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":2,\"total_tokens\":5}}\n\n",
        "data: [DONE]\n\n",
    );

    fn state_with_upstream(base_url: &str) -> Arc<RelayState> {
        let config: Config = toml::from_str(&format!(
            r#"
            [upstream]
            base_url = "{base_url}"
            connect_timeout_ms = 1000

            [model_map]
            "gpt-4o" = "vendor-large"

            [[models]]
            id = "gpt-4o"
            owned_by = "vendor"
            created = 1715367049
            "#
        ))
        .unwrap();
        Arc::new(RelayState::new(Arc::new(config)).unwrap())
    }

    fn minimal_state() -> Arc<RelayState> {
        // Port 1 is reserved and never responds, so the connection is refused.
        state_with_upstream("http://127.0.0.1:1")
    }

    fn chat_request(body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("Content-Type", "application/json")
            .header("Authorization", "Bearer sk-client")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    async fn body_json(body: Body) -> Value {
        let bytes = to_bytes(body, usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn mock_upstream(status: u16, body: &str) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(status).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;
        server
    }

    // -----------------------------------------------------------------------
    // GET /healthz, GET /v1/models
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn healthz_returns_200_ok() {
        let app = super::router(minimal_state());
        let req = Request::get("/healthz").body(Body::empty()).unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp.into_body()).await["status"], "ok");
    }

    #[tokio::test]
    async fn list_models_returns_catalog_without_credential() {
        let app = super::router(minimal_state());
        let req = Request::get("/v1/models").body(Body::empty()).unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let json = body_json(resp.into_body()).await;
        assert_eq!(json["object"], "list");
        assert_eq!(
            json["data"],
            json!([{ "id": "gpt-4o", "object": "model", "created": 1715367049, "owned_by": "vendor" }])
        );
    }

    // -----------------------------------------------------------------------
    // POST /v1/chat/completions
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn non_stream_request_is_reduced_to_one_document() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(json!({
                "model": "vendor-large",
                "stream": true,
                "messages": [
                    { "role": "system", "content": [{ "type": "text", "text": "You are a helpful assistant." }] },
                    { "role": "user", "content": [{ "type": "text", "text": "hello" }] },
                ],
            })))
            .respond_with(ResponseTemplate::new(200).set_body_raw(SSE_HELLO, "text/event-stream"))
            .expect(1)
            .mount(&server)
            .await;

        let app = super::router(state_with_upstream(&server.uri()));
        let resp = app
            .oneshot(chat_request(json!({
                "model": "gpt-4o",
                "messages": [{ "role": "user", "content": " hello " }],
            })))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp.into_body()).await;
        assert_eq!(
            json,
            json!({
                "id": "chatcmpl-up",
                "object": "chat.completion",
                "created": 1700000000,
                "model": "vendor-large",
                "choices": [{
                    "index": 0,
                    "message": { "role": "assistant", "content": "Hello" },
                    "finish_reason": "stop",
                }],
                "usage": { "prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5 },
            })
        );
    }

    #[tokio::test]
    async fn stream_request_passes_upstream_bytes_through() {
        let server = mock_upstream(200, SSE_HELLO).await;
        let app = super::router(state_with_upstream(&server.uri()));

        let resp = app
            .oneshot(chat_request(json!({
                "model": "gpt-4o",
                "stream": true,
                "messages": [{ "role": "user", "content": "hello" }],
            })))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(resp.headers()[header::CACHE_CONTROL], "no-cache");
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], SSE_HELLO.as_bytes());
    }

    #[tokio::test]
    async fn tool_call_stream_is_reduced_with_null_content() {
        let sse = concat!(
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",",
            "\"type\":\"function\",\"function\":{\"name\":\"f\",\"arguments\":\"{\\\"a\\\":\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,",
            "\"function\":{\"arguments\":\"1}\"}}]},\"finish_reason\":\"tool_calls\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        let server = mock_upstream(200, sse).await;
        let app = super::router(state_with_upstream(&server.uri()));

        let resp = app
            .oneshot(chat_request(json!({ "model": "m", "messages": [] })))
            .await
            .unwrap();
        let json = body_json(resp.into_body()).await;

        let message = &json["choices"][0]["message"];
        assert_eq!(message["content"], Value::Null);
        assert_eq!(
            message["tool_calls"],
            json!([{ "id": "call_1", "type": "function", "function": { "name": "f", "arguments": "{\"a\":1}" } }])
        );
        assert_eq!(json["choices"][0]["finish_reason"], "tool_calls");
        // The stream never named a model.
        assert_eq!(json["model"], "unknown");
    }

    #[tokio::test]
    async fn missing_credential_returns_401_without_calling_upstream() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let app = super::router(state_with_upstream(&server.uri()));
        let req = Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("Content-Type", "application/json")
            .body(Body::from(r#"{"model":"m","messages":[]}"#))
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let json = body_json(resp.into_body()).await;
        assert_eq!(json["type"], "error");
        assert_eq!(json["error"]["type"], "authentication_error");
    }

    #[tokio::test]
    async fn upstream_failure_status_and_message_are_mirrored() {
        let server = mock_upstream(429, r#"{"error":{"message":"quota exceeded"}}"#).await;
        let app = super::router(state_with_upstream(&server.uri()));

        let resp = app
            .oneshot(chat_request(json!({ "model": "m", "messages": [] })))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        let json = body_json(resp.into_body()).await;
        assert_eq!(json["error"]["message"], "quota exceeded");
        assert_eq!(json["error"]["type"], "upstream_error");
    }

    #[tokio::test]
    async fn upstream_failure_in_stream_mode_is_still_an_error_envelope() {
        let server = mock_upstream(500, "oops").await;
        let app = super::router(state_with_upstream(&server.uri()));

        let resp = app
            .oneshot(chat_request(json!({ "model": "m", "messages": [], "stream": true })))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(resp.into_body()).await;
        assert_eq!(json["error"]["message"], "upstream returned HTTP 500 Internal Server Error");
    }

    #[tokio::test]
    async fn unreachable_upstream_returns_500() {
        let app = super::router(minimal_state());
        let resp = app
            .oneshot(chat_request(json!({ "model": "m", "messages": [] })))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(resp.into_body()).await;
        assert_eq!(json["error"]["type"], "internal_error");
        assert!(json["error"]["message"].is_string());
    }

    #[tokio::test]
    async fn invalid_json_body_returns_500_envelope() {
        let app = super::router(minimal_state());
        let req = Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("x-api-key", "sk-client")
            .body(Body::from("{not json"))
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(resp.into_body()).await;
        assert!(json["error"]["message"]
            .as_str()
            .unwrap()
            .contains("not valid JSON"));
    }
}
