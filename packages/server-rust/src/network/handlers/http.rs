//! Request/reply entry point.
//!
//! Route descriptors sharing a path are mounted as one axum route that picks
//! the operation by method: an exact method match first, then a route that
//! accepts any method. `HEAD` falls back to `GET`.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Json, Router};
use switchyard_core::{
    OperationId, ProcedureError, Reply, RequestMeta, RouteDescriptor, ServerEvent, Transport,
};
use tracing::debug;

use super::body::parse_input;
use super::{guarded, AppState};
use crate::network::middleware::REQUEST_ID_HEADER;

type MethodTable = Arc<Vec<(Option<Method>, OperationId)>>;

/// Adds one axum route per distinct descriptor path.
pub fn mount_routes(mut router: Router<AppState>, routes: &[RouteDescriptor]) -> Router<AppState> {
    let mut by_path: BTreeMap<&str, Vec<(Option<Method>, OperationId)>> = BTreeMap::new();
    for route in routes {
        by_path
            .entry(route.path.as_str())
            .or_default()
            .push((route.method.clone(), route.operation.clone()));
    }

    for (path, table) in by_path {
        let table: MethodTable = Arc::new(table);
        router = router.route(
            path,
            any(move |State(state): State<AppState>, request: Request| {
                let table = Arc::clone(&table);
                async move {
                    match select_operation(&table, request.method()) {
                        Some(operation) => dispatch_request(state, operation, request).await,
                        None => StatusCode::METHOD_NOT_ALLOWED.into_response(),
                    }
                }
            }),
        );
    }
    router
}

fn select_operation(table: &[(Option<Method>, OperationId)], method: &Method) -> Option<OperationId> {
    let exact = |wanted: &Method| {
        table
            .iter()
            .find(|(m, _)| m.as_ref() == Some(wanted))
            .map(|(_, id)| id.clone())
    };
    exact(method)
        .or_else(|| (*method == Method::HEAD).then(|| exact(&Method::GET)).flatten())
        .or_else(|| table.iter().find(|(m, _)| m.is_none()).map(|(_, id)| id.clone()))
}

/// Parses, derives the context, invokes, and converts the outcome.
pub async fn dispatch_request(state: AppState, operation: OperationId, request: Request) -> Response {
    let _in_flight = state.shutdown.in_flight_guard();
    state.compiled.events().emit(&ServerEvent::Request {
        method: request.method().clone(),
        path: request.uri().path().to_owned(),
    });

    if !state.shutdown.is_accepting() {
        return failure_response(&state, Some(operation), ProcedureError::Overloaded);
    }

    let meta = Arc::new(RequestMeta {
        method: request.method().clone(),
        uri: request.uri().clone(),
        headers: request.headers().clone(),
        request_id: request
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned),
    });

    let outcome = guarded(async {
        let input = parse_input(request).await?;
        let ctx = state
            .compiled
            .context(Arc::clone(&state.instance), Transport::Request(meta))
            .await?;
        state.compiled.call(operation.as_str(), input, ctx).await
    })
    .await;

    match outcome {
        Ok(reply) => {
            debug!(operation = %operation, "request handled");
            reply_response(reply)
        }
        Err(error) => failure_response(&state, Some(operation), error),
    }
}

/// Raw responses pass through, `Reply::Empty` becomes 204, values (including
/// `null`) become JSON.
fn reply_response(reply: Reply) -> Response {
    match reply {
        Reply::Raw(response) => response.map(Body::from),
        Reply::Empty => StatusCode::NO_CONTENT.into_response(),
        Reply::Value(value) => Json(value).into_response(),
    }
}

fn failure_response(state: &AppState, operation: Option<OperationId>, error: ProcedureError) -> Response {
    let error = state.report(operation, error);
    (error.status(), Json(error.to_body())).into_response()
}

#[cfg(test)]
mod tests {
    use axum::http::header::CONTENT_TYPE;
    use axum::http::Request as HttpRequest;
    use serde_json::{json, Value};
    use switchyard_core::{EventKind, Module, OperationTree};
    use tower::ServiceExt;

    use super::super::test_support::state_for;
    use super::*;

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn app(module: &Module) -> Router {
        let state = state_for(module);
        mount_routes(Router::new(), state.compiled.routes()).with_state(state)
    }

    fn demo_module() -> Module {
        Module::new("demo").expose_by_default(true).procedures(|f| {
            OperationTree::new()
                .operation(
                    "echo",
                    f.operation()
                        .handler_raw(|inv| async move { Ok(Reply::Value(inv.input)) }),
                )
                .operation(
                    "search",
                    f.operation()
                        .method(Method::GET)
                        .handler_raw(|inv| async move { Ok(Reply::Value(inv.input)) }),
                )
                .operation(
                    "store",
                    f.operation()
                        .method(Method::POST)
                        .path("/search")
                        .handler_raw(|_inv| async { Ok(Reply::Empty) }),
                )
                .operation(
                    "secret",
                    f.operation().handler_raw(|_inv| async {
                        Err(ProcedureError::Internal(anyhow::anyhow!("connection string leaked")))
                    }),
                )
                .operation(
                    "teapot",
                    f.operation().handler_raw(|_inv| async {
                        Ok(Reply::Raw(
                            axum::http::Response::builder()
                                .status(StatusCode::IM_A_TEAPOT)
                                .body(b"short and stout".to_vec())
                                .unwrap(),
                        ))
                    }),
                )
        })
    }

    #[tokio::test]
    async fn json_round_trip() {
        let response = app(&demo_module())
            .oneshot(
                HttpRequest::post("/echo")
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"hello":"world"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({"hello": "world"}));
    }

    #[tokio::test]
    async fn methods_sharing_a_path_dispatch_separately() {
        let router = app(&demo_module());

        let response = router
            .clone()
            .oneshot(HttpRequest::get("/search?q=rust").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(response).await, json!({"q": "rust"}));

        let response = router
            .clone()
            .oneshot(HttpRequest::post("/search").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = router
            .oneshot(HttpRequest::delete("/search").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn internal_errors_are_generic() {
        let response = app(&demo_module())
            .oneshot(HttpRequest::post("/secret").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["error"]["message"], json!("Internal Server Error"));
        assert!(!body.to_string().contains("leaked"));
    }

    #[tokio::test]
    async fn raw_responses_pass_through() {
        let response = app(&demo_module())
            .oneshot(HttpRequest::post("/teapot").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"short and stout");
    }

    #[tokio::test]
    async fn bad_body_is_reported_with_status() {
        let response = app(&demo_module())
            .oneshot(
                HttpRequest::post("/echo")
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from("{"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"]["name"], json!("BadRequest"));
    }

    #[tokio::test]
    async fn draining_server_rejects_calls() {
        let state = state_for(&demo_module());
        state.shutdown.trigger_shutdown();
        let router = mount_routes(Router::new(), state.compiled.routes()).with_state(state);
        let response = router
            .oneshot(HttpRequest::post("/echo").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn null_results_stay_json() {
        let response = app(&demo_module())
            .oneshot(HttpRequest::post("/echo").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, Value::Null);
    }

    #[tokio::test]
    async fn panicking_listener_does_not_break_the_response() {
        let module = Module::new("noisy")
            .on(EventKind::Request, |_| panic!("listener bug"))
            .with(&demo_module());
        let response = tokio::spawn(async move {
            app(&module)
                .oneshot(
                    HttpRequest::post("/echo")
                        .header(CONTENT_TYPE, "application/json")
                        .body(Body::from(r#""hello""#))
                        .unwrap(),
                )
                .await
                .unwrap()
        })
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!("hello"));
    }

    #[test]
    fn head_falls_back_to_get() {
        let table = vec![(Some(Method::GET), OperationId::from("read"))];
        assert_eq!(select_operation(&table, &Method::HEAD), Some(OperationId::from("read")));
        assert_eq!(select_operation(&table, &Method::PUT), None);
    }
}
