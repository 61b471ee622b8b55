use std::net::SocketAddr;

use axum::{
    http::{header, HeaderValue, Method},
    middleware,
    routing::get,
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{auth, error::expose_internal_errors, registrations, state::AppState};

/// Browser origin allowed to call the API with credentials (the refresh cookie).
fn cors(client_url: &str) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_credentials(true);
    match HeaderValue::from_str(client_url) {
        Ok(origin) => layer.allow_origin(origin),
        Err(e) => {
            tracing::warn!(error = %e, client_url, "CLIENT_URL is not a valid origin; CORS disabled");
            layer
        }
    }
}

pub fn build_app(state: AppState) -> Router {
    let production = state.config.is_production();
    let cors = cors(&state.config.client_url);

    let mut app = Router::new()
        .nest(
            "/api/v1",
            Router::new()
                .merge(auth::router())
                .merge(registrations::router())
                .route("/health", get(|| async { "ok" })),
        )
        .with_state(state);

    if !production {
        app = app.layer(middleware::from_fn(expose_internal_errors));
    }

    app.layer(cors).layer(
        TraceLayer::new_for_http()
            .make_span_with(|req: &axum::http::Request<_>| {
                let method = req.method().clone();
                let uri = req.uri().clone();
                tracing::info_span!("http_request", %method, uri = %uri, status = tracing::field::Empty)
            })
            .on_response(
                |res: &axum::http::Response<_>, latency: std::time::Duration, span: &tracing::Span| {
                    let status = res.status();
                    span.record("status", tracing::field::display(status));
                    if status.is_server_error() {
                        tracing::error!(%status, ?latency, "response");
                    } else {
                        tracing::info!(%status, ?latency, "response");
                    }
                },
            ),
    )
}

pub async fn serve(app: Router) -> anyhow::Result<()> {
    let addr: SocketAddr = format!(
        "{}:{}",
        std::env::var("APP_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
        std::env::var("APP_PORT").unwrap_or_else(|_| "8080".into())
    )
    .parse()?;

    tracing::info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use axum::{
        body::Body,
        http::{header, HeaderMap, Method, Request, StatusCode},
        Router,
    };
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    pub struct TestResponse {
        pub status: StatusCode,
        pub headers: HeaderMap,
        pub body: Value,
    }

    pub fn request(
        method: Method,
        uri: &str,
        body: Option<Value>,
        bearer: Option<&str>,
    ) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    pub async fn call(app: &Router, req: Request<Body>) -> TestResponse {
        let res = app.clone().oneshot(req).await.unwrap();
        let status = res.status();
        let headers = res.headers().clone();
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        TestResponse {
            status,
            headers,
            body,
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::http::{header, Method, Request, StatusCode};
    use tower::ServiceExt;

    use super::{test_support::request, *};

    #[tokio::test]
    async fn health_is_public() {
        let app = build_app(AppState::fake());
        let res = app
            .oneshot(request(Method::GET, "/api/v1/health", None, None))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn cors_allows_client_origin_with_credentials() {
        let app = build_app(AppState::fake());
        let req = Request::builder()
            .method(Method::OPTIONS)
            .uri("/api/v1/auth/refresh")
            .header(header::ORIGIN, "http://localhost:5173")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .body(axum::body::Body::empty())
            .unwrap();
        let res = app.oneshot(req).await.unwrap();
        assert_eq!(
            res.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "http://localhost:5173"
        );
        assert_eq!(
            res.headers()[header::ACCESS_CONTROL_ALLOW_CREDENTIALS],
            "true"
        );
    }
}
