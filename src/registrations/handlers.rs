use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, patch, post},
    Json, Router,
};
use tracing::instrument;
use uuid::Uuid;

use crate::{
    auth::extractors::{AdminUser, AuthUser},
    error::AppResult,
    extract::{AppJson, AppPath},
    registrations::{
        dto::{
            AdminRegistration, MyRegistration, RegisterRequest, RegistrationDetails,
            UpdateStatusRequest,
        },
        repo_types::Registration,
        services,
    },
    state::AppState,
};

pub fn registration_routes() -> Router<AppState> {
    Router::new()
        .route("/registrations", post(register).get(list_all))
        .route("/registrations/me", get(list_mine))
        .route("/registrations/my", get(list_mine))
        .route("/registrations/:id/status", patch(update_status))
}

#[instrument(skip(state, user, payload))]
pub async fn register(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    AppJson(payload): AppJson<RegisterRequest>,
) -> AppResult<(StatusCode, Json<RegistrationDetails>)> {
    let details = services::register(&state, user, payload.course_id).await?;
    Ok((StatusCode::CREATED, Json(details)))
}

#[instrument(skip(state, user))]
pub async fn list_mine(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> AppResult<Json<Vec<MyRegistration>>> {
    Ok(Json(services::my_registrations(&state, user.user_id).await?))
}

#[instrument(skip(state, _admin))]
pub async fn list_all(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> AppResult<Json<Vec<AdminRegistration>>> {
    Ok(Json(services::all_registrations(&state).await?))
}

#[instrument(skip(state, _admin, payload))]
pub async fn update_status(
    State(state): State<AppState>,
    _admin: AdminUser,
    AppPath(id): AppPath<Uuid>,
    AppJson(payload): AppJson<UpdateStatusRequest>,
) -> AppResult<Json<Registration>> {
    Ok(Json(
        services::update_status(&state, id, &payload.status).await?,
    ))
}

#[cfg(test)]
mod tests {
    use axum::http::Method;
    use serde_json::json;

    use super::*;
    use crate::{
        app::test_support::{call, request},
        auth::{claims::TokenPayload, repo_types::Role},
    };

    async fn signed_up(app: &Router, email: &str) -> (Uuid, String) {
        call(
            app,
            request(
                Method::POST,
                "/api/v1/auth/signup",
                Some(json!({"name": "Reg", "email": email, "password": "secret1"})),
                None,
            ),
        )
        .await;
        let res = call(
            app,
            request(
                Method::POST,
                "/api/v1/auth/login",
                Some(json!({"email": email, "password": "secret1"})),
                None,
            ),
        )
        .await;
        let id = res.body["user"]["id"].as_str().unwrap().parse().unwrap();
        (id, res.body["accessToken"].as_str().unwrap().to_owned())
    }

    #[tokio::test]
    async fn register_scenario_over_http() {
        let (state, fakes) = AppState::fake_parts();
        let course = fakes.store.insert_course("Retreat", Some(1), 0);
        let app = crate::app::build_app(state);
        let (_, token_a) = signed_up(&app, "a@x.com").await;
        let (_, token_b) = signed_up(&app, "b@x.com").await;
        let body = json!({ "courseId": course.id });

        let anon = call(
            &app,
            request(Method::POST, "/api/v1/registrations", Some(body.clone()), None),
        )
        .await;
        assert_eq!(anon.status, StatusCode::UNAUTHORIZED);

        let ok = call(
            &app,
            request(
                Method::POST,
                "/api/v1/registrations",
                Some(body.clone()),
                Some(&token_a),
            ),
        )
        .await;
        assert_eq!(ok.status, StatusCode::CREATED);
        assert_eq!(ok.body["status"], "CONFIRMED");
        assert_eq!(ok.body["courseId"], course.id.to_string());
        assert_eq!(ok.body["course"]["registeredCount"], 1);
        assert_eq!(ok.body["user"]["email"], "a@x.com");

        let again = call(
            &app,
            request(
                Method::POST,
                "/api/v1/registrations",
                Some(body.clone()),
                Some(&token_a),
            ),
        )
        .await;
        assert_eq!(again.status, StatusCode::CONFLICT);

        let full = call(
            &app,
            request(Method::POST, "/api/v1/registrations", Some(body), Some(&token_b)),
        )
        .await;
        assert_eq!(full.status, StatusCode::BAD_REQUEST);
        assert_eq!(full.body["error"], "Course is full");

        let missing = call(
            &app,
            request(
                Method::POST,
                "/api/v1/registrations",
                Some(json!({ "courseId": Uuid::new_v4() })),
                Some(&token_b),
            ),
        )
        .await;
        assert_eq!(missing.status, StatusCode::NOT_FOUND);

        let mine = call(
            &app,
            request(Method::GET, "/api/v1/registrations/me", None, Some(&token_a)),
        )
        .await;
        assert_eq!(mine.status, StatusCode::OK);
        assert_eq!(mine.body.as_array().unwrap().len(), 1);
        assert_eq!(mine.body[0]["course"]["title"], "Retreat");
    }

    #[tokio::test]
    async fn admin_routes_require_admin() {
        let (state, fakes) = AppState::fake_parts();
        let course = fakes.store.insert_course("Retreat", None, 0);
        let jwt = state.jwt.clone();
        let app = crate::app::build_app(state);
        let (user_id, token) = signed_up(&app, "a@x.com").await;

        let created = call(
            &app,
            request(
                Method::POST,
                "/api/v1/registrations",
                Some(json!({ "courseId": course.id })),
                Some(&token),
            ),
        )
        .await;
        let registration_id = created.body["id"].as_str().unwrap().to_owned();

        let forbidden = call(
            &app,
            request(Method::GET, "/api/v1/registrations", None, Some(&token)),
        )
        .await;
        assert_eq!(forbidden.status, StatusCode::FORBIDDEN);

        let admin = jwt
            .sign_access(TokenPayload {
                user_id,
                role: Role::Admin,
            })
            .unwrap();

        let all = call(
            &app,
            request(Method::GET, "/api/v1/registrations", None, Some(&admin)),
        )
        .await;
        assert_eq!(all.status, StatusCode::OK);
        assert_eq!(all.body[0]["user"]["email"], "a@x.com");
        assert_eq!(all.body[0]["course"]["title"], "Retreat");

        let path = format!("/api/v1/registrations/{registration_id}/status");
        let bad = call(
            &app,
            request(
                Method::PATCH,
                &path,
                Some(json!({"status": "ARCHIVED"})),
                Some(&admin),
            ),
        )
        .await;
        assert_eq!(bad.status, StatusCode::BAD_REQUEST);

        let cancelled = call(
            &app,
            request(
                Method::PATCH,
                &path,
                Some(json!({"status": "CANCELLED"})),
                Some(&admin),
            ),
        )
        .await;
        assert_eq!(cancelled.status, StatusCode::OK);
        assert_eq!(cancelled.body["status"], "CANCELLED");
        assert_eq!(fakes.store.course(course.id).unwrap().registered_count, 1);

        let unknown = call(
            &app,
            request(
                Method::PATCH,
                &format!("/api/v1/registrations/{}/status", Uuid::new_v4()),
                Some(json!({"status": "PENDING"})),
                Some(&admin),
            ),
        )
        .await;
        assert_eq!(unknown.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_bodies_are_bad_requests_with_error_json() {
        let (state, fakes) = AppState::fake_parts();
        let course = fakes.store.insert_course("Retreat", Some(3), 0);
        let jwt = state.jwt.clone();
        let app = crate::app::build_app(state);
        let (user_id, token) = signed_up(&app, "a@x.com").await;

        let bad_id = call(
            &app,
            request(
                Method::POST,
                "/api/v1/registrations",
                Some(json!({ "courseId": "nope" })),
                Some(&token),
            ),
        )
        .await;
        assert_eq!(bad_id.status, StatusCode::BAD_REQUEST);
        assert!(bad_id.body["error"].as_str().unwrap().contains("courseId"));

        let missing = call(
            &app,
            request(Method::POST, "/api/v1/registrations", Some(json!({})), Some(&token)),
        )
        .await;
        assert_eq!(missing.status, StatusCode::BAD_REQUEST);
        assert!(missing.body["error"].is_string());
        assert_eq!(fakes.store.course(course.id).unwrap().registered_count, 0);

        let admin = jwt
            .sign_access(TokenPayload {
                user_id,
                role: Role::Admin,
            })
            .unwrap();
        let bad_path = call(
            &app,
            request(
                Method::PATCH,
                "/api/v1/registrations/not-a-uuid/status",
                Some(json!({"status": "CANCELLED"})),
                Some(&admin),
            ),
        )
        .await;
        assert_eq!(bad_path.status, StatusCode::BAD_REQUEST);
        assert!(bad_path.body["error"].is_string());
    }
}
