pub mod dto;
pub mod errors;
pub mod extract;
pub mod handlers;

use axum::{
    routing::{get, patch, post},
    Router,
};
use utoipa::OpenApi;
use utoipa_axum::router::OpenApiRouter;

use crate::{auth::Sessions, notify::Notifier, repository::Repository};
use handlers::ApiDoc;

/// Shared handles every handler can reach.
#[derive(Clone)]
pub struct AppState {
    pub repo: Repository,
    pub sessions: Sessions,
    pub notifier: Notifier,
}

pub fn router(state: AppState) -> Router {
    let (router, api) = OpenApiRouter::with_openapi(ApiDoc::openapi())
        .route("/auth/login", post(handlers::login))
        .route("/auth/logout", post(handlers::logout))
        .route("/devices", get(handlers::list_devices).post(handlers::pair_device))
        .route(
            "/devices/{id}",
            patch(handlers::update_device).delete(handlers::delete_device),
        )
        .route("/devices/{id}/gate/toggle", post(handlers::toggle_gate))
        .route("/devices/{id}/alerts", get(handlers::device_alerts))
        .route("/devices/{id}/readings", get(handlers::device_readings))
        .route(
            "/devices/{id}/thresholds",
            get(handlers::get_device_thresholds)
                .put(handlers::put_device_thresholds)
                .delete(handlers::reset_device_thresholds),
        )
        .route(
            "/thresholds",
            get(handlers::get_thresholds)
                .put(handlers::put_thresholds)
                .delete(handlers::reset_thresholds),
        )
        .route(
            "/settings/gate",
            get(handlers::get_gate_settings).put(handlers::put_gate_settings),
        )
        .route("/profile", get(handlers::get_profile).put(handlers::put_profile))
        .route("/dashboard", get(handlers::dashboard))
        .route("/chart", get(handlers::chart))
        .route("/export/devices.csv", get(handlers::export_devices))
        .route("/export/chart.csv", get(handlers::export_chart))
        .route("/notifications", get(handlers::list_notifications))
        .with_state(state)
        .split_for_parts();

    router
        .route("/health", get(handlers::health))
        .route(
            "/api-docs/openapi.json",
            get(move || async move { axum::Json(api) }),
        )
}
