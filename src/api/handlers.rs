use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use utoipa::OpenApi;
use uuid::Uuid;

use super::{
    dto::{
        ChartResponse, DashboardQuery, DashboardResponse, LoginRequest, LoginResponse,
        PairDeviceRequest, ReadingsQuery,
    },
    errors::AppError,
    extract::{bearer_token, CurrentUser},
    AppState,
};
use crate::{
    auth,
    control::thresholds::{self, Bound, ThresholdAlert, ThresholdCheck},
    db::models::{
        ChartPoint, Device, DeviceStatus, GateMode, GateSettings, GateState, MeasurementUnit,
        Nutrient, ReadingRecord, Readings, ThresholdBand, ThresholdScope, ThresholdSettings, Theme,
        UserProfile,
    },
    export,
    notify::{Notification, Severity},
    repository::{DeviceUpdate, ProfileUpdate},
    sensors::chart::{self, AxisDomain, ALL_GROUPS},
};

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// Sign in with an email address. The profile is created on first login.
#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Session token", body = LoginResponse),
        (status = 400, description = "Malformed email address"),
    ),
    tag = "auth"
)]
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, AppError> {
    let user_id = auth::user_id_for_email(&req.email)
        .ok_or_else(|| AppError::BadRequest("a valid email address is required".into()))?;
    let display_name = req.display_name.filter(|n| !n.trim().is_empty());

    let profile = state.repo.ensure_profile(user_id, display_name).await;
    let token = state.sessions.sign_in(user_id).await;

    Ok(Json(LoginResponse { token, user_id, profile }))
}

/// Revoke the bearer token of this request.
#[utoipa::path(
    post,
    path = "/auth/logout",
    responses(
        (status = 204, description = "Signed out"),
        (status = 401, description = "Missing or invalid token"),
    ),
    tag = "auth"
)]
pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    let token = bearer_token(&headers).ok_or(AppError::Unauthorized)?;
    state
        .sessions
        .sign_out(token)
        .await
        .ok_or(AppError::Unauthorized)?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

/// The caller's devices, newest first. Empty when signed out.
#[utoipa::path(
    get,
    path = "/devices",
    responses((status = 200, description = "Devices", body = Vec<Device>)),
    tag = "devices"
)]
pub async fn list_devices(State(state): State<AppState>, user: CurrentUser) -> Json<Vec<Device>> {
    match user.0 {
        Some(user_id) => Json(state.repo.devices(user_id).await),
        None => Json(Vec::new()),
    }
}

/// Pair a new sensor.
#[utoipa::path(
    post,
    path = "/devices",
    request_body = PairDeviceRequest,
    responses(
        (status = 201, description = "Paired device", body = Device),
        (status = 400, description = "Empty name"),
        (status = 401, description = "Not signed in"),
    ),
    tag = "devices"
)]
pub async fn pair_device(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(req): Json<PairDeviceRequest>,
) -> Result<(StatusCode, Json<Device>), AppError> {
    let user_id = user.require()?;
    let device = state.repo.pair_device(user_id, &req.name, req.group).await?;
    Ok((StatusCode::CREATED, Json(device)))
}

#[utoipa::path(
    patch,
    path = "/devices/{id}",
    params(("id" = Uuid, Path, description = "Device id")),
    request_body = DeviceUpdate,
    responses(
        (status = 200, description = "Updated device", body = Device),
        (status = 400, description = "Invalid field"),
        (status = 401, description = "Not signed in"),
        (status = 404, description = "Unknown device"),
    ),
    tag = "devices"
)]
pub async fn update_device(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
    Json(update): Json<DeviceUpdate>,
) -> Result<Json<Device>, AppError> {
    let user_id = user.require()?;
    Ok(Json(state.repo.update_device(user_id, id, update).await?))
}

#[utoipa::path(
    delete,
    path = "/devices/{id}",
    params(("id" = Uuid, Path, description = "Device id")),
    responses(
        (status = 204, description = "Deleted"),
        (status = 401, description = "Not signed in"),
        (status = 404, description = "Unknown device"),
    ),
    tag = "devices"
)]
pub async fn delete_device(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let user_id = user.require()?;
    state.repo.delete_device(user_id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Flip the nitrogen gate by hand. Only allowed in manual mode.
#[utoipa::path(
    post,
    path = "/devices/{id}/gate/toggle",
    params(("id" = Uuid, Path, description = "Device id")),
    responses(
        (status = 200, description = "Device with its new gate state", body = Device),
        (status = 401, description = "Not signed in"),
        (status = 404, description = "Unknown device"),
        (status = 409, description = "Gate is under automatic control"),
    ),
    tag = "devices"
)]
pub async fn toggle_gate(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Device>, AppError> {
    let user_id = user.require()?;
    Ok(Json(state.repo.toggle_gate(user_id, id).await?))
}

/// Current threshold violations of one device.
#[utoipa::path(
    get,
    path = "/devices/{id}/alerts",
    params(("id" = Uuid, Path, description = "Device id")),
    responses(
        (status = 200, description = "Threshold check", body = ThresholdCheck),
        (status = 404, description = "Unknown device"),
    ),
    tag = "devices"
)]
pub async fn device_alerts(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ThresholdCheck>, AppError> {
    let Some(user_id) = user.0 else {
        return Ok(Json(ThresholdCheck { exceeded: false, alerts: Vec::new() }));
    };
    let device = state.repo.device(user_id, id).await?;
    let limits = state.repo.thresholds(user_id, Some(id)).await;
    Ok(Json(thresholds::check_thresholds(&device.readings, &limits)))
}

/// Persisted reading history of one device, oldest first.
#[utoipa::path(
    get,
    path = "/devices/{id}/readings",
    params(("id" = Uuid, Path, description = "Device id"), ReadingsQuery),
    responses(
        (status = 200, description = "Reading history", body = Vec<ReadingRecord>),
        (status = 400, description = "`from` is after `to`"),
        (status = 404, description = "Unknown device"),
        (status = 500, description = "Remote store failure"),
    ),
    tag = "devices"
)]
pub async fn device_readings(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
    Query(q): Query<ReadingsQuery>,
) -> Result<Json<Vec<ReadingRecord>>, AppError> {
    let Some(user_id) = user.0 else {
        return Ok(Json(Vec::new()));
    };
    if let (Some(from), Some(to)) = (q.from, q.to) {
        if from > to {
            return Err(AppError::BadRequest("`from` must not be after `to`".into()));
        }
    }
    state.repo.device(user_id, id).await?;
    Ok(Json(state.repo.reading_history(user_id, id, q.from, q.to).await?))
}

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

/// The caller's global thresholds, or the defaults.
#[utoipa::path(
    get,
    path = "/thresholds",
    responses((status = 200, description = "Global thresholds", body = ThresholdSettings)),
    tag = "thresholds"
)]
pub async fn get_thresholds(State(state): State<AppState>, user: CurrentUser) -> Json<ThresholdSettings> {
    match user.0 {
        Some(user_id) => Json(state.repo.thresholds(user_id, None).await),
        None => Json(ThresholdSettings::DEFAULT),
    }
}

#[utoipa::path(
    put,
    path = "/thresholds",
    request_body = ThresholdSettings,
    responses(
        (status = 200, description = "Saved thresholds", body = ThresholdSettings),
        (status = 400, description = "Band out of range or min above max"),
        (status = 401, description = "Not signed in"),
    ),
    tag = "thresholds"
)]
pub async fn put_thresholds(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(settings): Json<ThresholdSettings>,
) -> Result<Json<ThresholdSettings>, AppError> {
    let user_id = user.require()?;
    Ok(Json(
        state
            .repo
            .save_thresholds(user_id, ThresholdScope::Global, settings)
            .await?,
    ))
}

/// Reset the global thresholds to the defaults.
#[utoipa::path(
    delete,
    path = "/thresholds",
    responses(
        (status = 200, description = "Thresholds now in effect", body = ThresholdSettings),
        (status = 401, description = "Not signed in"),
    ),
    tag = "thresholds"
)]
pub async fn reset_thresholds(
    State(state): State<AppState>,
    user: CurrentUser,
) -> Result<Json<ThresholdSettings>, AppError> {
    let user_id = user.require()?;
    Ok(Json(state.repo.reset_thresholds(user_id, ThresholdScope::Global).await?))
}

/// Thresholds in effect for one device.
#[utoipa::path(
    get,
    path = "/devices/{id}/thresholds",
    params(("id" = Uuid, Path, description = "Device id")),
    responses(
        (status = 200, description = "Effective thresholds", body = ThresholdSettings),
        (status = 404, description = "Unknown device"),
    ),
    tag = "thresholds"
)]
pub async fn get_device_thresholds(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ThresholdSettings>, AppError> {
    let Some(user_id) = user.0 else {
        return Ok(Json(ThresholdSettings::DEFAULT));
    };
    state.repo.device(user_id, id).await?;
    Ok(Json(state.repo.thresholds(user_id, Some(id)).await))
}

#[utoipa::path(
    put,
    path = "/devices/{id}/thresholds",
    params(("id" = Uuid, Path, description = "Device id")),
    request_body = ThresholdSettings,
    responses(
        (status = 200, description = "Saved override", body = ThresholdSettings),
        (status = 400, description = "Band out of range or min above max"),
        (status = 401, description = "Not signed in"),
        (status = 404, description = "Unknown device"),
    ),
    tag = "thresholds"
)]
pub async fn put_device_thresholds(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
    Json(settings): Json<ThresholdSettings>,
) -> Result<Json<ThresholdSettings>, AppError> {
    let user_id = user.require()?;
    Ok(Json(
        state
            .repo
            .save_thresholds(user_id, ThresholdScope::Device(id), settings)
            .await?,
    ))
}

/// Drop a device override; the global thresholds apply again.
#[utoipa::path(
    delete,
    path = "/devices/{id}/thresholds",
    params(("id" = Uuid, Path, description = "Device id")),
    responses(
        (status = 200, description = "Thresholds now in effect", body = ThresholdSettings),
        (status = 401, description = "Not signed in"),
        (status = 404, description = "Unknown device"),
    ),
    tag = "thresholds"
)]
pub async fn reset_device_thresholds(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ThresholdSettings>, AppError> {
    let user_id = user.require()?;
    Ok(Json(
        state
            .repo
            .reset_thresholds(user_id, ThresholdScope::Device(id))
            .await?,
    ))
}

// ---------------------------------------------------------------------------
// Settings and profile
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/settings/gate",
    responses((status = 200, description = "Gate control mode", body = GateSettings)),
    tag = "settings"
)]
pub async fn get_gate_settings(State(state): State<AppState>, user: CurrentUser) -> Json<GateSettings> {
    match user.0 {
        Some(user_id) => Json(state.repo.gate_settings(user_id).await),
        None => Json(GateSettings::default()),
    }
}

#[utoipa::path(
    put,
    path = "/settings/gate",
    request_body = GateSettings,
    responses(
        (status = 200, description = "Saved gate mode", body = GateSettings),
        (status = 401, description = "Not signed in"),
    ),
    tag = "settings"
)]
pub async fn put_gate_settings(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(settings): Json<GateSettings>,
) -> Result<Json<GateSettings>, AppError> {
    let user_id = user.require()?;
    Ok(Json(state.repo.save_gate_settings(user_id, settings).await?))
}

#[utoipa::path(
    get,
    path = "/profile",
    responses((status = 200, description = "User profile", body = UserProfile)),
    tag = "settings"
)]
pub async fn get_profile(State(state): State<AppState>, user: CurrentUser) -> Json<UserProfile> {
    match user.0 {
        Some(user_id) => Json(state.repo.profile(user_id).await),
        None => Json(UserProfile::new(Uuid::nil(), None)),
    }
}

#[utoipa::path(
    put,
    path = "/profile",
    request_body = ProfileUpdate,
    responses(
        (status = 200, description = "Saved profile", body = UserProfile),
        (status = 401, description = "Not signed in"),
    ),
    tag = "settings"
)]
pub async fn put_profile(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(update): Json<ProfileUpdate>,
) -> Result<Json<UserProfile>, AppError> {
    let user_id = user.require()?;
    Ok(Json(state.repo.save_profile(user_id, update).await?))
}

// ---------------------------------------------------------------------------
// Dashboard, chart and export
// ---------------------------------------------------------------------------

/// Devices of one group with their per-nutrient averages.
#[utoipa::path(
    get,
    path = "/dashboard",
    params(DashboardQuery),
    responses((status = 200, description = "Dashboard summary", body = DashboardResponse)),
    tag = "dashboard"
)]
pub async fn dashboard(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(q): Query<DashboardQuery>,
) -> Json<DashboardResponse> {
    let all = match user.0 {
        Some(user_id) => state.repo.devices(user_id).await,
        None => Vec::new(),
    };
    let group = q
        .group
        .filter(|g| !g.trim().is_empty())
        .unwrap_or_else(|| ALL_GROUPS.to_owned());

    let selected = chart::filter_by_group(&all, &group);
    let averages = chart::average_readings(selected.iter().copied());
    let devices = selected.into_iter().cloned().collect();

    Json(DashboardResponse {
        groups: chart::known_groups(&all),
        group,
        devices,
        averages,
    })
}

/// Averaged reading history with a y-axis range that fits it.
#[utoipa::path(
    get,
    path = "/chart",
    responses((status = 200, description = "Chart history", body = ChartResponse)),
    tag = "dashboard"
)]
pub async fn chart(State(state): State<AppState>, user: CurrentUser) -> Json<ChartResponse> {
    let points = match user.0 {
        Some(user_id) => state.repo.chart(user_id).await,
        None => Vec::new(),
    };
    let y_domain = chart::y_axis_domain(&points);
    Json(ChartResponse { points, y_domain })
}

#[utoipa::path(
    get,
    path = "/export/devices.csv",
    responses((status = 200, description = "Device table as CSV", content_type = "text/csv", body = String)),
    tag = "export"
)]
pub async fn export_devices(State(state): State<AppState>, user: CurrentUser) -> impl IntoResponse {
    let devices = match user.0 {
        Some(user_id) => state.repo.devices(user_id).await,
        None => Vec::new(),
    };
    csv_attachment(export::export_filename("readings", Utc::now()), export::devices_csv(&devices))
}

#[utoipa::path(
    get,
    path = "/export/chart.csv",
    responses(
        (status = 200, description = "Chart history as CSV", content_type = "text/csv", body = String),
        (status = 500, description = "Encoding failure"),
    ),
    tag = "export"
)]
pub async fn export_chart(
    State(state): State<AppState>,
    user: CurrentUser,
) -> Result<impl IntoResponse, AppError> {
    let points = match user.0 {
        Some(user_id) => state.repo.chart(user_id).await,
        None => Vec::new(),
    };
    let body = export::rows_csv(&points)?;
    Ok(csv_attachment(export::export_filename("chart", Utc::now()), body))
}

fn csv_attachment(filename: String, body: String) -> impl IntoResponse {
    (
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_owned()),
            (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{filename}\"")),
        ],
        body,
    )
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// Recent notifications, newest first.
#[utoipa::path(
    get,
    path = "/notifications",
    responses((status = 200, description = "Notifications", body = Vec<Notification>)),
    tag = "notifications"
)]
pub async fn list_notifications(State(state): State<AppState>, user: CurrentUser) -> Json<Vec<Notification>> {
    match user.0 {
        Some(user_id) => Json(state.notifier.list(user_id).await),
        None => Json(Vec::new()),
    }
}

// ---------------------------------------------------------------------------
// Health check
// ---------------------------------------------------------------------------

/// Returns `200 OK` with `{"status":"ok"}` when the server is running.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy"),
    ),
    tag = "system"
)]
pub async fn health() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({ "status": "ok" }))
}

// ---------------------------------------------------------------------------
// OpenAPI spec
// ---------------------------------------------------------------------------

#[derive(OpenApi)]
#[openapi(
    paths(
        login, logout,
        list_devices, pair_device, update_device, delete_device, toggle_gate,
        device_alerts, device_readings,
        get_thresholds, put_thresholds, reset_thresholds,
        get_device_thresholds, put_device_thresholds, reset_device_thresholds,
        get_gate_settings, put_gate_settings, get_profile, put_profile,
        dashboard, chart, export_devices, export_chart,
        list_notifications, health,
    ),
    components(schemas(
        LoginRequest, LoginResponse, PairDeviceRequest, DeviceUpdate, ProfileUpdate,
        DashboardResponse, ChartResponse, AxisDomain,
        Device, DeviceStatus, GateState, Readings, ReadingRecord, Nutrient, ChartPoint,
        ThresholdSettings, ThresholdBand, ThresholdCheck, ThresholdAlert, Bound,
        GateSettings, GateMode, UserProfile, MeasurementUnit, Theme,
        Notification, Severity,
    )),
    tags(
        (name = "auth",          description = "Sign in and out"),
        (name = "devices",       description = "Paired sensors and their gates"),
        (name = "thresholds",    description = "Acceptable nutrient bands"),
        (name = "settings",      description = "Gate mode and user profile"),
        (name = "dashboard",     description = "Group summaries and chart history"),
        (name = "export",        description = "CSV downloads"),
        (name = "notifications", description = "Gate changes and threshold alerts"),
        (name = "system",        description = "System endpoints"),
    ),
    info(
        title = "NitCat API",
        version = "0.1.0",
        description = "Soil nutrient monitoring with simulated NPK sensors and automatic nitrogen gates"
    )
)]
pub struct ApiDoc;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;
    use axum_test::TestServer;
    use serde_json::{json, Value};

    use crate::{
        api::{router, AppState},
        auth::Sessions,
        config::ThresholdSource,
        local_store::LocalStore,
        notify::Notifier,
        remote::{MemoryStore, Remote},
        repository::Repository,
    };

    use super::*;

    fn test_server() -> TestServer {
        let repo = Repository::new(
            LocalStore::new(),
            Remote::Memory(MemoryStore::new()),
            ThresholdSource::RemoteFirst,
            24,
        );
        let state = AppState {
            repo,
            sessions: Sessions::new("test-secret"),
            notifier: Notifier::new(None),
        };
        TestServer::new(router(state)).unwrap()
    }

    async fn sign_in(server: &TestServer, email: &str) -> HeaderValue {
        let resp = server
            .post("/auth/login")
            .json(&json!({ "email": email, "display_name": "Grower" }))
            .await;
        resp.assert_status_ok();
        let body: LoginResponse = resp.json();
        HeaderValue::from_str(&format!("Bearer {}", body.token)).unwrap()
    }

    async fn pair(server: &TestServer, auth: &HeaderValue, name: &str, group: Option<&str>) -> Device {
        let resp = server
            .post("/devices")
            .add_header(header::AUTHORIZATION, auth.clone())
            .json(&json!({ "name": name, "group": group }))
            .await;
        resp.assert_status(StatusCode::CREATED);
        resp.json()
    }

    // -----------------------------------------------------------------------
    // System
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn health_returns_ok() {
        let server = test_server();
        let resp = server.get("/health").await;
        resp.assert_status_ok();
        let body: Value = resp.json();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn openapi_document_lists_routes() {
        let server = test_server();
        let body: Value = server.get("/api-docs/openapi.json").await.json();
        assert!(body["paths"]["/devices"].is_object());
        assert!(body["paths"]["/devices/{id}/gate/toggle"].is_object());
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn login_creates_profile_and_rejects_bad_email() {
        let server = test_server();
        let resp = server
            .post("/auth/login")
            .json(&json!({ "email": "Grower@Example.com", "display_name": "Ada" }))
            .await;
        resp.assert_status_ok();
        let body: LoginResponse = resp.json();
        assert_eq!(body.profile.display_name.as_deref(), Some("Ada"));
        assert_eq!(Some(body.user_id), auth::user_id_for_email("grower@example.com"));

        let resp = server.post("/auth/login").json(&json!({ "email": "nope" })).await;
        resp.assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn logout_invalidates_token() {
        let server = test_server();
        let auth = sign_in(&server, "a@example.com").await;

        server
            .post("/auth/logout")
            .add_header(header::AUTHORIZATION, auth.clone())
            .await
            .assert_status(StatusCode::NO_CONTENT);

        server
            .post("/devices")
            .add_header(header::AUTHORIZATION, auth)
            .json(&json!({ "name": "probe" }))
            .await
            .assert_status(StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn signed_out_reads_are_empty_and_writes_unauthorized() {
        let server = test_server();

        let devices: Vec<Value> = server.get("/devices").await.json();
        assert!(devices.is_empty());

        let thresholds: ThresholdSettings = server.get("/thresholds").await.json();
        assert_eq!(thresholds, ThresholdSettings::DEFAULT);

        let gate: GateSettings = server.get("/settings/gate").await.json();
        assert_eq!(gate.mode, GateMode::Auto);

        server
            .post("/devices")
            .json(&json!({ "name": "probe" }))
            .await
            .assert_status(StatusCode::UNAUTHORIZED);
        server
            .put("/thresholds")
            .json(&ThresholdSettings::DEFAULT)
            .await
            .assert_status(StatusCode::UNAUTHORIZED);

        let body: Value = server.post("/auth/logout").await.json();
        assert_eq!(body["error"], "authentication required");
    }

    // -----------------------------------------------------------------------
    // Devices
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn pair_list_update_delete() {
        let server = test_server();
        let auth = sign_in(&server, "a@example.com").await;

        let first = pair(&server, &auth, "North bed", None).await;
        let second = pair(&server, &auth, "South bed", Some("Garden")).await;
        assert_eq!(first.group.as_deref(), Some("Uncategorized"));
        assert_eq!(first.nitrogen_gate, Some(GateState::Closed));
        assert_eq!(first.nitrogen_timer, Some(24));

        let listed: Vec<Device> = server
            .get("/devices")
            .add_header(header::AUTHORIZATION, auth.clone())
            .await
            .json();
        assert_eq!(listed.iter().map(|d| d.id).collect::<Vec<_>>(), vec![second.id, first.id]);

        let updated: Device = server
            .patch(&format!("/devices/{}", first.id))
            .add_header(header::AUTHORIZATION, auth.clone())
            .json(&json!({ "name": "Renamed", "status": "offline" }))
            .await
            .json();
        assert_eq!(updated.name, "Renamed");
        assert_eq!(updated.status, DeviceStatus::Offline);

        server
            .delete(&format!("/devices/{}", first.id))
            .add_header(header::AUTHORIZATION, auth.clone())
            .await
            .assert_status(StatusCode::NO_CONTENT);
        server
            .delete(&format!("/devices/{}", first.id))
            .add_header(header::AUTHORIZATION, auth)
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn pairing_requires_a_name() {
        let server = test_server();
        let auth = sign_in(&server, "a@example.com").await;
        server
            .post("/devices")
            .add_header(header::AUTHORIZATION, auth)
            .json(&json!({ "name": "  " }))
            .await
            .assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn users_do_not_see_each_other() {
        let server = test_server();
        let alice = sign_in(&server, "alice@example.com").await;
        let bob = sign_in(&server, "bob@example.com").await;
        let d = pair(&server, &alice, "probe", None).await;

        let listed: Vec<Device> = server
            .get("/devices")
            .add_header(header::AUTHORIZATION, bob.clone())
            .await
            .json();
        assert!(listed.is_empty());

        server
            .delete(&format!("/devices/{}", d.id))
            .add_header(header::AUTHORIZATION, bob)
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn manual_toggle_needs_manual_mode() {
        let server = test_server();
        let auth = sign_in(&server, "a@example.com").await;
        let d = pair(&server, &auth, "probe", None).await;
        let path = format!("/devices/{}/gate/toggle", d.id);

        server
            .post(&path)
            .add_header(header::AUTHORIZATION, auth.clone())
            .await
            .assert_status(StatusCode::CONFLICT);

        server
            .put("/settings/gate")
            .add_header(header::AUTHORIZATION, auth.clone())
            .json(&json!({ "mode": "manual" }))
            .await
            .assert_status_ok();

        let toggled: Device = server
            .post(&path)
            .add_header(header::AUTHORIZATION, auth.clone())
            .await
            .json();
        assert_eq!(toggled.nitrogen_gate, Some(GateState::Open));

        let profile: UserProfile = server
            .get("/profile")
            .add_header(header::AUTHORIZATION, auth)
            .await
            .json();
        assert!(!profile.gate_auto_control);
    }

    #[tokio::test]
    async fn reading_history_rejects_inverted_window() {
        let server = test_server();
        let auth = sign_in(&server, "a@example.com").await;
        let d = pair(&server, &auth, "probe", None).await;

        let history: Vec<Value> = server
            .get(&format!("/devices/{}/readings", d.id))
            .add_header(header::AUTHORIZATION, auth.clone())
            .await
            .json();
        assert!(history.is_empty());

        server
            .get(&format!("/devices/{}/readings", d.id))
            .add_query_param("from", "2025-01-02T00:00:00Z")
            .add_query_param("to", "2025-01-01T00:00:00Z")
            .add_header(header::AUTHORIZATION, auth)
            .await
            .assert_status(StatusCode::BAD_REQUEST);
    }

    // -----------------------------------------------------------------------
    // Thresholds
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn global_thresholds_validate_save_and_reset() {
        let server = test_server();
        let auth = sign_in(&server, "a@example.com").await;

        let mut inverted = ThresholdSettings::DEFAULT;
        inverted.nitrogen = ThresholdBand::new(80.0, 30.0);
        let resp = server
            .put("/thresholds")
            .add_header(header::AUTHORIZATION, auth.clone())
            .json(&inverted)
            .await;
        resp.assert_status(StatusCode::BAD_REQUEST);
        let body: Value = resp.json();
        assert!(body["error"].as_str().unwrap().contains("exceeds maximum"));

        let mut custom = ThresholdSettings::DEFAULT;
        custom.potassium = ThresholdBand::new(50.0, 95.0);
        server
            .put("/thresholds")
            .add_header(header::AUTHORIZATION, auth.clone())
            .json(&custom)
            .await
            .assert_status_ok();
        let got: ThresholdSettings = server
            .get("/thresholds")
            .add_header(header::AUTHORIZATION, auth.clone())
            .await
            .json();
        assert_eq!(got, custom);

        let reset: ThresholdSettings = server
            .delete("/thresholds")
            .add_header(header::AUTHORIZATION, auth)
            .await
            .json();
        assert_eq!(reset, ThresholdSettings::DEFAULT);
    }

    #[tokio::test]
    async fn device_override_drives_alerts() {
        let server = test_server();
        let auth = sign_in(&server, "a@example.com").await;
        let d = pair(&server, &auth, "probe", None).await;

        let check: ThresholdCheck = server
            .get(&format!("/devices/{}/alerts", d.id))
            .add_header(header::AUTHORIZATION, auth.clone())
            .await
            .json();
        assert!(!check.exceeded);

        let mut strict = ThresholdSettings::DEFAULT;
        strict.nitrogen = ThresholdBand::new(95.0, 100.0);
        server
            .put(&format!("/devices/{}/thresholds", d.id))
            .add_header(header::AUTHORIZATION, auth.clone())
            .json(&strict)
            .await
            .assert_status_ok();

        let check: Value = server
            .get(&format!("/devices/{}/alerts", d.id))
            .add_header(header::AUTHORIZATION, auth.clone())
            .await
            .json();
        assert_eq!(check["exceeded"], true);
        assert_eq!(check["alerts"][0]["nutrient"], "nitrogen");
        assert_eq!(check["alerts"][0]["bound"], "below");

        let effective: ThresholdSettings = server
            .delete(&format!("/devices/{}/thresholds", d.id))
            .add_header(header::AUTHORIZATION, auth)
            .await
            .json();
        assert_eq!(effective, ThresholdSettings::DEFAULT);
    }

    // -----------------------------------------------------------------------
    // Dashboard, chart, export
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn dashboard_filters_by_group() {
        let server = test_server();
        let auth = sign_in(&server, "a@example.com").await;
        pair(&server, &auth, "a", Some("Garden")).await;
        pair(&server, &auth, "b", Some("Garden")).await;
        pair(&server, &auth, "c", Some("Orchard")).await;

        let garden: DashboardResponse = server
            .get("/dashboard")
            .add_query_param("group", "Garden")
            .add_header(header::AUTHORIZATION, auth.clone())
            .await
            .json();
        assert_eq!(garden.devices.len(), 2);
        assert!(garden.averages.is_some());
        assert!(garden.groups.contains(&"Orchard".to_owned()));
        assert!(garden.groups.contains(&"Field A".to_owned()));

        let empty: DashboardResponse = server
            .get("/dashboard")
            .add_query_param("group", "Research")
            .add_header(header::AUTHORIZATION, auth.clone())
            .await
            .json();
        assert!(empty.devices.is_empty());
        assert!(empty.averages.is_none());

        let all: DashboardResponse = server
            .get("/dashboard")
            .add_header(header::AUTHORIZATION, auth)
            .await
            .json();
        assert_eq!(all.group, "all");
        assert_eq!(all.devices.len(), 3);
    }

    #[tokio::test]
    async fn empty_chart_uses_full_range() {
        let server = test_server();
        let chart: ChartResponse = server.get("/chart").await.json();
        assert!(chart.points.is_empty());
        assert_eq!(chart.y_domain, AxisDomain { min: 0.0, max: 100.0 });
    }

    #[tokio::test]
    async fn device_export_is_an_attachment() {
        let server = test_server();
        let auth = sign_in(&server, "a@example.com").await;
        let d = pair(&server, &auth, "probe", None).await;

        let resp = server
            .get("/export/devices.csv")
            .add_header(header::AUTHORIZATION, auth)
            .await;
        resp.assert_status_ok();

        let disposition = resp.header(header::CONTENT_DISPOSITION);
        let disposition = disposition.to_str().unwrap();
        assert!(disposition.starts_with("attachment; filename=\"nitcat-readings-"));
        assert!(disposition.ends_with(".csv\""));

        let text = resp.text();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some(export::DEVICE_CSV_HEADER));
        assert!(lines.next().unwrap().starts_with(&format!("{},probe,Uncategorized,online,", d.id)));
    }

    #[tokio::test]
    async fn notifications_start_empty() {
        let server = test_server();
        let auth = sign_in(&server, "a@example.com").await;
        let feed: Vec<Value> = server
            .get("/notifications")
            .add_header(header::AUTHORIZATION, auth)
            .await
            .json();
        assert!(feed.is_empty());
    }

    #[tokio::test]
    async fn profile_updates_are_partial() {
        let server = test_server();
        let auth = sign_in(&server, "a@example.com").await;

        let saved: UserProfile = server
            .put("/profile")
            .add_header(header::AUTHORIZATION, auth.clone())
            .json(&json!({ "theme": "dark", "notifications_enabled": false }))
            .await
            .json();
        assert_eq!(saved.theme, Theme::Dark);
        assert!(!saved.notifications_enabled);
        assert_eq!(saved.display_name.as_deref(), Some("Grower"));
        assert!(saved.gate_auto_control);
    }
}
