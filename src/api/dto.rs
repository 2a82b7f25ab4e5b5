use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::{
    db::models::{ChartPoint, Device, Readings, UserProfile},
    sensors::chart::AxisDomain,
};

/// Request body for `POST /auth/login`.
#[derive(Debug, Deserialize, ToSchema)]
pub struct LoginRequest {
    pub email: String,
    /// Used only when the profile is created.
    pub display_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LoginResponse {
    /// Send as `Authorization: Bearer <token>`.
    pub token: String,
    pub user_id: Uuid,
    pub profile: UserProfile,
}

/// Request body for `POST /devices`.
#[derive(Debug, Deserialize, ToSchema)]
pub struct PairDeviceRequest {
    pub name: String,
    /// Defaults to `Uncategorized`.
    pub group: Option<String>,
}

/// Time window for `GET /devices/{id}/readings`, both ends inclusive.
#[derive(Debug, Deserialize, IntoParams)]
pub struct ReadingsQuery {
    /// RFC3339 lower bound.
    pub from: Option<DateTime<Utc>>,
    /// RFC3339 upper bound.
    pub to: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct DashboardQuery {
    /// Group name, `all` (default) or `Uncategorized`.
    pub group: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DashboardResponse {
    pub group: String,
    pub devices: Vec<Device>,
    /// Per-nutrient mean over `devices`; `null` when there are none.
    pub averages: Option<Readings>,
    pub groups: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ChartResponse {
    /// Oldest first.
    pub points: Vec<ChartPoint>,
    pub y_domain: AxisDomain,
}
