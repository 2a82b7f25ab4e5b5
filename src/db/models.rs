use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Nutrients and readings
// ---------------------------------------------------------------------------

/// The three tracked soil nutrients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Nutrient {
    Nitrogen,
    Phosphorus,
    Potassium,
}

impl Nutrient {
    /// Alert and export order.
    pub const ALL: [Nutrient; 3] = [Nutrient::Nitrogen, Nutrient::Phosphorus, Nutrient::Potassium];

    /// Human-readable name used in alert messages and CSV headers.
    pub fn label(self) -> &'static str {
        match self {
            Nutrient::Nitrogen => "Nitrogen",
            Nutrient::Phosphorus => "Phosphorus",
            Nutrient::Potassium => "Potassium",
        }
    }
}

impl fmt::Display for Nutrient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Nutrient::Nitrogen => "nitrogen",
            Nutrient::Phosphorus => "phosphorus",
            Nutrient::Potassium => "potassium",
        };
        f.write_str(s)
    }
}

/// NPK readings, each a percentage in `[0, 100]`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize, ToSchema)]
pub struct Readings {
    pub nitrogen: f64,
    pub phosphorus: f64,
    pub potassium: f64,
}

impl Readings {
    pub fn get(&self, nutrient: Nutrient) -> f64 {
        match nutrient {
            Nutrient::Nitrogen => self.nitrogen,
            Nutrient::Phosphorus => self.phosphorus,
            Nutrient::Potassium => self.potassium,
        }
    }

    pub fn set(&mut self, nutrient: Nutrient, value: f64) {
        match nutrient {
            Nutrient::Nitrogen => self.nitrogen = value,
            Nutrient::Phosphorus => self.phosphorus = value,
            Nutrient::Potassium => self.potassium = value,
        }
    }

    /// Build readings by evaluating `f` once per nutrient.
    pub fn from_fn(mut f: impl FnMut(Nutrient) -> f64) -> Self {
        Self {
            nitrogen: f(Nutrient::Nitrogen),
            phosphorus: f(Nutrient::Phosphorus),
            potassium: f(Nutrient::Potassium),
        }
    }
}

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

/// Mirrors the `device_status` Postgres enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "device_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    #[default]
    Online,
    Offline,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
        })
    }
}

/// Mirrors the `gate_state` Postgres enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "gate_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    Open,
    Closed,
}

impl GateState {
    pub fn toggled(self) -> Self {
        match self {
            GateState::Open => GateState::Closed,
            GateState::Closed => GateState::Open,
        }
    }
}

impl fmt::Display for GateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GateState::Open => "open",
            GateState::Closed => "closed",
        })
    }
}

/// Group label shown for devices without one.
pub const UNCATEGORIZED: &str = "Uncategorized";

/// Groups offered before the user has created any of their own.
pub const DEFAULT_GROUPS: [&str; 5] = ["Field A", "Field B", "Greenhouse", "Garden", "Research"];

/// Release timer assigned to newly paired devices, in hours.
pub const DEFAULT_GATE_TIMER_HOURS: i32 = 24;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Device {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub status: DeviceStatus,
    pub nitrogen_gate: Option<GateState>,
    /// Release timer, hours.
    pub nitrogen_timer: Option<i32>,
    pub group: Option<String>,
    pub readings: Readings,
    pub created_at: DateTime<Utc>,
    /// Last-write-wins stamp used when merging cached and remote copies.
    pub updated_at: DateTime<Utc>,
}

impl Device {
    /// A freshly paired device: online, gate closed, default timer.
    pub fn paired(user_id: Uuid, name: String, group: Option<String>, readings: Readings) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            name,
            status: DeviceStatus::Online,
            nitrogen_gate: Some(GateState::Closed),
            nitrogen_timer: Some(DEFAULT_GATE_TIMER_HOURS),
            group: Some(group.unwrap_or_else(|| UNCATEGORIZED.to_owned())),
            readings,
            created_at: now,
            updated_at: now,
        }
    }

    /// Group label with empty and missing groups folded into `Uncategorized`.
    pub fn group_label(&self) -> &str {
        match self.group.as_deref() {
            Some(g) if !g.is_empty() => g,
            _ => UNCATEGORIZED,
        }
    }
}

/// What one simulation tick produced for a device.
///
/// Only these fields are written onto the stored row, so user edits made
/// while the tick was running survive.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceTelemetry {
    pub device_id: Uuid,
    pub readings: Readings,
    /// Set only when automatic control moved the gate.
    pub gate: Option<GateState>,
}

impl DeviceTelemetry {
    /// Write onto `device` unless it was modified after `at`.
    /// Returns whether anything was applied.
    pub fn apply_to(&self, device: &mut Device, at: DateTime<Utc>) -> bool {
        if device.id != self.device_id || device.updated_at > at {
            return false;
        }
        device.readings = self.readings;
        if let Some(gate) = self.gate {
            device.nitrogen_gate = Some(gate);
        }
        device.updated_at = at;
        true
    }
}

/// Flat `devices` row as stored in Postgres.
#[derive(Debug, Clone, FromRow)]
pub struct DeviceRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub status: DeviceStatus,
    pub nitrogen_gate: Option<GateState>,
    pub nitrogen_timer: Option<i32>,
    pub group_name: Option<String>,
    pub nitrogen: f64,
    pub phosphorus: f64,
    pub potassium: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<DeviceRow> for Device {
    fn from(r: DeviceRow) -> Self {
        Self {
            id: r.id,
            user_id: r.user_id,
            name: r.name,
            status: r.status,
            nitrogen_gate: r.nitrogen_gate,
            nitrogen_timer: r.nitrogen_timer,
            group: r.group_name,
            readings: Readings {
                nitrogen: r.nitrogen,
                phosphorus: r.phosphorus,
                potassium: r.potassium,
            },
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

/// One persisted history row from `nutrient_readings`.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize, ToSchema)]
pub struct ReadingRecord {
    pub id: Uuid,
    pub device_id: Uuid,
    pub nitrogen: f64,
    pub phosphorus: f64,
    pub potassium: f64,
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

/// Acceptable `[min, max]` band for one nutrient, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ThresholdBand {
    pub min: f64,
    pub max: f64,
}

impl ThresholdBand {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ThresholdSettings {
    pub nitrogen: ThresholdBand,
    pub phosphorus: ThresholdBand,
    pub potassium: ThresholdBand,
}

impl ThresholdSettings {
    pub const DEFAULT: ThresholdSettings = ThresholdSettings {
        nitrogen: ThresholdBand::new(30.0, 80.0),
        phosphorus: ThresholdBand::new(20.0, 70.0),
        potassium: ThresholdBand::new(40.0, 90.0),
    };

    pub fn band(&self, nutrient: Nutrient) -> ThresholdBand {
        match nutrient {
            Nutrient::Nitrogen => self.nitrogen,
            Nutrient::Phosphorus => self.phosphorus,
            Nutrient::Potassium => self.potassium,
        }
    }
}

impl Default for ThresholdSettings {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Where a threshold set applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThresholdScope {
    /// Every device of the user without its own override.
    Global,
    Device(Uuid),
}

impl ThresholdScope {
    /// Value of the `scope` column.
    pub fn key(&self) -> String {
        match self {
            ThresholdScope::Global => "global".to_owned(),
            ThresholdScope::Device(id) => id.to_string(),
        }
    }
}

/// Flat `thresholds` row as stored in Postgres.
#[derive(Debug, Clone, FromRow)]
pub struct ThresholdRow {
    pub nitrogen_min: f64,
    pub nitrogen_max: f64,
    pub phosphorus_min: f64,
    pub phosphorus_max: f64,
    pub potassium_min: f64,
    pub potassium_max: f64,
    pub updated_at: DateTime<Utc>,
}

impl From<ThresholdRow> for Stamped<ThresholdSettings> {
    fn from(r: ThresholdRow) -> Self {
        Stamped {
            updated_at: r.updated_at,
            value: ThresholdSettings {
                nitrogen: ThresholdBand::new(r.nitrogen_min, r.nitrogen_max),
                phosphorus: ThresholdBand::new(r.phosphorus_min, r.phosphorus_max),
                potassium: ThresholdBand::new(r.potassium_min, r.potassium_max),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Gate settings and profile
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum GateMode {
    #[default]
    Auto,
    Manual,
}

impl fmt::Display for GateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GateMode::Auto => "auto",
            GateMode::Manual => "manual",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
pub struct GateSettings {
    pub mode: GateMode,
}

/// Mirrors the `measurement_unit` Postgres enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "measurement_unit", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MeasurementUnit {
    #[default]
    Percent,
    Ppm,
}

/// Mirrors the `theme_preference` Postgres enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "theme_preference", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Theme {
    Light,
    Dark,
    #[default]
    System,
}

#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize, ToSchema)]
pub struct UserProfile {
    pub id: Uuid,
    pub display_name: Option<String>,
    pub notifications_enabled: bool,
    pub measurement_unit: MeasurementUnit,
    pub theme: Theme,
    pub gate_auto_control: bool,
    pub updated_at: DateTime<Utc>,
}

impl UserProfile {
    /// Profile created on first login.
    pub fn new(id: Uuid, display_name: Option<String>) -> Self {
        Self {
            id,
            display_name,
            notifications_enabled: true,
            measurement_unit: MeasurementUnit::default(),
            theme: Theme::default(),
            gate_auto_control: true,
            updated_at: Utc::now(),
        }
    }

    pub fn gate_settings(&self) -> GateSettings {
        GateSettings {
            mode: if self.gate_auto_control {
                GateMode::Auto
            } else {
                GateMode::Manual
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Chart history
// ---------------------------------------------------------------------------

/// Per-tick average of a user's readings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ChartPoint {
    pub time: DateTime<Utc>,
    pub nitrogen: f64,
    pub phosphorus: f64,
    pub potassium: f64,
}

// ---------------------------------------------------------------------------
// Last-write-wins envelope
// ---------------------------------------------------------------------------

/// A value tagged with the instant it was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stamped<T> {
    pub updated_at: DateTime<Utc>,
    pub value: T,
}

impl<T> Stamped<T> {
    pub fn now(value: T) -> Self {
        Self {
            updated_at: Utc::now(),
            value,
        }
    }

    /// Keep whichever copy was written last; ties go to `self`.
    pub fn newest(self, other: Self) -> Self {
        if other.updated_at > self.updated_at {
            other
        } else {
            self
        }
    }
}
