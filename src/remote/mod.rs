//! The remote store: hosted relational tables holding devices, reading
//! history, thresholds and profiles.

pub mod memory;

use anyhow::Result;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::{
    models::{
        Device, DeviceTelemetry, ReadingRecord, Stamped, ThresholdScope, ThresholdSettings,
        UserProfile,
    },
    PgStore,
};

pub use memory::MemoryStore;

/// Remote store selected at startup.
#[derive(Clone)]
pub enum Remote {
    Postgres(PgStore),
    Memory(MemoryStore),
}

impl Remote {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Remote::Postgres(_) => "postgres",
            Remote::Memory(_) => "memory",
        }
    }

    /// The user's devices, newest first.
    pub async fn list_devices(&self, user_id: Uuid) -> Result<Vec<Device>> {
        match self {
            Remote::Postgres(s) => s.list_devices(user_id).await,
            Remote::Memory(s) => s.list_devices(user_id).await,
        }
    }

    /// Insert or update, keeping whichever copy has the later `updated_at`.
    /// Only pairing inserts devices.
    pub async fn upsert_devices(&self, devices: &[Device]) -> Result<()> {
        match self {
            Remote::Postgres(s) => s.upsert_devices(devices).await,
            Remote::Memory(s) => s.upsert_devices(devices).await,
        }
    }

    /// Returns `false` when the device does not exist for this user.
    pub async fn delete_device(&self, user_id: Uuid, device_id: Uuid) -> Result<bool> {
        match self {
            Remote::Postgres(s) => s.delete_device(user_id, device_id).await,
            Remote::Memory(s) => s.delete_device(user_id, device_id).await,
        }
    }

    /// Update existing rows only; never inserts.
    pub async fn update_devices(&self, devices: &[Device]) -> Result<()> {
        match self {
            Remote::Postgres(s) => s.update_devices(devices).await,
            Remote::Memory(s) => s.update_devices(devices).await,
        }
    }

    /// Write tick output onto the user's existing rows and record history.
    /// Returns the devices that were written, as now stored.
    pub async fn apply_telemetry(
        &self,
        user_id: Uuid,
        updates: &[DeviceTelemetry],
        at: DateTime<Utc>,
    ) -> Result<Vec<Device>> {
        match self {
            Remote::Postgres(s) => s.apply_telemetry(user_id, updates, at).await,
            Remote::Memory(s) => s.apply_telemetry(user_id, updates, at).await,
        }
    }

    /// History of one device, oldest first, optionally bounded (inclusive).
    pub async fn readings(
        &self,
        user_id: Uuid,
        device_id: Uuid,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<ReadingRecord>> {
        match self {
            Remote::Postgres(s) => s.readings(user_id, device_id, from, to).await,
            Remote::Memory(s) => s.readings(user_id, device_id, from, to).await,
        }
    }

    pub async fn get_thresholds(
        &self,
        user_id: Uuid,
        scope: ThresholdScope,
    ) -> Result<Option<Stamped<ThresholdSettings>>> {
        match self {
            Remote::Postgres(s) => s.get_thresholds(user_id, scope).await,
            Remote::Memory(s) => s.get_thresholds(user_id, scope).await,
        }
    }

    pub async fn put_thresholds(
        &self,
        user_id: Uuid,
        scope: ThresholdScope,
        thresholds: &Stamped<ThresholdSettings>,
    ) -> Result<()> {
        match self {
            Remote::Postgres(s) => s.put_thresholds(user_id, scope, thresholds).await,
            Remote::Memory(s) => s.put_thresholds(user_id, scope, thresholds).await,
        }
    }

    pub async fn delete_thresholds(&self, user_id: Uuid, scope: ThresholdScope) -> Result<()> {
        match self {
            Remote::Postgres(s) => s.delete_thresholds(user_id, scope).await,
            Remote::Memory(s) => s.delete_thresholds(user_id, scope).await,
        }
    }

    pub async fn get_profile(&self, user_id: Uuid) -> Result<Option<UserProfile>> {
        match self {
            Remote::Postgres(s) => s.get_profile(user_id).await,
            Remote::Memory(s) => s.get_profile(user_id).await,
        }
    }

    pub async fn upsert_profile(&self, profile: &UserProfile) -> Result<()> {
        match self {
            Remote::Postgres(s) => s.upsert_profile(profile).await,
            Remote::Memory(s) => s.upsert_profile(profile).await,
        }
    }
}
