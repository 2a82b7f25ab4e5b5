//! Cache-then-sync persistence for everything a user owns.
//!
//! Reads consult the local cache and the remote store and keep whichever
//! copy carries the later `updated_at`. Writes go to the cache first and are
//! then pushed to the remote store. Remote failures on reads fall back to the
//! cache; on user-initiated writes they are returned to the caller.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    config::ThresholdSource,
    control::{
        gate,
        thresholds::{self, ThresholdError},
    },
    db::models::{
        ChartPoint, Device, DeviceStatus, DeviceTelemetry, GateMode, GateSettings, GateState, MeasurementUnit,
        ReadingRecord, Stamped, ThresholdScope, ThresholdSettings, Theme, UserProfile,
    },
    local_store::{LocalStore, StorageKey},
    remote::Remote,
    sensors::{chart, simulation},
};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("device {0} not found")]
    DeviceNotFound(Uuid),
    #[error(transparent)]
    InvalidThresholds(#[from] ThresholdError),
    #[error("gate is under automatic control")]
    GateInAutoMode,
    #[error("device name must not be empty")]
    EmptyName,
    #[error("gate timer must not be negative, got {0}")]
    InvalidTimer(i32),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type RepoResult<T> = Result<T, RepoError>;

/// Partial device edit; absent fields are left as they are.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct DeviceUpdate {
    pub name: Option<String>,
    /// An empty string moves the device back to `Uncategorized`.
    pub group: Option<String>,
    pub status: Option<DeviceStatus>,
    pub nitrogen_timer: Option<i32>,
}

/// Partial profile edit; absent fields are left as they are.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct ProfileUpdate {
    pub display_name: Option<String>,
    pub notifications_enabled: Option<bool>,
    pub measurement_unit: Option<MeasurementUnit>,
    pub theme: Option<Theme>,
    pub gate_auto_control: Option<bool>,
}

#[derive(Clone)]
pub struct Repository {
    local: LocalStore,
    remote: Remote,
    threshold_source: ThresholdSource,
    chart_len: usize,
}

impl Repository {
    pub fn new(
        local: LocalStore,
        remote: Remote,
        threshold_source: ThresholdSource,
        chart_len: usize,
    ) -> Self {
        Self {
            local,
            remote,
            threshold_source,
            chart_len: chart_len.max(1),
        }
    }

    // -----------------------------------------------------------------------
    // Devices
    // -----------------------------------------------------------------------

    /// The user's devices, newest first.
    ///
    /// When the remote list is available it decides which devices exist; for
    /// each one the newer of the cached and remote copies is kept.
    pub async fn devices(&self, user_id: Uuid) -> Vec<Device> {
        let key = StorageKey::Devices(user_id);

        match self.remote.list_devices(user_id).await {
            Ok(remote) => {
                self.local
                    .update(&key, |cached: &mut Vec<Device>| {
                        let merged: Vec<Device> = remote
                            .into_iter()
                            .map(|r| match cached.iter().find(|c| c.id == r.id) {
                                Some(c) if c.updated_at > r.updated_at => c.clone(),
                                _ => r,
                            })
                            .collect();
                        cached.clone_from(&merged);
                        merged
                    })
                    .await
            }
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "repository: remote device list failed, using cache");
                let mut cached: Vec<Device> = self.local.get(&key).await.unwrap_or_default();
                cached.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                cached
            }
        }
    }

    pub async fn device(&self, user_id: Uuid, device_id: Uuid) -> RepoResult<Device> {
        self.devices(user_id)
            .await
            .into_iter()
            .find(|d| d.id == device_id)
            .ok_or(RepoError::DeviceNotFound(device_id))
    }

    /// Write edited devices to the cache, then to the remote.
    ///
    /// Both sides only update devices that still exist, keeping the newer
    /// copy, so a device deleted meanwhile stays deleted. The cache write
    /// always happens; the remote error is returned.
    pub async fn store_devices(&self, user_id: Uuid, devices: &[Device]) -> anyhow::Result<()> {
        let key = StorageKey::Devices(user_id);
        self.local
            .update(&key, |cached: &mut Vec<Device>| {
                for d in devices {
                    if let Some(c) = cached.iter_mut().find(|c| c.id == d.id) {
                        if c.updated_at <= d.updated_at {
                            *c = d.clone();
                        }
                    }
                }
            })
            .await;

        self.remote.update_devices(devices).await
    }

    /// Write one simulation tick onto the user's stored devices and record
    /// the new readings.
    ///
    /// Only readings and, on an automatic transition, the gate are written,
    /// and only onto devices that still exist and were not edited after `at`.
    /// Returns the devices as now stored. When the remote is reachable it
    /// decides which devices were written; otherwise the cache does.
    pub async fn apply_telemetry(
        &self,
        user_id: Uuid,
        updates: &[DeviceTelemetry],
        at: DateTime<Utc>,
    ) -> Vec<Device> {
        let key = StorageKey::Devices(user_id);
        let cached = self
            .local
            .update(&key, |cached: &mut Vec<Device>| {
                cached
                    .iter_mut()
                    .filter_map(|d| {
                        let u = updates.iter().find(|u| u.device_id == d.id)?;
                        u.apply_to(d, at).then(|| d.clone())
                    })
                    .collect::<Vec<_>>()
            })
            .await;

        match self.remote.apply_telemetry(user_id, updates, at).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "repository: remote telemetry write failed, kept in cache");
                cached
            }
        }
    }

    /// Pair a new device. The remote insert must succeed before it is cached.
    pub async fn pair_device(
        &self,
        user_id: Uuid,
        name: &str,
        group: Option<String>,
    ) -> RepoResult<Device> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RepoError::EmptyName);
        }
        let group = group.filter(|g| !g.trim().is_empty());

        let readings = simulation::initial_readings(&ThresholdSettings::DEFAULT, &mut rand::rng());
        let device = Device::paired(user_id, name.to_owned(), group, readings);

        self.remote.upsert_devices(std::slice::from_ref(&device)).await?;

        self.local
            .update(&StorageKey::Devices(user_id), |cached: &mut Vec<Device>| {
                cached.retain(|d| d.id != device.id);
                cached.insert(0, device.clone());
            })
            .await;

        debug!(user_id = %user_id, device_id = %device.id, "repository: device paired");
        Ok(device)
    }

    pub async fn delete_device(&self, user_id: Uuid, device_id: Uuid) -> RepoResult<()> {
        if !self.remote.delete_device(user_id, device_id).await? {
            return Err(RepoError::DeviceNotFound(device_id));
        }

        self.local
            .update(&StorageKey::Devices(user_id), |cached: &mut Vec<Device>| {
                cached.retain(|d| d.id != device_id);
            })
            .await;
        self.local.remove(&StorageKey::DeviceThresholds(device_id)).await;
        Ok(())
    }

    pub async fn update_device(
        &self,
        user_id: Uuid,
        device_id: Uuid,
        update: DeviceUpdate,
    ) -> RepoResult<Device> {
        let mut device = self.device(user_id, device_id).await?;

        if let Some(name) = update.name {
            let name = name.trim();
            if name.is_empty() {
                return Err(RepoError::EmptyName);
            }
            device.name = name.to_owned();
        }
        if let Some(group) = update.group {
            let group = group.trim();
            device.group = (!group.is_empty()).then(|| group.to_owned());
        }
        if let Some(status) = update.status {
            device.status = status;
        }
        if let Some(timer) = update.nitrogen_timer {
            if timer < 0 {
                return Err(RepoError::InvalidTimer(timer));
            }
            device.nitrogen_timer = Some(timer);
        }

        device.updated_at = Utc::now();
        self.store_devices(user_id, std::slice::from_ref(&device)).await?;
        Ok(device)
    }

    /// Flip the nitrogen gate by hand. Refused while the gate runs on auto.
    pub async fn toggle_gate(&self, user_id: Uuid, device_id: Uuid) -> RepoResult<Device> {
        if self.gate_settings(user_id).await.mode == GateMode::Auto {
            return Err(RepoError::GateInAutoMode);
        }

        let mut device = self.device(user_id, device_id).await?;
        let current = device.nitrogen_gate.unwrap_or(GateState::Closed);
        device.nitrogen_gate = Some(current.toggled());
        device.updated_at = Utc::now();

        self.store_devices(user_id, std::slice::from_ref(&device)).await?;
        Ok(device)
    }

    /// Run automatic gate control on one device with its effective
    /// thresholds, persisting the device only on a transition.
    ///
    /// Returns the device and whether the gate changed.
    pub async fn update_device_gate_auto(
        &self,
        user_id: Uuid,
        device_id: Uuid,
    ) -> RepoResult<(Device, bool)> {
        let device = self.device(user_id, device_id).await?;
        let limits = self.thresholds(user_id, Some(device_id)).await;

        let mut next = gate::update_device_gate_auto(&device, &limits);
        if next.nitrogen_gate == device.nitrogen_gate {
            return Ok((device, false));
        }
        next.updated_at = Utc::now();
        self.store_devices(user_id, std::slice::from_ref(&next)).await?;
        Ok((next, true))
    }

    pub async fn reading_history(
        &self,
        user_id: Uuid,
        device_id: Uuid,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> RepoResult<Vec<ReadingRecord>> {
        Ok(self.remote.readings(user_id, device_id, from, to).await?)
    }

    // -----------------------------------------------------------------------
    // Thresholds
    // -----------------------------------------------------------------------

    /// Effective thresholds: the device override, else the user's global
    /// set, else the defaults.
    pub async fn thresholds(&self, user_id: Uuid, device_id: Option<Uuid>) -> ThresholdSettings {
        if let Some(id) = device_id {
            if let Some(t) = self.scoped_thresholds(user_id, ThresholdScope::Device(id)).await {
                return t.value;
            }
        }
        self.scoped_thresholds(user_id, ThresholdScope::Global)
            .await
            .map(|t| t.value)
            .unwrap_or_default()
    }

    /// The threshold set stored for exactly `scope`, if any.
    pub async fn scoped_thresholds(
        &self,
        user_id: Uuid,
        scope: ThresholdScope,
    ) -> Option<Stamped<ThresholdSettings>> {
        let key = threshold_key(user_id, scope);
        let cached: Option<Stamped<ThresholdSettings>> = self.local.get(&key).await;

        if self.threshold_source == ThresholdSource::CacheFirst && cached.is_some() {
            return cached;
        }

        match self.remote.get_thresholds(user_id, scope).await {
            Ok(Some(remote)) => {
                let newest = match cached {
                    Some(c) => remote.newest(c),
                    None => remote,
                };
                self.local.set(&key, &newest).await;
                Some(newest)
            }
            Ok(None) => cached,
            Err(e) => {
                warn!(user_id = %user_id, scope = %scope.key(), error = %e, "repository: remote thresholds failed, using cache");
                cached
            }
        }
    }

    pub async fn save_thresholds(
        &self,
        user_id: Uuid,
        scope: ThresholdScope,
        settings: ThresholdSettings,
    ) -> RepoResult<ThresholdSettings> {
        thresholds::validate(&settings)?;
        if let ThresholdScope::Device(id) = scope {
            self.device(user_id, id).await?;
        }

        let stamped = Stamped::now(settings);
        self.local.set(&threshold_key(user_id, scope), &stamped).await;
        self.remote.put_thresholds(user_id, scope, &stamped).await?;
        Ok(settings)
    }

    /// Drop the set stored for `scope` and return what now applies.
    pub async fn reset_thresholds(
        &self,
        user_id: Uuid,
        scope: ThresholdScope,
    ) -> RepoResult<ThresholdSettings> {
        let device_id = match scope {
            ThresholdScope::Device(id) => {
                self.device(user_id, id).await?;
                Some(id)
            }
            ThresholdScope::Global => None,
        };

        self.local.remove(&threshold_key(user_id, scope)).await;
        self.remote.delete_thresholds(user_id, scope).await?;
        Ok(self.thresholds(user_id, device_id).await)
    }

    // -----------------------------------------------------------------------
    // Profile and gate settings
    // -----------------------------------------------------------------------

    /// The user's profile, or a fresh unsaved one when nothing is stored.
    pub async fn profile(&self, user_id: Uuid) -> UserProfile {
        let key = StorageKey::Profile(user_id);
        let cached: Option<UserProfile> = self.local.get(&key).await;

        let resolved = match self.remote.get_profile(user_id).await {
            Ok(Some(remote)) => match cached {
                Some(c) if c.updated_at > remote.updated_at => c,
                _ => remote,
            },
            Ok(None) => return cached.unwrap_or_else(|| UserProfile::new(user_id, None)),
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "repository: remote profile failed, using cache");
                return cached.unwrap_or_else(|| UserProfile::new(user_id, None));
            }
        };
        self.local.set(&key, &resolved).await;
        resolved
    }

    /// Create the profile on first login. Failures are logged, not returned.
    pub async fn ensure_profile(&self, user_id: Uuid, display_name: Option<String>) -> UserProfile {
        match self.remote.get_profile(user_id).await {
            Ok(Some(existing)) => {
                self.local.set(&StorageKey::Profile(user_id), &existing).await;
                existing
            }
            Ok(None) => {
                let profile = UserProfile::new(user_id, display_name);
                self.local.set(&StorageKey::Profile(user_id), &profile).await;
                if let Err(e) = self.remote.upsert_profile(&profile).await {
                    warn!(user_id = %user_id, error = %e, "repository: failed to create profile");
                }
                profile
            }
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "repository: remote profile failed, using cache");
                self.profile(user_id).await
            }
        }
    }

    pub async fn save_profile(&self, user_id: Uuid, update: ProfileUpdate) -> RepoResult<UserProfile> {
        let mut profile = self.profile(user_id).await;

        if let Some(name) = update.display_name {
            let name = name.trim();
            profile.display_name = (!name.is_empty()).then(|| name.to_owned());
        }
        if let Some(v) = update.notifications_enabled {
            profile.notifications_enabled = v;
        }
        if let Some(v) = update.measurement_unit {
            profile.measurement_unit = v;
        }
        if let Some(v) = update.theme {
            profile.theme = v;
        }
        if let Some(v) = update.gate_auto_control {
            profile.gate_auto_control = v;
        }
        profile.updated_at = Utc::now();

        self.local.set(&StorageKey::Profile(user_id), &profile).await;
        self.remote.upsert_profile(&profile).await?;
        Ok(profile)
    }

    pub async fn gate_settings(&self, user_id: Uuid) -> GateSettings {
        self.profile(user_id).await.gate_settings()
    }

    pub async fn save_gate_settings(
        &self,
        user_id: Uuid,
        settings: GateSettings,
    ) -> RepoResult<GateSettings> {
        let update = ProfileUpdate {
            gate_auto_control: Some(settings.mode == GateMode::Auto),
            ..ProfileUpdate::default()
        };
        Ok(self.save_profile(user_id, update).await?.gate_settings())
    }

    // -----------------------------------------------------------------------
    // Chart history
    // -----------------------------------------------------------------------

    pub async fn chart(&self, user_id: Uuid) -> Vec<ChartPoint> {
        self.local
            .get(&StorageKey::ChartData(user_id))
            .await
            .unwrap_or_default()
    }

    pub async fn push_chart_point(&self, user_id: Uuid, point: ChartPoint) {
        let capacity = self.chart_len;
        self.local
            .update(&StorageKey::ChartData(user_id), |history: &mut Vec<ChartPoint>| {
                chart::push_point(history, point, capacity)
            })
            .await;
    }
}

fn threshold_key(user_id: Uuid, scope: ThresholdScope) -> StorageKey {
    match scope {
        ThresholdScope::Global => StorageKey::Thresholds(user_id),
        ThresholdScope::Device(id) => StorageKey::DeviceThresholds(id),
    }
}
