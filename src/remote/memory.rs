use std::{
    collections::{hash_map::Entry, HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::db::models::{
    Device, DeviceTelemetry, ReadingRecord, Stamped, ThresholdScope, ThresholdSettings,
    UserProfile,
};

/// History rows kept per device before the oldest are dropped.
pub const READINGS_PER_DEVICE: usize = 4096;

#[derive(Default)]
struct Tables {
    devices: HashMap<Uuid, Device>,
    /// device id → (owner, history oldest first)
    readings: HashMap<Uuid, (Uuid, VecDeque<ReadingRecord>)>,
    thresholds: HashMap<(Uuid, String), Stamped<ThresholdSettings>>,
    profiles: HashMap<Uuid, UserProfile>,
}

/// In-process remote store with the same isolation and last-write-wins
/// rules as the Postgres one. Used when no database is configured and in
/// tests.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
    offline: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail until switched back, simulating an outage.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn ensure_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            bail!("remote store unavailable");
        }
        Ok(())
    }

    pub async fn list_devices(&self, user_id: Uuid) -> Result<Vec<Device>> {
        self.ensure_online()?;
        let tables = self.tables.read().await;
        let mut devices: Vec<_> = tables
            .devices
            .values()
            .filter(|d| d.user_id == user_id)
            .cloned()
            .collect();
        devices.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(devices)
    }

    pub async fn upsert_devices(&self, devices: &[Device]) -> Result<()> {
        self.ensure_online()?;
        let mut tables = self.tables.write().await;
        for d in devices {
            match tables.devices.entry(d.id) {
                Entry::Occupied(mut e) => {
                    let existing = e.get_mut();
                    if existing.user_id == d.user_id && existing.updated_at <= d.updated_at {
                        *existing = Device {
                            created_at: existing.created_at,
                            ..d.clone()
                        };
                    }
                }
                Entry::Vacant(e) => {
                    e.insert(d.clone());
                }
            }
        }
        Ok(())
    }

    pub async fn delete_device(&self, user_id: Uuid, device_id: Uuid) -> Result<bool> {
        self.ensure_online()?;
        let mut tables = self.tables.write().await;
        let owned = tables
            .devices
            .get(&device_id)
            .is_some_and(|d| d.user_id == user_id);
        if !owned {
            return Ok(false);
        }
        tables.devices.remove(&device_id);
        tables.readings.remove(&device_id);
        tables
            .thresholds
            .remove(&(user_id, ThresholdScope::Device(device_id).key()));
        Ok(true)
    }

    /// Update rows that already exist; unknown ids and stale copies are
    /// skipped, so a device deleted meanwhile stays deleted.
    pub async fn update_devices(&self, devices: &[Device]) -> Result<()> {
        self.ensure_online()?;
        let mut tables = self.tables.write().await;
        for d in devices {
            if let Some(existing) = tables.devices.get_mut(&d.id) {
                if existing.user_id == d.user_id && existing.updated_at <= d.updated_at {
                    *existing = Device {
                        created_at: existing.created_at,
                        ..d.clone()
                    };
                }
            }
        }
        Ok(())
    }

    /// Write tick output onto the user's existing rows and append one history
    /// row per device written. Returns the devices as now stored.
    pub async fn apply_telemetry(
        &self,
        user_id: Uuid,
        updates: &[DeviceTelemetry],
        at: DateTime<Utc>,
    ) -> Result<Vec<Device>> {
        self.ensure_online()?;
        let mut guard = self.tables.write().await;
        let tables = &mut *guard;

        let mut applied = Vec::with_capacity(updates.len());
        for u in updates {
            let Some(device) = tables
                .devices
                .get_mut(&u.device_id)
                .filter(|d| d.user_id == user_id)
            else {
                continue;
            };
            if !u.apply_to(device, at) {
                continue;
            }
            let device = device.clone();
            push_reading(&mut tables.readings, &device, at);
            applied.push(device);
        }
        Ok(applied)
    }

    pub async fn readings(
        &self,
        user_id: Uuid,
        device_id: Uuid,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<ReadingRecord>> {
        self.ensure_online()?;
        let tables = self.tables.read().await;
        let Some((owner, history)) = tables.readings.get(&device_id) else {
            return Ok(Vec::new());
        };
        if *owner != user_id {
            return Ok(Vec::new());
        }
        Ok(history
            .iter()
            .filter(|r| from.map_or(true, |f| r.recorded_at >= f))
            .filter(|r| to.map_or(true, |t| r.recorded_at <= t))
            .cloned()
            .collect())
    }

    pub async fn get_thresholds(
        &self,
        user_id: Uuid,
        scope: ThresholdScope,
    ) -> Result<Option<Stamped<ThresholdSettings>>> {
        self.ensure_online()?;
        let tables = self.tables.read().await;
        Ok(tables.thresholds.get(&(user_id, scope.key())).cloned())
    }

    pub async fn put_thresholds(
        &self,
        user_id: Uuid,
        scope: ThresholdScope,
        thresholds: &Stamped<ThresholdSettings>,
    ) -> Result<()> {
        self.ensure_online()?;
        let mut tables = self.tables.write().await;
        match tables.thresholds.entry((user_id, scope.key())) {
            Entry::Occupied(mut e) => {
                if e.get().updated_at <= thresholds.updated_at {
                    e.insert(thresholds.clone());
                }
            }
            Entry::Vacant(e) => {
                e.insert(thresholds.clone());
            }
        }
        Ok(())
    }

    pub async fn delete_thresholds(&self, user_id: Uuid, scope: ThresholdScope) -> Result<()> {
        self.ensure_online()?;
        self.tables
            .write()
            .await
            .thresholds
            .remove(&(user_id, scope.key()));
        Ok(())
    }

    pub async fn get_profile(&self, user_id: Uuid) -> Result<Option<UserProfile>> {
        self.ensure_online()?;
        Ok(self.tables.read().await.profiles.get(&user_id).cloned())
    }

    pub async fn upsert_profile(&self, profile: &UserProfile) -> Result<()> {
        self.ensure_online()?;
        let mut tables = self.tables.write().await;
        let stale = tables
            .profiles
            .get(&profile.id)
            .is_some_and(|p| p.updated_at > profile.updated_at);
        if !stale {
            tables.profiles.insert(profile.id, profile.clone());
        }
        Ok(())
    }
}

fn push_reading(
    readings: &mut HashMap<Uuid, (Uuid, VecDeque<ReadingRecord>)>,
    device: &Device,
    recorded_at: DateTime<Utc>,
) {
    let (_, history) = readings
        .entry(device.id)
        .or_insert_with(|| (device.user_id, VecDeque::new()));
    history.push_back(ReadingRecord {
        id: Uuid::new_v4(),
        device_id: device.id,
        nitrogen: device.readings.nitrogen,
        phosphorus: device.readings.phosphorus,
        potassium: device.readings.potassium,
        recorded_at,
    });
    while history.len() > READINGS_PER_DEVICE {
        history.pop_front();
    }
}
