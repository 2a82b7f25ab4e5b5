use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::models::{
    Device, DeviceRow, DeviceTelemetry, ReadingRecord, Stamped, ThresholdRow, ThresholdScope,
    ThresholdSettings, UserProfile,
};

/// Postgres-backed remote store.
///
/// Every statement filters on the owning `user_id`, so one user can never
/// read or overwrite another user's rows. Upserts only apply when the
/// incoming `updated_at` is not older than the stored one.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn list_devices(&self, user_id: Uuid) -> Result<Vec<Device>> {
        let rows = sqlx::query_as::<_, DeviceRow>(
            r#"
            SELECT id, user_id, name, status, nitrogen_gate, nitrogen_timer, group_name,
                   nitrogen, phosphorus, potassium, created_at, updated_at
            FROM devices
            WHERE user_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list devices")?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn upsert_devices(&self, devices: &[Device]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for d in devices {
            sqlx::query(
                r#"
                INSERT INTO devices (id, user_id, name, status, nitrogen_gate, nitrogen_timer,
                                     group_name, nitrogen, phosphorus, potassium,
                                     created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                ON CONFLICT (id) DO UPDATE SET
                    name           = EXCLUDED.name,
                    status         = EXCLUDED.status,
                    nitrogen_gate  = EXCLUDED.nitrogen_gate,
                    nitrogen_timer = EXCLUDED.nitrogen_timer,
                    group_name     = EXCLUDED.group_name,
                    nitrogen       = EXCLUDED.nitrogen,
                    phosphorus     = EXCLUDED.phosphorus,
                    potassium      = EXCLUDED.potassium,
                    updated_at     = EXCLUDED.updated_at
                WHERE devices.user_id = EXCLUDED.user_id
                  AND devices.updated_at <= EXCLUDED.updated_at
                "#,
            )
            .bind(d.id)
            .bind(d.user_id)
            .bind(&d.name)
            .bind(d.status)
            .bind(d.nitrogen_gate)
            .bind(d.nitrogen_timer)
            .bind(&d.group)
            .bind(d.readings.nitrogen)
            .bind(d.readings.phosphorus)
            .bind(d.readings.potassium)
            .bind(d.created_at)
            .bind(d.updated_at)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to upsert device {}", d.id))?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn delete_device(&self, user_id: Uuid, device_id: Uuid) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM devices WHERE id = $1 AND user_id = $2")
            .bind(device_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .context("failed to delete device")?
            .rows_affected();
        sqlx::query("DELETE FROM thresholds WHERE user_id = $1 AND scope = $2")
            .bind(user_id)
            .bind(ThresholdScope::Device(device_id).key())
            .execute(&mut *tx)
            .await
            .context("failed to delete device thresholds")?;
        tx.commit().await?;
        Ok(deleted > 0)
    }

    /// Update rows that already exist. Unknown ids match nothing, so a device
    /// deleted meanwhile is not recreated.
    pub async fn update_devices(&self, devices: &[Device]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for d in devices {
            sqlx::query(
                r#"
                UPDATE devices SET
                    name           = $3,
                    status         = $4,
                    nitrogen_gate  = $5,
                    nitrogen_timer = $6,
                    group_name     = $7,
                    nitrogen       = $8,
                    phosphorus     = $9,
                    potassium      = $10,
                    updated_at     = $11
                WHERE id = $1 AND user_id = $2 AND updated_at <= $11
                "#,
            )
            .bind(d.id)
            .bind(d.user_id)
            .bind(&d.name)
            .bind(d.status)
            .bind(d.nitrogen_gate)
            .bind(d.nitrogen_timer)
            .bind(&d.group)
            .bind(d.readings.nitrogen)
            .bind(d.readings.phosphorus)
            .bind(d.readings.potassium)
            .bind(d.updated_at)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to update device {}", d.id))?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Write tick output onto existing rows and append a history row for each
    /// device written, in one transaction. Returns the devices as now stored.
    pub async fn apply_telemetry(
        &self,
        user_id: Uuid,
        updates: &[DeviceTelemetry],
        at: DateTime<Utc>,
    ) -> Result<Vec<Device>> {
        let mut tx = self.pool.begin().await?;
        let mut applied: Vec<Device> = Vec::with_capacity(updates.len());

        for u in updates {
            let row = sqlx::query_as::<_, DeviceRow>(
                r#"
                UPDATE devices SET
                    nitrogen      = $3,
                    phosphorus    = $4,
                    potassium     = $5,
                    nitrogen_gate = COALESCE($6, nitrogen_gate),
                    updated_at    = $7
                WHERE id = $1 AND user_id = $2 AND updated_at <= $7
                RETURNING id, user_id, name, status, nitrogen_gate, nitrogen_timer, group_name,
                          nitrogen, phosphorus, potassium, created_at, updated_at
                "#,
            )
            .bind(u.device_id)
            .bind(user_id)
            .bind(u.readings.nitrogen)
            .bind(u.readings.phosphorus)
            .bind(u.readings.potassium)
            .bind(u.gate)
            .bind(at)
            .fetch_optional(&mut *tx)
            .await
            .with_context(|| format!("failed to apply telemetry to device {}", u.device_id))?;

            let Some(row) = row else {
                continue;
            };

            sqlx::query(
                r#"
                INSERT INTO nutrient_readings
                    (id, device_id, user_id, nitrogen, phosphorus, potassium, recorded_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(row.id)
            .bind(user_id)
            .bind(row.nitrogen)
            .bind(row.phosphorus)
            .bind(row.potassium)
            .bind(at)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to insert reading for device {}", row.id))?;

            applied.push(row.into());
        }

        tx.commit().await?;
        Ok(applied)
    }

    pub async fn readings(
        &self,
        user_id: Uuid,
        device_id: Uuid,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<ReadingRecord>> {
        let rows = sqlx::query_as::<_, ReadingRecord>(
            r#"
            SELECT id, device_id, nitrogen, phosphorus, potassium, recorded_at
            FROM nutrient_readings
            WHERE user_id   = $1
              AND device_id = $2
              AND ($3::timestamptz IS NULL OR recorded_at >= $3)
              AND ($4::timestamptz IS NULL OR recorded_at <= $4)
            ORDER BY recorded_at ASC
            "#,
        )
        .bind(user_id)
        .bind(device_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch reading history")?;

        Ok(rows)
    }

    pub async fn get_thresholds(
        &self,
        user_id: Uuid,
        scope: ThresholdScope,
    ) -> Result<Option<Stamped<ThresholdSettings>>> {
        let row = sqlx::query_as::<_, ThresholdRow>(
            r#"
            SELECT nitrogen_min, nitrogen_max, phosphorus_min, phosphorus_max,
                   potassium_min, potassium_max, updated_at
            FROM thresholds
            WHERE user_id = $1 AND scope = $2
            "#,
        )
        .bind(user_id)
        .bind(scope.key())
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch thresholds")?;

        Ok(row.map(Into::into))
    }

    pub async fn put_thresholds(
        &self,
        user_id: Uuid,
        scope: ThresholdScope,
        thresholds: &Stamped<ThresholdSettings>,
    ) -> Result<()> {
        let t = &thresholds.value;
        sqlx::query(
            r#"
            INSERT INTO thresholds (user_id, scope, nitrogen_min, nitrogen_max,
                                    phosphorus_min, phosphorus_max,
                                    potassium_min, potassium_max, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (user_id, scope) DO UPDATE SET
                nitrogen_min   = EXCLUDED.nitrogen_min,
                nitrogen_max   = EXCLUDED.nitrogen_max,
                phosphorus_min = EXCLUDED.phosphorus_min,
                phosphorus_max = EXCLUDED.phosphorus_max,
                potassium_min  = EXCLUDED.potassium_min,
                potassium_max  = EXCLUDED.potassium_max,
                updated_at     = EXCLUDED.updated_at
            WHERE thresholds.updated_at <= EXCLUDED.updated_at
            "#,
        )
        .bind(user_id)
        .bind(scope.key())
        .bind(t.nitrogen.min)
        .bind(t.nitrogen.max)
        .bind(t.phosphorus.min)
        .bind(t.phosphorus.max)
        .bind(t.potassium.min)
        .bind(t.potassium.max)
        .bind(thresholds.updated_at)
        .execute(&self.pool)
        .await
        .context("failed to store thresholds")?;
        Ok(())
    }

    pub async fn delete_thresholds(&self, user_id: Uuid, scope: ThresholdScope) -> Result<()> {
        sqlx::query("DELETE FROM thresholds WHERE user_id = $1 AND scope = $2")
            .bind(user_id)
            .bind(scope.key())
            .execute(&self.pool)
            .await
            .context("failed to delete thresholds")?;
        Ok(())
    }

    pub async fn get_profile(&self, user_id: Uuid) -> Result<Option<UserProfile>> {
        let row = sqlx::query_as::<_, UserProfile>(
            r#"
            SELECT id, display_name, notifications_enabled, measurement_unit, theme,
                   gate_auto_control, updated_at
            FROM user_profiles
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch profile")?;

        Ok(row)
    }

    pub async fn upsert_profile(&self, profile: &UserProfile) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_profiles (id, display_name, notifications_enabled,
                                       measurement_unit, theme, gate_auto_control, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                display_name          = EXCLUDED.display_name,
                notifications_enabled = EXCLUDED.notifications_enabled,
                measurement_unit      = EXCLUDED.measurement_unit,
                theme                 = EXCLUDED.theme,
                gate_auto_control     = EXCLUDED.gate_auto_control,
                updated_at            = EXCLUDED.updated_at
            WHERE user_profiles.updated_at <= EXCLUDED.updated_at
            "#,
        )
        .bind(profile.id)
        .bind(&profile.display_name)
        .bind(profile.notifications_enabled)
        .bind(profile.measurement_unit)
        .bind(profile.theme)
        .bind(profile.gate_auto_control)
        .bind(profile.updated_at)
        .execute(&self.pool)
        .await
        .context("failed to store profile")?;
        Ok(())
    }
}
