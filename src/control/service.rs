use std::{collections::HashMap, time::Duration};

use chrono::Utc;
use tokio::{
    sync::{broadcast::error::RecvError, watch},
    time,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    auth::Sessions,
    control::{gate, thresholds},
    db::models::{Device, DeviceTelemetry, GateState, ThresholdSettings},
    notify::{Notifier, Severity},
    repository::Repository,
    sensors::{chart, simulation::{self, SimulationPolicy}},
};

/// Periodic simulation and automatic gate control for every signed-in user.
pub struct SimulationService {
    repo: Repository,
    sessions: Sessions,
    notifier: Notifier,
    policy: SimulationPolicy,
    interval: Duration,
}

impl SimulationService {
    pub fn new(
        repo: Repository,
        sessions: Sessions,
        notifier: Notifier,
        policy: SimulationPolicy,
        interval: Duration,
    ) -> Self {
        Self {
            repo,
            sessions,
            notifier,
            policy,
            interval,
        }
    }

    /// Tick until `stop` flips to `true` or its sender is dropped.
    /// Spawn this via `tokio::spawn`.
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            policy = ?self.policy,
            "Simulation loop started"
        );
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        let mut events = self.sessions.subscribe();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once().await;
                }
                event = events.recv() => match event {
                    Ok(event) => debug!(?event, "simulation: session changed"),
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "simulation: missed session events"),
                    Err(RecvError::Closed) => {}
                },
                _ = stop.changed() => break,
            }
        }

        info!("Simulation loop stopped");
    }

    /// One tick over every active user. Returns how many users were processed.
    pub async fn run_once(&self) -> usize {
        let users = self.sessions.active_users().await;
        for &user_id in &users {
            self.tick_user(user_id).await;
        }
        users.len()
    }

    async fn tick_user(&self, user_id: Uuid) {
        let devices = self.repo.devices(user_id).await;
        if devices.is_empty() {
            return;
        }

        let mut limits = Vec::with_capacity(devices.len());
        for d in &devices {
            limits.push(self.repo.thresholds(user_id, Some(d.id)).await);
        }
        let profile = self.repo.profile(user_id).await;

        let stepped = self.step(&devices, &limits);
        let updates = plan_telemetry(&stepped, &limits, profile.gate_auto_control);

        // Devices deleted or edited since the snapshot come back as they are
        // stored now, or not at all.
        let now = Utc::now();
        let stored = self.repo.apply_telemetry(user_id, &updates, now).await;

        if let Some(point) = chart::average_point(&stored, now) {
            self.repo.push_chart_point(user_id, point).await;
        }

        let limits: HashMap<Uuid, ThresholdSettings> =
            devices.iter().map(|d| d.id).zip(limits).collect();

        for device in &stored {
            let transition = updates
                .iter()
                .find(|u| u.device_id == device.id)
                .and_then(|u| u.gate);
            let Some(state) = transition else {
                continue;
            };
            let verb = match state {
                GateState::Open => "opened",
                GateState::Closed => "closed",
            };
            self.notifier
                .publish(
                    user_id,
                    Some(device.id),
                    Severity::Info,
                    format!("{} gate automatically {verb}", device.name),
                )
                .await;
        }

        if profile.notifications_enabled {
            for device in &stored {
                let Some(t) = limits.get(&device.id) else {
                    continue;
                };
                for alert in thresholds::check_thresholds(&device.readings, t).alerts {
                    self.notifier
                        .publish(
                            user_id,
                            Some(device.id),
                            Severity::Warning,
                            format!("{}: {}", device.name, alert.message),
                        )
                        .await;
                }
            }
        }
    }

    fn step(&self, devices: &[Device], limits: &[ThresholdSettings]) -> Vec<Device> {
        simulation::step_devices(devices, limits, self.policy, &mut rand::rng())
    }
}

/// The writes for one tick: the stepped readings and, in auto mode, any gate
/// transition the controller wants for them.
fn plan_telemetry(
    stepped: &[Device],
    limits: &[ThresholdSettings],
    auto: bool,
) -> Vec<DeviceTelemetry> {
    stepped
        .iter()
        .zip(limits)
        .map(|(device, t)| DeviceTelemetry {
            device_id: device.id,
            readings: device.readings,
            gate: if auto { gate::gate_transition(device, t) } else { None },
        })
        .collect()
}
