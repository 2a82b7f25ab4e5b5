use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::{sync::RwLock, time::Instant};
use tracing::{info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

/// Notifications kept per user.
pub const BUFFER_LEN: usize = 50;

/// Identical notifications inside this window are dropped.
pub const DEDUPE_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub device_id: Option<Uuid>,
    pub severity: Severity,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Per-user notification feed with duplicate suppression and an optional
/// webhook sink.
#[derive(Clone)]
pub struct Notifier {
    inner: Arc<Inner>,
}

struct Inner {
    feeds: RwLock<HashMap<Uuid, VecDeque<Notification>>>,
    /// (user, key) → last delivery
    recent: RwLock<HashMap<(Uuid, String), Instant>>,
    webhook: Option<Webhook>,
}

struct Webhook {
    http: Client,
    url: String,
}

impl Notifier {
    pub fn new(webhook_url: Option<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                feeds: RwLock::new(HashMap::new()),
                recent: RwLock::new(HashMap::new()),
                webhook: webhook_url.map(|url| Webhook {
                    http: Client::new(),
                    url,
                }),
            }),
        }
    }

    /// Deliver a notification unless an identical one went out within
    /// [`DEDUPE_WINDOW`]. Returns whether it was delivered.
    pub async fn publish(
        &self,
        user_id: Uuid,
        device_id: Option<Uuid>,
        severity: Severity,
        message: impl Into<String>,
    ) -> bool {
        let message = message.into();
        let key = match device_id {
            Some(id) => format!("{id}-{message}"),
            None => message.clone(),
        };

        let now = Instant::now();
        {
            let mut recent = self.inner.recent.write().await;
            recent.retain(|_, at| now.duration_since(*at) < DEDUPE_WINDOW);
            if recent.contains_key(&(user_id, key.clone())) {
                return false;
            }
            recent.insert((user_id, key), now);
        }

        let notification = Notification {
            id: Uuid::new_v4(),
            user_id,
            device_id,
            severity,
            message,
            created_at: Utc::now(),
        };

        match severity {
            Severity::Info => info!(user_id = %user_id, device_id = ?device_id, message = %notification.message, "notify"),
            Severity::Warning => warn!(user_id = %user_id, device_id = ?device_id, message = %notification.message, "notify"),
        }

        {
            let mut feeds = self.inner.feeds.write().await;
            let feed = feeds.entry(user_id).or_default();
            feed.push_back(notification.clone());
            while feed.len() > BUFFER_LEN {
                feed.pop_front();
            }
        }

        if let Some(hook) = &self.inner.webhook {
            let http = hook.http.clone();
            let url = hook.url.clone();
            tokio::spawn(async move {
                let result = http
                    .post(&url)
                    .json(&notification)
                    .send()
                    .await
                    .and_then(|r| r.error_for_status());
                if let Err(e) = result {
                    warn!(url = %url, error = %e, "notify: webhook delivery failed");
                }
            });
        }

        true
    }

    /// The user's notifications, newest first.
    pub async fn list(&self, user_id: Uuid) -> Vec<Notification> {
        self.inner
            .feeds
            .read()
            .await
            .get(&user_id)
            .map(|feed| feed.iter().rev().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn duplicates_inside_window_are_suppressed() {
        let notifier = Notifier::new(None);
        let (user, device) = (Uuid::new_v4(), Some(Uuid::new_v4()));

        assert!(notifier.publish(user, device, Severity::Warning, "Nitrogen low").await);
        assert!(!notifier.publish(user, device, Severity::Warning, "Nitrogen low").await);

        tokio::time::advance(DEDUPE_WINDOW + Duration::from_millis(1)).await;
        assert!(notifier.publish(user, device, Severity::Warning, "Nitrogen low").await);
        assert_eq!(notifier.list(user).await.len(), 2);
    }

    #[tokio::test]
    async fn dedupe_is_per_user_and_device() {
        let notifier = Notifier::new(None);
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let device = Some(Uuid::new_v4());

        assert!(notifier.publish(alice, device, Severity::Info, "gate opened").await);
        assert!(notifier.publish(bob, device, Severity::Info, "gate opened").await);
        assert!(notifier.publish(alice, Some(Uuid::new_v4()), Severity::Info, "gate opened").await);
        assert!(notifier.publish(alice, None, Severity::Info, "gate opened").await);
    }

    #[tokio::test]
    async fn feed_is_newest_first_and_bounded() {
        let notifier = Notifier::new(None);
        let user = Uuid::new_v4();
        for i in 0..BUFFER_LEN + 5 {
            notifier.publish(user, None, Severity::Info, format!("event {i}")).await;
        }

        let feed = notifier.list(user).await;
        assert_eq!(feed.len(), BUFFER_LEN);
        assert_eq!(feed[0].message, format!("event {}", BUFFER_LEN + 4));
        assert!(notifier.list(Uuid::new_v4()).await.is_empty());
    }
}
