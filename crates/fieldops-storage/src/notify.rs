use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use fieldops_core::Notification;
use tracing::{info, warn};

use crate::notification_body;

/// Receiver of lifecycle events. Delivery is the sink's concern; callers never
/// wait on it and never see its failures.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn notify(&self, notification: Notification) {
        info!(
            user_id = %notification.user_id,
            event = notification.kind.as_str(),
            payload = %notification.payload,
            "notification"
        );
    }
}

/// Keeps every notification in memory, in arrival order.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    seen: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<Notification> {
        match self.seen.lock() {
            Ok(mut seen) => std::mem::take(&mut *seen),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

impl NotificationSink for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        match self.seen.lock() {
            Ok(mut seen) => seen.push(notification),
            Err(poisoned) => poisoned.into_inner().push(notification),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

/// Posts each notification as JSON to a single endpoint on a spawned task.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(config: WebhookConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building webhook client")?;
        Ok(Self {
            client,
            url: config.url,
        })
    }
}

impl NotificationSink for WebhookNotifier {
    fn notify(&self, notification: Notification) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(event = notification.kind.as_str(), "no runtime; dropping webhook notification");
            return;
        };
        let client = self.client.clone();
        let url = self.url.clone();
        let body = notification_body(&notification);
        runtime.spawn(async move {
            match client.post(&url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => {
                    warn!(status = resp.status().as_u16(), url, "webhook rejected notification")
                }
                Err(err) => warn!(error = %err, url, "webhook delivery failed"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldops_core::EventKind;
    use uuid::Uuid;

    #[test]
    fn recording_notifier_drains_in_order() {
        let sink = RecordingNotifier::new();
        let user = Uuid::new_v4();
        sink.notify(Notification {
            user_id: user,
            kind: EventKind::RequestCreated,
            payload: serde_json::json!({}),
        });
        sink.notify(Notification {
            user_id: user,
            kind: EventKind::WorkerAssigned,
            payload: serde_json::json!({}),
        });

        let kinds = sink.take().into_iter().map(|n| n.kind).collect::<Vec<_>>();
        assert_eq!(kinds, vec![EventKind::RequestCreated, EventKind::WorkerAssigned]);
        assert!(sink.take().is_empty());
    }

    #[test]
    fn webhook_body_carries_event_name() {
        let n = Notification {
            user_id: Uuid::nil(),
            kind: EventKind::RequestCancelled,
            payload: serde_json::json!({"reason": "moved out"}),
        };
        let body = notification_body(&n);
        assert_eq!(body["event"], "request_cancelled");
        assert_eq!(body["payload"]["reason"], "moved out");
    }

    #[test]
    fn webhook_outside_runtime_is_dropped_quietly() {
        let sink = WebhookNotifier::new(WebhookConfig {
            url: "http://127.0.0.1:9/hook".into(),
            timeout: Duration::from_millis(50),
            user_agent: None,
        })
        .unwrap();
        sink.notify(Notification {
            user_id: Uuid::nil(),
            kind: EventKind::WorkStarted,
            payload: serde_json::json!({}),
        });
    }
}
