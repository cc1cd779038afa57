//! Asset-change aggregation (spec.md §4.K). Unlike [`marmot_batcher`]'s
//! single global size/interval batch, this coalesces events per
//! `(asset_id, change_type)` key, each with its own flush deadline that
//! resets forward to `now + window` on every new event for that key,
//! capped at `max_wait` from the key's first event — so it runs its own
//! small scheduling loop rather than reusing the batcher.

use crate::model::{ChangeEvent, NotificationInput, Recipient, RecipientType};
use crate::service::NotificationService;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::warn;

/// Above this many events for the same `(recipient, change_type)` in one
/// flush, a single summarized notification replaces one-per-event
/// (spec.md §4.K step 3).
const BATCH_THRESHOLD: usize = 20;

#[derive(Debug, Clone, Copy)]
pub struct ChangeAggregatorConfig {
    pub window: Duration,
    pub max_wait: Duration,
}

impl Default for ChangeAggregatorConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(30),
            max_wait: Duration::from_secs(300),
        }
    }
}

struct PendingKey {
    asset_id: String,
    mrn: String,
    name: String,
    change_type: String,
    changed_fields: Vec<String>,
    owners: Vec<Recipient>,
    first_seen: Instant,
    deadline: Instant,
}

enum Message {
    Event(ChangeEvent),
    Stop,
}

pub struct ChangeAggregator {
    tx: mpsc::UnboundedSender<Message>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ChangeAggregator {
    pub fn start(config: ChangeAggregatorConfig, notifications: Arc<NotificationService>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(rx, config, notifications));
        Arc::new(Self { tx, handle: Mutex::new(Some(handle)) })
    }

    pub fn submit(&self, event: ChangeEvent) {
        if self.tx.send(Message::Event(event)).is_err() {
            warn!("change aggregator channel closed, dropping event");
        }
    }

    pub async fn stop(&self) {
        let _ = self.tx.send(Message::Stop);
        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(err) = handle.await {
                warn!(%err, "change aggregator task panicked");
            }
        }
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<Message>, config: ChangeAggregatorConfig, notifications: Arc<NotificationService>) {
    let mut pending: BTreeMap<(String, String), PendingKey> = BTreeMap::new();

    loop {
        let next_deadline = pending.values().map(|p| p.deadline).min();
        let sleep = match next_deadline {
            Some(at) => tokio::time::sleep_until(at),
            None => tokio::time::sleep(Duration::from_secs(3600)),
        };
        tokio::pin!(sleep);

        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Some(Message::Event(event)) => merge_event(&mut pending, event, config),
                    Some(Message::Stop) | None => {
                        flush_all(&mut pending, &notifications).await;
                        return;
                    }
                }
            }
            _ = &mut sleep, if next_deadline.is_some() => {
                flush_due(&mut pending, &notifications).await;
            }
        }
    }
}

fn merge_event(pending: &mut BTreeMap<(String, String), PendingKey>, event: ChangeEvent, config: ChangeAggregatorConfig) {
    let key = (event.asset_id.clone(), event.change_type.clone());
    let now = Instant::now();
    match pending.get_mut(&key) {
        Some(existing) => {
            for field in event.changed_fields {
                if !existing.changed_fields.contains(&field) {
                    existing.changed_fields.push(field);
                }
            }
            for owner in event.owners {
                if !existing.owners.contains(&owner) {
                    existing.owners.push(owner);
                }
            }
            // each new event pushes the deadline back out to a fresh
            // `window`, capped at `max_wait` from this key's first event.
            existing.deadline = (now + config.window).min(existing.first_seen + config.max_wait);
        }
        None => {
            let deadline = now + config.window.min(config.max_wait);
            pending.insert(
                key,
                PendingKey {
                    asset_id: event.asset_id,
                    mrn: event.mrn,
                    name: event.name,
                    change_type: event.change_type,
                    changed_fields: event.changed_fields,
                    owners: event.owners,
                    first_seen: now,
                    deadline,
                },
            );
        }
    }
}

async fn flush_due(pending: &mut BTreeMap<(String, String), PendingKey>, notifications: &Arc<NotificationService>) {
    let now = Instant::now();
    let due_keys: Vec<(String, String)> = pending.iter().filter(|(_, p)| p.deadline <= now).map(|(k, _)| k.clone()).collect();
    let due: Vec<PendingKey> = due_keys.iter().filter_map(|k| pending.remove(k)).collect();
    emit(due, notifications).await;
}

async fn flush_all(pending: &mut BTreeMap<(String, String), PendingKey>, notifications: &Arc<NotificationService>) {
    let due: Vec<PendingKey> = std::mem::take(pending).into_values().collect();
    emit(due, notifications).await;
}

async fn emit(due: Vec<PendingKey>, notifications: &Arc<NotificationService>) {
    if due.is_empty() {
        return;
    }
    // group by (recipient, change_type) across every due key (spec.md
    // §4.K step 3)
    let mut by_recipient: BTreeMap<(String, String), Vec<&PendingKey>> = BTreeMap::new();
    for entry in &due {
        for owner in &entry.owners {
            by_recipient.entry((owner.id.clone(), entry.change_type.clone())).or_default().push(entry);
        }
    }

    for ((recipient_id, change_type), entries) in by_recipient {
        let recipients = vec![Recipient { recipient_type: RecipientType::User, id: recipient_id }];
        if entries.len() > BATCH_THRESHOLD {
            notifications
                .create(NotificationInput {
                    recipients,
                    notification_type: format!("asset_{change_type}"),
                    title: "Asset Updates".to_string(),
                    message: format!("{} assets were {} recently", entries.len(), change_type),
                    data: json!({
                        "count": entries.len(),
                        "mrns": entries.iter().map(|e| e.mrn.clone()).collect::<Vec<_>>(),
                    }),
                })
                .await;
        } else {
            for entry in entries {
                notifications
                    .create(NotificationInput {
                        recipients: recipients.clone(),
                        notification_type: format!("asset_{change_type}"),
                        title: format!("{} {}", entry.name, entry.change_type),
                        message: format!("Fields changed: {}", entry.changed_fields.join(", ")),
                        data: json!({ "mrn": entry.mrn, "asset_id": entry.asset_id }),
                    })
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::InMemoryNotificationRepo;
    use crate::team_membership::InMemoryTeamMembershipProvider;
    use marmot_worker_pool::WorkerPoolConfig;
    use tokio::time::advance;

    fn service(repo: Arc<InMemoryNotificationRepo>) -> Arc<NotificationService> {
        NotificationService::new(
            repo,
            Arc::new(InMemoryTeamMembershipProvider::new()),
            crate::service::NotificationServiceConfig { batch_size: 100, worker_pool: WorkerPoolConfig::default() },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn merged_event_emits_one_notification_after_window() {
        let repo = Arc::new(InMemoryNotificationRepo::new());
        let notifications = service(repo.clone());
        let aggregator = ChangeAggregator::start(ChangeAggregatorConfig { window: Duration::from_secs(5), max_wait: Duration::from_secs(60) }, notifications);

        aggregator.submit(ChangeEvent {
            asset_id: "a1".to_string(),
            mrn: "mrn://topic/kafka/orders".to_string(),
            name: "orders".to_string(),
            change_type: "updated".to_string(),
            changed_fields: vec!["description".to_string()],
            owners: vec![Recipient { recipient_type: RecipientType::User, id: "alice".to_string() }],
        });

        advance(Duration::from_secs(6)).await;
        aggregator.stop().await;

        let alice = repo.list_for_user("alice", 10).await.unwrap();
        assert_eq!(alice.len(), 1);
        assert_eq!(alice[0].title, "orders updated");
    }
}
