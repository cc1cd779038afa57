//! Recipient fan-out (spec.md §4.J). `create` expands team recipients to
//! members, dedups by user-id preferring the user-origin reason, drops
//! users who disabled the notification type, and bulk-inserts in chunks.

use crate::model::{Notification, NotificationInput, RecipientType};
use crate::repo::NotificationRepo;
use crate::team_membership::TeamMembershipProvider;
use chrono::Utc;
use marmot_common::ids::NotificationId;
use marmot_worker_pool::{WorkerPool, WorkerPoolConfig};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// Default/ceiling for the bulk-insert chunk size (spec.md §4.J step 4).
pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const MAX_BATCH_SIZE: usize = 500;

pub struct NotificationServiceConfig {
    pub batch_size: usize,
    pub worker_pool: WorkerPoolConfig,
}

impl Default for NotificationServiceConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            worker_pool: WorkerPoolConfig::default(),
        }
    }
}

struct FanoutJob {
    input: NotificationInput,
}

pub struct NotificationService {
    repo: Arc<dyn NotificationRepo>,
    teams: Arc<dyn TeamMembershipProvider>,
    pool: WorkerPool<FanoutJob, ()>,
    batch_size: usize,
}

impl NotificationService {
    pub fn new(repo: Arc<dyn NotificationRepo>, teams: Arc<dyn TeamMembershipProvider>, config: NotificationServiceConfig) -> Arc<Self> {
        let batch_size = config.batch_size.clamp(1, MAX_BATCH_SIZE);
        let repo_for_pool = repo.clone();
        let teams_for_pool = teams.clone();
        let pool = WorkerPool::start(
            config.worker_pool,
            move |job: FanoutJob| {
                let repo = repo_for_pool.clone();
                let teams = teams_for_pool.clone();
                async move {
                    if let Err(err) = fan_out(&repo, &teams, job.input, batch_size).await {
                        warn!(%err, "notification fan-out job failed");
                    }
                }
            },
            |_: ()| {},
        );
        Arc::new(Self { repo, teams, pool, batch_size })
    }

    /// Queues the fan-out asynchronously; falls back to inline execution
    /// if the worker pool's queue is full (spec.md §4.J "Submission").
    pub async fn create(&self, input: NotificationInput) {
        if self.pool.submit(FanoutJob { input: input.clone() }) {
            return;
        }
        warn!("notification fan-out queue full, executing inline");
        if let Err(err) = fan_out(&self.repo, &self.teams, input, self.batch_size).await {
            warn!(%err, "inline notification fan-out failed");
        }
    }

    /// Drains the fan-out queue. Requires every other `Arc` clone to have
    /// been dropped first; logs and returns otherwise.
    pub async fn stop(self: Arc<Self>) {
        match Arc::try_unwrap(self) {
            Ok(this) => this.pool.stop().await,
            Err(_) => warn!("notification service stop called while other references remain live"),
        }
    }
}

async fn fan_out(
    repo: &Arc<dyn NotificationRepo>,
    teams: &Arc<dyn TeamMembershipProvider>,
    input: NotificationInput,
    batch_size: usize,
) -> anyhow::Result<()> {
    // user-id -> (original_type, original_id), user-origin recipients win
    // over team-origin ones per spec.md §4.J step 2.
    let mut resolved: BTreeMap<String, (RecipientType, String)> = BTreeMap::new();
    for recipient in &input.recipients {
        match recipient.recipient_type {
            RecipientType::User => {
                resolved.insert(recipient.id.clone(), (RecipientType::User, recipient.id.clone()));
            }
            RecipientType::Team => {
                // a single team's expansion failing (unknown team, directory
                // unreachable, ...) must not sink every other recipient in
                // this notification (spec.md §7).
                let members = match teams.members_of(&recipient.id).await {
                    Ok(members) => members,
                    Err(err) => {
                        warn!(team = %recipient.id, %err, "team expansion failed, skipping team");
                        continue;
                    }
                };
                for member in members {
                    resolved.entry(member).or_insert((RecipientType::Team, recipient.id.clone()));
                }
            }
        }
    }
    // a later user-origin recipient must still win even if a team already
    // claimed the slot first
    for recipient in &input.recipients {
        if recipient.recipient_type == RecipientType::User {
            resolved.insert(recipient.id.clone(), (RecipientType::User, recipient.id.clone()));
        }
    }

    let user_ids: Vec<String> = resolved.keys().cloned().collect();
    let preferences = repo.preferences_for(&user_ids).await?;

    let now = Utc::now();
    let notifications: Vec<Notification> = resolved
        .into_iter()
        .filter(|(user_id, _)| {
            preferences
                .get(user_id)
                .and_then(|prefs| prefs.get(&input.notification_type))
                .copied()
                .unwrap_or(true)
        })
        .map(|(user_id, (original_type, original_id))| Notification {
            id: NotificationId::new_v4(),
            recipient_user_id: user_id,
            original_recipient_type: original_type,
            original_recipient_id: original_id,
            notification_type: input.notification_type.clone(),
            title: input.title.clone(),
            message: input.message.clone(),
            data: input.data.clone(),
            read: false,
            read_at: None,
            created_at: now,
        })
        .collect();

    for chunk in notifications.chunks(batch_size) {
        repo.bulk_insert(chunk).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Recipient;
    use crate::repo::InMemoryNotificationRepo;
    use crate::team_membership::InMemoryTeamMembershipProvider;
    use serde_json::json;

    fn input(recipients: Vec<Recipient>) -> NotificationInput {
        NotificationInput {
            recipients,
            notification_type: "asset_updated".to_string(),
            title: "orders.created changed".to_string(),
            message: "schema updated".to_string(),
            data: json!({}),
        }
    }

    #[tokio::test]
    async fn team_recipient_expands_to_members() {
        let repo = Arc::new(InMemoryNotificationRepo::new());
        let teams = Arc::new(InMemoryTeamMembershipProvider::new().with_team("team-data", vec!["alice".to_string(), "bob".to_string()]));
        fan_out(
            &(repo.clone() as Arc<dyn NotificationRepo>),
            &(teams as Arc<dyn TeamMembershipProvider>),
            input(vec![Recipient { recipient_type: RecipientType::Team, id: "team-data".to_string() }]),
            DEFAULT_BATCH_SIZE,
        )
        .await
        .unwrap();

        let alice = repo.list_for_user("alice", 10).await.unwrap();
        let bob = repo.list_for_user("bob", 10).await.unwrap();
        assert_eq!(alice.len(), 1);
        assert_eq!(bob.len(), 1);
    }

    #[tokio::test]
    async fn user_origin_wins_over_team_origin_for_same_user() {
        let repo = Arc::new(InMemoryNotificationRepo::new());
        let teams = Arc::new(InMemoryTeamMembershipProvider::new().with_team("team-data", vec!["alice".to_string()]));
        fan_out(
            &(repo.clone() as Arc<dyn NotificationRepo>),
            &(teams as Arc<dyn TeamMembershipProvider>),
            input(vec![
                Recipient { recipient_type: RecipientType::Team, id: "team-data".to_string() },
                Recipient { recipient_type: RecipientType::User, id: "alice".to_string() },
            ]),
            DEFAULT_BATCH_SIZE,
        )
        .await
        .unwrap();

        let alice = repo.list_for_user("alice", 10).await.unwrap();
        assert_eq!(alice.len(), 1);
        assert_eq!(alice[0].original_recipient_type, RecipientType::User);
        assert_eq!(alice[0].original_recipient_id, "alice");
    }
}
