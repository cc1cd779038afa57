pub mod aggregator;
pub mod model;
pub mod repo;
pub mod retention;
pub mod service;
pub mod team_membership;
pub mod webhook;

pub use aggregator::{ChangeAggregator, ChangeAggregatorConfig};
pub use model::{
    ChangeEvent, Notification, NotificationInput, Recipient, RecipientType, TeamWebhook, WebhookProvider,
};
pub use repo::{InMemoryNotificationRepo, InMemoryWebhookRepo, NotificationRepo, SqlNotificationRepo, SqlWebhookRepo, WebhookRepo};
pub use retention::spawn_retention_task;
pub use service::{NotificationService, NotificationServiceConfig};
pub use team_membership::{InMemoryTeamMembershipProvider, TeamMembershipProvider};
pub use webhook::{validate_webhook_url, WebhookDispatcher, WebhookError};
