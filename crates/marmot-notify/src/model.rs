use chrono::{DateTime, Utc};
use marmot_common::ids::{NotificationId, WebhookId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientType {
    User,
    Team,
}

impl RecipientType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Team => "team",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub recipient_type: RecipientType,
    pub id: String,
}

/// What a caller hands `NotificationService::create` (spec.md §4.J).
#[derive(Debug, Clone)]
pub struct NotificationInput {
    pub recipients: Vec<Recipient>,
    pub notification_type: String,
    pub title: String,
    pub message: String,
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub recipient_user_id: String,
    pub original_recipient_type: RecipientType,
    pub original_recipient_id: String,
    pub notification_type: String,
    pub title: String,
    pub message: String,
    pub data: Value,
    pub read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookProvider {
    Slack,
    Discord,
    Generic,
}

impl WebhookProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Slack => "slack",
            Self::Discord => "discord",
            Self::Generic => "generic",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "slack" => Some(Self::Slack),
            "discord" => Some(Self::Discord),
            "generic" => Some(Self::Generic),
            _ => None,
        }
    }
}

/// `url` is always the plaintext form in memory; repos encrypt/decrypt it
/// at the storage boundary (spec.md §4.L "URL encryption at rest").
#[derive(Debug, Clone)]
pub struct TeamWebhook {
    pub id: WebhookId,
    pub team_id: String,
    pub display_name: String,
    pub provider: WebhookProvider,
    pub url: String,
    pub notification_types: Vec<String>,
    pub enabled: bool,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One asset-change arriving at the Change Aggregator (spec.md §4.K).
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub asset_id: String,
    pub mrn: String,
    pub name: String,
    pub change_type: String,
    pub changed_fields: Vec<String>,
    pub owners: Vec<Recipient>,
}
