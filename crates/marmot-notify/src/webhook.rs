//! Webhook delivery with provider formatting, retry, and an SSRF guard at
//! save time (spec.md §4.L). Delivery itself is queued on a worker pool;
//! a full queue drops the job with a warning rather than blocking or
//! running inline, since webhook delivery (unlike notification fan-out)
//! is not required to guarantee eventual insertion.

use crate::model::{Notification, TeamWebhook, WebhookProvider};
use crate::repo::WebhookRepo;
use chrono::Utc;
use marmot_common::config::RetryConfig;
use marmot_common::ids::WebhookId;
use marmot_common::retry::backoff_delay;
use marmot_worker_pool::{WorkerPool, WorkerPoolConfig};
use serde_json::{json, Value};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("invalid webhook url: {0}")]
    InvalidUrl(String),
    #[error("webhook url resolves to a disallowed address: {0}")]
    SsrfRejected(String),
}

/// Rejects `localhost`, loopback/private/link-local literal addresses,
/// and non-http(s) schemes (spec.md §4.L "URL SSRF guard"). DNS names
/// are accepted as-is — resolving them at save time would only catch
/// addresses that are private *right now*, not at delivery time, so the
/// dispatcher is still responsible for the connection itself going
/// through a sandboxed egress path in a real deployment.
pub fn validate_webhook_url(raw: &str) -> Result<(), WebhookError> {
    let url = Url::parse(raw).map_err(|e| WebhookError::InvalidUrl(e.to_string()))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(WebhookError::InvalidUrl(format!("unsupported scheme {}", url.scheme())));
    }
    let host = url.host_str().ok_or_else(|| WebhookError::InvalidUrl("missing host".to_string()))?;
    if host.eq_ignore_ascii_case("localhost") {
        return Err(WebhookError::SsrfRejected(host.to_string()));
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_disallowed_ip(&ip) {
            return Err(WebhookError::SsrfRejected(ip.to_string()));
        }
    }
    Ok(())
}

fn is_disallowed_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified(),
        IpAddr::V6(v6) => {
            v6.is_loopback() || v6.is_unspecified() || (v6.segments()[0] & 0xfe00) == 0xfc00 || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

fn format_slack(notification: &Notification) -> Value {
    let title: String = notification.title.chars().take(150).collect();
    json!({
        "blocks": [
            { "type": "header", "text": { "type": "plain_text", "text": title } },
            { "type": "section", "text": { "type": "mrkdwn", "text": notification.message } },
            { "type": "context", "elements": [ { "type": "mrkdwn", "text": format!("type: {}", notification.notification_type) } ] },
        ]
    })
}

fn discord_color(change_type: &str) -> u32 {
    match change_type {
        "created" => 0x2ecc71,
        "deleted" => 0xe74c3c,
        _ => 0x3498db,
    }
}

fn format_discord(notification: &Notification) -> Value {
    let title: String = notification.title.chars().take(256).collect();
    let change_type = notification.data.get("change_type").and_then(Value::as_str).unwrap_or(&notification.notification_type);
    json!({
        "embeds": [{
            "title": title,
            "description": notification.message,
            "color": discord_color(change_type),
        }]
    })
}

fn format_generic(notification: &Notification) -> Value {
    json!({
        "notification_type": notification.notification_type,
        "title": notification.title,
        "message": notification.message,
        "data": notification.data,
    })
}

fn format_body(provider: WebhookProvider, notification: &Notification) -> Value {
    match provider {
        WebhookProvider::Slack => format_slack(notification),
        WebhookProvider::Discord => format_discord(notification),
        WebhookProvider::Generic => format_generic(notification),
    }
}

enum Outcome {
    Success,
    NonRetryable(String),
    Exhausted(String),
}

/// `delay = 100ms * attempt^2`, uncapped within the attempt counts this
/// dispatcher ever reaches — shares its math with
/// [`marmot_common::retry`] rather than reimplementing the formula here.
fn retry_config(max_retries: u32) -> RetryConfig {
    RetryConfig {
        max_attempts: max_retries,
        min_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(3600),
        multiplier: 1.0,
    }
}

async fn deliver_with_retry(client: &reqwest::Client, webhook: &TeamWebhook, body: &Value, max_retries: u32) -> Outcome {
    let retry_config = retry_config(max_retries);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let result = client.post(&webhook.url).timeout(DELIVERY_TIMEOUT).json(body).send().await;
        match result {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Outcome::Success;
                }
                if status.as_u16() == 429 || status.is_server_error() {
                    if attempt >= max_retries {
                        return Outcome::Exhausted(format!("status {status} after {attempt} attempts"));
                    }
                } else {
                    return Outcome::NonRetryable(format!("status {status}"));
                }
            }
            Err(err) => {
                if attempt >= max_retries {
                    return Outcome::Exhausted(format!("network error after {attempt} attempts: {err}"));
                }
            }
        }
        tokio::time::sleep(backoff_delay(&retry_config, attempt)).await;
    }
}

struct DeliveryJob {
    webhook_id: WebhookId,
    notification: Notification,
}

pub struct WebhookDispatcher {
    repo: Arc<dyn WebhookRepo>,
    pool: WorkerPool<DeliveryJob, ()>,
}

impl WebhookDispatcher {
    pub fn new(repo: Arc<dyn WebhookRepo>, worker_pool: WorkerPoolConfig, max_retries: u32) -> Arc<Self> {
        let repo_for_pool = repo.clone();
        let client = reqwest::Client::new();
        let pool = WorkerPool::start(
            worker_pool,
            move |job: DeliveryJob| {
                let repo = repo_for_pool.clone();
                let client = client.clone();
                async move { deliver(&repo, &client, job, max_retries).await }
            },
            |_: ()| {},
        );
        Arc::new(Self { repo, pool })
    }

    /// Looks up every enabled webhook subscribed to this notification's
    /// type and enqueues a delivery job for each. Queue-full drops the
    /// job with a warning (spec.md §4.L "dispatch").
    pub async fn dispatch_for_notification(&self, notification: Notification) -> anyhow::Result<()> {
        let webhooks = self.repo.enabled_for_type(&notification.notification_type).await?;
        for webhook in webhooks {
            let accepted = self.pool.submit(DeliveryJob { webhook_id: webhook.id, notification: notification.clone() });
            if !accepted {
                tracing::warn!(webhook_id = %webhook.id, "webhook delivery queue full, dropping job");
            }
        }
        Ok(())
    }
}

async fn deliver(repo: &Arc<dyn WebhookRepo>, client: &reqwest::Client, job: DeliveryJob, max_retries: u32) {
    let webhook = match repo.get(job.webhook_id).await {
        Ok(Some(w)) if w.enabled => w,
        Ok(_) => return,
        Err(err) => {
            tracing::warn!(%err, "failed to load webhook for delivery");
            return;
        }
    };

    let body = format_body(webhook.provider, &job.notification);
    match deliver_with_retry(client, &webhook, &body, max_retries.max(1)).await {
        Outcome::Success => {
            let _ = repo.record_success(webhook.id, Utc::now()).await;
        }
        Outcome::NonRetryable(reason) | Outcome::Exhausted(reason) => {
            let _ = repo.record_failure(webhook.id, &reason).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_localhost_and_loopback() {
        assert!(validate_webhook_url("http://localhost/hook").is_err());
        assert!(validate_webhook_url("http://127.0.0.1/hook").is_err());
        assert!(validate_webhook_url("http://[::1]/hook").is_err());
    }

    #[test]
    fn rejects_private_and_link_local() {
        assert!(validate_webhook_url("http://10.0.0.5/hook").is_err());
        assert!(validate_webhook_url("http://192.168.1.1/hook").is_err());
        assert!(validate_webhook_url("http://169.254.1.1/hook").is_err());
    }

    #[test]
    fn rejects_non_http_scheme() {
        assert!(validate_webhook_url("ftp://example.com/hook").is_err());
    }

    #[test]
    fn accepts_public_https_url() {
        assert!(validate_webhook_url("https://hooks.slack.com/services/abc").is_ok());
    }

    #[test]
    fn discord_color_varies_by_change_type() {
        assert_ne!(discord_color("created"), discord_color("deleted"));
    }
}
