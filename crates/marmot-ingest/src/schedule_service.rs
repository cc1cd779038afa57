//! Schedule CRUD plus cron-expression validation (spec.md §4.C, §4.E
//! step 1). Plugin configuration is encrypted at rest the same way the
//! webhook dispatcher encrypts target URLs — see `marmot_common::crypto`.

use crate::cron::{CronError, CronSchedule};
use crate::model::Schedule;
use crate::repo::ScheduleRepo;
use chrono::Utc;
use marmot_common::crypto::Cipher;
use marmot_common::ids::{PluginId, ScheduleId};
use marmot_db::RepoError;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScheduleServiceError {
    #[error("invalid cron expression: {0}")]
    InvalidCron(#[from] CronError),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error("encryption error: {0}")]
    Crypto(#[from] marmot_common::error::Error),
}

pub struct NewSchedule {
    pub name: String,
    pub plugin_id: PluginId,
    pub pipeline_name: String,
    pub source_name: String,
    pub config: Value,
    pub cron_expression: String,
}

pub struct ScheduleService {
    repo: Arc<dyn ScheduleRepo>,
    cipher: Cipher,
}

impl ScheduleService {
    pub fn new(repo: Arc<dyn ScheduleRepo>, cipher: Cipher) -> Self {
        Self { repo, cipher }
    }

    pub async fn create(&self, new: NewSchedule) -> Result<Schedule, ScheduleServiceError> {
        let parsed = CronSchedule::parse(&new.cron_expression)?;
        let now = Utc::now();
        let next_fire_time = parsed.next_after(now);

        let schedule = Schedule {
            id: ScheduleId::new_v4(),
            name: new.name,
            plugin_id: new.plugin_id,
            pipeline_name: new.pipeline_name,
            source_name: new.source_name,
            config: self.encrypt_config(&new.config)?,
            cron_expression: new.cron_expression,
            enabled: true,
            next_fire_time,
            claimed_by: None,
            claim_expires_at: None,
            created_at: now,
            updated_at: now,
        };
        let created = self.repo.create(schedule).await?;
        Ok(self.decrypted(created)?)
    }

    pub async fn get(&self, id: ScheduleId) -> Result<Option<Schedule>, ScheduleServiceError> {
        match self.repo.get(id).await? {
            Some(schedule) => Ok(Some(self.decrypted(schedule)?)),
            None => Ok(None),
        }
    }

    pub async fn delete(&self, id: ScheduleId) -> Result<(), ScheduleServiceError> {
        Ok(self.repo.delete(id).await?)
    }

    pub async fn list(&self) -> Result<Vec<Schedule>, ScheduleServiceError> {
        self.repo.list_all().await?.into_iter().map(|s| Ok(self.decrypted(s)?)).collect()
    }

    pub async fn update(
        &self,
        id: ScheduleId,
        cron_expression: String,
        config: Value,
        enabled: bool,
    ) -> Result<Schedule, ScheduleServiceError> {
        CronSchedule::parse(&cron_expression)?;
        let encrypted = self.encrypt_config(&config)?;
        self.repo.update(id, &cron_expression, encrypted, enabled, Utc::now()).await?;
        self.get(id).await?.ok_or_else(|| RepoError::NotFound.into())
    }

    /// Forces the next scheduler tick to pick this schedule up, regardless
    /// of its stored `next_fire_time`.
    pub async fn trigger(&self, id: ScheduleId) -> Result<(), ScheduleServiceError> {
        self.repo.trigger_now(id, Utc::now()).await?;
        Ok(())
    }

    /// Re-validates the expression, decrypted at read time only.
    fn encrypt_config(&self, config: &Value) -> Result<Value, marmot_common::error::Error> {
        let plaintext = config.to_string();
        let ciphertext = self.cipher.encrypt(&plaintext)?;
        Ok(Value::String(ciphertext))
    }

    fn decrypted(&self, mut schedule: Schedule) -> Result<Schedule, marmot_common::error::Error> {
        if let Value::String(ciphertext) = &schedule.config {
            let plaintext = self.cipher.decrypt(ciphertext)?;
            schedule.config = serde_json::from_str(&plaintext)
                .map_err(|e| marmot_common::error::Error::internal(format!("stored config not valid json: {e}")))?;
        }
        Ok(schedule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::InMemoryScheduleRepo;
    use marmot_common::crypto::{Cipher, EncryptionKey};
    use serde_json::json;

    fn service() -> ScheduleService {
        ScheduleService::new(
            Arc::new(InMemoryScheduleRepo::new()),
            Cipher::new(Some(EncryptionKey::from_secret("test-key"))),
        )
    }

    #[tokio::test]
    async fn create_computes_next_fire_time_and_round_trips_config() {
        let svc = service();
        let created = svc
            .create(NewSchedule {
                name: "kafka-orders".to_string(),
                plugin_id: PluginId("kafka".to_string()),
                pipeline_name: "kafka-pipeline".to_string(),
                source_name: "prod".to_string(),
                config: json!({"bootstrap.servers": "kafka:9092"}),
                cron_expression: "*/5 * * * *".to_string(),
            })
            .await
            .unwrap();
        assert!(created.next_fire_time > Utc::now() - chrono::Duration::minutes(1));

        let fetched = svc.get(created.id).await.unwrap().unwrap();
        assert_eq!(fetched.config, json!({"bootstrap.servers": "kafka:9092"}));
    }

    #[tokio::test]
    async fn rejects_invalid_cron_expression() {
        let svc = service();
        let result = svc
            .create(NewSchedule {
                name: "bad".to_string(),
                plugin_id: PluginId("kafka".to_string()),
                pipeline_name: "p".to_string(),
                source_name: "s".to_string(),
                config: json!({}),
                cron_expression: "not a cron expression".to_string(),
            })
            .await;
        assert!(matches!(result, Err(ScheduleServiceError::InvalidCron(_))));
    }
}
