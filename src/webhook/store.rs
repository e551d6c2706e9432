//! Webhook subscription persistence. Secrets are encrypted at rest with
//! [`crate::secrets::SecretBox`] and only ever decrypted in-process to sign
//! an outgoing payload — never returned from a getter.

use crate::error::{DbError, Result, WebhookError};
use crate::secrets::SecretBox;
use crate::{AgentConfigId, WebhookId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: WebhookId,
    pub agent_config_id: Option<AgentConfigId>,
    pub target_url: String,
    /// Event names this subscription wants; empty means "all events".
    pub events: Vec<String>,
    pub has_secret: bool,
    pub enabled: bool,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl WebhookSubscription {
    pub fn wants(&self, event_name: &str) -> bool {
        self.enabled && (self.events.is_empty() || self.events.iter().any(|e| e == event_name))
    }
}

pub struct NewWebhookInput {
    pub agent_config_id: Option<AgentConfigId>,
    pub target_url: String,
    pub events: Vec<String>,
    pub secret: Option<String>,
}

pub struct WebhookStore {
    pool: SqlitePool,
    secrets: SecretBox,
}

impl WebhookStore {
    pub fn new(pool: SqlitePool, secrets: SecretBox) -> Self {
        Self { pool, secrets }
    }

    pub async fn create(&self, input: NewWebhookInput) -> Result<WebhookSubscription> {
        let id = uuid::Uuid::new_v4();
        let now = Utc::now();

        let (ciphertext, nonce) = match &input.secret {
            Some(secret) => {
                let encrypted = self.secrets.encrypt(secret.as_bytes()).map_err(crate::error::Error::from)?;
                (Some(encrypted.ciphertext), Some(encrypted.nonce.to_vec()))
            }
            None => (None, None),
        };

        sqlx::query(
            "INSERT INTO webhooks (id, agent_config_id, target_url, events, secret_ciphertext, secret_nonce, enabled, created_at)
             VALUES (?, ?, ?, ?, ?, ?, 1, ?)",
        )
        .bind(id.to_string())
        .bind(input.agent_config_id.map(|a| a.to_string()))
        .bind(&input.target_url)
        .bind(serde_json::to_string(&input.events).unwrap_or_default())
        .bind(&ciphertext)
        .bind(&nonce)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        self.get(id).await
    }

    pub async fn get(&self, id: WebhookId) -> Result<WebhookSubscription> {
        let row = sqlx::query("SELECT * FROM webhooks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?
            .ok_or_else(|| WebhookError::NotFound(id.to_string()))?;
        row_to_subscription(row)
    }

    pub async fn list(&self) -> Result<Vec<WebhookSubscription>> {
        let rows = sqlx::query("SELECT * FROM webhooks ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::from)?;
        rows.into_iter().map(row_to_subscription).collect()
    }

    /// Subscriptions matching an event: everything enabled, scoped to
    /// either no agent filter or this task's agent, whose `events[]` is
    /// empty or includes the event name.
    pub async fn matching(&self, event_name: &str, agent_config_id: Option<AgentConfigId>) -> Result<Vec<WebhookSubscription>> {
        let all = self.list().await?;
        Ok(all
            .into_iter()
            .filter(|sub| sub.wants(event_name))
            .filter(|sub| match (sub.agent_config_id, agent_config_id) {
                (None, _) => true,
                (Some(a), Some(b)) => a == b,
                (Some(_), None) => false,
            })
            .collect())
    }

    /// Decrypts the signing secret for dispatch. Returns `None` when the
    /// subscription has no secret configured.
    pub async fn signing_secret(&self, id: WebhookId) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT secret_ciphertext, secret_nonce FROM webhooks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?
            .ok_or_else(|| WebhookError::NotFound(id.to_string()))?;

        let ciphertext: Option<Vec<u8>> = row.try_get("secret_ciphertext").map_err(DbError::from)?;
        let nonce: Option<Vec<u8>> = row.try_get("secret_nonce").map_err(DbError::from)?;

        match (ciphertext, nonce) {
            (Some(ciphertext), Some(nonce)) => {
                let plaintext = self.secrets.decrypt(&ciphertext, &nonce).map_err(crate::error::Error::from)?;
                Ok(Some(plaintext))
            }
            _ => Ok(None),
        }
    }

    pub async fn set_enabled(&self, id: WebhookId, enabled: bool) -> Result<()> {
        sqlx::query("UPDATE webhooks SET enabled = ? WHERE id = ?")
            .bind(enabled)
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(())
    }

    pub async fn delete(&self, id: WebhookId) -> Result<()> {
        sqlx::query("DELETE FROM webhooks WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(())
    }

    pub async fn record_attempt(&self, id: WebhookId, error: Option<String>) -> Result<()> {
        sqlx::query("UPDATE webhooks SET last_attempt_at = ?, last_error = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(&error)
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(())
    }
}

fn row_to_subscription(row: sqlx::sqlite::SqliteRow) -> Result<WebhookSubscription> {
    let id: String = row.try_get("id").map_err(DbError::from)?;
    let agent_config_id: Option<String> = row.try_get("agent_config_id").map_err(DbError::from)?;
    let events: String = row.try_get("events").map_err(DbError::from)?;
    let secret_ciphertext: Option<Vec<u8>> = row.try_get("secret_ciphertext").map_err(DbError::from)?;
    let enabled: bool = row.try_get("enabled").map_err(DbError::from)?;
    let last_attempt_at: Option<String> = row.try_get("last_attempt_at").map_err(DbError::from)?;
    let created_at: String = row.try_get("created_at").map_err(DbError::from)?;

    Ok(WebhookSubscription {
        id: id.parse().map_err(|_| WebhookError::NotFound(id.clone()))?,
        agent_config_id: agent_config_id.map(|a| a.parse()).transpose().map_err(|_| WebhookError::NotFound(id.clone()))?,
        target_url: row.try_get("target_url").map_err(DbError::from)?,
        events: serde_json::from_str(&events).unwrap_or_default(),
        has_secret: secret_ciphertext.is_some(),
        enabled,
        last_attempt_at: parse_opt_ts(last_attempt_at)?,
        last_error: row.try_get("last_error").map_err(DbError::from)?,
        created_at: parse_ts(&created_at)?,
    })
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| WebhookError::NotFound(format!("invalid timestamp: {s}")).into())
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_ts(&s)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(pool: SqlitePool) -> WebhookStore {
        WebhookStore::new(pool, SecretBox::new(&[9u8; 32]))
    }

    #[tokio::test]
    async fn create_without_secret_has_no_secret() {
        let pool = crate::db::connect_in_memory().await;
        let store = store(pool);
        let sub = store
            .create(NewWebhookInput {
                agent_config_id: None,
                target_url: "https://example.com/hook".to_string(),
                events: vec![],
                secret: None,
            })
            .await
            .unwrap();
        assert!(!sub.has_secret);
        assert!(store.signing_secret(sub.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn signing_secret_round_trips_through_encryption() {
        let pool = crate::db::connect_in_memory().await;
        let store = store(pool);
        let sub = store
            .create(NewWebhookInput {
                agent_config_id: None,
                target_url: "https://example.com/hook".to_string(),
                events: vec!["task.completed".to_string()],
                secret: Some("s3cr3t".to_string()),
            })
            .await
            .unwrap();
        assert!(sub.has_secret);
        let secret = store.signing_secret(sub.id).await.unwrap().unwrap();
        assert_eq!(secret, b"s3cr3t");
    }

    #[tokio::test]
    async fn wants_respects_empty_vs_explicit_event_list() {
        let pool = crate::db::connect_in_memory().await;
        let store = store(pool);
        let all_events = store
            .create(NewWebhookInput { agent_config_id: None, target_url: "u".to_string(), events: vec![], secret: None })
            .await
            .unwrap();
        let scoped = store
            .create(NewWebhookInput {
                agent_config_id: None,
                target_url: "u".to_string(),
                events: vec!["task.failed".to_string()],
                secret: None,
            })
            .await
            .unwrap();

        assert!(all_events.wants("task.completed"));
        assert!(!scoped.wants("task.completed"));
        assert!(scoped.wants("task.failed"));
    }
}
