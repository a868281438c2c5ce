//! Live `ExternalServices` implementation used by the built-in step handlers.
//!
//! - Notifications: the `log` channel writes a tracing event; the `webhook`
//!   channel POSTs the notification as JSON to the recipient URL.
//! - API calls: real HTTP requests via `reqwest::Client`.
//! - Record updates: merged into the SQLite `records` table.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::{Value, json};
use stepflow_core::workflow::handlers::{ApiRequest, ExternalServices, Notification, RecordUpdate};
use stepflow_core::workflow::registry::{StepError, StepFuture};

use crate::sqlite::pool::DatabasePool;
use crate::sqlite::records::SqliteRecordStore;

const HTTP_TIMEOUT_SECS: u64 = 30;
const USER_AGENT: &str = "stepflow/0.1";

pub struct LiveServices {
    http_client: reqwest::Client,
    records: SqliteRecordStore,
}

impl LiveServices {
    /// Build the HTTP client and attach the record store to `pool`.
    pub fn new(pool: DatabasePool) -> Result<Self, reqwest::Error> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            http_client,
            records: SqliteRecordStore::new(pool),
        })
    }

    async fn post_webhook(&self, notification: &Notification) -> Result<Value, StepError> {
        let url = notification.recipient.as_deref().ok_or_else(|| {
            StepError::InvalidConfig("webhook notifications require a 'recipient' URL".to_string())
        })?;

        let response = self
            .http_client
            .post(url)
            .json(notification)
            .send()
            .await
            .map_err(|e| StepError::ExecutionFailed(format!("webhook to '{url}' failed: {e}")))?;

        let status = response.status().as_u16();
        if status >= 400 {
            return Err(StepError::ExecutionFailed(format!(
                "webhook to '{url}' returned status {status}"
            )));
        }

        tracing::info!(url, status, "webhook notification delivered");
        Ok(json!({
            "delivered": true,
            "channel": notification.channel,
            "recipient": url,
            "status": status,
        }))
    }
}

impl ExternalServices for LiveServices {
    fn send_notification(&self, notification: Notification) -> StepFuture<'_> {
        Box::pin(async move {
            match notification.channel.as_str() {
                "log" => {
                    tracing::info!(
                        recipient = notification.recipient.as_deref().unwrap_or("-"),
                        subject = notification.subject.as_deref().unwrap_or("-"),
                        message = notification.message.as_str(),
                        "workflow notification"
                    );
                    Ok(json!({
                        "delivered": true,
                        "channel": "log",
                        "recipient": notification.recipient,
                        "message": notification.message,
                    }))
                }
                "webhook" => self.post_webhook(&notification).await,
                other => Err(StepError::ExecutionFailed(format!(
                    "unsupported notification channel: {other}"
                ))),
            }
        })
    }

    fn call_api(&self, request: ApiRequest) -> StepFuture<'_> {
        Box::pin(async move {
            let http_method: reqwest::Method = request.method.parse().map_err(|_| {
                StepError::ExecutionFailed(format!("invalid HTTP method: {}", request.method))
            })?;

            let mut builder = self.http_client.request(http_method, &request.url);
            for (key, value) in &request.headers {
                builder = builder.header(key.as_str(), value.as_str());
            }
            if let Some(ref body) = request.body {
                builder = builder.json(body);
            }

            let response = builder.send().await.map_err(|e| {
                StepError::ExecutionFailed(format!("HTTP request to '{}' failed: {e}", request.url))
            })?;

            let status = response.status().as_u16();
            let headers: BTreeMap<String, String> = response
                .headers()
                .iter()
                .map(|(k, v)| {
                    (
                        k.as_str().to_string(),
                        v.to_str().unwrap_or("<binary>").to_string(),
                    )
                })
                .collect();
            let text = response.text().await.map_err(|e| {
                StepError::ExecutionFailed(format!("failed to read HTTP response body: {e}"))
            })?;

            if status >= 400 {
                return Err(StepError::ExecutionFailed(format!(
                    "HTTP {} {} returned status {status}",
                    request.method, request.url
                )));
            }

            tracing::info!(
                url = request.url.as_str(),
                status,
                body_len = text.len(),
                "external API call completed"
            );

            let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
            Ok(json!({
                "status": status,
                "body": body,
                "headers": headers,
            }))
        })
    }

    fn update_record(&self, update: RecordUpdate) -> StepFuture<'_> {
        Box::pin(async move {
            let fields = self
                .records
                .upsert(&update.collection, &update.record_id, &update.fields)
                .await
                .map_err(|e| StepError::ExecutionFailed(format!("record update failed: {e}")))?;

            tracing::debug!(
                collection = update.collection.as_str(),
                record_id = update.record_id.as_str(),
                "record updated"
            );
            Ok(json!({
                "collection": update.collection,
                "record_id": update.record_id,
                "fields": fields,
            }))
        })
    }
}
