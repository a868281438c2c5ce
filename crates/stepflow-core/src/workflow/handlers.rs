//! Built-in step handlers and the `ExternalServices` port they delegate to.
//!
//! The engine never talks to the outside world directly. Notification,
//! HTTP, and record-update steps call through `ExternalServices`; infra
//! provides the live implementation, and `NoopServices` here logs and echoes
//! for dry runs and tests.
//!
//! Built-in step types:
//! - `send_notification` -- `{ channel, recipient?, subject?, message }`
//! - `call_external_api` -- `{ method?, url, headers?, body? }`
//! - `wait` -- `{ duration_ms }` or `{ duration_secs }`
//! - `evaluate_condition` -- `{ expression, on_true?, on_false? }`
//! - `update_record` -- `{ collection, record_id, fields }`

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::expression::ExpressionEvaluator;
use super::registry::{StepError, StepFuture, StepHandler, StepInput, StepRegistry};

/// Step type names registered by `StepRegistry::with_builtins`.
pub const SEND_NOTIFICATION: &str = "send_notification";
pub const CALL_EXTERNAL_API: &str = "call_external_api";
pub const WAIT: &str = "wait";
pub const EVALUATE_CONDITION: &str = "evaluate_condition";
pub const UPDATE_RECORD: &str = "update_record";

// ---------------------------------------------------------------------------
// Service requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub channel: String,
    pub recipient: Option<String>,
    pub subject: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiRequest {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordUpdate {
    pub collection: String,
    pub record_id: String,
    pub fields: serde_json::Map<String, Value>,
}

// ---------------------------------------------------------------------------
// ExternalServices
// ---------------------------------------------------------------------------

/// Collaborators reached by the built-in handlers.
///
/// Object-safe (boxed futures) so the registry can hold `Arc<dyn ExternalServices>`.
pub trait ExternalServices: Send + Sync {
    fn send_notification(&self, notification: Notification) -> StepFuture<'_>;

    fn call_api(&self, request: ApiRequest) -> StepFuture<'_>;

    fn update_record(&self, update: RecordUpdate) -> StepFuture<'_>;
}

/// Logs each request and echoes it back. Nothing leaves the process.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopServices;

impl ExternalServices for NoopServices {
    fn send_notification(&self, notification: Notification) -> StepFuture<'_> {
        Box::pin(async move {
            tracing::info!(
                channel = notification.channel.as_str(),
                recipient = notification.recipient.as_deref().unwrap_or("-"),
                "notification (dry run)"
            );
            Ok(json!({
                "delivered": false,
                "dry_run": true,
                "channel": notification.channel,
                "recipient": notification.recipient,
                "message": notification.message,
            }))
        })
    }

    fn call_api(&self, request: ApiRequest) -> StepFuture<'_> {
        Box::pin(async move {
            tracing::info!(
                method = request.method.as_str(),
                url = request.url.as_str(),
                "external API call (dry run)"
            );
            Ok(json!({
                "dry_run": true,
                "method": request.method,
                "url": request.url,
                "status": Value::Null,
            }))
        })
    }

    fn update_record(&self, update: RecordUpdate) -> StepFuture<'_> {
        Box::pin(async move {
            tracing::info!(
                collection = update.collection.as_str(),
                record_id = update.record_id.as_str(),
                fields = update.fields.len(),
                "record update (dry run)"
            );
            Ok(json!({
                "dry_run": true,
                "collection": update.collection,
                "record_id": update.record_id,
                "fields": update.fields,
            }))
        })
    }
}

// ---------------------------------------------------------------------------
// Registry wiring
// ---------------------------------------------------------------------------

impl StepRegistry {
    /// Registry pre-loaded with every built-in step type.
    pub fn with_builtins(services: Arc<dyn ExternalServices>) -> Self {
        let mut registry = Self::new();
        registry.register(
            SEND_NOTIFICATION,
            SendNotificationHandler {
                services: Arc::clone(&services),
            },
        );
        registry.register(
            CALL_EXTERNAL_API,
            CallExternalApiHandler {
                services: Arc::clone(&services),
            },
        );
        registry.register(WAIT, WaitHandler);
        registry.register(EVALUATE_CONDITION, EvaluateConditionHandler);
        registry.register(UPDATE_RECORD, UpdateRecordHandler { services });
        registry
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub struct SendNotificationHandler {
    services: Arc<dyn ExternalServices>,
}

impl StepHandler for SendNotificationHandler {
    fn execute(&self, input: StepInput) -> StepFuture<'_> {
        Box::pin(async move {
            let config = input.resolved_config();
            let notification = Notification {
                channel: optional_str(&config, "channel").unwrap_or_else(|| "log".to_string()),
                recipient: optional_str(&config, "recipient"),
                subject: optional_str(&config, "subject"),
                message: required_str(&config, "message")?,
            };
            self.services.send_notification(notification).await
        })
    }
}

pub struct CallExternalApiHandler {
    services: Arc<dyn ExternalServices>,
}

impl StepHandler for CallExternalApiHandler {
    fn execute(&self, input: StepInput) -> StepFuture<'_> {
        Box::pin(async move {
            let config = input.resolved_config();
            let headers = match config.get("headers") {
                None | Some(Value::Null) => BTreeMap::new(),
                Some(Value::Object(map)) => map
                    .iter()
                    .map(|(k, v)| (k.clone(), super::context::value_to_string(v)))
                    .collect(),
                Some(_) => {
                    return Err(StepError::InvalidConfig(
                        "'headers' must be an object".to_string(),
                    ));
                }
            };
            let request = ApiRequest {
                method: optional_str(&config, "method")
                    .unwrap_or_else(|| "GET".to_string())
                    .to_ascii_uppercase(),
                url: required_str(&config, "url")?,
                headers,
                body: config.get("body").filter(|b| !b.is_null()).cloned(),
            };
            self.services.call_api(request).await
        })
    }
}

/// Sleeps for the configured duration. The runner's step timeout still applies.
pub struct WaitHandler;

impl StepHandler for WaitHandler {
    fn execute(&self, input: StepInput) -> StepFuture<'_> {
        Box::pin(async move {
            let config = input.resolved_config();
            let millis = match (config.get("duration_ms"), config.get("duration_secs")) {
                (Some(ms), _) => ms.as_u64(),
                (None, Some(secs)) => secs.as_u64().map(|s| s.saturating_mul(1000)),
                (None, None) => None,
            }
            .ok_or_else(|| {
                StepError::InvalidConfig(
                    "wait requires a non-negative integer 'duration_ms' or 'duration_secs'"
                        .to_string(),
                )
            })?;

            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok(json!({ "waited_ms": millis }))
        })
    }
}

/// Evaluates `expression` against the run context.
///
/// The expression is never template-resolved; context values reach the
/// evaluator only as data.
pub struct EvaluateConditionHandler;

impl StepHandler for EvaluateConditionHandler {
    fn execute(&self, input: StepInput) -> StepFuture<'_> {
        Box::pin(async move {
            let expression = required_str(&input.config, "expression")?;
            let result = ExpressionEvaluator::new()
                .evaluate_bool(&expression, &input.context.to_expression_context())
                .map_err(|e| StepError::ExecutionFailed(e.to_string()))?;

            let label_key = if result { "on_true" } else { "on_false" };
            let branch = optional_str(&input.config, label_key)
                .unwrap_or_else(|| result.to_string());
            Ok(json!({ "result": result, "branch": branch }))
        })
    }
}

pub struct UpdateRecordHandler {
    services: Arc<dyn ExternalServices>,
}

impl StepHandler for UpdateRecordHandler {
    fn execute(&self, input: StepInput) -> StepFuture<'_> {
        Box::pin(async move {
            let config = input.resolved_config();
            let fields = match config.get("fields") {
                Some(Value::Object(map)) => map.clone(),
                _ => {
                    return Err(StepError::InvalidConfig(
                        "update_record requires an object 'fields'".to_string(),
                    ));
                }
            };
            let update = RecordUpdate {
                collection: required_str(&config, "collection")?,
                record_id: required_str(&config, "record_id")?,
                fields,
            };
            self.services.update_record(update).await
        })
    }
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

fn optional_str(config: &Value, key: &str) -> Option<String> {
    match config.get(key)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn required_str(config: &Value, key: &str) -> Result<String, StepError> {
    optional_str(config, key)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| StepError::InvalidConfig(format!("missing required field '{key}'")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use uuid::Uuid;

    use crate::workflow::context::ExecutionContext;

    /// Records every request it receives.
    #[derive(Default)]
    struct RecordingServices {
        notifications: Mutex<Vec<Notification>>,
        requests: Mutex<Vec<ApiRequest>>,
        updates: Mutex<Vec<RecordUpdate>>,
    }

    impl ExternalServices for RecordingServices {
        fn send_notification(&self, notification: Notification) -> StepFuture<'_> {
            self.notifications.lock().unwrap().push(notification);
            Box::pin(async { Ok(json!({ "delivered": true })) })
        }

        fn call_api(&self, request: ApiRequest) -> StepFuture<'_> {
            self.requests.lock().unwrap().push(request);
            Box::pin(async { Ok(json!({ "status": 200 })) })
        }

        fn update_record(&self, update: RecordUpdate) -> StepFuture<'_> {
            self.updates.lock().unwrap().push(update);
            Box::pin(async { Ok(json!({ "updated": true })) })
        }
    }

    fn input(config: Value, context: Value) -> StepInput {
        let vars = match context {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        StepInput {
            run_id: Uuid::nil(),
            step_id: "step".to_string(),
            attempt: 1,
            config,
            context: ExecutionContext::from_variables(vars),
        }
    }

    fn registry_with(services: Arc<RecordingServices>) -> StepRegistry {
        StepRegistry::with_builtins(services)
    }

    #[test]
    fn test_builtins_registered() {
        let registry = StepRegistry::with_builtins(Arc::new(NoopServices));
        assert_eq!(
            registry.step_types(),
            vec![
                CALL_EXTERNAL_API,
                EVALUATE_CONDITION,
                SEND_NOTIFICATION,
                UPDATE_RECORD,
                WAIT
            ]
        );
    }

    #[tokio::test]
    async fn test_send_notification_resolves_templates() {
        let services = Arc::new(RecordingServices::default());
        let registry = registry_with(Arc::clone(&services));
        let handler = registry.resolve(SEND_NOTIFICATION).unwrap();

        let out = handler
            .execute(input(
                json!({
                    "channel": "email",
                    "recipient": "{{ owner }}",
                    "message": "Invoice {{ invoice_id }} needs review"
                }),
                json!({ "owner": "ap@example.com", "invoice_id": "INV-7" }),
            ))
            .await
            .unwrap();

        assert_eq!(out["delivered"], json!(true));
        let sent = services.notifications.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient.as_deref(), Some("ap@example.com"));
        assert_eq!(sent[0].message, "Invoice INV-7 needs review");
    }

    #[tokio::test]
    async fn test_send_notification_requires_message() {
        let registry = StepRegistry::with_builtins(Arc::new(NoopServices));
        let err = registry
            .resolve(SEND_NOTIFICATION)
            .unwrap()
            .execute(input(json!({ "channel": "sms" }), json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::InvalidConfig(_)));
        assert!(err.to_string().contains("message"));
    }

    #[tokio::test]
    async fn test_call_external_api_builds_request() {
        let services = Arc::new(RecordingServices::default());
        let registry = registry_with(Arc::clone(&services));

        registry
            .resolve(CALL_EXTERNAL_API)
            .unwrap()
            .execute(input(
                json!({
                    "method": "post",
                    "url": "https://api.example.com/orders/{{ order_id }}",
                    "headers": { "X-Attempt": 1 },
                    "body": { "amount": "{{ amount }}" }
                }),
                json!({ "order_id": "o-9", "amount": 42 }),
            ))
            .await
            .unwrap();

        let requests = services.requests.lock().unwrap();
        assert_eq!(requests[0].method, "POST");
        assert_eq!(requests[0].url, "https://api.example.com/orders/o-9");
        assert_eq!(requests[0].headers["X-Attempt"], "1");
        assert_eq!(requests[0].body, Some(json!({ "amount": 42 })));
    }

    #[tokio::test]
    async fn test_call_external_api_rejects_bad_headers() {
        let registry = StepRegistry::with_builtins(Arc::new(NoopServices));
        let err = registry
            .resolve(CALL_EXTERNAL_API)
            .unwrap()
            .execute(input(json!({ "url": "https://x", "headers": [1] }), json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_wait_handler() {
        let out = WaitHandler
            .execute(input(json!({ "duration_ms": 5 }), json!({})))
            .await
            .unwrap();
        assert_eq!(out, json!({ "waited_ms": 5 }));

        let err = WaitHandler
            .execute(input(json!({}), json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_evaluate_condition_branches() {
        let config = json!({
            "expression": "amount > 100",
            "on_true": "escalate",
            "on_false": "auto_approve"
        });

        let out = EvaluateConditionHandler
            .execute(input(config.clone(), json!({ "amount": 250 })))
            .await
            .unwrap();
        assert_eq!(out, json!({ "result": true, "branch": "escalate" }));

        let out = EvaluateConditionHandler
            .execute(input(config, json!({ "amount": 50 })))
            .await
            .unwrap();
        assert_eq!(out, json!({ "result": false, "branch": "auto_approve" }));
    }

    #[tokio::test]
    async fn test_evaluate_condition_default_branch_labels() {
        let out = EvaluateConditionHandler
            .execute(input(json!({ "expression": "flag" }), json!({ "flag": true })))
            .await
            .unwrap();
        assert_eq!(out["branch"], json!("true"));
    }

    #[tokio::test]
    async fn test_update_record() {
        let services = Arc::new(RecordingServices::default());
        let registry = registry_with(Arc::clone(&services));

        registry
            .resolve(UPDATE_RECORD)
            .unwrap()
            .execute(input(
                json!({
                    "collection": "invoices",
                    "record_id": "{{ invoice_id }}",
                    "fields": { "status": "approved" }
                }),
                json!({ "invoice_id": "INV-7" }),
            ))
            .await
            .unwrap();

        let updates = services.updates.lock().unwrap();
        assert_eq!(updates[0].record_id, "INV-7");
        assert_eq!(updates[0].fields["status"], json!("approved"));
    }

    #[tokio::test]
    async fn test_update_record_requires_fields_object() {
        let registry = StepRegistry::with_builtins(Arc::new(NoopServices));
        let err = registry
            .resolve(UPDATE_RECORD)
            .unwrap()
            .execute(input(
                json!({ "collection": "c", "record_id": "r", "fields": "oops" }),
                json!({}),
            ))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("fields"));
    }

    #[tokio::test]
    async fn test_noop_services_echo() {
        let out = NoopServices
            .call_api(ApiRequest {
                method: "GET".to_string(),
                url: "https://example.com".to_string(),
                headers: BTreeMap::new(),
                body: None,
            })
            .await
            .unwrap();
        assert_eq!(out["dry_run"], json!(true));
        assert_eq!(out["url"], json!("https://example.com"));
    }
}
