//! Steps executed by a remote service over a request/reply command bus.
//!
//! [`remote_action`] and [`remote_compensation`] build step callbacks that
//! send a [`RemoteCommand`] describing the invocation and wait for a
//! [`RemoteReply`]. Outputs of a successful action reply are merged into the
//! step data.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use saga_store::{DataMap, SagaId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::definition::StepFn;
use crate::error::BoxError;
use crate::execution::Execution;

/// Per-call timeout used when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Whether a command runs a step's action or its compensation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallType {
    Action,
    Compensate,
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallType::Action => write!(f, "action"),
            CallType::Compensate => write!(f, "compensation"),
        }
    }
}

/// What the remote service is asked to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemotePayload {
    pub saga_id: SagaId,
    pub step: String,
    #[serde(rename = "type")]
    pub call_type: CallType,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub idempotency_key: String,
    #[serde(default)]
    pub input: DataMap,
    #[serde(default)]
    pub step_data: DataMap,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl RemotePayload {
    fn from_execution(ex: &Execution, call_type: CallType) -> Self {
        Self {
            saga_id: ex.saga_id().clone(),
            step: ex.step_name().to_string(),
            call_type,
            attempt: ex.attempt(),
            idempotency_key: ex.idempotency_key(),
            input: ex.input().clone(),
            step_data: ex.data().clone(),
            metadata: ex.metadata().clone(),
        }
    }
}

/// A command addressed to a subject on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCommand {
    pub id: Uuid,
    pub subject: String,
    pub issued_at: DateTime<Utc>,
    pub payload: RemotePayload,
}

impl RemoteCommand {
    pub fn new(subject: impl Into<String>, payload: RemotePayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject: subject.into(),
            issued_at: Utc::now(),
            payload,
        }
    }
}

/// The remote service's answer to a [`RemoteCommand`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteReply {
    pub command_id: Uuid,
    /// `<subject>.result` or `<subject>.error`.
    #[serde(rename = "type")]
    pub reply_type: String,
    pub saga_id: SagaId,
    pub step: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "DataMap::is_empty")]
    pub outputs: DataMap,
}

impl RemoteReply {
    /// A successful reply carrying `outputs`.
    pub fn ok(command: &RemoteCommand, outputs: DataMap) -> Self {
        Self {
            command_id: command.id,
            reply_type: format!("{}.result", command.subject),
            saga_id: command.payload.saga_id.clone(),
            step: command.payload.step.clone(),
            ok: true,
            error: String::new(),
            outputs,
        }
    }

    /// A rejection carrying the remote error message.
    pub fn error(command: &RemoteCommand, error: impl Into<String>) -> Self {
        Self {
            command_id: command.id,
            reply_type: format!("{}.error", command.subject),
            saga_id: command.payload.saga_id.clone(),
            step: command.payload.step.clone(),
            ok: false,
            error: error.into(),
            outputs: DataMap::new(),
        }
    }
}

/// Request/reply transport for remote steps.
#[async_trait]
pub trait CommandBus: Send + Sync {
    /// Sends `command` and waits for its reply.
    async fn request(&self, command: RemoteCommand) -> Result<RemoteReply, BoxError>;
}

/// Failure of a remote step call.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote {call} request failed: {source}")]
    Transport {
        call: CallType,
        #[source]
        source: BoxError,
    },

    #[error("remote {call} request timed out after {timeout:?}")]
    Timeout { call: CallType, timeout: Duration },

    #[error("remote {call} request cancelled")]
    Cancelled { call: CallType },

    /// The remote service answered with `ok: false`.
    #[error("{message}")]
    Rejected { call: CallType, message: String },
}

/// Builds an action that delegates to `subject`.
///
/// `timeout` bounds each call; `None` uses [`DEFAULT_TIMEOUT`].
pub fn remote_action(bus: Arc<dyn CommandBus>, subject: impl Into<String>, timeout: Option<Duration>) -> StepFn {
    remote_step(bus, subject.into(), timeout, CallType::Action)
}

/// Builds a compensation that delegates to `subject`.
pub fn remote_compensation(
    bus: Arc<dyn CommandBus>,
    subject: impl Into<String>,
    timeout: Option<Duration>,
) -> StepFn {
    remote_step(bus, subject.into(), timeout, CallType::Compensate)
}

fn remote_step(bus: Arc<dyn CommandBus>, subject: String, timeout: Option<Duration>, call: CallType) -> StepFn {
    let timeout = timeout.filter(|t| !t.is_zero()).unwrap_or(DEFAULT_TIMEOUT);
    StepFn::new(move |ex: &mut Execution| {
        Box::pin(call_remote(ex, Arc::clone(&bus), subject.clone(), timeout, call))
    })
}

async fn call_remote(
    ex: &mut Execution,
    bus: Arc<dyn CommandBus>,
    subject: String,
    timeout: Duration,
    call: CallType,
) -> Result<(), BoxError> {
    let command = RemoteCommand::new(subject, RemotePayload::from_execution(ex, call));
    tracing::debug!(
        subject = %command.subject,
        command_id = %command.id,
        attempt = command.payload.attempt,
        "sending remote {call}"
    );

    let reply = send(bus.as_ref(), command, timeout, ex.cancellation()).await?;
    if call == CallType::Action {
        for (key, value) in reply.outputs {
            ex.set(key, value);
        }
    }
    Ok(())
}

async fn send(
    bus: &dyn CommandBus,
    command: RemoteCommand,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<RemoteReply, RemoteError> {
    let call = command.payload.call_type;
    let reply = tokio::select! {
        _ = cancel.cancelled() => return Err(RemoteError::Cancelled { call }),
        res = tokio::time::timeout(timeout, bus.request(command)) => match res {
            Err(_) => return Err(RemoteError::Timeout { call, timeout }),
            Ok(Err(source)) => return Err(RemoteError::Transport { call, source }),
            Ok(Ok(reply)) => reply,
        },
    };

    if reply.ok {
        return Ok(reply);
    }
    let message = if reply.error.is_empty() {
        format!("remote {call} rejected")
    } else {
        reply.error
    };
    Err(RemoteError::Rejected { call, message })
}

type Handler = Arc<dyn Fn(RemoteCommand) -> BoxFuture<'static, Result<RemoteReply, BoxError>> + Send + Sync>;

/// In-process command bus dispatching to registered handlers by subject.
#[derive(Clone, Default)]
pub struct LocalCommandBus {
    handlers: Arc<RwLock<HashMap<String, Handler>>>,
}

impl LocalCommandBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler for `subject`, replacing any previous one.
    pub fn handle<F, Fut>(&self, subject: impl Into<String>, handler: F)
    where
        F: Fn(RemoteCommand) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RemoteReply, BoxError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |command| handler(command).boxed());
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(subject.into(), handler);
    }
}

impl fmt::Debug for LocalCommandBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("LocalCommandBus")
            .field("subjects", &handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl CommandBus for LocalCommandBus {
    async fn request(&self, command: RemoteCommand) -> Result<RemoteReply, BoxError> {
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&command.subject)
            .cloned();
        match handler {
            Some(handler) => handler(command).await,
            None => Err(format!("no handler for subject '{}'", command.subject).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn command() -> RemoteCommand {
        let mut input = DataMap::new();
        input.insert("order_id".into(), json!("ORD-1"));
        RemoteCommand::new(
            "payments.charge",
            RemotePayload {
                saga_id: SagaId::from("saga-1"),
                step: "charge".into(),
                call_type: CallType::Action,
                attempt: 2,
                idempotency_key: "saga-1:charge".into(),
                input,
                step_data: DataMap::new(),
                metadata: BTreeMap::new(),
            },
        )
    }

    #[test]
    fn payload_uses_camel_case_wire_names() {
        let value = serde_json::to_value(&command().payload).unwrap();
        assert_eq!(value["sagaId"], "saga-1");
        assert_eq!(value["type"], "ACTION");
        assert_eq!(value["attempt"], 2);
        assert_eq!(value["idempotencyKey"], "saga-1:charge");
        assert_eq!(value["input"]["order_id"], "ORD-1");
        assert!(value.get("stepData").is_some());
    }

    #[test]
    fn reply_types_follow_subject() {
        let cmd = command();
        let ok = RemoteReply::ok(&cmd, DataMap::new());
        assert_eq!(ok.reply_type, "payments.charge.result");
        assert_eq!(ok.command_id, cmd.id);
        assert!(ok.ok);

        let err = RemoteReply::error(&cmd, "card declined");
        assert_eq!(err.reply_type, "payments.charge.error");
        assert!(!err.ok);
        assert_eq!(err.error, "card declined");
    }

    #[test]
    fn reply_omits_empty_error_and_outputs() {
        let value = serde_json::to_value(RemoteReply::ok(&command(), DataMap::new())).unwrap();
        assert!(value.get("error").is_none());
        assert!(value.get("outputs").is_none());

        let parsed: RemoteReply = serde_json::from_value(value).unwrap();
        assert!(parsed.ok);
        assert!(parsed.outputs.is_empty());
    }

    #[tokio::test]
    async fn send_maps_rejection_to_error_message() {
        let bus = LocalCommandBus::new();
        bus.handle("payments.charge", |cmd| async move {
            Ok::<_, BoxError>(RemoteReply::error(&cmd, "card declined"))
        });

        let err = send(&bus, command(), DEFAULT_TIMEOUT, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Rejected { .. }));
        assert_eq!(err.to_string(), "card declined");
    }

    #[tokio::test]
    async fn send_reports_unknown_subject_as_transport_failure() {
        let bus = LocalCommandBus::new();
        let err = send(&bus, command(), DEFAULT_TIMEOUT, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "remote action request failed: no handler for subject 'payments.charge'"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn send_times_out() {
        let bus = LocalCommandBus::new();
        bus.handle("payments.charge", |cmd| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, BoxError>(RemoteReply::ok(&cmd, DataMap::new()))
        });

        let err = send(&bus, command(), Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Timeout { timeout, .. } if timeout == Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn send_observes_cancellation() {
        let bus = LocalCommandBus::new();
        bus.handle("payments.charge", |cmd| async move {
            futures_util::future::pending::<()>().await;
            Ok::<_, BoxError>(RemoteReply::ok(&cmd, DataMap::new()))
        });
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = send(&bus, command(), DEFAULT_TIMEOUT, &cancel).await.unwrap_err();
        assert!(matches!(err, RemoteError::Cancelled { call: CallType::Action }));
    }
}
