//! The externally-callable command surface.
//!
//! Commands arrive as JSON documents from the host database's dispatcher and
//! return JSON documents. Argument validation happens here, synchronously,
//! before any engine state changes; per-subscription failures never fail a
//! command, they travel in the response's `errors` document keyed by id.

use std::collections::BTreeSet;

use serde_json::{json, Map, Value};
use thiserror::Error;

use trellis_core::error::FabricError;
use trellis_core::fabric::Fabric;
use trellis_core::id::SubscriptionId;

const PUBLISH_FIELD: &str = "publish";
const MESSAGE_FIELD: &str = "message";
const SUBSCRIBE_FIELD: &str = "subscribe";
const FILTER_FIELD: &str = "filter";
const PROJECTION_FIELD: &str = "projection";
const POLL_FIELD: &str = "poll";
const TIMEOUT_FIELD: &str = "timeout";
const UNSUBSCRIBE_FIELD: &str = "unsubscribe";
const SUBSCRIPTION_ID_FIELD: &str = "subscriptionId";
const MESSAGES_FIELD: &str = "messages";
const MILLIS_POLLED_FIELD: &str = "millisPolled";
const POLL_AGAIN_FIELD: &str = "pollAgain";
const ERRORS_FIELD: &str = "errors";

/// Error failing a whole command.
#[derive(Error, Debug)]
pub enum CommandError {
    /// The command arguments were malformed; nothing was changed.
    #[error("{0}")]
    InvalidArgument(String),
    /// The transport would not accept the publication.
    #[error("Failed to publish message.")]
    PublishFailed,
    /// The engine failed the operation.
    #[error(transparent)]
    Fabric(FabricError),
}

impl From<FabricError> for CommandError {
    fn from(err: FabricError) -> Self {
        match err {
            // Filter/projection compilation failures are argument errors.
            FabricError::Match(inner) => Self::InvalidArgument(inner.to_string()),
            other => Self::Fabric(other),
        }
    }
}

/// Result type alias for command handlers.
pub type CommandResult = Result<Value, CommandError>;

/// `{ publish: <channel>, message: <document> }` -> `{ ok: 1 }`
pub fn publish(fabric: &Fabric, command: &Value) -> CommandResult {
    let channel = required_string(command, PUBLISH_FIELD, "channel", "publish")?;
    let message = match command.get(MESSAGE_FIELD) {
        None => {
            return Err(CommandError::InvalidArgument(
                "The publish command requires a message argument.".to_string(),
            ))
        }
        Some(value) if value.is_object() => value,
        Some(other) => {
            return Err(CommandError::InvalidArgument(format!(
                "The message for the publish command must be a document but was a {}",
                type_name(other)
            )))
        }
    };

    if !fabric.publish(channel, message) {
        return Err(CommandError::PublishFailed);
    }
    Ok(json!({ "ok": 1 }))
}

/// `{ subscribe: <channel>, filter?: <document>, projection?: <document> }`
/// -> `{ subscriptionId: <hex string> }`
pub fn subscribe(fabric: &Fabric, command: &Value) -> CommandResult {
    let channel = required_string(command, SUBSCRIBE_FIELD, "channel", "subscribe")?;
    let filter = optional_document(command, FILTER_FIELD, "filter")?;
    let projection = optional_document(command, PROJECTION_FIELD, "projection")?;

    let id = fabric.subscribe(channel, filter, projection)?;
    Ok(json!({ SUBSCRIPTION_ID_FIELD: id.to_string() }))
}

/// `{ poll: <id | [ids]>, timeout?: <number> }` ->
/// `{ messages, millisPolled, pollAgain?, errors? }`
pub fn poll(fabric: &Fabric, command: &Value) -> CommandResult {
    let ids = validate_ids(command.get(POLL_FIELD), POLL_FIELD)?;
    let timeout = match command.get(TIMEOUT_FIELD) {
        // Default is to return from the poll without waiting.
        None => 0,
        Some(Value::Number(number)) => match number.as_i64() {
            Some(millis) => millis,
            None => number.as_f64().map(|millis| millis.floor() as i64).unwrap_or(0),
        },
        Some(other) => {
            return Err(CommandError::InvalidArgument(format!(
                "The timeout argument must be a number but was a {}",
                type_name(other)
            )))
        }
    };

    let outcome = fabric.poll(&ids, timeout);

    // `into_sorted_vec` is ascending; the response wants the heap's pop
    // order: id ascending, channel ascending, newest first.
    let mut ordered = outcome.messages.into_sorted_vec();
    ordered.reverse();

    let mut grouped: Vec<(SubscriptionId, Vec<(String, Vec<Value>)>)> = Vec::new();
    for message in ordered {
        let same_id = grouped
            .last()
            .is_some_and(|(id, _)| *id == message.subscription_id);
        if !same_id {
            grouped.push((message.subscription_id, Vec::new()));
        }
        if let Some((_, channels)) = grouped.last_mut() {
            let same_channel = channels
                .last()
                .is_some_and(|(channel, _)| *channel == message.channel);
            if !same_channel {
                channels.push((message.channel.clone(), Vec::new()));
            }
            if let Some((_, documents)) = channels.last_mut() {
                documents.push(message.message);
            }
        }
    }

    let mut messages = Map::new();
    for (id, channels) in grouped {
        let mut by_channel = Map::new();
        for (channel, documents) in channels {
            by_channel.insert(channel, Value::Array(documents));
        }
        messages.insert(id.to_string(), Value::Object(by_channel));
    }

    let mut result = Map::new();
    result.insert(MESSAGES_FIELD.to_string(), Value::Object(messages));
    result.insert(MILLIS_POLLED_FIELD.to_string(), json!(outcome.millis_polled));
    if outcome.poll_again {
        result.insert(POLL_AGAIN_FIELD.to_string(), Value::Bool(true));
    }
    if !outcome.errors.is_empty() {
        let errors: Map<String, Value> = outcome
            .errors
            .iter()
            .map(|(id, err)| (id.to_string(), Value::String(err.to_string())))
            .collect();
        result.insert(ERRORS_FIELD.to_string(), Value::Object(errors));
    }
    Ok(Value::Object(result))
}

/// `{ unsubscribe: <id | [ids]> }` -> `{ errors?: { id: string } }`
pub fn unsubscribe(fabric: &Fabric, command: &Value) -> CommandResult {
    let ids = validate_ids(command.get(UNSUBSCRIBE_FIELD), UNSUBSCRIBE_FIELD)?;

    let errors = fabric.unsubscribe(&ids);
    let mut result = Map::new();
    if !errors.is_empty() {
        let errors: Map<String, Value> = errors
            .iter()
            .map(|(id, err)| (id.to_string(), Value::String(err.to_string())))
            .collect();
        result.insert(ERRORS_FIELD.to_string(), Value::Object(errors));
    }
    Ok(Value::Object(result))
}

/// Introspection: every live subscription with its lease and liveness flags.
pub fn view_subscriptions(fabric: &Fabric) -> Value {
    let subscriptions: Vec<Value> = fabric
        .subscriptions()
        .into_iter()
        .map(|info| {
            json!({
                SUBSCRIPTION_ID_FIELD: info.id.to_string(),
                "channel": info.channel,
                "inUse": info.in_use,
                "polledRecently": info.polled_recently,
                "unsubscribePending": info.unsubscribe_pending,
            })
        })
        .collect();
    json!({ "subscriptions": subscriptions })
}

fn required_string<'cmd>(
    command: &'cmd Value,
    field: &str,
    what: &str,
    command_name: &str,
) -> Result<&'cmd str, CommandError> {
    let value = command.get(field).unwrap_or(&Value::Null);
    value.as_str().ok_or_else(|| {
        CommandError::InvalidArgument(format!(
            "The {what} passed to the {command_name} command must be a string but was a {}",
            type_name(value)
        ))
    })
}

fn optional_document<'cmd>(
    command: &'cmd Value,
    field: &str,
    what: &str,
) -> Result<Option<&'cmd Value>, CommandError> {
    match command.get(field) {
        None => Ok(None),
        Some(value) if value.is_object() => Ok(Some(value)),
        Some(other) => Err(CommandError::InvalidArgument(format!(
            "The {what} passed to the subscribe command must be an object but was a {}",
            type_name(other)
        ))),
    }
}

/// Validate a single id or an array of ids.
fn validate_ids(
    value: Option<&Value>,
    field: &str,
) -> Result<BTreeSet<SubscriptionId>, CommandError> {
    let value = value.unwrap_or(&Value::Null);
    let mut ids = BTreeSet::new();
    match value {
        Value::String(text) => {
            ids.insert(parse_id(text)?);
        }
        Value::Array(elements) => {
            for element in elements {
                let text = element.as_str().ok_or_else(|| {
                    CommandError::InvalidArgument(format!(
                        "Each subscription id in the {field} array must be a string but found a {}",
                        type_name(element)
                    ))
                })?;
                ids.insert(parse_id(text)?);
            }
        }
        other => {
            return Err(CommandError::InvalidArgument(format!(
                "The {field} argument must be a subscription id or array of subscription ids \
                 but was a {}",
                type_name(other)
            )))
        }
    }
    Ok(ids)
}

fn parse_id(text: &str) -> Result<SubscriptionId, CommandError> {
    text.parse().map_err(|_| {
        CommandError::InvalidArgument(format!("'{text}' is not a valid subscription id"))
    })
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
