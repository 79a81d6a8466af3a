//! Cloud-event envelope carried by the queue trigger: one POST body wraps
//! exactly one queue message whose body is the bare run UUID.

use std::collections::HashMap;

use axum::http::StatusCode;
use serde::Deserialize;

use crate::worker::AppError;

#[derive(Debug, Deserialize)]
pub struct DeliveryEnvelope {
    #[serde(default)]
    pub messages: Vec<DeliveredMessage>,
}

#[derive(Debug, Deserialize)]
pub struct DeliveredMessage {
    #[serde(default)]
    pub event_metadata: EventMetadata,
    pub details: Details,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventMetadata {
    #[serde(default)]
    pub event_id: String,
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub cloud_id: String,
    #[serde(default)]
    pub folder_id: String,
}

#[derive(Debug, Deserialize)]
pub struct Details {
    #[serde(default)]
    pub queue_id: String,
    pub message: MessageDetails,
}

#[derive(Debug, Deserialize)]
pub struct MessageDetails {
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub md5_of_body: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default)]
    pub message_attributes: HashMap<String, MessageAttribute>,
    #[serde(default)]
    pub md5_of_message_attributes: String,
}

#[derive(Debug, Deserialize)]
pub struct MessageAttribute {
    #[serde(default)]
    pub data_type: String,
    #[serde(default)]
    pub string_value: String,
}

/// Pull the queue-message body out of a trigger request body.
pub(crate) fn extract_message_body(request_body: &str) -> Result<String, AppError> {
    let envelope: DeliveryEnvelope = serde_json::from_str(request_body).map_err(|e| {
        AppError::without_stage(e.into(), "Unable to parse request body", StatusCode::BAD_REQUEST)
    })?;

    let message_count = envelope.messages.len();
    if message_count != 1 {
        return Err(AppError::without_stage(
            optiflow_common::error::Error::Internal(format!(
                "request body has {message_count} messages, but only 1 is allowed"
            )),
            "Request body must contain exactly one message",
            StatusCode::BAD_REQUEST,
        ));
    }

    Ok(envelope.messages.into_iter().next().unwrap().details.message.body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_the_single_message_body() {
        let body = serde_json::json!({
            "messages": [{
                "event_metadata": {"event_id": "e1", "event_type": "t"},
                "details": {"queue_id": "q", "message": {"body": "run-uuid-here"}}
            }]
        })
        .to_string();
        assert_eq!(extract_message_body(&body).unwrap(), "run-uuid-here");
    }

    #[test]
    fn rejects_garbage_and_wrong_message_counts() {
        let err = extract_message_body("not json").unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let empty = serde_json::json!({"messages": []}).to_string();
        assert_eq!(
            extract_message_body(&empty).unwrap_err().status,
            StatusCode::BAD_REQUEST
        );

        let two = serde_json::json!({"messages": [
            {"details": {"message": {"body": "a"}}},
            {"details": {"message": {"body": "b"}}}
        ]})
        .to_string();
        assert_eq!(
            extract_message_body(&two).unwrap_err().status,
            StatusCode::BAD_REQUEST
        );
    }
}
