use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use updater_core::{DeploymentRecord, EnvironmentId};

use crate::error::{io_err, DaemonError};
use crate::intake::Notification;
use crate::paths::socket_path;

/// JSON newline-delimited request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum DaemonRequest {
    Status,
    /// Manual deploy. Answers as soon as the run is accepted or refused.
    /// Manual deploy. Without `tag` the tag policy picks the image.
    Reconcile {
        environment: EnvironmentId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tag: Option<String>,
    },
    Webhook {
        notification: Notification,
    },
    History {
        environment: EnvironmentId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
    },
    Stop,
}

impl DaemonRequest {
    pub fn name(&self) -> &'static str {
        match self {
            DaemonRequest::Status => "status",
            DaemonRequest::Reconcile { .. } => "reconcile",
            DaemonRequest::Webhook { .. } => "webhook",
            DaemonRequest::History { .. } => "history",
            DaemonRequest::Stop => "stop",
        }
    }
}

/// JSON newline-delimited response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DaemonResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Send one JSON request to the daemon socket and return one response.
pub fn send_request(home: &Path, request: &DaemonRequest) -> Result<DaemonResponse, DaemonError> {
    let socket = socket_path(home);
    if !socket.exists() {
        return Err(DaemonError::DaemonNotRunning { socket });
    }

    let mut stream = UnixStream::connect(&socket).map_err(|err| {
        if matches!(
            err.kind(),
            std::io::ErrorKind::NotFound
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
        ) {
            DaemonError::DaemonNotRunning {
                socket: socket.clone(),
            }
        } else {
            io_err(&socket, err)
        }
    })?;

    let payload = serde_json::to_string(request)?;
    stream
        .write_all(payload.as_bytes())
        .map_err(|e| io_err(&socket, e))?;
    stream.write_all(b"\n").map_err(|e| io_err(&socket, e))?;
    stream.flush().map_err(|e| io_err(&socket, e))?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let read = reader
        .read_line(&mut line)
        .map_err(|e| io_err(&socket, e))?;
    if read == 0 {
        return Err(DaemonError::Protocol(
            "daemon closed connection before responding".to_string(),
        ));
    }

    let response: DaemonResponse = serde_json::from_str(line.trim_end())?;
    Ok(response)
}

/// Status query, retried briefly so it works right after `daemon start`.
pub fn request_status(home: &Path) -> Result<Value, DaemonError> {
    let mut last_not_running: Option<DaemonError> = None;
    for attempt in 0..5 {
        match send_request(home, &DaemonRequest::Status) {
            Ok(response) => return response_into_data(response),
            Err(err @ DaemonError::DaemonNotRunning { .. }) => {
                last_not_running = Some(err);
                if attempt < 4 {
                    sleep(Duration::from_millis(100));
                    continue;
                }
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_not_running.unwrap_or_else(|| {
        DaemonError::Protocol("daemon status retry loop exited unexpectedly".to_string())
    }))
}

pub fn request_stop(home: &Path) -> Result<(), DaemonError> {
    let response = send_request(home, &DaemonRequest::Stop)?;
    response_into_data(response).map(|_| ())
}

pub fn request_reconcile(
    home: &Path,
    environment: EnvironmentId,
    user: Option<String>,
    tag: Option<String>,
) -> Result<Value, DaemonError> {
    let request = DaemonRequest::Reconcile {
        environment,
        user,
        tag,
    };
    let response = send_request(home, &request)?;
    response_into_data(response)
}

pub fn request_webhook(home: &Path, notification: Notification) -> Result<Value, DaemonError> {
    let response = send_request(home, &DaemonRequest::Webhook { notification })?;
    response_into_data(response)
}

pub fn request_history(
    home: &Path,
    environment: EnvironmentId,
    limit: Option<usize>,
) -> Result<Vec<DeploymentRecord>, DaemonError> {
    let response = send_request(home, &DaemonRequest::History { environment, limit })?;
    let data = response_into_data(response)?;
    Ok(serde_json::from_value(data)?)
}

pub fn response_into_data(response: DaemonResponse) -> Result<Value, DaemonError> {
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(DaemonError::Protocol(
            response
                .error
                .unwrap_or_else(|| "unknown daemon error".to_string()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn requests_are_tagged_by_cmd() {
        let request: DaemonRequest =
            serde_json::from_str(r#"{"cmd":"reconcile","environment":"staging"}"#)
                .expect("decode");
        assert_eq!(
            request,
            DaemonRequest::Reconcile {
                environment: EnvironmentId::from("staging"),
                user: None,
                tag: None,
            }
        );

        let encoded = serde_json::to_value(&DaemonRequest::Stop).expect("encode");
        assert_eq!(encoded, json!({"cmd": "stop"}));
    }

    #[test]
    fn reconcile_request_carries_a_pinned_tag() {
        let request = DaemonRequest::Reconcile {
            environment: EnvironmentId::from("prod"),
            user: Some("alice".into()),
            tag: Some("1.24.0".into()),
        };
        let encoded = serde_json::to_value(&request).expect("encode");
        assert_eq!(
            encoded,
            json!({"cmd": "reconcile", "environment": "prod", "user": "alice", "tag": "1.24.0"})
        );
        let decoded: DaemonRequest = serde_json::from_value(encoded).expect("decode");
        assert_eq!(decoded, request);
    }

    #[test]
    fn webhook_request_carries_the_notification() {
        let line = r#"{"cmd":"webhook","notification":{"namespace":"library","repository":"nginx","tag":"1.25.1","digest":"sha256:abc"}}"#;
        let request: DaemonRequest = serde_json::from_str(line).expect("decode");
        match request {
            DaemonRequest::Webhook { notification } => {
                assert_eq!(notification.repository, "nginx");
                assert_eq!(notification.tag, "1.25.1");
                assert!(notification.registry.is_none());
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn unknown_command_is_rejected() {
        let result = serde_json::from_str::<DaemonRequest>(r#"{"cmd":"sync"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn error_response_becomes_protocol_error() {
        let err = response_into_data(DaemonResponse::error("unknown environment 'prod'"))
            .expect_err("should fail");
        assert!(matches!(err, DaemonError::Protocol(msg) if msg.contains("prod")));
    }

    #[test]
    fn missing_socket_means_not_running() {
        let home = tempfile::TempDir::new().expect("home");
        let err = send_request(home.path(), &DaemonRequest::Status).expect_err("no daemon");
        assert!(matches!(err, DaemonError::DaemonNotRunning { .. }));
    }
}
