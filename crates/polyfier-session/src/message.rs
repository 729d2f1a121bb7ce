//! Wire protocol: client envelopes, decoded commands, and server replies.
//!
//! An envelope carries its payload as a JSON string in `body`. The
//! `messageCode` is checked against the sender's `clientCode` before the body
//! is decoded, so a worker can never issue a control command. Legacy role
//! names (`PCTRL`, `PDB`, `BROWSER`) and role-prefixed codes such as
//! `PDB_REQ_JOB` are accepted.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{SessionError, SessionResult};

/// Role of the sending peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientCode {
    #[serde(alias = "PCTRL")]
    Control,
    #[serde(alias = "PDB")]
    Worker,
    #[serde(alias = "BROWSER")]
    Observer,
}

impl ClientCode {
    fn prefixes(self) -> &'static [&'static str] {
        match self {
            ClientCode::Control => &["CONTROL_", "PCTRL_"],
            ClientCode::Worker => &["WORKER_", "PDB_"],
            ClientCode::Observer => &["OBSERVER_", "BROWSER_"],
        }
    }
}

/// Inbound message as sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default)]
    pub api_key: String,
    pub client_code: ClientCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub message_code: String,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl Envelope {
    pub fn new(client_code: ClientCode, message_code: &str, body: String) -> Self {
        Self {
            api_key: String::new(),
            client_code,
            branch: None,
            message_code: message_code.to_string(),
            body,
            request_id: None,
        }
    }

    pub fn parse(raw: &str) -> SessionResult<Self> {
        serde_json::from_str(raw)
            .map_err(|e| SessionError::ProtocolViolation(format!("malformed envelope: {e}")))
    }

    pub fn to_json(&self) -> SessionResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Message code with any role prefix removed.
    fn bare_code(&self) -> &str {
        self.client_code
            .prefixes()
            .iter()
            .find_map(|p| self.message_code.strip_prefix(p))
            .unwrap_or(self.message_code.as_str())
    }

    /// Validate the code against the sender's role and decode the body.
    pub fn command(&self) -> SessionResult<Command> {
        let body = self.body.as_str();
        let command = match (self.client_code, self.bare_code()) {
            (ClientCode::Control, "SIGN_IN") => Command::ControlSignIn(decode(body)?),
            (ClientCode::Control, "SIGN_OUT") => Command::ControlSignOut(decode(body)?),
            (ClientCode::Control, "STATUS_UPD") => Command::ControlStatus(decode(body)?),
            (ClientCode::Control, "REQ_JOB") => Command::ControlRequestJob(decode(body)?),
            (ClientCode::Worker, "SIGN_IN") => Command::WorkerSignIn(decode(body)?),
            (ClientCode::Worker, "SIGN_OUT") => Command::WorkerSignOut(decode(body)?),
            (ClientCode::Worker, "STATUS_UPD") => Command::WorkerStatus(decode(body)?),
            (ClientCode::Worker, "REQ_JOB") => Command::WorkerRequestJob(decode(body)?),
            (ClientCode::Worker, "RESULT_DEP") => Command::WorkerResult(decode(body)?),
            (ClientCode::Observer, "SUBSCRIBE") => Command::Subscribe,
            (ClientCode::Observer, "UNSUBSCRIBE") => Command::Unsubscribe,
            (role, _) => {
                return Err(SessionError::ProtocolViolation(format!(
                    "message code {} not supported for {role:?}",
                    self.message_code
                )));
            }
        };
        Ok(command)
    }
}

fn decode<T: DeserializeOwned>(body: &str) -> SessionResult<T> {
    serde_json::from_str(body)
        .map_err(|e| SessionError::ProtocolViolation(format!("malformed body: {e}")))
}

// ── Bodies ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBody {
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyStatusBody {
    pub key: String,
    pub status: String,
}

/// A control node ordering a job for a worker it is about to launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOrderBody {
    #[serde(alias = "key1")]
    pub control_key: String,
    #[serde(alias = "key2")]
    pub worker_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerJobBody {
    #[serde(alias = "key")]
    pub worker_key: String,
}

/// One execution result deposited by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultBody {
    #[serde(alias = "pdbKey")]
    pub worker_key: String,
    pub seed: u64,
    #[serde(default)]
    pub result_set_hash: Option<u64>,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub logical: Option<String>,
    #[serde(default)]
    pub physical: Option<String>,
    #[serde(default)]
    pub actual: Option<u64>,
    #[serde(default)]
    pub predicted: Option<u64>,
}

/// A validated inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    ControlSignIn(KeyBody),
    ControlSignOut(KeyBody),
    ControlStatus(KeyStatusBody),
    ControlRequestJob(JobOrderBody),
    WorkerSignIn(KeyBody),
    WorkerSignOut(KeyBody),
    WorkerStatus(KeyStatusBody),
    WorkerRequestJob(WorkerJobBody),
    WorkerResult(ResultBody),
    Subscribe,
    Unsubscribe,
}

// ── Replies ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplyCode {
    Ok,
    Job,
    Error,
    Status,
}

/// Outbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    pub message_code: ReplyCode,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ServerMessage {
    pub fn ok() -> Self {
        Self::with_body(ReplyCode::Ok, String::new())
    }

    pub fn job(profile_json: String) -> Self {
        Self::with_body(ReplyCode::Job, profile_json)
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self::with_body(ReplyCode::Error, reason.into())
    }

    pub fn status(snapshot_json: String) -> Self {
        Self::with_body(ReplyCode::Status, snapshot_json)
    }

    fn with_body(message_code: ReplyCode, body: String) -> Self {
        Self {
            message_code,
            body,
            request_id: None,
        }
    }

    pub fn correlate(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn to_json(&self) -> SessionResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn parse(raw: &str) -> SessionResult<Self> {
        serde_json::from_str(raw)
            .map_err(|e| SessionError::ProtocolViolation(format!("malformed reply: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_codes_are_accepted() {
        let raw = r#"{"apiKey":"k1","clientCode":"PCTRL","messageCode":"PCTRL_REQ_JOB","body":"{\"key1\":\"C1\",\"key2\":\"W1\"}"}"#;
        let envelope = Envelope::parse(raw).unwrap();
        assert_eq!(envelope.client_code, ClientCode::Control);
        assert_eq!(
            envelope.command().unwrap(),
            Command::ControlRequestJob(JobOrderBody {
                control_key: "C1".into(),
                worker_key: "W1".into(),
            })
        );
    }

    #[test]
    fn code_must_match_role() {
        let mut envelope = Envelope::new(ClientCode::Worker, "SIGN_IN", r#"{"key":"W1"}"#.into());
        assert!(envelope.command().is_ok());

        envelope.message_code = "SUBSCRIBE".into();
        assert!(matches!(envelope.command(), Err(SessionError::ProtocolViolation(_))));

        envelope.message_code = "PCTRL_SIGN_IN".into();
        assert!(matches!(envelope.command(), Err(SessionError::ProtocolViolation(_))));
    }

    #[test]
    fn result_body_accepts_legacy_worker_key() {
        let body = r#"{"pdbKey":"W1","seed":7,"success":false,"error":"boom"}"#;
        let envelope = Envelope::new(ClientCode::Worker, "RESULT_DEP", body.into());
        let Command::WorkerResult(result) = envelope.command().unwrap() else {
            panic!("expected a result");
        };
        assert_eq!(result.worker_key, "W1");
        assert_eq!(result.error.as_deref(), Some("boom"));
        assert_eq!(result.predicted, None);
    }

    #[test]
    fn malformed_input_is_a_protocol_violation() {
        assert!(matches!(
            Envelope::parse("not json"),
            Err(SessionError::ProtocolViolation(_))
        ));
        let envelope = Envelope::new(ClientCode::Control, "SIGN_IN", "{}".into());
        assert!(matches!(envelope.command(), Err(SessionError::ProtocolViolation(_))));
    }

    #[test]
    fn reply_echoes_request_id() {
        let json = ServerMessage::ok().correlate(Some("r-1".into())).to_json().unwrap();
        assert_eq!(json, r#"{"messageCode":"OK","body":"","requestId":"r-1"}"#);
        let json = ServerMessage::error("nope").to_json().unwrap();
        assert!(!json.contains("requestId"));
    }
}
