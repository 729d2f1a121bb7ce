//! Control-side job requests with reply correlation.
//!
//! A control node may have several requests in flight on one connection. Each
//! outbound envelope gets a fresh `requestId`; inbound frames are routed back
//! to the waiting caller by the id the dispatcher echoes. A request that sees
//! no reply within the configured bound fails with [`SessionError::Timeout`].
//! Nothing is retried.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use polyfier_core::ClientConfig;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{SessionError, SessionResult};
use crate::message::{ClientCode, Envelope, JobOrderBody, KeyBody, ReplyCode, ServerMessage};

pub struct JobRequester {
    api_key: String,
    branch: Option<String>,
    outbound: mpsc::UnboundedSender<String>,
    pending: Mutex<HashMap<String, oneshot::Sender<ServerMessage>>>,
    next_id: AtomicU64,
    timeout: Duration,
}

impl JobRequester {
    pub fn new(api_key: &str, outbound: mpsc::UnboundedSender<String>, timeout: Duration) -> Self {
        Self {
            api_key: api_key.to_string(),
            branch: None,
            outbound,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            timeout,
        }
    }

    /// Requester whose reply bound comes from the `[client]` config section.
    pub fn from_config(
        api_key: &str,
        outbound: mpsc::UnboundedSender<String>,
        config: &ClientConfig,
    ) -> Self {
        Self::new(api_key, outbound, config.job_timeout())
    }

    pub fn with_branch(mut self, branch: &str) -> Self {
        self.branch = Some(branch.to_string());
        self
    }

    /// Send one control envelope and wait for its correlated reply.
    pub async fn request(&self, message_code: &str, body: String) -> SessionResult<ServerMessage> {
        let request_id = format!("req-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut envelope = Envelope::new(ClientCode::Control, message_code, body);
        envelope.api_key = self.api_key.clone();
        envelope.branch = self.branch.clone();
        envelope.request_id = Some(request_id.clone());
        let frame = envelope.to_json()?;

        let (tx, rx) = oneshot::channel();
        self.waiters().insert(request_id.clone(), tx);

        if self.outbound.send(frame).is_err() {
            self.waiters().remove(&request_id);
            return Err(SessionError::ChannelClosed);
        }
        debug!(%request_id, %message_code, "request sent");

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(SessionError::ChannelClosed),
            Err(_) => {
                self.waiters().remove(&request_id);
                warn!(%request_id, timeout = ?self.timeout, "request timed out");
                Err(SessionError::Timeout(self.timeout))
            }
        }
    }

    pub async fn sign_in(&self, control_key: &str) -> SessionResult<()> {
        let body = serde_json::to_string(&KeyBody {
            key: control_key.to_string(),
        })?;
        expect_ok(self.request("SIGN_IN", body).await?)
    }

    /// Order a job for `worker_key` and return the serialized profile.
    pub async fn request_job(&self, control_key: &str, worker_key: &str) -> SessionResult<String> {
        let body = serde_json::to_string(&JobOrderBody {
            control_key: control_key.to_string(),
            worker_key: worker_key.to_string(),
        })?;
        let reply = self.request("REQ_JOB", body).await?;
        match reply.message_code {
            ReplyCode::Job => Ok(reply.body),
            ReplyCode::Error => Err(SessionError::ProtocolViolation(reply.body)),
            other => Err(SessionError::ProtocolViolation(format!(
                "unexpected {other:?} reply to job request"
            ))),
        }
    }

    /// Route an inbound frame to its waiter. Returns `false` for frames that
    /// carry no known request id (broadcasts, late replies).
    pub fn route(&self, raw: &str) -> SessionResult<bool> {
        let reply = ServerMessage::parse(raw)?;
        let Some(request_id) = reply.request_id.clone() else {
            return Ok(false);
        };
        match self.waiters().remove(&request_id) {
            Some(waiter) => Ok(waiter.send(reply).is_ok()),
            None => {
                debug!(%request_id, "reply without waiter dropped");
                Ok(false)
            }
        }
    }

    /// Number of requests still awaiting a reply.
    pub fn in_flight(&self) -> usize {
        self.waiters().len()
    }

    fn waiters(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<ServerMessage>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn expect_ok(reply: ServerMessage) -> SessionResult<()> {
    match reply.message_code {
        ReplyCode::Ok => Ok(()),
        _ => Err(SessionError::ProtocolViolation(reply.body)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Answer every request with `reply_code`, echoing its id.
    fn spawn_echo_server(
        requester: Arc<JobRequester>,
        mut outbound: mpsc::UnboundedReceiver<String>,
        reply_code: ReplyCode,
    ) {
        tokio::spawn(async move {
            while let Some(frame) = outbound.recv().await {
                let envelope = Envelope::parse(&frame).unwrap();
                let reply = ServerMessage {
                    message_code: reply_code,
                    body: format!("reply to {}", envelope.message_code),
                    request_id: envelope.request_id,
                };
                requester.route(&reply.to_json().unwrap()).unwrap();
            }
        });
    }

    #[tokio::test]
    async fn replies_are_routed_by_request_id() {
        let (tx, rx) = mpsc::unbounded_channel();
        let requester = Arc::new(JobRequester::new("k1", tx, Duration::from_secs(5)));
        spawn_echo_server(Arc::clone(&requester), rx, ReplyCode::Job);

        let a = requester.request_job("C1", "W1");
        let b = requester.request_job("C1", "W2");
        let (a, b) = tokio::join!(a, b);
        assert_eq!(a.unwrap(), "reply to REQ_JOB");
        assert_eq!(b.unwrap(), "reply to REQ_JOB");
        assert_eq!(requester.in_flight(), 0);
    }

    #[tokio::test]
    async fn missing_reply_times_out() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let requester = JobRequester::new("k1", tx, Duration::from_millis(20));

        let err = requester.request_job("C1", "W1").await.unwrap_err();
        assert!(matches!(err, SessionError::Timeout(_)));
        assert_eq!(requester.in_flight(), 0);
    }

    #[tokio::test]
    async fn error_reply_fails_the_request() {
        let (tx, rx) = mpsc::unbounded_channel();
        let requester = Arc::new(JobRequester::new("k1", tx, Duration::from_secs(5)));
        spawn_echo_server(Arc::clone(&requester), rx, ReplyCode::Error);

        let err = requester.request_job("C1", "W1").await.unwrap_err();
        assert!(matches!(err, SessionError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn closed_transport_is_reported() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let requester = JobRequester::new("k1", tx, Duration::from_secs(5));
        assert!(matches!(
            requester.sign_in("C1").await,
            Err(SessionError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn configured_timeout_bounds_the_wait() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = ClientConfig { job_timeout_secs: 0 };
        let requester = JobRequester::from_config("k1", tx, &config);
        let err = requester.request_job("C1", "W1").await.unwrap_err();
        assert!(matches!(err, SessionError::Timeout(d) if d == Duration::ZERO));
    }

    #[test]
    fn uncorrelated_frames_are_ignored() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let requester = JobRequester::new("k1", tx, Duration::from_secs(5));
        let status = ServerMessage::status("{}".into()).to_json().unwrap();
        assert!(!requester.route(&status).unwrap());
    }
}
