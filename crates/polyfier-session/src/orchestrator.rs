//! Job orchestration: the per-message state machine.
//!
//! One [`JobOrchestrator`] is shared by every connection. Each inbound
//! envelope is handled to completion before the connection reads the next
//! one, so a single peer's messages are processed in arrival order. Store
//! I/O always happens outside the registry lock.

use std::sync::Arc;

use polyfier_core::{ConfigKind, Configuration, ProfileGenerator, SeedSet};
use polyfier_state::{
    ControlNodeRecord, NodeStore, OrderRecord, Persistence, ResultRecord, ResultStore,
    WorkerNodeRecord, status, store_config, store_profile,
};
use tracing::{debug, info, warn};

use crate::channel::{ChannelHandle, SessionId};
use crate::error::{SessionError, SessionResult};
use crate::message::{
    Command, Envelope, JobOrderBody, KeyBody, KeyStatusBody, ResultBody, ServerMessage,
};
use crate::registry::{ControlNode, SessionRegistry, WorkerNode, epoch_millis};

/// Field name under which error text is stored.
const ERROR_FIELD: &str = "error";
/// Field name under which plan text is stored.
const PLAN_FIELD: &str = "plan";

pub struct JobOrchestrator {
    registry: Arc<SessionRegistry>,
    store: Arc<dyn Persistence>,
    generator: ProfileGenerator,
    seeds: SeedSet,
}

impl JobOrchestrator {
    pub fn new(store: Arc<dyn Persistence>, generator: ProfileGenerator, seeds: SeedSet) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new()),
            store,
            generator,
            seeds,
        }
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Handle one raw frame and send the reply on `channel`. Failures become
    /// an `ERROR` reply; the connection and the registry stay intact.
    pub async fn dispatch(&self, channel: &ChannelHandle, raw: &str) {
        let (request_id, outcome) = match Envelope::parse(raw) {
            Ok(envelope) => {
                let outcome = self.handle(channel, &envelope).await;
                (envelope.request_id, outcome)
            }
            Err(err) => (None, Err(err)),
        };

        let reply = outcome.unwrap_or_else(|err| {
            warn!(session_id = channel.session_id(), error = %err, "message rejected");
            ServerMessage::error(err.to_string())
        });
        if let Err(err) = channel.send(&reply.correlate(request_id)) {
            debug!(session_id = channel.session_id(), error = %err, "reply dropped");
        }
    }

    /// Validate and apply one envelope.
    pub async fn handle(
        &self,
        channel: &ChannelHandle,
        envelope: &Envelope,
    ) -> SessionResult<ServerMessage> {
        self.verify_api_key(envelope)?;
        let command = envelope.command()?;

        match command {
            Command::ControlSignIn(KeyBody { key }) => {
                self.control_sign_in(channel, envelope, key).await
            }
            Command::ControlSignOut(KeyBody { key }) => self.control_sign_out(key).await,
            Command::ControlStatus(body) => self.control_status(channel, body).await,
            Command::ControlRequestJob(order) => {
                self.control_request_job(channel, envelope, order).await
            }
            Command::WorkerSignIn(KeyBody { key }) => self.worker_sign_in(channel, key).await,
            Command::WorkerSignOut(KeyBody { key }) => self.worker_sign_out(key).await,
            Command::WorkerStatus(body) => self.worker_status(channel, body).await,
            Command::WorkerRequestJob(body) => {
                self.worker_request_job(channel, &body.worker_key).await
            }
            Command::WorkerResult(result) => {
                self.worker_result(channel, envelope.body.len(), result).await
            }
            Command::Subscribe => {
                let mut state = self.registry.write().await;
                state.observers.insert(channel.session_id(), channel.clone());
                debug!(session_id = channel.session_id(), "observer subscribed");
                Ok(ServerMessage::ok())
            }
            Command::Unsubscribe => {
                let mut state = self.registry.write().await;
                state.observers.remove(&channel.session_id());
                debug!(session_id = channel.session_id(), "observer unsubscribed");
                Ok(ServerMessage::ok())
            }
        }
    }

    /// Forget the observer subscription of a closed connection.
    pub async fn disconnect(&self, session_id: SessionId) {
        self.registry.disconnect(session_id).await;
    }

    /// API keys are accepted as given.
    fn verify_api_key(&self, _envelope: &Envelope) -> SessionResult<()> {
        Ok(())
    }

    // ── Control nodes ──────────────────────────────────────────────

    async fn control_sign_in(
        &self,
        channel: &ChannelHandle,
        envelope: &Envelope,
        key: String,
    ) -> SessionResult<ServerMessage> {
        let now = epoch_millis();
        let record = ControlNodeRecord {
            key: key.clone(),
            api_key: envelope.api_key.clone(),
            branch: envelope.branch.clone(),
            session_id: channel.session_id(),
            status: status::IDLE.to_string(),
            active: true,
            registered_at: now,
            update_time: now,
        };
        self.store.put_control_node(&record)?;

        self.registry
            .write()
            .await
            .controls
            .insert(key.clone(), ControlNode::new(record, channel.clone()));
        info!(%key, session_id = channel.session_id(), "control node signed in");
        Ok(ServerMessage::ok())
    }

    async fn control_status(
        &self,
        channel: &ChannelHandle,
        body: KeyStatusBody,
    ) -> SessionResult<ServerMessage> {
        let record = {
            let mut state = self.registry.write().await;
            let node = state
                .bind_control(&body.key, channel)
                .ok_or_else(|| unknown("control node", &body.key))?;
            node.record.status = body.status;
            node.record.update_time = epoch_millis();
            node.record.clone()
        };
        self.store.put_control_node(&record)?;
        debug!(key = %record.key, status = %record.status, "control node status updated");
        Ok(ServerMessage::ok())
    }

    async fn control_sign_out(&self, key: String) -> SessionResult<ServerMessage> {
        let node = self
            .registry
            .write()
            .await
            .controls
            .remove(&key)
            .ok_or_else(|| unknown("control node", &key))?;

        let mut record = node.record;
        record.active = false;
        record.update_time = epoch_millis();
        self.store.put_control_node(&record)?;
        info!(%key, "control node signed out");
        Ok(ServerMessage::ok())
    }

    /// Generate a profile for a new worker and hand the job to the control
    /// node. The worker key may be used exactly once while it is live.
    async fn control_request_job(
        &self,
        channel: &ChannelHandle,
        envelope: &Envelope,
        order: JobOrderBody,
    ) -> SessionResult<ServerMessage> {
        let JobOrderBody {
            control_key,
            worker_key,
        } = order;

        let control = {
            let mut state = self.registry.write().await;
            let control = state
                .bind_control(&control_key, channel)
                .map(|n| n.record.clone())
                .ok_or_else(|| unknown("control node", &control_key))?;
            if !state.reserve_worker(&worker_key) {
                return Err(already_ordered(&worker_key));
            }
            control
        };

        match self.issue_job(envelope, &control, &worker_key) {
            Ok((node, job, profile_hash)) => {
                self.registry.write().await.install_worker(node, job.clone());
                info!(%control_key, %worker_key, profile_hash, "job issued");
                Ok(ServerMessage::job(job))
            }
            Err(err) => {
                self.registry.write().await.reserved.remove(&worker_key);
                Err(err)
            }
        }
    }

    /// Generate and persist a job for a reserved worker key. Runs without
    /// the registry lock.
    fn issue_job(
        &self,
        envelope: &Envelope,
        control: &ControlNodeRecord,
        worker_key: &str,
    ) -> SessionResult<(WorkerNode, String, u64)> {
        let profile = self.generator.create_profile_with(
            self.seeds.clone(),
            Some(worker_key.to_string()),
            Some(envelope.api_key.clone()),
        )?;
        let job = profile.to_json()?;

        let profile_record = store_profile(self.store.as_ref(), &profile)?;
        let now = epoch_millis();
        self.store.put_order(&OrderRecord {
            worker_key: worker_key.to_string(),
            control_key: control.key.clone(),
            profile_hash: profile_record.hash,
            issued_at: now,
            completed_at: None,
        })?;

        let worker = WorkerNodeRecord {
            key: worker_key.to_string(),
            control_key: control.key.clone(),
            session_id: 0,
            branch: profile.branch().map(str::to_string).or(control.branch.clone()),
            status: status::ORDERED.to_string(),
            active: false,
            data_stores: profile.data_stores(),
            results_count: 0,
            data_count: 0.0,
            registered_at: now,
            update_time: now,
        };
        self.store.put_worker_node(&worker)?;
        Ok((WorkerNode::new(worker), job, profile_record.hash))
    }

    // ── Workers ────────────────────────────────────────────────────

    async fn worker_sign_in(
        &self,
        channel: &ChannelHandle,
        key: String,
    ) -> SessionResult<ServerMessage> {
        let record = {
            let mut state = self.registry.write().await;
            let node = state
                .bind_worker(&key, channel)
                .ok_or_else(|| unknown("worker", &key))?;
            node.record.active = true;
            node.record.status = status::IDLE.to_string();
            node.record.update_time = epoch_millis();
            node.record.clone()
        };
        self.store.put_worker_node(&record)?;
        info!(%key, session_id = record.session_id, "worker signed in");
        Ok(ServerMessage::ok())
    }

    async fn worker_status(
        &self,
        channel: &ChannelHandle,
        body: KeyStatusBody,
    ) -> SessionResult<ServerMessage> {
        let record = {
            let mut state = self.registry.write().await;
            let node = state
                .bind_worker(&body.key, channel)
                .ok_or_else(|| unknown("worker", &body.key))?;
            node.record.status = body.status;
            node.record.update_time = epoch_millis();
            node.record.clone()
        };
        self.store.put_worker_node(&record)?;
        debug!(key = %record.key, status = %record.status, "worker status updated");
        Ok(ServerMessage::ok())
    }

    async fn worker_request_job(
        &self,
        channel: &ChannelHandle,
        key: &str,
    ) -> SessionResult<ServerMessage> {
        let mut state = self.registry.write().await;
        if state.bind_worker(key, channel).is_none() {
            return Err(unknown("worker", key));
        }
        state
            .jobs
            .get(key)
            .cloned()
            .map(ServerMessage::job)
            .ok_or_else(|| unknown("worker", key))
    }

    /// Counters move under the lock before the result is stored and are
    /// rolled back if storing fails.
    async fn worker_result(
        &self,
        channel: &ChannelHandle,
        body_len: usize,
        result: ResultBody,
    ) -> SessionResult<ServerMessage> {
        let data_kib = body_len as f64 / 1024.0;
        let received_at = epoch_millis();
        let worker = {
            let mut state = self.registry.write().await;
            let node = state
                .bind_worker(&result.worker_key, channel)
                .ok_or_else(|| unknown("worker", &result.worker_key))?;
            node.record.results_count += 1;
            node.record.data_count += data_kib;
            node.record.update_time = received_at;
            node.record.clone()
        };

        let seq = match self.store_result(&worker.control_key, received_at, &result) {
            Ok(seq) => seq,
            Err(err) => {
                let mut state = self.registry.write().await;
                if let Some(node) = state.workers.get_mut(&result.worker_key) {
                    node.record.results_count = node.record.results_count.saturating_sub(1);
                    node.record.data_count = (node.record.data_count - data_kib).max(0.0);
                }
                return Err(err);
            }
        };

        self.store.put_worker_node(&worker)?;
        debug!(
            key = %worker.key,
            seed = result.seed,
            success = result.success,
            seq,
            "result deposited"
        );
        Ok(ServerMessage::ok())
    }

    fn store_result(
        &self,
        control_key: &str,
        received_at: u64,
        result: &ResultBody,
    ) -> SessionResult<u64> {
        let store = self.store.as_ref();
        let dedup = |kind: ConfigKind, field: &str, text: Option<&str>| {
            text.map(|t| store_config(store, &Configuration::single(kind, field, t)))
                .transpose()
        };
        let record = ResultRecord {
            worker_key: result.worker_key.clone(),
            control_key: control_key.to_string(),
            seed: result.seed,
            success: result.success,
            error_hash: dedup(ConfigKind::Error, ERROR_FIELD, result.error.as_deref())?,
            logical_plan_hash: dedup(ConfigKind::LogicalPlan, PLAN_FIELD, result.logical.as_deref())?,
            physical_plan_hash: dedup(
                ConfigKind::PhysicalPlan,
                PLAN_FIELD,
                result.physical.as_deref(),
            )?,
            result_set_hash: result.result_set_hash,
            actual_ms: result.actual,
            predicted_ms: result.predicted,
            received_at,
        };
        Ok(self.store.append_result(&record)?)
    }

    async fn worker_sign_out(&self, key: String) -> SessionResult<ServerMessage> {
        let node = {
            let mut state = self.registry.write().await;
            let node = state
                .workers
                .remove(&key)
                .ok_or_else(|| unknown("worker", &key))?;
            state.jobs.remove(&key);
            node
        };

        let mut record = node.record;
        record.active = false;
        record.update_time = epoch_millis();
        self.store.put_worker_node(&record)?;
        info!(%key, results = record.results_count, "worker signed out");
        Ok(ServerMessage::ok())
    }
}

fn unknown(what: &str, key: &str) -> SessionError {
    SessionError::ProtocolViolation(format!("unknown {what}: {key}"))
}

fn already_ordered(worker_key: &str) -> SessionError {
    SessionError::ProtocolViolation(format!("worker {worker_key} already has a job"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ClientCode, ReplyCode};
    use polyfier_core::{GeneratorConfig, Profile};
    use polyfier_state::{ConfigStore, ProfileRecord, StateError, StateResult, StateStore};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn orchestrator_with(store: Arc<dyn Persistence>) -> JobOrchestrator {
        let generator = ProfileGenerator::new(&GeneratorConfig::default()).unwrap();
        JobOrchestrator::new(store, generator, SeedSet::range(0, 1000).unwrap())
    }

    fn orchestrator() -> (JobOrchestrator, StateStore) {
        let store = StateStore::open_in_memory().unwrap();
        (orchestrator_with(Arc::new(store.clone())), store)
    }

    fn frame(code: ClientCode, message_code: &str, body: &str) -> String {
        let mut envelope = Envelope::new(code, message_code, body.to_string());
        envelope.api_key = "k1".into();
        envelope.to_json().unwrap()
    }

    async fn roundtrip(
        orch: &JobOrchestrator,
        channel: &ChannelHandle,
        rx: &mut UnboundedReceiver<String>,
        raw: String,
    ) -> ServerMessage {
        orch.dispatch(channel, &raw).await;
        ServerMessage::parse(&rx.recv().await.unwrap()).unwrap()
    }

    struct FailingStore;

    fn down<T>() -> StateResult<T> {
        Err(StateError::Unavailable("disk gone".into()))
    }

    impl ConfigStore for FailingStore {
        fn exists(&self, _: ConfigKind, _: u64) -> StateResult<bool> {
            down()
        }
        fn insert(&self, _: ConfigKind, _: u64, _: &str) -> StateResult<bool> {
            down()
        }
        fn get(&self, _: ConfigKind, _: u64) -> StateResult<Option<String>> {
            down()
        }
    }

    impl ResultStore for FailingStore {
        fn append_result(&self, _: &ResultRecord) -> StateResult<u64> {
            down()
        }
        fn list_results(&self, _: &str) -> StateResult<Vec<ResultRecord>> {
            down()
        }
    }

    impl NodeStore for FailingStore {
        fn put_control_node(&self, _: &ControlNodeRecord) -> StateResult<()> {
            down()
        }
        fn put_worker_node(&self, _: &WorkerNodeRecord) -> StateResult<()> {
            down()
        }
        fn put_order(&self, _: &OrderRecord) -> StateResult<()> {
            down()
        }
        fn put_profile(&self, _: &ProfileRecord) -> StateResult<bool> {
            down()
        }
    }

    /// Working store whose result log refuses appends.
    struct AppendRefused(StateStore);

    impl ConfigStore for AppendRefused {
        fn exists(&self, kind: ConfigKind, hash: u64) -> StateResult<bool> {
            self.0.exists(kind, hash)
        }
        fn insert(&self, kind: ConfigKind, hash: u64, canonical: &str) -> StateResult<bool> {
            self.0.insert(kind, hash, canonical)
        }
        fn get(&self, kind: ConfigKind, hash: u64) -> StateResult<Option<String>> {
            self.0.get(kind, hash)
        }
    }

    impl ResultStore for AppendRefused {
        fn append_result(&self, _: &ResultRecord) -> StateResult<u64> {
            down()
        }
        fn list_results(&self, worker_key: &str) -> StateResult<Vec<ResultRecord>> {
            self.0.list_results(worker_key)
        }
    }

    impl NodeStore for AppendRefused {
        fn put_control_node(&self, node: &ControlNodeRecord) -> StateResult<()> {
            self.0.put_control_node(node)
        }
        fn put_worker_node(&self, node: &WorkerNodeRecord) -> StateResult<()> {
            self.0.put_worker_node(node)
        }
        fn put_order(&self, order: &OrderRecord) -> StateResult<()> {
            self.0.put_order(order)
        }
        fn put_profile(&self, profile: &ProfileRecord) -> StateResult<bool> {
            self.0.put_profile(profile)
        }
    }

    #[tokio::test]
    async fn control_sign_in_and_status() {
        let (orch, store) = orchestrator();
        let (ch, mut rx) = ChannelHandle::pair(1);

        let reply = roundtrip(&orch, &ch, &mut rx, frame(ClientCode::Control, "SIGN_IN", r#"{"key":"C1"}"#)).await;
        assert_eq!(reply.message_code, ReplyCode::Ok);
        let reply = roundtrip(
            &orch,
            &ch,
            &mut rx,
            frame(ClientCode::Control, "STATUS_UPD", r#"{"key":"C1","status":"BUSY"}"#),
        )
        .await;
        assert_eq!(reply.message_code, ReplyCode::Ok);

        let live = orch.registry().control("C1").await.unwrap();
        assert_eq!(live.status, "BUSY");
        assert_eq!(live.api_key, "k1");
        assert_eq!(store.get_control_node("C1").unwrap().unwrap().status, "BUSY");
    }

    #[tokio::test]
    async fn unknown_key_leaves_registry_unchanged() {
        let (orch, _store) = orchestrator();
        let (ch, mut rx) = ChannelHandle::pair(1);

        let reply = roundtrip(
            &orch,
            &ch,
            &mut rx,
            frame(ClientCode::Worker, "STATUS_UPD", r#"{"key":"ghost","status":"BUSY"}"#),
        )
        .await;
        assert_eq!(reply.message_code, ReplyCode::Error);
        assert!(reply.body.contains("ghost"));

        let snapshot = orch.registry().snapshot().await;
        assert!(snapshot.controls.is_empty());
        assert!(snapshot.workers.is_empty());
    }

    #[tokio::test]
    async fn worker_key_is_issued_once() {
        let (orch, _store) = orchestrator();
        let (ch, mut rx) = ChannelHandle::pair(1);
        roundtrip(&orch, &ch, &mut rx, frame(ClientCode::Control, "SIGN_IN", r#"{"key":"C1"}"#)).await;

        let order = r#"{"controlKey":"C1","workerKey":"W1"}"#;
        let first = roundtrip(&orch, &ch, &mut rx, frame(ClientCode::Control, "REQ_JOB", order)).await;
        assert_eq!(first.message_code, ReplyCode::Job);
        let profile = Profile::from_json(&first.body).unwrap();
        assert_eq!(profile.profile_key.as_deref(), Some("W1"));

        let second = roundtrip(&orch, &ch, &mut rx, frame(ClientCode::Control, "REQ_JOB", order)).await;
        assert_eq!(second.message_code, ReplyCode::Error);

        let worker = orch.registry().worker("W1").await.unwrap();
        assert_eq!(worker.status, status::ORDERED);
        assert_eq!(worker.control_key, "C1");
        assert!(worker.data_stores.contains_key("POSTGRESQL"));
    }

    #[tokio::test]
    async fn request_id_is_echoed_on_errors() {
        let (orch, _store) = orchestrator();
        let (ch, mut rx) = ChannelHandle::pair(1);
        let mut envelope = Envelope::new(ClientCode::Control, "SIGN_OUT", r#"{"key":"C9"}"#.into());
        envelope.request_id = Some("req-7".into());

        let reply = roundtrip(&orch, &ch, &mut rx, envelope.to_json().unwrap()).await;
        assert_eq!(reply.message_code, ReplyCode::Error);
        assert_eq!(reply.request_id.as_deref(), Some("req-7"));
    }

    #[tokio::test]
    async fn control_channel_migrates_on_new_connection() {
        let (orch, _store) = orchestrator();
        let (old, mut old_rx) = ChannelHandle::pair(1);
        let (new, mut new_rx) = ChannelHandle::pair(2);
        roundtrip(&orch, &old, &mut old_rx, frame(ClientCode::Control, "SIGN_IN", r#"{"key":"C1"}"#)).await;

        let reply = roundtrip(
            &orch,
            &new,
            &mut new_rx,
            frame(ClientCode::Control, "REQ_JOB", r#"{"controlKey":"C1","workerKey":"W1"}"#),
        )
        .await;
        assert_eq!(reply.message_code, ReplyCode::Job);

        let state = orch.registry();
        let state = state.read().await;
        assert_eq!(state.controls["C1"].channel.session_id(), 2);
        assert_eq!(state.controls["C1"].record.session_id, 2);
        assert!(old_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn store_failure_is_reported_and_nothing_is_registered() {
        let orch = orchestrator_with(Arc::new(FailingStore));
        let (ch, mut rx) = ChannelHandle::pair(1);

        let reply = roundtrip(&orch, &ch, &mut rx, frame(ClientCode::Control, "SIGN_IN", r#"{"key":"C1"}"#)).await;
        assert_eq!(reply.message_code, ReplyCode::Error);
        assert!(reply.body.starts_with("store unavailable"));
        assert!(orch.registry().control("C1").await.is_none());
    }

    #[tokio::test]
    async fn observers_subscribe_and_unsubscribe() {
        let (orch, _store) = orchestrator();
        let (ch, mut rx) = ChannelHandle::pair(4);

        let reply = roundtrip(&orch, &ch, &mut rx, frame(ClientCode::Observer, "SUBSCRIBE", "")).await;
        assert_eq!(reply.message_code, ReplyCode::Ok);
        assert_eq!(orch.registry().observer_count().await, 1);

        roundtrip(&orch, &ch, &mut rx, frame(ClientCode::Observer, "UNSUBSCRIBE", "")).await;
        assert_eq!(orch.registry().observer_count().await, 0);

        roundtrip(&orch, &ch, &mut rx, frame(ClientCode::Observer, "SUBSCRIBE", "")).await;
        orch.disconnect(4).await;
        assert_eq!(orch.registry().observer_count().await, 0);
    }

    #[tokio::test]
    async fn malformed_frame_yields_error_reply() {
        let (orch, _store) = orchestrator();
        let (ch, mut rx) = ChannelHandle::pair(1);
        let reply = roundtrip(&orch, &ch, &mut rx, "{nope".to_string()).await;
        assert_eq!(reply.message_code, ReplyCode::Error);
        assert!(reply.body.contains("malformed envelope"));
    }

    #[tokio::test]
    async fn worker_channel_rebinds_without_new_sign_in() {
        let (orch, store) = orchestrator();
        let (control, mut control_rx) = ChannelHandle::pair(1);
        let (first, mut first_rx) = ChannelHandle::pair(2);
        let (second, mut second_rx) = ChannelHandle::pair(3);
        roundtrip(&orch, &control, &mut control_rx, frame(ClientCode::Control, "SIGN_IN", r#"{"key":"C1"}"#)).await;
        roundtrip(
            &orch,
            &control,
            &mut control_rx,
            frame(ClientCode::Control, "REQ_JOB", r#"{"controlKey":"C1","workerKey":"W1"}"#),
        )
        .await;
        roundtrip(&orch, &first, &mut first_rx, frame(ClientCode::Worker, "SIGN_IN", r#"{"key":"W1"}"#)).await;

        let reply = roundtrip(
            &orch,
            &second,
            &mut second_rx,
            frame(ClientCode::Worker, "STATUS_UPD", r#"{"key":"W1","status":"BUSY"}"#),
        )
        .await;
        assert_eq!(reply.message_code, ReplyCode::Ok);
        let reply = roundtrip(
            &orch,
            &second,
            &mut second_rx,
            frame(ClientCode::Worker, "RESULT_DEP", r#"{"workerKey":"W1","seed":3,"success":true}"#),
        )
        .await;
        assert_eq!(reply.message_code, ReplyCode::Ok);

        {
            let registry = orch.registry();
            let state = registry.read().await;
            let worker = &state.workers["W1"];
            assert_eq!(worker.channel.as_ref().map(ChannelHandle::session_id), Some(3));
            assert_eq!(worker.record.session_id, 3);
            assert_eq!(worker.record.status, "BUSY");
            assert_eq!(worker.record.results_count, 1);
        }
        assert!(first_rx.try_recv().is_err());
        let stored = store.get_worker_node("W1").unwrap().unwrap();
        assert_eq!(stored.session_id, 3);
        assert_eq!(stored.results_count, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_orders_for_one_worker_key_issue_once() {
        let (orch, store) = orchestrator();
        let orch = Arc::new(orch);
        let (control, mut control_rx) = ChannelHandle::pair(1);
        roundtrip(&orch, &control, &mut control_rx, frame(ClientCode::Control, "SIGN_IN", r#"{"key":"C1"}"#)).await;

        for i in 0..50 {
            let worker_key = format!("W{i}");
            let body = format!(r#"{{"controlKey":"C1","workerKey":"{worker_key}"}}"#);
            let tasks: Vec<_> = (0..2)
                .map(|_| {
                    let orch = Arc::clone(&orch);
                    let control = control.clone();
                    let envelope = Envelope::parse(&frame(ClientCode::Control, "REQ_JOB", &body)).unwrap();
                    tokio::spawn(async move { orch.handle(&control, &envelope).await })
                })
                .collect();

            let mut issued = Vec::new();
            for task in tasks {
                match task.await.unwrap() {
                    Ok(reply) => issued.push(reply),
                    Err(err) => assert!(matches!(err, SessionError::ProtocolViolation(_))),
                }
            }
            assert_eq!(issued.len(), 1, "{worker_key}");

            let job = orch.registry().job(&worker_key).await.unwrap();
            assert_eq!(job, issued[0].body);
            let profile = Profile::from_json(&job).unwrap();
            let order = store.get_order(&worker_key).unwrap().unwrap();
            assert_eq!(order.profile_hash, profile.content_hash());
        }
        assert!(orch.registry().read().await.reserved.is_empty());
    }

    #[tokio::test]
    async fn failed_order_releases_the_worker_key() {
        let orch = orchestrator_with(Arc::new(FailingStore));
        let (ch, _rx) = ChannelHandle::pair(1);
        orch.registry().write().await.controls.insert(
            "C1".into(),
            ControlNode::new(
                ControlNodeRecord {
                    key: "C1".into(),
                    api_key: "k1".into(),
                    branch: None,
                    session_id: 1,
                    status: status::IDLE.into(),
                    active: true,
                    registered_at: 1,
                    update_time: 1,
                },
                ch.clone(),
            ),
        );
        let envelope = Envelope::parse(&frame(
            ClientCode::Control,
            "REQ_JOB",
            r#"{"controlKey":"C1","workerKey":"W1"}"#,
        ))
        .unwrap();

        let err = orch.handle(&ch, &envelope).await.unwrap_err();
        assert!(matches!(err, SessionError::StoreUnavailable(_)));
        let registry = orch.registry();
        let state = registry.read().await;
        assert!(state.reserved.is_empty());
        assert!(!state.workers.contains_key("W1"));
    }

    #[tokio::test]
    async fn refused_result_leaves_counters_untouched() {
        let store = StateStore::open_in_memory().unwrap();
        let orch = orchestrator_with(Arc::new(AppendRefused(store.clone())));
        let (ch, mut rx) = ChannelHandle::pair(1);
        roundtrip(&orch, &ch, &mut rx, frame(ClientCode::Control, "SIGN_IN", r#"{"key":"C1"}"#)).await;
        roundtrip(
            &orch,
            &ch,
            &mut rx,
            frame(ClientCode::Control, "REQ_JOB", r#"{"controlKey":"C1","workerKey":"W1"}"#),
        )
        .await;

        let reply = roundtrip(
            &orch,
            &ch,
            &mut rx,
            frame(ClientCode::Worker, "RESULT_DEP", r#"{"workerKey":"W1","seed":1,"success":true}"#),
        )
        .await;
        assert_eq!(reply.message_code, ReplyCode::Error);

        let worker = orch.registry().worker("W1").await.unwrap();
        assert_eq!(worker.results_count, 0);
        assert_eq!(worker.data_count, 0.0);
        assert_eq!(store.get_worker_node("W1").unwrap().unwrap().results_count, 0);
    }
}
