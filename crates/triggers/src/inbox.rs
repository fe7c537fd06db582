//! Mailbox watcher that turns incoming mail into executions.
//!
//! Each watched user gets one task that keeps a [`MailboxSession`] open and
//! polls it for mail that arrived after the session opened. A message first
//! goes to an execution that is waiting on the user's inbox (an inbox-read
//! action); only when no waiter matches are the user's email-trigger
//! workflows considered.
//!
//! A watch started only to serve waiters is on-demand: it stops once its
//! last waiter is gone.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use db::{CredentialStore, WorkflowStore};
use engine::node::types::EMAIL_TRIGGER;
use engine::{
    submit, ExecutionJob, ExecutionMetadata, Node, NodeKind, TriggerData, TriggeredBy,
    WorkflowDefinition,
};
use nodes::mail::{
    parse_message, InboxMessage, InboxWaitRequest, InboxWatch, MailFilter, MailboxAccount,
};
use nodes::{Credential, NodeError};
use queue::{JobQueue, Priority};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::imap::MailboxConnector;
use crate::TriggerError;

/// Credential application holding the mailbox OAuth tokens.
const MAILBOX_APPLICATION: &str = "gmail";

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub poll_interval: Duration,
    /// Pause before reopening a session that failed.
    pub reconnect_delay: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(10),
        }
    }
}

/// Where an incoming message ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the waiting execution with this id.
    Waiter(Uuid),
    /// Execution ids of the jobs enqueued for matching workflows; empty when
    /// nothing matched.
    Enqueued(Vec<Uuid>),
}

struct Waiter {
    id: u64,
    execution_id: Uuid,
    filter: MailFilter,
    reply: oneshot::Sender<InboxMessage>,
}

struct WatchSession {
    email: String,
    generation: u64,
    on_demand: bool,
    cancel: CancellationToken,
}

struct MonitorInner {
    workflows: Arc<dyn WorkflowStore>,
    credentials: Arc<dyn CredentialStore>,
    queue: Arc<dyn JobQueue<ExecutionJob>>,
    connector: Arc<dyn MailboxConnector>,
    config: MonitorConfig,
    waiters: Mutex<HashMap<Uuid, Vec<Waiter>>>,
    sessions: Mutex<HashMap<Uuid, WatchSession>>,
    generation: AtomicU64,
    shutdown: CancellationToken,
}

/// Per-user inbox watcher. Clones share state.
#[derive(Clone)]
pub struct InboxMonitor {
    inner: Arc<MonitorInner>,
}

impl InboxMonitor {
    pub fn new(
        workflows: Arc<dyn WorkflowStore>,
        credentials: Arc<dyn CredentialStore>,
        queue: Arc<dyn JobQueue<ExecutionJob>>,
        connector: Arc<dyn MailboxConnector>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                workflows,
                credentials,
                queue,
                connector,
                config,
                waiters: Mutex::new(HashMap::new()),
                sessions: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Watch the mailbox of every user owning an active workflow with an
    /// email trigger. Users without a usable mailbox credential are skipped.
    ///
    /// Returns the number of mailboxes now watched.
    pub async fn start(&self) -> Result<usize, TriggerError> {
        let mut users = HashSet::new();
        for row in self.inner.workflows.find_active().await? {
            match WorkflowDefinition::from_row(&row) {
                Ok(definition) if definition.nodes_of_type(EMAIL_TRIGGER).next().is_some() => {
                    users.insert(row.user_id);
                }
                Ok(_) => {}
                Err(e) => warn!(workflow_id = %row.id, error = %e, "skipping undecodable workflow"),
            }
        }

        let mut watched = 0;
        for user_id in users {
            match self.mailbox_account(user_id).await {
                Ok(Some(account)) => {
                    self.start_monitoring(user_id, account)?;
                    watched += 1;
                }
                Ok(None) => warn!(%user_id, "email-triggered workflows but no mailbox credential"),
                Err(e) => error!(%user_id, error = %e, "could not load mailbox credential"),
            }
        }
        info!(watched, "inbox monitor started");
        Ok(watched)
    }

    /// Start a watch task for `user_id`, replacing any running one.
    pub fn start_monitoring(&self, user_id: Uuid, account: MailboxAccount) -> Result<(), TriggerError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(TriggerError::ShutDown);
        }
        let mut sessions = self.inner.sessions.lock().unwrap();
        if let Some(previous) = sessions.remove(&user_id) {
            previous.cancel.cancel();
            debug!(%user_id, email = %previous.email, "replaced mailbox watch");
        }
        spawn_watch(&self.inner, &mut sessions, user_id, account, false);
        Ok(())
    }

    /// Start an on-demand watch for `user_id` unless one is running.
    fn ensure_monitoring(&self, user_id: Uuid, account: &MailboxAccount) -> Result<(), TriggerError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(TriggerError::ShutDown);
        }
        let mut sessions = self.inner.sessions.lock().unwrap();
        if !sessions.contains_key(&user_id) {
            spawn_watch(&self.inner, &mut sessions, user_id, account.clone(), true);
        }
        Ok(())
    }

    /// Stop watching `user_id`. Returns whether a watch was running.
    pub fn stop_monitoring(&self, user_id: Uuid) -> bool {
        let removed = self.inner.sessions.lock().unwrap().remove(&user_id);
        match removed {
            Some(session) => {
                session.cancel.cancel();
                info!(%user_id, email = %session.email, "mailbox watch stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_monitoring(&self, user_id: Uuid) -> bool {
        self.inner.sessions.lock().unwrap().contains_key(&user_id)
    }

    /// Number of users being watched.
    pub fn len(&self) -> usize {
        self.inner.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop every watch. Pending waiters are released with an error.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let stopped = {
            let mut sessions = self.inner.sessions.lock().unwrap();
            let n = sessions.len();
            sessions.clear();
            n
        };
        self.inner.waiters.lock().unwrap().clear();
        info!(stopped, "inbox monitor shut down");
    }

    /// Route one parsed message for `user_id`.
    pub async fn handle_message(
        &self,
        user_id: Uuid,
        message: InboxMessage,
    ) -> Result<Delivery, TriggerError> {
        route(&self.inner, user_id, message).await
    }

    async fn mailbox_account(&self, user_id: Uuid) -> Result<Option<MailboxAccount>, TriggerError> {
        let row = self
            .inner
            .credentials
            .find_by_user(user_id)
            .await?
            .into_iter()
            .find(|c| c.application.eq_ignore_ascii_case(MAILBOX_APPLICATION));
        let Some(row) = row else {
            return Ok(None);
        };
        let credential = Credential::new(row.application, row.data);
        Ok(Some(MailboxAccount::from_credential(&credential)?))
    }
}

#[async_trait]
impl InboxWatch for InboxMonitor {
    async fn wait_for_message(&self, request: InboxWaitRequest) -> Result<InboxMessage, NodeError> {
        let user_id = request.user_id;
        let (reply, receiver) = oneshot::channel();
        let waiter_id = self.inner.generation.fetch_add(1, Ordering::Relaxed);

        // Registered before the watch is ensured, so a concurrent release
        // either sees this waiter or has already removed the session.
        self.inner
            .waiters
            .lock()
            .unwrap()
            .entry(user_id)
            .or_default()
            .push(Waiter {
                id: waiter_id,
                execution_id: request.execution_id,
                filter: request.filter,
                reply,
            });
        let _pending = PendingWait {
            inner: Arc::clone(&self.inner),
            user_id,
            waiter_id,
        };

        self.ensure_monitoring(user_id, &request.account)
            .map_err(|e| NodeError::Mailbox(e.to_string()))?;
        debug!(%user_id, execution_id = %request.execution_id, "waiting for inbox message");

        receiver
            .await
            .map_err(|_| NodeError::Mailbox("inbox monitor stopped before a message arrived".into()))
    }
}

/// Unregisters a waiter however its wait ends, and stops an on-demand watch
/// left without waiters.
struct PendingWait {
    inner: Arc<MonitorInner>,
    user_id: Uuid,
    waiter_id: u64,
}

impl Drop for PendingWait {
    fn drop(&mut self) {
        let mut sessions = self.inner.sessions.lock().unwrap();
        let idle = {
            let mut waiters = self.inner.waiters.lock().unwrap();
            if let Some(list) = waiters.get_mut(&self.user_id) {
                list.retain(|w| w.id != self.waiter_id && !w.reply.is_closed());
                if list.is_empty() {
                    waiters.remove(&self.user_id);
                }
            }
            !waiters.contains_key(&self.user_id)
        };
        if idle && sessions.get(&self.user_id).is_some_and(|s| s.on_demand) {
            if let Some(session) = sessions.remove(&self.user_id) {
                session.cancel.cancel();
                debug!(user_id = %self.user_id, email = %session.email, "on-demand mailbox watch released");
            }
        }
    }
}

/// Insert a session for `user_id` and spawn its task. The caller holds the
/// sessions lock and has cleared any previous entry.
fn spawn_watch(
    inner: &Arc<MonitorInner>,
    sessions: &mut HashMap<Uuid, WatchSession>,
    user_id: Uuid,
    account: MailboxAccount,
    on_demand: bool,
) {
    let generation = inner.generation.fetch_add(1, Ordering::Relaxed);
    let cancel = inner.shutdown.child_token();
    sessions.insert(
        user_id,
        WatchSession {
            email: account.email.clone(),
            generation,
            on_demand,
            cancel: cancel.clone(),
        },
    );
    info!(%user_id, email = %account.email, on_demand, "mailbox watch started");
    tokio::spawn(watch(Arc::clone(inner), user_id, account, generation, cancel));
}

#[instrument(skip(inner, message), fields(from = %message.from, subject = %message.subject))]
async fn route(
    inner: &MonitorInner,
    user_id: Uuid,
    message: InboxMessage,
) -> Result<Delivery, TriggerError> {
    if let Some(execution_id) = deliver_to_waiter(inner, user_id, &message) {
        info!(%execution_id, "inbox message handed to waiting execution");
        return Ok(Delivery::Waiter(execution_id));
    }

    let mut enqueued = Vec::new();
    for row in inner.workflows.find_active_by_user(user_id).await? {
        let definition = match WorkflowDefinition::from_row(&row) {
            Ok(definition) => definition,
            Err(e) => {
                warn!(workflow_id = %row.id, error = %e, "skipping undecodable workflow");
                continue;
            }
        };
        let matching: Vec<String> = definition
            .nodes_of_type(EMAIL_TRIGGER)
            .filter(|data| match Node::try_from(*data).map(|n| n.kind) {
                Ok(NodeKind::EmailTrigger { filter }) => filter.matches(&message),
                _ => false,
            })
            .map(|data| data.id.clone())
            .collect();

        for node_id in matching {
            let job = ExecutionJob::new(definition.clone(), row.user_id, TriggeredBy::Email)
                .with_priority(Priority::High)
                .with_trigger_data(TriggerData {
                    node_id: Some(node_id.clone()),
                    email_data: Some(serde_json::to_value(&message)?),
                    ..Default::default()
                })
                .with_metadata(ExecutionMetadata {
                    source: Some("email".into()),
                    node_id: Some(node_id),
                    ..Default::default()
                });
            enqueued.push(job.execution_id);
            submit(inner.queue.as_ref(), job).await?;
        }
    }

    if enqueued.is_empty() {
        debug!("inbox message matched no workflow");
    }
    Ok(Delivery::Enqueued(enqueued))
}

/// Hand `message` to the first live waiter whose filter accepts it. Waiters
/// whose action already gave up are dropped on the way.
fn deliver_to_waiter(inner: &MonitorInner, user_id: Uuid, message: &InboxMessage) -> Option<Uuid> {
    let mut waiters = inner.waiters.lock().unwrap();
    let list = waiters.get_mut(&user_id)?;

    let mut delivered = None;
    while delivered.is_none() {
        list.retain(|w| !w.reply.is_closed());
        let Some(pos) = list.iter().position(|w| w.filter.matches(message)) else {
            break;
        };
        let waiter = list.remove(pos);
        if waiter.reply.send(message.clone()).is_ok() {
            delivered = Some(waiter.execution_id);
        }
    }

    if list.is_empty() {
        waiters.remove(&user_id);
    }
    delivered
}

/// Keep a session open for `user_id` and route every newly arrived message,
/// until cancelled. A reconnect starts from the folder's state at that time.
async fn watch(
    inner: Arc<MonitorInner>,
    user_id: Uuid,
    account: MailboxAccount,
    generation: u64,
    cancel: CancellationToken,
) {
    let poll_interval = inner.config.poll_interval;
    let reconnect_delay = inner.config.reconnect_delay;

    'connect: loop {
        let connected = tokio::select! {
            _ = cancel.cancelled() => break,
            connected = inner.connector.connect(&account) => connected,
        };
        let mut session = match connected {
            Ok(session) => session,
            Err(e) => {
                error!(%user_id, email = %account.email, error = %e, "mailbox connection failed");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(reconnect_delay) => continue,
                }
            }
        };
        debug!(%user_id, email = %account.email, "mailbox session open");

        loop {
            let fetched = tokio::select! {
                _ = cancel.cancelled() => None,
                fetched = session.fetch_new() => Some(fetched),
            };
            let Some(fetched) = fetched else {
                session.close().await;
                break 'connect;
            };

            match fetched {
                Ok(raw_messages) => {
                    for raw in raw_messages {
                        let Some(message) = parse_message(&raw) else {
                            warn!(%user_id, bytes = raw.len(), "could not parse inbox message");
                            continue;
                        };
                        if let Err(e) = route(&inner, user_id, message).await {
                            error!(%user_id, error = %e, "failed to route inbox message");
                        }
                    }
                }
                Err(e) => {
                    warn!(%user_id, error = %e, "mailbox poll failed, reconnecting");
                    session.close().await;
                    tokio::select! {
                        _ = cancel.cancelled() => break 'connect,
                        _ = tokio::time::sleep(reconnect_delay) => continue 'connect,
                    }
                }
            }

            let stop = tokio::select! {
                _ = cancel.cancelled() => true,
                _ = tokio::time::sleep(poll_interval) => false,
            };
            if stop {
                session.close().await;
                break 'connect;
            }
        }
    }

    let mut sessions = inner.sessions.lock().unwrap();
    if sessions.get(&user_id).is_some_and(|s| s.generation == generation) {
        sessions.remove(&user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    use chrono::Utc;
    use db::models::{CredentialRow, WorkflowRow};
    use db::MemoryStore;
    use queue::MemoryQueue;
    use serde_json::{json, Value};

    use crate::imap::{MailboxSession, UidWatermark};

    /// In-memory folder; message `i` has UID `i + 1`.
    #[derive(Default)]
    struct ScriptedConnector {
        folder: Arc<Mutex<Vec<Vec<u8>>>>,
        connects: AtomicUsize,
    }

    impl ScriptedConnector {
        fn with_backlog(backlog: Vec<Vec<u8>>) -> Self {
            Self {
                folder: Arc::new(Mutex::new(backlog)),
                connects: AtomicUsize::new(0),
            }
        }

        fn deliver(&self, raw: Vec<u8>) {
            self.folder.lock().unwrap().push(raw);
        }
    }

    struct ScriptedSession {
        folder: Arc<Mutex<Vec<Vec<u8>>>>,
        watermark: UidWatermark,
    }

    #[async_trait]
    impl MailboxConnector for ScriptedConnector {
        async fn connect(&self, _account: &MailboxAccount) -> Result<Box<dyn MailboxSession>, TriggerError> {
            let uid_next = self.folder.lock().unwrap().len() as u32 + 1;
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedSession {
                folder: Arc::clone(&self.folder),
                watermark: UidWatermark::new(uid_next),
            }))
        }
    }

    #[async_trait]
    impl MailboxSession for ScriptedSession {
        async fn fetch_new(&mut self) -> Result<Vec<Vec<u8>>, TriggerError> {
            let folder = self.folder.lock().unwrap();
            let uids = self.watermark.advance(1..=folder.len() as u32);
            Ok(uids
                .into_iter()
                .map(|uid| folder[uid as usize - 1].clone())
                .collect())
        }

        async fn close(self: Box<Self>) {}
    }

    struct Fixture {
        monitor: InboxMonitor,
        store: Arc<MemoryStore>,
        jobs: Arc<MemoryQueue<ExecutionJob>>,
        connector: Arc<ScriptedConnector>,
    }

    fn fixture(connector: ScriptedConnector) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let jobs = Arc::new(MemoryQueue::new());
        let connector = Arc::new(connector);
        let monitor = InboxMonitor::new(
            store.clone(),
            store.clone(),
            jobs.clone(),
            connector.clone(),
            MonitorConfig {
                poll_interval: Duration::from_secs(1),
                reconnect_delay: Duration::from_secs(1),
            },
        );
        Fixture {
            monitor,
            store,
            jobs,
            connector,
        }
    }

    fn email_workflow(user_id: Uuid, data: Value) -> WorkflowRow {
        WorkflowRow {
            id: Uuid::new_v4(),
            user_id,
            name: "invoices".into(),
            active: true,
            nodes: json!([
                { "id": "mail", "type": "emailTrigger", "data": data },
                { "id": "ping", "type": "action",
                  "data": { "actionType": "WebHookNodeType", "parameters": { "url": "http://localhost/" } } }
            ]),
            edges: json!([{ "source": "mail", "target": "ping" }]),
            updated_at: Utc::now(),
        }
    }

    fn message(from: &str, subject: &str) -> InboxMessage {
        InboxMessage {
            from: from.into(),
            to: "me@example.com".into(),
            subject: subject.into(),
            body: "Amount due: 42".into(),
            html: String::new(),
            date: Utc::now(),
        }
    }

    fn account() -> MailboxAccount {
        MailboxAccount {
            email: "me@example.com".into(),
            access_token: "token".into(),
        }
    }

    fn wait_request(user_id: Uuid, filter: MailFilter) -> InboxWaitRequest {
        InboxWaitRequest {
            user_id,
            execution_id: Uuid::new_v4(),
            account: account(),
            filter,
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..50 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        check()
    }

    #[tokio::test]
    async fn matching_workflow_gets_a_high_priority_email_job() {
        let f = fixture(ScriptedConnector::default());
        let user_id = Uuid::new_v4();
        let row = email_workflow(
            user_id,
            json!({ "senderFilter": "billing@", "subjectFilter": "Invoice" }),
        );
        f.store.insert_workflow(row.clone());

        let delivery = f
            .monitor
            .handle_message(user_id, message("Billing <billing@acme.test>", "Invoice 42"))
            .await
            .unwrap();
        let Delivery::Enqueued(ids) = delivery else {
            panic!("expected an enqueued job, got {delivery:?}");
        };
        assert_eq!(ids.len(), 1);

        let job = f.jobs.dequeue().await.unwrap().unwrap();
        assert_eq!(job.priority, Priority::High);
        assert_eq!(job.payload.execution_id, ids[0]);
        assert_eq!(job.payload.workflow_id, row.id);
        assert_eq!(job.payload.triggered_by, TriggeredBy::Email);
        let trigger = job.payload.trigger_data.unwrap();
        assert_eq!(trigger.node_id.as_deref(), Some("mail"));
        assert_eq!(trigger.email_data.unwrap()["subject"], "Invoice 42");
    }

    #[tokio::test]
    async fn filter_mismatch_enqueues_nothing() {
        let f = fixture(ScriptedConnector::default());
        let user_id = Uuid::new_v4();
        f.store
            .insert_workflow(email_workflow(user_id, json!({ "senderFilter": "billing@" })));

        let delivery = f
            .monitor
            .handle_message(user_id, message("friend@example.com", "Invoice 42"))
            .await
            .unwrap();
        assert_eq!(delivery, Delivery::Enqueued(Vec::new()));
        assert!(f.jobs.is_empty());

        // Another user's mail never reaches this workflow.
        let delivery = f
            .monitor
            .handle_message(Uuid::new_v4(), message("billing@acme.test", "Invoice"))
            .await
            .unwrap();
        assert_eq!(delivery, Delivery::Enqueued(Vec::new()));
    }

    #[tokio::test]
    async fn waiting_execution_takes_the_message_first() {
        let f = fixture(ScriptedConnector::default());
        let user_id = Uuid::new_v4();
        f.store.insert_workflow(email_workflow(user_id, json!({})));

        let request = wait_request(
            user_id,
            MailFilter {
                subject_contains: Some("code".into()),
                ..Default::default()
            },
        );
        let execution_id = request.execution_id;
        let monitor = f.monitor.clone();
        let waiting = tokio::spawn(async move { monitor.wait_for_message(request).await });
        assert!(eventually(|| f.monitor.inner.waiters.lock().unwrap().contains_key(&user_id)).await);
        assert!(eventually(|| f.monitor.is_monitoring(user_id)).await);

        // Not for the waiter: falls through to the catch-all workflow.
        let delivery = f
            .monitor
            .handle_message(user_id, message("a@example.com", "newsletter"))
            .await
            .unwrap();
        assert!(matches!(delivery, Delivery::Enqueued(ids) if ids.len() == 1));

        let delivery = f
            .monitor
            .handle_message(user_id, message("a@example.com", "Your code is 1234"))
            .await
            .unwrap();
        assert_eq!(delivery, Delivery::Waiter(execution_id));
        let received = waiting.await.unwrap().unwrap();
        assert_eq!(received.subject, "Your code is 1234");
        assert_eq!(f.jobs.len(), 1);
        // Started only for the waiter, so it ends with it.
        assert!(!f.monitor.is_monitoring(user_id));

        f.monitor.shutdown();
    }

    #[tokio::test]
    async fn abandoned_waiter_is_dropped() {
        let f = fixture(ScriptedConnector::default());
        let user_id = Uuid::new_v4();

        let gave_up = tokio::time::timeout(
            Duration::from_millis(50),
            f.monitor.wait_for_message(wait_request(user_id, MailFilter::default())),
        )
        .await;
        assert!(gave_up.is_err());

        let delivery = f
            .monitor
            .handle_message(user_id, message("a@example.com", "late"))
            .await
            .unwrap();
        assert_eq!(delivery, Delivery::Enqueued(Vec::new()));
        assert!(f.monitor.inner.waiters.lock().unwrap().is_empty());

        f.monitor.shutdown();
    }

    #[tokio::test]
    async fn shutdown_releases_waiters_with_an_error() {
        let f = fixture(ScriptedConnector::default());
        let user_id = Uuid::new_v4();
        let monitor = f.monitor.clone();
        let waiting = tokio::spawn(async move {
            monitor
                .wait_for_message(wait_request(user_id, MailFilter::default()))
                .await
        });
        assert!(eventually(|| f.monitor.inner.waiters.lock().unwrap().contains_key(&user_id)).await);

        f.monitor.shutdown();
        assert!(matches!(waiting.await.unwrap(), Err(NodeError::Mailbox(_))));
        assert!(f.monitor.is_empty());
        assert!(matches!(
            f.monitor.start_monitoring(user_id, account()),
            Err(TriggerError::ShutDown)
        ));
    }

    fn invoice(number: u32) -> Vec<u8> {
        format!(
            "From: Billing <billing@acme.test>\r\n\
To: me@example.com\r\n\
Subject: Invoice {number}\r\n\
Date: Tue, 1 Jul 2025 10:00:00 +0000\r\n\
\r\n\
Amount due: {number}\r\n"
        )
        .into_bytes()
    }

    #[tokio::test]
    async fn only_mail_arriving_after_connect_is_routed() {
        let f = fixture(ScriptedConnector::with_backlog(vec![invoice(1), invoice(2)]));
        let user_id = Uuid::new_v4();
        f.store
            .insert_workflow(email_workflow(user_id, json!({ "subjectFilter": "Invoice" })));

        f.monitor.start_monitoring(user_id, account()).unwrap();
        assert!(eventually(|| f.connector.connects.load(Ordering::SeqCst) == 1).await);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(f.jobs.is_empty(), "backlog must not start executions");

        f.connector.deliver(b"garbage".to_vec());
        f.connector.deliver(invoice(7));
        assert!(eventually(|| f.jobs.len() == 1).await);

        let job = f.jobs.dequeue().await.unwrap().unwrap();
        let email = job.payload.trigger_data.unwrap().email_data.unwrap();
        assert_eq!(email["subject"], "Invoice 7");

        assert!(f.monitor.stop_monitoring(user_id));
        assert!(!f.monitor.stop_monitoring(user_id));
    }

    #[tokio::test]
    async fn waiter_ignores_backlog_and_takes_the_next_message() {
        let f = fixture(ScriptedConnector::with_backlog(vec![invoice(1)]));
        let user_id = Uuid::new_v4();

        let stale = tokio::time::timeout(
            Duration::from_millis(1500),
            f.monitor.wait_for_message(wait_request(user_id, MailFilter::default())),
        )
        .await;
        assert!(stale.is_err(), "backlog satisfied the waiter: {stale:?}");

        let connects = f.connector.connects.load(Ordering::SeqCst);
        let monitor = f.monitor.clone();
        let waiting = tokio::spawn(async move {
            monitor
                .wait_for_message(wait_request(user_id, MailFilter::default()))
                .await
        });
        assert!(eventually(|| f.connector.connects.load(Ordering::SeqCst) > connects).await);
        f.connector.deliver(invoice(9));

        let received = waiting.await.unwrap().unwrap();
        assert_eq!(received.subject, "Invoice 9");
        assert!(eventually(|| !f.monitor.is_monitoring(user_id)).await);
        assert!(f.jobs.is_empty());
    }

    #[tokio::test]
    async fn on_demand_watch_stops_when_its_waiter_gives_up() {
        let f = fixture(ScriptedConnector::default());
        let user_id = Uuid::new_v4();

        let gave_up = tokio::time::timeout(
            Duration::from_millis(200),
            f.monitor.wait_for_message(wait_request(user_id, MailFilter::default())),
        )
        .await;
        assert!(gave_up.is_err());
        assert!(!f.monitor.is_monitoring(user_id));
        assert!(f.monitor.is_empty());
    }

    #[tokio::test]
    async fn on_demand_watch_outlives_a_waiter_while_others_remain() {
        let f = fixture(ScriptedConnector::default());
        let user_id = Uuid::new_v4();

        let monitor = f.monitor.clone();
        let patient = tokio::spawn(async move {
            monitor
                .wait_for_message(wait_request(user_id, MailFilter::default()))
                .await
        });
        assert!(eventually(|| f.monitor.is_monitoring(user_id)).await);

        let impatient = tokio::time::timeout(
            Duration::from_millis(100),
            f.monitor.wait_for_message(wait_request(user_id, MailFilter::default())),
        )
        .await;
        assert!(impatient.is_err());
        assert!(f.monitor.is_monitoring(user_id));

        patient.abort();
        let _ = patient.await;
        assert!(eventually(|| !f.monitor.is_monitoring(user_id)).await);
    }

    #[tokio::test]
    async fn workflow_watch_survives_its_waiters() {
        let f = fixture(ScriptedConnector::default());
        let user_id = Uuid::new_v4();
        f.monitor.start_monitoring(user_id, account()).unwrap();

        let gave_up = tokio::time::timeout(
            Duration::from_millis(100),
            f.monitor.wait_for_message(wait_request(user_id, MailFilter::default())),
        )
        .await;
        assert!(gave_up.is_err());
        assert!(f.monitor.is_monitoring(user_id));

        f.monitor.shutdown();
    }

    #[tokio::test]
    async fn restarting_a_watch_replaces_the_session() {
        let f = fixture(ScriptedConnector::default());
        let user_id = Uuid::new_v4();

        f.monitor.start_monitoring(user_id, account()).unwrap();
        f.monitor.start_monitoring(user_id, account()).unwrap();
        assert_eq!(f.monitor.len(), 1);
        assert!(eventually(|| f.connector.connects.load(Ordering::SeqCst) == 2).await);

        f.monitor.shutdown();
        assert!(f.monitor.is_empty());
    }

    #[tokio::test]
    async fn start_watches_users_with_email_workflows() {
        let f = fixture(ScriptedConnector::default());
        let with_mailbox = Uuid::new_v4();
        let without_mailbox = Uuid::new_v4();
        f.store.insert_workflow(email_workflow(with_mailbox, json!({})));
        f.store.insert_workflow(email_workflow(without_mailbox, json!({})));
        f.store.insert_credential(CredentialRow {
            id: Uuid::new_v4(),
            user_id: with_mailbox,
            application: "Gmail".into(),
            data: json!({ "access_token": "token", "email": "me@example.com" }),
        });

        assert_eq!(f.monitor.start().await.unwrap(), 1);
        assert!(f.monitor.is_monitoring(with_mailbox));
        assert!(!f.monitor.is_monitoring(without_mailbox));

        f.monitor.shutdown();
    }
}
