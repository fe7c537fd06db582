//! Cron-driven trigger registry.
//!
//! One entry per (workflow id, schedule node id), each backed by its own
//! tokio task that sleeps until the next UTC fire time and enqueues an
//! [`ExecutionJob`]. Construct one registry per process, call
//! [`ScheduleRegistry::start`] once, and [`ScheduleRegistry::shutdown`] on
//! the way out.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use db::WorkflowStore;
use engine::node::types::SCHEDULE_TRIGGER;
use engine::{
    submit, ExecutionJob, ExecutionMetadata, Node, NodeKind, TriggeredBy, WorkflowDefinition,
};
use queue::{EventBus, JobQueue};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::TriggerError;

/// Bus channel carrying `{ workflowId }` whenever a workflow's schedule may
/// have changed.
pub const SCHEDULE_REFRESH_CHANNEL: &str = "workflow:schedule:refresh";

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

const WEEKDAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// Parse a 5- or 6-field cron expression, evaluated in UTC. Five fields get
/// a leading `0` seconds field. Day-of-week follows the usual crontab
/// numbering: 0-6 from Sunday, with 7 also Sunday.
pub fn parse_cron(expression: &str) -> Result<Schedule, TriggerError> {
    let invalid = |message: String| TriggerError::InvalidCron {
        expression: expression.to_owned(),
        message,
    };

    let mut fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() == 5 {
        fields.insert(0, "0");
    }
    if fields.len() != 6 {
        return Err(invalid(format!(
            "expected 5 or 6 fields, found {}",
            expression.split_whitespace().count()
        )));
    }
    let day_of_week = day_of_week_field(fields[5]).map_err(invalid)?;
    fields[5] = &day_of_week;

    Schedule::from_str(&fields.join(" ")).map_err(|e| invalid(e.to_string()))
}

/// Rewrite a crontab day-of-week field as the day-name list the `cron`
/// crate reads, since it numbers Sunday as 1.
fn day_of_week_field(field: &str) -> Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_owned());
    }

    let mut days = [false; 7];
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => match step.parse::<usize>() {
                Ok(step) if step > 0 => (range, Some(step)),
                _ => return Err(format!("invalid day-of-week step in '{item}'")),
            },
            None => (item, None),
        };
        let (first, last) = match (range, range.split_once('-')) {
            ("*" | "?", _) => (0, 6),
            (_, Some((first, last))) => (weekday(first)?, weekday(last)?),
            (_, None) => {
                let day = weekday(range)?;
                (day, if step.is_some() { 6 } else { day })
            }
        };
        if first > last {
            return Err(format!("day-of-week range '{range}' runs backwards"));
        }
        for day in (first..=last).step_by(step.unwrap_or(1)) {
            days[day % 7] = true;
        }
    }

    if days.iter().all(|d| *d) {
        return Ok("*".to_owned());
    }
    Ok(WEEKDAYS
        .iter()
        .zip(days)
        .filter(|(_, set)| *set)
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(","))
}

/// 0-7 or a three-letter day name.
fn weekday(token: &str) -> Result<usize, String> {
    if let Ok(n) = token.parse::<usize>() {
        return if n <= 7 {
            Ok(n)
        } else {
            Err(format!("day of week {n} is out of range"))
        };
    }
    WEEKDAYS
        .iter()
        .position(|name| name.eq_ignore_ascii_case(token))
        .ok_or_else(|| format!("unknown day of week '{token}'"))
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScheduleKey {
    pub workflow_id: Uuid,
    pub node_id: String,
}

impl fmt::Display for ScheduleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.workflow_id, self.node_id)
    }
}

struct ScheduleEntry {
    cron: String,
    generation: u64,
    cancel: CancellationToken,
}

enum Tick {
    Enqueued(Uuid),
    /// The workflow is gone or inactive; the entry should go too.
    Retired,
}

struct Inner {
    workflows: Arc<dyn WorkflowStore>,
    queue: Arc<dyn JobQueue<ExecutionJob>>,
    entries: Mutex<HashMap<ScheduleKey, ScheduleEntry>>,
    generation: AtomicU64,
    shutdown: CancellationToken,
}

/// Live table of scheduled workflows. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ScheduleRegistry {
    inner: Arc<Inner>,
}

impl ScheduleRegistry {
    pub fn new(workflows: Arc<dyn WorkflowStore>, queue: Arc<dyn JobQueue<ExecutionJob>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                workflows,
                queue,
                entries: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Register every schedule node of every active workflow, then follow
    /// refresh signals on `bus` and log a heartbeat until shutdown.
    ///
    /// Returns the number of entries registered by the initial scan.
    pub async fn start(&self, bus: Arc<dyn EventBus>) -> Result<usize, TriggerError> {
        let mut refreshes = bus.subscribe(SCHEDULE_REFRESH_CHANNEL).await?;

        let mut registered = 0;
        for row in self.inner.workflows.find_active().await? {
            match WorkflowDefinition::from_row(&row) {
                Ok(definition) => registered += self.register_definition(&definition, row.user_id),
                Err(e) => warn!(workflow_id = %row.id, error = %e, "skipping undecodable workflow"),
            }
        }
        info!(registered, "schedule registry started");

        let registry = self.clone();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    message = refreshes.recv() => message,
                };
                match message {
                    Ok(message) => registry.on_refresh_signal(&message).await,
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "schedule refresh listener lagged")
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let registry = self.clone();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
            heartbeat.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = heartbeat.tick() => registry.log_heartbeat(),
                }
            }
        });

        Ok(registered)
    }

    /// Add or replace the entry for (`workflow_id`, `node_id`).
    ///
    /// # Errors
    /// [`TriggerError::InvalidCron`] for a malformed expression; the existing
    /// entry, if any, is left alone in that case.
    pub fn register(
        &self,
        workflow_id: Uuid,
        node_id: &str,
        cron: &str,
        user_id: Uuid,
    ) -> Result<(), TriggerError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(TriggerError::ShutDown);
        }
        let schedule = parse_cron(cron)?;
        let key = ScheduleKey {
            workflow_id,
            node_id: node_id.to_owned(),
        };
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let cancel = self.inner.shutdown.child_token();

        let previous = self.inner.entries.lock().unwrap().insert(
            key.clone(),
            ScheduleEntry {
                cron: cron.to_owned(),
                generation,
                cancel: cancel.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.cancel.cancel();
            debug!(key = %key, "replaced existing schedule");
        }

        info!(key = %key, cron, %user_id, "schedule registered");
        tokio::spawn(run_entry(Arc::clone(&self.inner), key, generation, schedule, cancel));
        Ok(())
    }

    /// Stop and drop one entry. Returns whether it existed.
    pub fn unregister(&self, workflow_id: Uuid, node_id: &str) -> bool {
        let key = ScheduleKey {
            workflow_id,
            node_id: node_id.to_owned(),
        };
        let removed = self.inner.entries.lock().unwrap().remove(&key);
        match removed {
            Some(entry) => {
                entry.cancel.cancel();
                info!(key = %key, "schedule unregistered");
                true
            }
            None => false,
        }
    }

    /// Stop and drop every entry of one workflow.
    pub fn unregister_workflow(&self, workflow_id: Uuid) -> usize {
        let mut entries = self.inner.entries.lock().unwrap();
        let keys: Vec<ScheduleKey> = entries
            .keys()
            .filter(|k| k.workflow_id == workflow_id)
            .cloned()
            .collect();
        for key in &keys {
            if let Some(entry) = entries.remove(key) {
                entry.cancel.cancel();
            }
        }
        keys.len()
    }

    /// Re-derive a workflow's entries from its current stored definition.
    /// Returns how many entries it has afterwards.
    #[instrument(skip(self))]
    pub async fn refresh(&self, workflow_id: Uuid) -> Result<usize, TriggerError> {
        let removed = self.unregister_workflow(workflow_id);
        let registered = match self.inner.workflows.find(workflow_id).await? {
            Some(row) if row.active => {
                let definition = WorkflowDefinition::from_row(&row)?;
                self.register_definition(&definition, row.user_id)
            }
            _ => 0,
        };
        info!(removed, registered, "schedules refreshed");
        Ok(registered)
    }

    /// `(key, cron)` of every live entry, ordered by key.
    pub fn entries(&self) -> Vec<(ScheduleKey, String)> {
        let mut all: Vec<_> = self
            .inner
            .entries
            .lock()
            .unwrap()
            .iter()
            .map(|(k, e)| (k.clone(), e.cron.clone()))
            .collect();
        all.sort();
        all
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop every entry and the background listeners. Later registrations
    /// fail with [`TriggerError::ShutDown`].
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let stopped = {
            let mut entries = self.inner.entries.lock().unwrap();
            let n = entries.len();
            entries.clear();
            n
        };
        info!(stopped, "schedule registry shut down");
    }

    /// Register each schedule node of `definition`; bad nodes are logged.
    fn register_definition(&self, definition: &WorkflowDefinition, user_id: Uuid) -> usize {
        let mut registered = 0;
        for data in definition.nodes_of_type(SCHEDULE_TRIGGER) {
            let cron = match Node::try_from(data).map(|n| n.kind) {
                Ok(NodeKind::ScheduleTrigger { cron: Some(cron) }) => cron,
                _ => {
                    warn!(workflow_id = %definition.id, node_id = %data.id, "schedule node has no cron expression");
                    continue;
                }
            };
            match self.register(definition.id, &data.id, &cron, user_id) {
                Ok(()) => registered += 1,
                Err(e) => error!(
                    workflow_id = %definition.id,
                    node_id = %data.id,
                    error = %e,
                    "failed to register schedule"
                ),
            }
        }
        registered
    }

    async fn on_refresh_signal(&self, message: &Value) {
        let workflow_id = message
            .get("workflowId")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok());
        let Some(workflow_id) = workflow_id else {
            warn!(%message, "ignoring malformed schedule refresh signal");
            return;
        };
        if let Err(e) = self.refresh(workflow_id).await {
            error!(%workflow_id, error = %e, "schedule refresh failed");
        }
    }

    fn log_heartbeat(&self) {
        let entries = self.entries();
        info!(active = entries.len(), "schedule registry heartbeat");
        for (key, cron) in &entries {
            info!(key = %key, cron = %cron, "active schedule");
        }
    }
}

/// Sleep until each fire time and enqueue, until cancelled or retired.
async fn run_entry(
    inner: Arc<Inner>,
    key: ScheduleKey,
    generation: u64,
    schedule: Schedule,
    cancel: CancellationToken,
) {
    let mut last_fire: Option<DateTime<Utc>> = None;

    loop {
        let now = Utc::now();
        let after = last_fire.map_or(now, |last| last.max(now));
        let Some(next) = schedule.after(&after).next() else {
            info!(key = %key, "schedule has no future fire times");
            break;
        };
        let wait = (next - now).to_std().unwrap_or_default();

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
        last_fire = Some(next);

        match fire(&inner, &key, next).await {
            Ok(Tick::Enqueued(execution_id)) => {
                info!(key = %key, %execution_id, "scheduled execution queued")
            }
            Ok(Tick::Retired) => {
                info!(key = %key, "workflow missing or inactive, dropping schedule");
                let mut entries = inner.entries.lock().unwrap();
                if entries.get(&key).is_some_and(|e| e.generation == generation) {
                    entries.remove(&key);
                }
                break;
            }
            Err(e) => error!(key = %key, error = %e, "scheduled tick failed"),
        }
    }
}

#[instrument(skip(inner), fields(workflow_id = %key.workflow_id, node_id = %key.node_id))]
async fn fire(
    inner: &Inner,
    key: &ScheduleKey,
    scheduled_time: DateTime<Utc>,
) -> Result<Tick, TriggerError> {
    let row = match inner.workflows.find(key.workflow_id).await? {
        Some(row) if row.active => row,
        _ => return Ok(Tick::Retired),
    };
    let definition = WorkflowDefinition::from_row(&row)?;

    let job = ExecutionJob::new(definition, row.user_id, TriggeredBy::Schedule).with_metadata(
        ExecutionMetadata {
            source: Some("schedule".into()),
            node_id: Some(key.node_id.clone()),
            scheduled_time: Some(scheduled_time),
            ..Default::default()
        },
    );
    let execution_id = job.execution_id;
    submit(inner.queue.as_ref(), job).await?;
    Ok(Tick::Enqueued(execution_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use db::models::WorkflowRow;
    use db::MemoryStore;
    use queue::{MemoryBus, MemoryQueue, Priority};
    use chrono::{Datelike, Weekday};
    use serde_json::json;
    use std::collections::HashSet;

    fn scheduled_workflow(cron: &str, active: bool) -> WorkflowRow {
        WorkflowRow {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: "nightly".into(),
            active,
            nodes: json!([
                { "id": "tick", "type": "scheduleTrigger", "data": { "cronExpression": cron } },
                { "id": "ping", "type": "action",
                  "data": { "actionType": "WebHookNodeType", "parameters": { "url": "http://localhost/" } } }
            ]),
            edges: json!([{ "source": "tick", "target": "ping" }]),
            updated_at: Utc::now(),
        }
    }

    fn registry() -> (ScheduleRegistry, Arc<MemoryStore>, Arc<MemoryQueue<ExecutionJob>>) {
        let store = Arc::new(MemoryStore::new());
        let jobs = Arc::new(MemoryQueue::new());
        let registry = ScheduleRegistry::new(store.clone(), jobs.clone());
        (registry, store, jobs)
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

    #[test]
    fn five_and_six_field_expressions_parse() {
        assert!(parse_cron("*/5 * * * *").is_ok());
        assert!(parse_cron("30 0 9 * * Mon-Fri").is_ok());
        assert!(parse_cron("0 9 * * *").is_ok());
    }

    fn fire_days(expression: &str, count: usize) -> Vec<Weekday> {
        let schedule = parse_cron(expression).unwrap();
        schedule.upcoming(Utc).take(count).map(|t| t.weekday()).collect()
    }

    #[test]
    fn sunday_is_zero_or_seven() {
        for expression in ["0 9 * * 0", "0 9 * * 7", "0 9 * * sun"] {
            let days = fire_days(expression, 3);
            assert!(days.iter().all(|d| *d == Weekday::Sun), "{expression}: {days:?}");
        }
    }

    #[test]
    fn weekday_range_fires_monday_to_friday() {
        let days: HashSet<Weekday> = fire_days("0 9 * * 1-5", 15).into_iter().collect();
        let expected: HashSet<Weekday> = [
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
        ]
        .into();
        assert_eq!(days, expected);
    }

    #[test]
    fn day_of_week_lists_ranges_and_steps() {
        assert_eq!(day_of_week_field("1-5").unwrap(), "Mon,Tue,Wed,Thu,Fri");
        assert_eq!(day_of_week_field("0,6").unwrap(), "Sun,Sat");
        assert_eq!(day_of_week_field("*/2").unwrap(), "Sun,Tue,Thu,Sat");
        assert_eq!(day_of_week_field("1/3").unwrap(), "Mon,Thu");
        assert_eq!(day_of_week_field("5-7").unwrap(), "Sun,Fri,Sat");
        assert_eq!(day_of_week_field("Mon-Fri").unwrap(), "Mon,Tue,Wed,Thu,Fri");
        assert_eq!(day_of_week_field("0-7").unwrap(), "*");
        assert_eq!(day_of_week_field("*").unwrap(), "*");
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        for bad in [
            "",
            "not a cron",
            "61 * * * *",
            "* * *",
            "0 9 * * 8",
            "0 9 * * 5-1",
            "0 9 * * */0",
            "0 9 * * funday",
        ] {
            assert!(
                matches!(parse_cron(bad), Err(TriggerError::InvalidCron { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn re_registering_a_key_replaces_the_entry() {
        let (registry, _store, _jobs) = registry();
        let workflow_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();

        for cron in ["0 9 * * *", "0 10 * * *", "0 11 * * *"] {
            registry.register(workflow_id, "tick", cron, user_id).unwrap();
            assert_eq!(registry.len(), 1);
        }
        assert_eq!(registry.entries()[0].1, "0 11 * * *");

        assert!(registry
            .register(workflow_id, "tick", "bogus", user_id)
            .is_err());
        assert_eq!(registry.entries()[0].1, "0 11 * * *");

        assert!(registry.unregister(workflow_id, "tick"));
        assert!(!registry.unregister(workflow_id, "tick"));
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn tick_enqueues_a_schedule_job() {
        let (registry, store, jobs) = registry();
        let row = scheduled_workflow("* * * * * *", true);
        store.insert_workflow(row.clone());

        registry.register(row.id, "tick", "* * * * * *", row.user_id).unwrap();

        let job = tokio::time::timeout(Duration::from_secs(5), jobs.dequeue())
            .await
            .expect("no scheduled job")
            .unwrap()
            .unwrap();
        assert_eq!(job.id, job.payload.execution_id.to_string());
        assert_eq!(job.priority, Priority::Normal);
        assert_eq!(job.payload.triggered_by, TriggeredBy::Schedule);
        assert_eq!(job.payload.user_id, row.user_id);
        let metadata = job.payload.metadata.unwrap();
        assert_eq!(metadata.source.as_deref(), Some("schedule"));
        assert_eq!(metadata.node_id.as_deref(), Some("tick"));
        assert!(metadata.scheduled_time.is_some());

        registry.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn inactive_workflow_retires_its_entry() {
        let (registry, store, jobs) = registry();
        let row = scheduled_workflow("* * * * * *", false);
        store.insert_workflow(row.clone());

        registry.register(row.id, "tick", "* * * * * *", row.user_id).unwrap();

        assert!(eventually(|| registry.is_empty()).await);
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn start_registers_active_workflows_and_follows_refreshes() {
        let (registry, store, _jobs) = registry();
        let bus = Arc::new(MemoryBus::new());
        let mut active = scheduled_workflow("0 9 * * *", true);
        store.insert_workflow(active.clone());
        store.insert_workflow(scheduled_workflow("0 9 * * *", false));

        assert_eq!(registry.start(bus.clone()).await.unwrap(), 1);
        assert_eq!(
            registry.entries(),
            vec![(
                ScheduleKey {
                    workflow_id: active.id,
                    node_id: "tick".into()
                },
                "0 9 * * *".to_owned()
            )]
        );

        // Cron edit.
        active.nodes[0]["data"]["cronExpression"] = json!("15 7 * * *");
        WorkflowStore::update(store.as_ref(), &active).await.unwrap();
        bus.publish(SCHEDULE_REFRESH_CHANNEL, json!({ "workflowId": active.id }))
            .await
            .unwrap();
        assert!(eventually(|| registry.entries().first().map(|e| e.1.as_str()) == Some("15 7 * * *")).await);

        // Deactivation.
        active.active = false;
        WorkflowStore::update(store.as_ref(), &active).await.unwrap();
        assert_eq!(registry.refresh(active.id).await.unwrap(), 0);
        assert!(registry.is_empty());

        registry.shutdown();
        assert!(matches!(
            registry.register(active.id, "tick", "0 9 * * *", active.user_id),
            Err(TriggerError::ShutDown)
        ));
    }
}
