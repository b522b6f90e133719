//! Task Scheduler.
//!
//! Tracks every unfinished task in memory, indexed by placeable and by the
//! instant it next becomes eligible for a sweep. The durable copy of each task
//! lives in the store; the scheduler is rebuilt from it on start.
//!
//! A due task is claimed by a sweep before its effect is committed. Claiming
//! moves it from `Pending` to `Completing` and takes it out of the due index,
//! so a concurrent sweep that observed the same task gets nothing to do.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use crate::config::RetryPolicy;
use crate::error::{CoreError, CoreResult};
use crate::models::*;

struct Entry {
    task: Task,
    /// When the task is next eligible for a sweep.
    due_at: DateTime<Utc>,
    /// Claimed by a sweep that has not reported back yet.
    in_flight: bool,
}

#[derive(Default)]
struct SchedulerState {
    tasks: HashMap<TaskId, Entry>,
    by_placeable: HashMap<PlaceableId, TaskId>,
    due: BTreeSet<(DateTime<Utc>, TaskId)>,
    failed: BTreeMap<TaskId, FailedTask>,
}

impl SchedulerState {
    fn insert(&mut self, task: Task, due_at: DateTime<Utc>) {
        self.by_placeable.insert(task.placeable_id, task.id);
        self.due.insert((due_at, task.id));
        self.tasks.insert(
            task.id,
            Entry {
                task,
                due_at,
                in_flight: false,
            },
        );
    }

    fn remove(&mut self, id: TaskId) -> Option<Task> {
        let entry = self.tasks.remove(&id)?;
        self.due.remove(&(entry.due_at, id));
        if self.by_placeable.get(&entry.task.placeable_id) == Some(&id) {
            self.by_placeable.remove(&entry.task.placeable_id);
        }
        Some(entry.task)
    }
}

/// What happened to a task whose commit failed.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Back in the due index, eligible again at `at`.
    Retry { at: DateTime<Utc>, attempts: u32 },
    /// Attempts exhausted; the task is now surfaced as failed.
    Failed(FailedTask),
}

#[derive(Default)]
pub struct TaskScheduler {
    state: Mutex<SchedulerState>,
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted tasks. Active tasks become due at their
    /// completion time; failed ones are surfaced again.
    pub fn load(&self, tasks: Vec<Task>) -> usize {
        let mut state = self.state.lock().expect("scheduler lock poisoned");
        let mut loaded = 0;
        for task in tasks {
            match task.status {
                TaskStatus::Pending | TaskStatus::Completing => {
                    if state.by_placeable.contains_key(&task.placeable_id) {
                        tracing::warn!(
                            task_id = %task.id,
                            placeable_id = %task.placeable_id,
                            "Skipping second active task for placeable"
                        );
                        continue;
                    }
                    let due_at = task.completes_at();
                    state.insert(task, due_at);
                    loaded += 1;
                }
                TaskStatus::Failed => {
                    let failed_at = task.completes_at();
                    state.failed.insert(
                        task.id,
                        FailedTask {
                            task,
                            reason: "completion could not be committed".to_string(),
                            failed_at,
                        },
                    );
                }
                TaskStatus::Applied | TaskStatus::Cancelled => {}
            }
        }
        loaded
    }

    /// Schedule a new task on a placeable that has no active task.
    pub fn schedule(
        &self,
        placeable_id: PlaceableId,
        kind: TaskKind,
        duration: Duration,
        params: TaskParams,
    ) -> CoreResult<TaskId> {
        let task = Task {
            id: TaskId::new(),
            owner: params.owner,
            placeable_id,
            kind,
            used_crystals: params.used_crystals,
            to_level: params.to_level,
            started_at: params.started_at,
            duration_secs: duration.num_seconds(),
            status: TaskStatus::Pending,
            attempts: 0,
        };
        let id = task.id;
        self.track(task)?;
        Ok(id)
    }

    /// Start tracking a task created elsewhere, e.g. by a store transaction
    /// that also created its placeable.
    pub fn track(&self, task: Task) -> CoreResult<()> {
        validate(&task)?;

        let mut state = self.state.lock().expect("scheduler lock poisoned");
        if let Some(existing) = state.by_placeable.get(&task.placeable_id) {
            return Err(CoreError::conflict(format!(
                "placeable {} already has active task {}",
                task.placeable_id, existing
            )));
        }
        if state.tasks.contains_key(&task.id) {
            return Err(CoreError::conflict(format!("task {} already exists", task.id)));
        }

        tracing::debug!(
            task_id = %task.id,
            placeable_id = %task.placeable_id,
            kind = task.kind.as_str(),
            completes_at = %task.completes_at(),
            "Task scheduled"
        );
        let due_at = task.completes_at();
        state.insert(task, due_at);
        Ok(())
    }

    pub fn get(&self, id: TaskId) -> Option<Task> {
        let state = self.state.lock().expect("scheduler lock poisoned");
        state.tasks.get(&id).map(|e| e.task.clone())
    }

    pub fn for_placeable(&self, placeable_id: PlaceableId) -> Option<Task> {
        let state = self.state.lock().expect("scheduler lock poisoned");
        state
            .by_placeable
            .get(&placeable_id)
            .and_then(|id| state.tasks.get(id))
            .map(|e| e.task.clone())
    }

    /// Remove a task without applying it. Crystals spent on it are not
    /// refunded. A task whose completion is being committed right now cannot
    /// be cancelled.
    pub fn cancel(&self, id: TaskId) -> CoreResult<Task> {
        let mut state = self.state.lock().expect("scheduler lock poisoned");
        match state.tasks.get(&id) {
            None => return Err(CoreError::not_found(format!("task {}", id))),
            Some(entry) if entry.in_flight => {
                return Err(CoreError::conflict(format!("task {} is being completed", id)))
            }
            Some(_) => {}
        }
        let mut task = state
            .remove(id)
            .ok_or_else(|| CoreError::not_found(format!("task {}", id)))?;
        task.status = TaskStatus::Cancelled;
        tracing::debug!(task_id = %id, "Task cancelled");
        Ok(task)
    }

    /// Put a cancelled task back, used when removing its durable row failed.
    pub fn restore(&self, mut task: Task) -> CoreResult<()> {
        task.status = TaskStatus::Pending;
        self.track(task)
    }

    /// Forget a task without any status change, used to revert a schedule
    /// whose durable write failed.
    pub fn remove(&self, id: TaskId) -> Option<Task> {
        let mut state = self.state.lock().expect("scheduler lock poisoned");
        state.remove(id)
    }

    /// Tasks eligible for a sweep at `now`, in completion order (ties broken by
    /// task id). The sequence is evaluated lazily against live state; calling
    /// again restarts it.
    pub fn due_tasks(&self, now: DateTime<Utc>) -> DueTasks<'_> {
        DueTasks {
            scheduler: self,
            now,
            owner: None,
            cursor: None,
        }
    }

    /// Like [`Self::due_tasks`], restricted to one island.
    pub fn due_tasks_for(&self, owner: PlayerId, now: DateTime<Utc>) -> DueTasks<'_> {
        DueTasks {
            scheduler: self,
            now,
            owner: Some(owner),
            cursor: None,
        }
    }

    /// Take a due task for completion. Returns `None` if it is not due, is
    /// already claimed, or is gone.
    pub fn claim(&self, id: TaskId, now: DateTime<Utc>) -> Option<Task> {
        let mut state = self.state.lock().expect("scheduler lock poisoned");
        let entry = state.tasks.get(&id)?;
        if entry.in_flight || entry.due_at > now {
            return None;
        }
        let due_at = entry.due_at;
        state.due.remove(&(due_at, id));

        let entry = state.tasks.get_mut(&id)?;
        entry.in_flight = true;
        entry.task.status = TaskStatus::Completing;
        Some(entry.task.clone())
    }

    /// The claimed task's effect is committed; drop it.
    pub fn complete(&self, id: TaskId) -> Option<Task> {
        let mut state = self.state.lock().expect("scheduler lock poisoned");
        let mut task = state.remove(id)?;
        task.status = TaskStatus::Applied;
        Some(task)
    }

    /// Record a failed commit of a claimed task. The task goes back in the due
    /// index after a backoff, or is marked failed once the policy is exhausted.
    pub fn retry_later(
        &self,
        id: TaskId,
        reason: &str,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> Option<RetryDecision> {
        let mut state = self.state.lock().expect("scheduler lock poisoned");
        let attempts = {
            let entry = state.tasks.get_mut(&id)?;
            entry.task.attempts += 1;
            entry.task.attempts
        };

        if policy.exhausted(attempts) {
            drop(state);
            return self.fail(id, reason, now).map(RetryDecision::Failed);
        }

        let at = now + policy.backoff(attempts);
        if let Some(entry) = state.tasks.get_mut(&id) {
            entry.due_at = at;
            entry.in_flight = false;
        }
        state.due.insert((at, id));
        Some(RetryDecision::Retry { at, attempts })
    }

    /// Mark a task failed without further retries.
    pub fn fail(&self, id: TaskId, reason: &str, now: DateTime<Utc>) -> Option<FailedTask> {
        let mut state = self.state.lock().expect("scheduler lock poisoned");
        let mut task = state.remove(id)?;
        task.status = TaskStatus::Failed;
        let failed = FailedTask {
            task,
            reason: reason.to_string(),
            failed_at: now,
        };
        state.failed.insert(id, failed.clone());
        tracing::warn!(task_id = %id, reason, "Task failed");
        Some(failed)
    }

    /// Active tasks on one island, in completion order.
    pub fn active_for(&self, owner: PlayerId) -> Vec<Task> {
        let state = self.state.lock().expect("scheduler lock poisoned");
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|e| e.task.owner == owner)
            .map(|e| e.task.clone())
            .collect();
        tasks.sort_by_key(|t| (t.completes_at(), t.id));
        tasks
    }

    pub fn failed_for(&self, owner: PlayerId) -> Vec<FailedTask> {
        let state = self.state.lock().expect("scheduler lock poisoned");
        state
            .failed
            .values()
            .filter(|f| f.task.owner == owner)
            .cloned()
            .collect()
    }

    /// Acknowledge a failed task so it stops being surfaced.
    pub fn dismiss_failed(&self, owner: PlayerId, id: TaskId) -> CoreResult<FailedTask> {
        let mut state = self.state.lock().expect("scheduler lock poisoned");
        match state.failed.get(&id) {
            Some(f) if f.task.owner == owner => {}
            _ => return Err(CoreError::not_found(format!("failed task {}", id))),
        }
        state
            .failed
            .remove(&id)
            .ok_or_else(|| CoreError::not_found(format!("failed task {}", id)))
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("scheduler lock poisoned").tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn validate(task: &Task) -> CoreResult<()> {
    if task.used_crystals < 0 {
        return Err(CoreError::validation(format!(
            "used_crystals must be >= 0, got {}",
            task.used_crystals
        )));
    }
    if task.to_level < 0 {
        return Err(CoreError::validation(format!(
            "to_level must be >= 0, got {}",
            task.to_level
        )));
    }
    if task.duration_secs < 0 {
        return Err(CoreError::validation(format!(
            "duration must be >= 0, got {}s",
            task.duration_secs
        )));
    }
    if let TaskKind::Mine { yield_amount } = task.kind {
        if yield_amount < 0 {
            return Err(CoreError::validation(format!(
                "yield must be >= 0, got {}",
                yield_amount
            )));
        }
    }
    Ok(())
}

/// Lazy cursor over due tasks. See [`TaskScheduler::due_tasks`].
pub struct DueTasks<'a> {
    scheduler: &'a TaskScheduler,
    now: DateTime<Utc>,
    owner: Option<PlayerId>,
    cursor: Option<(DateTime<Utc>, TaskId)>,
}

impl Iterator for DueTasks<'_> {
    type Item = Task;

    fn next(&mut self) -> Option<Task> {
        use std::ops::Bound::{Excluded, Unbounded};

        let state = self.scheduler.state.lock().expect("scheduler lock poisoned");
        let range = match self.cursor {
            Some(key) => state.due.range((Excluded(key), Unbounded)),
            None => state.due.range(..),
        };
        for &(due_at, id) in range {
            if due_at > self.now {
                return None;
            }
            self.cursor = Some((due_at, id));
            let Some(entry) = state.tasks.get(&id) else {
                continue;
            };
            if self.owner.is_some_and(|owner| owner != entry.task.owner) {
                continue;
            }
            return Some(entry.task.clone());
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(secs)
    }

    fn params(owner: i64) -> TaskParams {
        TaskParams {
            owner: PlayerId(owner),
            used_crystals: 10,
            to_level: 1,
            started_at: t(0),
        }
    }

    fn schedule(s: &TaskScheduler, placeable: i64, secs: i64) -> TaskId {
        s.schedule(
            PlaceableId(placeable),
            TaskKind::Build,
            Duration::seconds(secs),
            params(1),
        )
        .unwrap()
    }

    #[test]
    fn rejects_second_active_task_on_placeable() {
        let s = TaskScheduler::new();
        schedule(&s, 1, 30);

        let err = s
            .schedule(PlaceableId(1), TaskKind::Upgrade, Duration::seconds(5), params(1))
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn rejects_negative_params() {
        let s = TaskScheduler::new();
        let mut p = params(1);
        p.used_crystals = -1;
        let err = s
            .schedule(PlaceableId(1), TaskKind::Build, Duration::seconds(5), p)
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));

        let mut p = params(1);
        p.to_level = -1;
        assert!(s
            .schedule(PlaceableId(1), TaskKind::Build, Duration::seconds(5), p)
            .is_err());
        assert!(s.is_empty());
    }

    #[test]
    fn due_tasks_are_ordered_by_completion_then_id() {
        let s = TaskScheduler::new();
        let late = schedule(&s, 1, 20);
        let a = schedule(&s, 2, 10);
        let b = schedule(&s, 3, 10);
        schedule(&s, 4, 99);

        let due: Vec<TaskId> = s.due_tasks(t(20)).map(|t| t.id).collect();
        let mut same_time = vec![a, b];
        same_time.sort();
        assert_eq!(due, vec![same_time[0], same_time[1], late]);
    }

    #[test]
    fn due_tasks_is_restartable() {
        let s = TaskScheduler::new();
        schedule(&s, 1, 5);
        schedule(&s, 2, 6);

        let mut first = s.due_tasks(t(10));
        assert!(first.next().is_some());

        assert_eq!(s.due_tasks(t(10)).count(), 2);
        assert_eq!(s.due_tasks(t(5)).count(), 1);
        assert_eq!(s.due_tasks(t(4)).count(), 0);
    }

    #[test]
    fn claim_is_exclusive() {
        let s = TaskScheduler::new();
        let id = schedule(&s, 1, 30);

        assert!(s.claim(id, t(29)).is_none());

        let claimed = s.claim(id, t(30)).unwrap();
        assert_eq!(claimed.status, TaskStatus::Completing);
        assert!(s.claim(id, t(30)).is_none());
        assert_eq!(s.due_tasks(t(30)).count(), 0);

        let done = s.complete(id).unwrap();
        assert_eq!(done.status, TaskStatus::Applied);
        assert!(s.is_empty());
        assert!(s.for_placeable(PlaceableId(1)).is_none());
    }

    #[test]
    fn cancel_removes_without_refund_bookkeeping() {
        let s = TaskScheduler::new();
        let id = schedule(&s, 1, 30);

        let cancelled = s.cancel(id).unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert_eq!(cancelled.used_crystals, 10);
        assert!(matches!(s.cancel(id), Err(CoreError::NotFound(_))));

        // the placeable is free again
        schedule(&s, 1, 30);
    }

    #[test]
    fn cancel_refuses_in_flight_task() {
        let s = TaskScheduler::new();
        let id = schedule(&s, 1, 0);
        s.claim(id, t(0)).unwrap();
        assert!(matches!(s.cancel(id), Err(CoreError::Conflict(_))));
    }

    #[test]
    fn retries_back_off_then_fail() {
        let s = TaskScheduler::new();
        let policy = RetryPolicy {
            base_millis: 1000,
            max_millis: 60_000,
            max_attempts: 3,
        };
        let id = schedule(&s, 1, 0);

        s.claim(id, t(0)).unwrap();
        let decision = s.retry_later(id, "locked", t(0), &policy).unwrap();
        assert_eq!(decision, RetryDecision::Retry { at: t(1), attempts: 1 });
        assert!(s.claim(id, t(0)).is_none());

        s.claim(id, t(1)).unwrap();
        let decision = s.retry_later(id, "locked", t(1), &policy).unwrap();
        assert_eq!(decision, RetryDecision::Retry { at: t(3), attempts: 2 });

        s.claim(id, t(3)).unwrap();
        let RetryDecision::Failed(failed) = s.retry_later(id, "locked", t(3), &policy).unwrap()
        else {
            panic!("expected failure after exhausting attempts");
        };
        assert_eq!(failed.task.status, TaskStatus::Failed);
        assert_eq!(failed.task.attempts, 3);

        assert!(s.is_empty());
        assert_eq!(s.failed_for(PlayerId(1)).len(), 1);
        assert!(s.failed_for(PlayerId(2)).is_empty());

        assert!(s.dismiss_failed(PlayerId(2), id).is_err());
        s.dismiss_failed(PlayerId(1), id).unwrap();
        assert!(s.failed_for(PlayerId(1)).is_empty());
    }

    #[test]
    fn load_restores_active_and_failed() {
        let task = |placeable: i64, status| Task {
            id: TaskId::new(),
            owner: PlayerId(7),
            placeable_id: PlaceableId(placeable),
            kind: TaskKind::Upgrade,
            used_crystals: 0,
            to_level: 2,
            started_at: t(0),
            duration_secs: 60,
            status,
            attempts: 0,
        };

        let s = TaskScheduler::new();
        let loaded = s.load(vec![
            task(1, TaskStatus::Pending),
            task(2, TaskStatus::Completing),
            task(3, TaskStatus::Failed),
        ]);
        assert_eq!(loaded, 2);
        assert_eq!(s.active_for(PlayerId(7)).len(), 2);
        assert_eq!(s.failed_for(PlayerId(7)).len(), 1);
        assert_eq!(s.due_tasks_for(PlayerId(7), t(60)).count(), 2);
        assert_eq!(s.due_tasks_for(PlayerId(8), t(60)).count(), 0);
    }
}
