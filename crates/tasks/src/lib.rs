//! tollgate_tasks
//!
//! Task marketplace with claim/complete semantics. Tasks live in memory
//! and are retained indefinitely; every lifecycle transition also appends
//! an event to a dedicated lineage chain so the history is tamper-evident
//! the same way the audit log is.
//!
//! State machine:
//!   available --claim--> claimed --> completed (complete, also from in_progress)
//!   available --cancel--> cancelled

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tollgate_chain::{Chain, ChainError};
use tollgate_common::MonotoneClock;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task {0} not found")]
    NotFound(Uuid),
    #[error("task {id} is {status:?}, not available")]
    NotAvailable { id: Uuid, status: TaskStatus },
    #[error("task {id} is {status:?}, not claimable as complete")]
    NotCompletable { id: Uuid, status: TaskStatus },
    #[error("lineage error: {0}")]
    Lineage(#[from] ChainError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Available,
    Claimed,
    InProgress,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub priority: Priority,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    pub created_ns: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_ns: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_ns: Option<u64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Creation payload, as posted to the marketplace.
#[derive(Debug, Clone, Deserialize)]
pub struct NewTask {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub skills: Vec<String>,
}

/// Equality filters for listings.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub agent: Option<String>,
}

impl TaskFilter {
    fn matches(&self, task: &Task) -> bool {
        if let Some(status) = self.status {
            if task.status != status {
                return false;
            }
        }
        if let Some(priority) = self.priority {
            if task.priority != priority {
                return false;
            }
        }
        if let Some(agent) = &self.agent {
            if task.agent.as_deref() != Some(agent.as_str()) {
                return false;
            }
        }
        true
    }
}

pub struct TaskStore {
    tasks: Mutex<HashMap<Uuid, Task>>,
    lineage: Arc<Chain>,
    clock: MonotoneClock,
}

impl TaskStore {
    pub fn new(lineage: Arc<Chain>) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            lineage,
            clock: MonotoneClock::new(),
        }
    }

    pub fn lineage(&self) -> &Chain {
        &self.lineage
    }

    pub fn create(&self, new: NewTask) -> Result<Task, TaskError> {
        let task = Task {
            id: Uuid::new_v4(),
            title: new.title,
            description: new.description,
            priority: new.priority,
            status: TaskStatus::Available,
            agent: None,
            created_ns: self.clock.now_ns(),
            claimed_ns: None,
            completed_ns: None,
            tags: new.tags,
            skills: new.skills,
            summary: None,
        };
        self.lineage.append(json!({
            "event": "task_created",
            "task_id": task.id,
            "title": task.title,
            "priority": task.priority,
        }))?;
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.insert(task.id, task.clone());
        Ok(task)
    }

    pub fn get(&self, id: Uuid) -> Option<Task> {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.get(&id).cloned()
    }

    /// available -> claimed. Any other starting state is a conflict.
    pub fn claim(&self, id: Uuid, agent: &str) -> Result<Task, TaskError> {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let task = tasks.get_mut(&id).ok_or(TaskError::NotFound(id))?;
        if task.status != TaskStatus::Available {
            return Err(TaskError::NotAvailable {
                id,
                status: task.status,
            });
        }
        task.status = TaskStatus::Claimed;
        task.agent = Some(agent.to_string());
        task.claimed_ns = Some(self.clock.now_ns());
        let snapshot = task.clone();
        drop(tasks);
        self.lineage.append(json!({
            "event": "task_claimed",
            "task_id": id,
            "agent": agent,
        }))?;
        Ok(snapshot)
    }

    /// claimed|in_progress -> completed, recording agent + summary.
    pub fn complete(
        &self,
        id: Uuid,
        agent: &str,
        summary: Option<String>,
    ) -> Result<Task, TaskError> {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let task = tasks.get_mut(&id).ok_or(TaskError::NotFound(id))?;
        if !matches!(task.status, TaskStatus::Claimed | TaskStatus::InProgress) {
            return Err(TaskError::NotCompletable {
                id,
                status: task.status,
            });
        }
        task.status = TaskStatus::Completed;
        task.agent = Some(agent.to_string());
        task.completed_ns = Some(self.clock.now_ns());
        task.summary = summary.clone();
        let snapshot = task.clone();
        drop(tasks);
        self.lineage.append(json!({
            "event": "task_completed",
            "task_id": id,
            "agent": agent,
            "summary": summary,
        }))?;
        Ok(snapshot)
    }

    /// available -> cancelled.
    pub fn cancel(&self, id: Uuid) -> Result<Task, TaskError> {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let task = tasks.get_mut(&id).ok_or(TaskError::NotFound(id))?;
        if task.status != TaskStatus::Available {
            return Err(TaskError::NotAvailable {
                id,
                status: task.status,
            });
        }
        task.status = TaskStatus::Cancelled;
        let snapshot = task.clone();
        drop(tasks);
        self.lineage.append(json!({
            "event": "task_cancelled",
            "task_id": id,
        }))?;
        Ok(snapshot)
    }

    /// Priority descending (critical first), then creation time ascending.
    pub fn list(&self, filter: &TaskFilter, limit: usize, offset: usize) -> (Vec<Task>, usize) {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let mut matches: Vec<Task> = tasks.values().filter(|t| filter.matches(t)).cloned().collect();
        matches.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_ns.cmp(&b.created_ns))
        });
        let total = matches.len();
        let page = matches.into_iter().skip(offset).take(limit).collect();
        (page, total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> TaskStore {
        TaskStore::new(Arc::new(Chain::in_memory()))
    }

    fn new_task(title: &str, priority: Priority) -> NewTask {
        NewTask {
            title: title.to_string(),
            description: String::new(),
            priority,
            tags: vec![],
            skills: vec![],
        }
    }

    #[test]
    fn lifecycle_happy_path() {
        let store = store();
        let t = store.create(new_task("T", Priority::High)).unwrap();
        assert_eq!(t.status, TaskStatus::Available);

        let claimed = store.claim(t.id, "agent-a").unwrap();
        assert_eq!(claimed.status, TaskStatus::Claimed);
        assert_eq!(claimed.agent.as_deref(), Some("agent-a"));
        assert!(claimed.claimed_ns.is_some());

        let done = store
            .complete(t.id, "agent-a", Some("done".to_string()))
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.summary.as_deref(), Some("done"));
        assert!(done.completed_ns.unwrap() > done.claimed_ns.unwrap());
    }

    #[test]
    fn second_claim_conflicts() {
        let store = store();
        let t = store.create(new_task("T", Priority::High)).unwrap();
        store.claim(t.id, "agent-a").unwrap();
        let err = store.claim(t.id, "agent-b").unwrap_err();
        assert!(matches!(err, TaskError::NotAvailable { .. }));
        // holder unchanged
        assert_eq!(store.get(t.id).unwrap().agent.as_deref(), Some("agent-a"));
    }

    #[test]
    fn complete_requires_claimed_or_in_progress() {
        let store = store();
        let t = store.create(new_task("T", Priority::Low)).unwrap();
        let err = store.complete(t.id, "agent-a", None).unwrap_err();
        assert!(matches!(err, TaskError::NotCompletable { .. }));
    }

    #[test]
    fn complete_accepts_in_progress() {
        let store = store();
        let t = store.create(new_task("T", Priority::Low)).unwrap();
        store.claim(t.id, "agent-a").unwrap();
        {
            let mut tasks = store.tasks.lock().unwrap();
            tasks.get_mut(&t.id).unwrap().status = TaskStatus::InProgress;
        }
        let done = store.complete(t.id, "agent-a", None).unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
    }

    #[test]
    fn cancel_only_from_available() {
        let store = store();
        let t = store.create(new_task("T", Priority::Low)).unwrap();
        store.claim(t.id, "agent-a").unwrap();
        assert!(store.cancel(t.id).is_err());

        let u = store.create(new_task("U", Priority::Low)).unwrap();
        assert_eq!(store.cancel(u.id).unwrap().status, TaskStatus::Cancelled);
    }

    #[test]
    fn listing_orders_priority_then_age() {
        let store = store();
        let low = store.create(new_task("low", Priority::Low)).unwrap();
        let crit_old = store.create(new_task("crit-old", Priority::Critical)).unwrap();
        let high = store.create(new_task("high", Priority::High)).unwrap();
        let crit_new = store.create(new_task("crit-new", Priority::Critical)).unwrap();

        let (tasks, total) = store.list(&TaskFilter::default(), 100, 0);
        assert_eq!(total, 4);
        let ids: Vec<Uuid> = tasks.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![crit_old.id, crit_new.id, high.id, low.id]);
    }

    #[test]
    fn listing_filters_and_paginates() {
        let store = store();
        for i in 0..6 {
            let t = store.create(new_task(&format!("t{i}"), Priority::Medium)).unwrap();
            if i % 2 == 0 {
                store.claim(t.id, "agent-a").unwrap();
            }
        }
        let (claimed, total) = store.list(
            &TaskFilter {
                status: Some(TaskStatus::Claimed),
                ..Default::default()
            },
            100,
            0,
        );
        assert_eq!(total, 3);
        assert!(claimed.iter().all(|t| t.status == TaskStatus::Claimed));

        let (by_agent, _) = store.list(
            &TaskFilter {
                agent: Some("agent-a".to_string()),
                ..Default::default()
            },
            2,
            2,
        );
        assert_eq!(by_agent.len(), 1);
    }

    #[test]
    fn lifecycle_events_land_on_the_lineage_chain() {
        let store = store();
        let t = store.create(new_task("T", Priority::High)).unwrap();
        store.claim(t.id, "agent-a").unwrap();
        store.complete(t.id, "agent-a", Some("ok".to_string())).unwrap();

        assert_eq!(store.lineage().len(), 3);
        let report = store.lineage().verify();
        assert!(report.valid);

        let (events, _) = store.lineage().list(
            &tollgate_chain::ListFilter::default().field("event", "task_claimed"),
            10,
            0,
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].content["agent"], "agent-a");
    }
}
