use chrono::Utc;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use taskhive_core::{Capability, Task, TaskPriority};
use tracing::{debug, warn};
use uuid::Uuid;

/// Default queue capacity when none is given.
const DEFAULT_MAX_SIZE: usize = 10_000;

/// Cap on the age bonus a task can accrue while waiting.
const MAX_AGE_BONUS: f64 = 1.0;
/// Cap on the retry bonus.
const MAX_RETRY_BONUS: f64 = 1.0;

/// A heap entry ordering tasks by dispatch score.
///
/// Lower score dequeues first; ties break on the monotonic sequence number
/// so equal-score tasks leave in insertion order.
#[derive(Debug, Clone)]
struct QueueEntry {
    score: f64,
    seq: u64,
    task_id: Uuid,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: invert so the lowest score (and then the
        // lowest sequence number) is popped first.
        other
            .score
            .total_cmp(&self.score)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority-ordered holding area for tasks awaiting dispatch.
///
/// Tasks whose `scheduled_at` lies in the future are parked in a deferred
/// map and promoted lazily on every queue operation. The queue is bounded;
/// [`PriorityTaskQueue::enqueue`] fails closed when full.
pub struct PriorityTaskQueue {
    heap: BinaryHeap<QueueEntry>,
    tasks: HashMap<Uuid, Task>,
    deferred: HashMap<Uuid, Task>,
    seq: u64,
    max_size: usize,
}

impl PriorityTaskQueue {
    /// Create a queue with the default capacity.
    pub fn new() -> Self {
        Self::with_max_size(DEFAULT_MAX_SIZE)
    }

    /// Create a queue bounded to `max_size` tasks (immediate + deferred).
    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            tasks: HashMap::new(),
            deferred: HashMap::new(),
            seq: 0,
            max_size,
        }
    }

    /// Dispatch score for a task: `(6 - priority) - ageBonus - retryBonus`.
    /// Lower dequeues first.
    pub fn dispatch_score(task: &Task) -> f64 {
        let base = 6.0 - f64::from(task.priority.ordinal());
        let age_hours = task.age_secs(Utc::now()).max(0) as f64 / 3600.0;
        let age_bonus = (age_hours * 0.1).min(MAX_AGE_BONUS);
        let retry_bonus = (f64::from(task.retry_count) * 0.2).min(MAX_RETRY_BONUS);
        base - age_bonus - retry_bonus
    }

    /// Add a task. Returns `false` (and drops nothing) when the queue is at
    /// capacity — the caller decides whether to retry, reject, or shed load.
    pub fn enqueue(&mut self, task: Task) -> bool {
        self.promote_due();
        if self.len() >= self.max_size {
            warn!(task_id = %task.id, max_size = self.max_size, "queue full, rejecting task");
            return false;
        }
        let now = Utc::now();
        if task.is_deferred(now) {
            debug!(task_id = %task.id, scheduled_at = ?task.scheduled_at, "deferring task");
            self.deferred.insert(task.id, task);
            return true;
        }
        self.push_ready(task);
        true
    }

    fn push_ready(&mut self, task: Task) {
        let entry = QueueEntry {
            score: Self::dispatch_score(&task),
            seq: self.seq,
            task_id: task.id,
        };
        self.seq += 1;
        self.tasks.insert(task.id, task);
        self.heap.push(entry);
    }

    /// Remove and return the best-scored task, optionally restricted to
    /// tasks whose `agent_type` matches one of `required_capabilities`.
    ///
    /// Non-matching tasks are held aside and pushed back with their original
    /// score and sequence, so the rest of the queue is not reordered.
    pub fn dequeue(&mut self, required_capabilities: Option<&[Capability]>) -> Option<Task> {
        self.dequeue_where(required_capabilities, |_| true)
    }

    /// Like [`PriorityTaskQueue::dequeue`], but the task must also pass
    /// `eligible`. Rejected tasks keep their original heap entry, so a
    /// skipped task never loses its FIFO position among equal scores.
    pub fn dequeue_where(
        &mut self,
        required_capabilities: Option<&[Capability]>,
        mut eligible: impl FnMut(&Task) -> bool,
    ) -> Option<Task> {
        self.promote_due();
        let mut skipped: Vec<QueueEntry> = Vec::new();
        let mut found: Option<Task> = None;

        while let Some(entry) = self.heap.pop() {
            // Stale entry: the task was removed out of band.
            let Some(task) = self.tasks.get(&entry.task_id) else {
                continue;
            };
            if Self::matches_filter(task, required_capabilities) && eligible(task) {
                found = self.tasks.remove(&entry.task_id);
                break;
            }
            skipped.push(entry);
        }

        for entry in skipped {
            self.heap.push(entry);
        }
        found
    }

    fn matches_filter(task: &Task, required: Option<&[Capability]>) -> bool {
        let Some(caps) = required else { return true };
        match &task.agent_type {
            None => true,
            Some(needed) => caps.iter().any(|c| c.matches(needed)),
        }
    }

    /// The next `n` tasks in dequeue order, without removing them.
    pub fn peek(&mut self, n: usize) -> Vec<Task> {
        self.promote_due();
        let mut entries: Vec<&QueueEntry> = self
            .heap
            .iter()
            .filter(|e| self.tasks.contains_key(&e.task_id))
            .collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries
            .into_iter()
            .take(n)
            .filter_map(|e| self.tasks.get(&e.task_id).cloned())
            .collect()
    }

    /// Number of held tasks, immediate and deferred.
    pub fn len(&self) -> usize {
        self.tasks.len() + self.deferred.len()
    }

    /// Whether the queue holds no tasks at all.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty() && self.deferred.is_empty()
    }

    /// Remove a task by ID from either the immediate or deferred store.
    pub fn remove(&mut self, task_id: Uuid) -> bool {
        // The heap entry (if any) becomes stale and is skipped on pop.
        self.tasks.remove(&task_id).is_some() || self.deferred.remove(&task_id).is_some()
    }

    /// All held tasks with the given static priority, deferred included.
    pub fn tasks_by_priority(&self, priority: TaskPriority) -> Vec<Task> {
        self.tasks
            .values()
            .chain(self.deferred.values())
            .filter(|t| t.priority == priority)
            .cloned()
            .collect()
    }

    /// Count of held tasks per priority level.
    pub fn priority_breakdown(&self) -> HashMap<TaskPriority, usize> {
        let mut counts = HashMap::new();
        for task in self.tasks.values().chain(self.deferred.values()) {
            *counts.entry(task.priority).or_insert(0) += 1;
        }
        counts
    }

    /// Whether the queue currently holds the given task.
    pub fn contains(&self, task_id: Uuid) -> bool {
        self.tasks.contains_key(&task_id) || self.deferred.contains_key(&task_id)
    }

    /// Promote deferred tasks whose scheduled time has arrived. Called
    /// lazily from every queue operation instead of a timer thread.
    fn promote_due(&mut self) {
        if self.deferred.is_empty() {
            return;
        }
        let now = Utc::now();
        let due: Vec<Uuid> = self
            .deferred
            .values()
            .filter(|t| !t.is_deferred(now))
            .map(|t| t.id)
            .collect();
        for id in due {
            if let Some(task) = self.deferred.remove(&id) {
                debug!(task_id = %id, "promoting deferred task");
                self.push_ready(task);
            }
        }
    }
}

impl Default for PriorityTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_empty_queue() {
        let mut queue = PriorityTaskQueue::new();
        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);
        assert!(queue.dequeue(None).is_none());
    }

    #[test]
    fn test_priority_order() {
        let mut queue = PriorityTaskQueue::new();
        queue.enqueue(Task::new("low").with_priority(TaskPriority::Low));
        queue.enqueue(Task::new("critical").with_priority(TaskPriority::Critical));
        queue.enqueue(Task::new("normal").with_priority(TaskPriority::Normal));

        assert_eq!(queue.dequeue(None).unwrap().name, "critical");
        assert_eq!(queue.dequeue(None).unwrap().name, "normal");
        assert_eq!(queue.dequeue(None).unwrap().name, "low");
    }

    #[test]
    fn test_fifo_tie_break() {
        let mut queue = PriorityTaskQueue::new();
        for i in 0..5 {
            queue.enqueue(Task::new(format!("task-{i}")));
        }
        for i in 0..5 {
            assert_eq!(queue.dequeue(None).unwrap().name, format!("task-{i}"));
        }
    }

    #[test]
    fn test_retry_bonus_bumps_order() {
        let mut queue = PriorityTaskQueue::new();
        queue.enqueue(Task::new("fresh"));
        let mut retried = Task::new("retried");
        retried.retry_count = 3;
        queue.enqueue(retried);
        // Same static priority, but the retried task scores lower (dequeues first).
        assert_eq!(queue.dequeue(None).unwrap().name, "retried");
    }

    #[test]
    fn test_capability_filter_skips_without_reordering() {
        let mut queue = PriorityTaskQueue::new();
        queue.enqueue(
            Task::new("needs-gpu")
                .with_priority(TaskPriority::Critical)
                .with_agent_type("gpu"),
        );
        queue.enqueue(Task::new("any-a").with_priority(TaskPriority::Normal));
        queue.enqueue(Task::new("any-b").with_priority(TaskPriority::Normal));

        // A cpu-only dequeue must skip the gpu task but not lose it.
        let caps = vec![Capability::new("cpu")];
        assert_eq!(queue.dequeue(Some(&caps)).unwrap().name, "any-a");
        assert_eq!(queue.len(), 2);

        // An unfiltered dequeue still sees the gpu task first (highest priority).
        assert_eq!(queue.dequeue(None).unwrap().name, "needs-gpu");
        assert_eq!(queue.dequeue(None).unwrap().name, "any-b");
    }

    #[test]
    fn test_capability_filter_never_returns_mismatch() {
        let mut queue = PriorityTaskQueue::new();
        queue.enqueue(Task::new("needs-gpu").with_agent_type("gpu"));
        let caps = vec![Capability::new("cpu")];
        assert!(queue.dequeue(Some(&caps)).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_dequeue_where_preserves_skipped_entries() {
        let mut queue = PriorityTaskQueue::new();
        queue.enqueue(Task::new("first"));
        queue.enqueue(Task::new("second"));

        // Nothing eligible: the queue is untouched.
        assert!(queue.dequeue_where(None, |_| false).is_none());
        assert_eq!(queue.len(), 2);

        // FIFO order among equal scores survived the skip.
        assert_eq!(
            queue.dequeue_where(None, |t| t.name == "second").unwrap().name,
            "second"
        );
        assert_eq!(queue.dequeue(None).unwrap().name, "first");
    }

    #[test]
    fn test_hierarchical_capability_dequeue() {
        let mut queue = PriorityTaskQueue::new();
        queue.enqueue(Task::new("rust-task").with_agent_type("code.rust"));
        let caps = vec![Capability::new("code")];
        assert_eq!(queue.dequeue(Some(&caps)).unwrap().name, "rust-task");
    }

    #[test]
    fn test_deferred_promotion() {
        let mut queue = PriorityTaskQueue::new();
        let future = Task::new("later").scheduled_for(Utc::now() + Duration::hours(1));
        let past = Task::new("due").scheduled_for(Utc::now() - Duration::seconds(1));
        queue.enqueue(future);
        queue.enqueue(past);

        assert_eq!(queue.len(), 2);
        // Only the due task is dispatchable.
        assert_eq!(queue.dequeue(None).unwrap().name, "due");
        assert!(queue.dequeue(None).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_bounded_enqueue_fails_closed() {
        let mut queue = PriorityTaskQueue::with_max_size(2);
        assert!(queue.enqueue(Task::new("a")));
        assert!(queue.enqueue(Task::new("b")));
        assert!(!queue.enqueue(Task::new("c")));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_remove() {
        let mut queue = PriorityTaskQueue::new();
        let task = Task::new("removable");
        let id = task.id;
        queue.enqueue(task);

        assert!(queue.remove(id));
        assert!(!queue.remove(id));
        assert!(queue.dequeue(None).is_none());
    }

    #[test]
    fn test_remove_deferred() {
        let mut queue = PriorityTaskQueue::new();
        let task = Task::new("deferred").scheduled_for(Utc::now() + Duration::hours(1));
        let id = task.id;
        queue.enqueue(task);
        assert!(queue.remove(id));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_peek_preserves_queue() {
        let mut queue = PriorityTaskQueue::new();
        queue.enqueue(Task::new("low").with_priority(TaskPriority::Low));
        queue.enqueue(Task::new("high").with_priority(TaskPriority::High));

        let peeked = queue.peek(2);
        assert_eq!(peeked.len(), 2);
        assert_eq!(peeked[0].name, "high");
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_tasks_by_priority() {
        let mut queue = PriorityTaskQueue::new();
        queue.enqueue(Task::new("a").with_priority(TaskPriority::High));
        queue.enqueue(Task::new("b").with_priority(TaskPriority::High));
        queue.enqueue(Task::new("c").with_priority(TaskPriority::Low));

        assert_eq!(queue.tasks_by_priority(TaskPriority::High).len(), 2);
        assert_eq!(queue.tasks_by_priority(TaskPriority::Low).len(), 1);
        assert_eq!(queue.tasks_by_priority(TaskPriority::Critical).len(), 0);
    }

    #[test]
    fn test_priority_breakdown() {
        let mut queue = PriorityTaskQueue::new();
        queue.enqueue(Task::new("a").with_priority(TaskPriority::High));
        queue.enqueue(Task::new("b"));
        let counts = queue.priority_breakdown();
        assert_eq!(counts.get(&TaskPriority::High), Some(&1));
        assert_eq!(counts.get(&TaskPriority::Normal), Some(&1));
    }
}
