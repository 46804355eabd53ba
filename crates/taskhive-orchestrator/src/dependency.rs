use std::collections::{HashMap, HashSet, VecDeque};
use taskhive_core::{
    DependencyCondition, DependencyKind, ExecutionPlan, HiveError, HiveResult, Task,
    TaskDependency, TaskStatus,
};
use tracing::warn;
use uuid::Uuid;

/// Directed graph of task-to-task dependencies with cycle prevention,
/// readiness checks, and topological ordering.
///
/// The graph is the only authority on dependency edges; other components go
/// through this API rather than inspecting task structs directly. Task
/// statuses are cached here so readiness checks do not need the task store.
pub struct DependencyManager {
    /// task -> edges it depends on.
    edges: HashMap<Uuid, Vec<TaskDependency>>,
    /// task -> tasks that depend on it (reverse index).
    dependents: HashMap<Uuid, HashSet<Uuid>>,
    /// Cached task statuses, updated by the scheduler on every transition.
    statuses: HashMap<Uuid, TaskStatus>,
}

impl DependencyManager {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self {
            edges: HashMap::new(),
            dependents: HashMap::new(),
            statuses: HashMap::new(),
        }
    }

    /// Add a dependency edge: `task_id` depends on `dependency.depends_on`.
    ///
    /// Rejects self-dependencies and any edge that would create a cycle.
    /// The cycle check runs a reachability search *before* insertion, so the
    /// graph never holds a cyclic state, even transiently.
    pub fn add_dependency(&mut self, task_id: Uuid, dependency: TaskDependency) -> HiveResult<()> {
        if task_id == dependency.depends_on {
            return Err(HiveError::Dependency(format!(
                "task {task_id} cannot depend on itself"
            )));
        }
        if self.is_reachable(dependency.depends_on, task_id) {
            return Err(HiveError::Dependency(format!(
                "adding dependency {} -> {} would create a cycle",
                task_id, dependency.depends_on
            )));
        }
        let depends_on = dependency.depends_on;
        self.edges.entry(task_id).or_default().push(dependency);
        self.dependents.entry(depends_on).or_default().insert(task_id);
        Ok(())
    }

    /// Remove a dependency edge. Returns whether an edge was removed.
    pub fn remove_dependency(&mut self, task_id: Uuid, depends_on: Uuid) -> bool {
        let mut removed = false;
        if let Some(deps) = self.edges.get_mut(&task_id) {
            let before = deps.len();
            deps.retain(|d| d.depends_on != depends_on);
            removed = deps.len() != before;
            if deps.is_empty() {
                self.edges.remove(&task_id);
            }
        }
        if removed {
            if let Some(set) = self.dependents.get_mut(&depends_on) {
                set.remove(&task_id);
                if set.is_empty() {
                    self.dependents.remove(&depends_on);
                }
            }
        }
        removed
    }

    /// Drop all edges and cached state for a task (on removal/unregistration).
    pub fn remove_task(&mut self, task_id: Uuid) {
        if let Some(deps) = self.edges.remove(&task_id) {
            for dep in deps {
                if let Some(set) = self.dependents.get_mut(&dep.depends_on) {
                    set.remove(&task_id);
                }
            }
        }
        self.dependents.remove(&task_id);
        self.statuses.remove(&task_id);
    }

    /// IDs this task depends on.
    pub fn dependencies(&self, task_id: Uuid) -> Vec<Uuid> {
        self.edges
            .get(&task_id)
            .map(|deps| deps.iter().map(|d| d.depends_on).collect())
            .unwrap_or_default()
    }

    /// The full dependency edges for a task.
    pub fn dependency_edges(&self, task_id: Uuid) -> Vec<TaskDependency> {
        self.edges.get(&task_id).cloned().unwrap_or_default()
    }

    /// IDs of tasks that depend on this task.
    pub fn dependents(&self, task_id: Uuid) -> Vec<Uuid> {
        self.dependents
            .get(&task_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Update the cached status of a task.
    pub fn set_status(&mut self, task_id: Uuid, status: TaskStatus) {
        self.statuses.insert(task_id, status);
    }

    /// The cached status of a task, if known.
    pub fn status(&self, task_id: Uuid) -> Option<TaskStatus> {
        self.statuses.get(&task_id).copied()
    }

    /// Whether every dependency of the task is satisfied.
    ///
    /// Per-kind semantics: `completion` and `data` require the dependency's
    /// cached status to be COMPLETED; `resource` only requires it is not
    /// currently executing (RUNNING or PAUSED mid-flight). A condition on a
    /// `completion`/`data` edge replaces
    /// the default success gate (a `failure` condition waits for the
    /// dependency to fail); on a `resource` edge it is an additional gate.
    pub fn is_ready(&self, task_id: Uuid) -> bool {
        let Some(deps) = self.edges.get(&task_id) else {
            return true;
        };
        deps.iter().all(|dep| self.is_edge_satisfied(dep))
    }

    fn is_edge_satisfied(&self, dep: &TaskDependency) -> bool {
        let status = self.statuses.get(&dep.depends_on).copied();
        match dep.kind {
            DependencyKind::Completion | DependencyKind::Data => match dep.condition {
                None | Some(DependencyCondition::Success) => {
                    status == Some(TaskStatus::Completed)
                }
                Some(DependencyCondition::Failure) => status == Some(TaskStatus::Failed),
                Some(DependencyCondition::Completion) => {
                    status.is_some_and(|s| s.is_terminal())
                }
            },
            DependencyKind::Resource => {
                !matches!(status, Some(TaskStatus::Running | TaskStatus::Paused))
                    && condition_met(dep.condition, status)
            }
        }
    }

    /// Whether a dependency of this task reached a terminal status that can
    /// never satisfy its edge (the task is permanently blocked).
    pub fn is_permanently_blocked(&self, task_id: Uuid) -> bool {
        let Some(deps) = self.edges.get(&task_id) else {
            return false;
        };
        deps.iter().any(|dep| {
            let status = self.statuses.get(&dep.depends_on).copied();
            match dep.kind {
                DependencyKind::Completion | DependencyKind::Data => {
                    status.is_some_and(|s| s.is_terminal()) && !self.is_edge_satisfied(dep)
                }
                // Resource edges clear as soon as the holder stops running.
                DependencyKind::Resource => false,
            }
        })
    }

    /// Topological sort (Kahn's algorithm) restricted to the supplied task
    /// set. Edges pointing outside the set are ignored for in-degree counts.
    ///
    /// If nodes remain after the queue drains (a residual cycle, which the
    /// insertion-time check normally prevents), they are appended in
    /// arbitrary order and a warning is emitted rather than failing the
    /// whole batch.
    pub fn resolve_execution_order(&self, tasks: &[Task]) -> Vec<Task> {
        let in_set: HashSet<Uuid> = tasks.iter().map(|t| t.id).collect();
        let by_id: HashMap<Uuid, &Task> = tasks.iter().map(|t| (t.id, t)).collect();

        let mut in_degree: HashMap<Uuid, usize> = HashMap::new();
        let mut out_edges: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for task in tasks {
            let deps = self.effective_deps(task);
            let count = deps
                .iter()
                .filter(|d| in_set.contains(&d.depends_on))
                .count();
            in_degree.insert(task.id, count);
            for dep in &deps {
                if in_set.contains(&dep.depends_on) {
                    out_edges.entry(dep.depends_on).or_default().push(task.id);
                }
            }
        }

        // Seed with zero-in-degree nodes in input order for determinism.
        let mut queue: VecDeque<Uuid> = tasks
            .iter()
            .filter(|t| in_degree.get(&t.id) == Some(&0))
            .map(|t| t.id)
            .collect();
        let mut order: Vec<Uuid> = Vec::with_capacity(tasks.len());

        while let Some(id) = queue.pop_front() {
            order.push(id);
            if let Some(nexts) = out_edges.get(&id) {
                for &next in nexts {
                    if let Some(d) = in_degree.get_mut(&next) {
                        *d -= 1;
                        if *d == 0 {
                            queue.push_back(next);
                        }
                    }
                }
            }
        }

        if order.len() != tasks.len() {
            let leftover: Vec<Uuid> = tasks
                .iter()
                .map(|t| t.id)
                .filter(|id| !order.contains(id))
                .collect();
            warn!(
                leftover = leftover.len(),
                "residual cycle in execution order; appending remaining tasks unordered"
            );
            order.extend(leftover);
        }

        order
            .into_iter()
            .filter_map(|id| by_id.get(&id).map(|t| (*t).clone()))
            .collect()
    }

    /// Enumerate dependency cycles within the supplied task set using a
    /// colored (white/gray/black) depth-first search. Each reported cycle is
    /// the path slice from the back-edge target to the revisiting node.
    pub fn detect_circular_dependencies(&self, tasks: &[Task]) -> Vec<Vec<Uuid>> {
        const WHITE: u8 = 0;
        const GRAY: u8 = 1;
        const BLACK: u8 = 2;

        let in_set: HashSet<Uuid> = tasks.iter().map(|t| t.id).collect();
        let deps_of: HashMap<Uuid, Vec<Uuid>> = tasks
            .iter()
            .map(|t| {
                let deps = self
                    .effective_deps(t)
                    .iter()
                    .map(|d| d.depends_on)
                    .filter(|id| in_set.contains(id))
                    .collect();
                (t.id, deps)
            })
            .collect();

        let mut color: HashMap<Uuid, u8> = tasks.iter().map(|t| (t.id, WHITE)).collect();
        let mut cycles: Vec<Vec<Uuid>> = Vec::new();

        fn visit(
            node: Uuid,
            deps_of: &HashMap<Uuid, Vec<Uuid>>,
            color: &mut HashMap<Uuid, u8>,
            path: &mut Vec<Uuid>,
            cycles: &mut Vec<Vec<Uuid>>,
        ) {
            color.insert(node, GRAY);
            path.push(node);
            if let Some(deps) = deps_of.get(&node) {
                for &dep in deps {
                    match color.get(&dep).copied().unwrap_or(WHITE) {
                        GRAY => {
                            // Back edge: the cycle is the path from `dep` to here.
                            if let Some(pos) = path.iter().position(|&p| p == dep) {
                                cycles.push(path[pos..].to_vec());
                            }
                        }
                        WHITE => visit(dep, deps_of, color, path, cycles),
                        _ => {}
                    }
                }
            }
            path.pop();
            color.insert(node, BLACK);
        }

        for task in tasks {
            if color.get(&task.id).copied().unwrap_or(WHITE) == WHITE {
                let mut path = Vec::new();
                visit(task.id, &deps_of, &mut color, &mut path, &mut cycles);
            }
        }
        cycles
    }

    /// Build an [`ExecutionPlan`] for a batch: a flattened topological order
    /// plus stages of tasks that may run concurrently. A task lands in the
    /// stage after its deepest in-set dependency.
    pub fn build_execution_plan(&self, tasks: &[Task]) -> ExecutionPlan {
        let ordered = self.resolve_execution_order(tasks);
        let in_set: HashSet<Uuid> = tasks.iter().map(|t| t.id).collect();

        let mut level_of: HashMap<Uuid, usize> = HashMap::new();
        let mut groups: Vec<Vec<Uuid>> = Vec::new();
        for task in &ordered {
            let level = self
                .effective_deps(task)
                .iter()
                .filter(|d| in_set.contains(&d.depends_on))
                .filter_map(|d| level_of.get(&d.depends_on))
                .map(|l| l + 1)
                .max()
                .unwrap_or(0);
            level_of.insert(task.id, level);
            if groups.len() <= level {
                groups.resize_with(level + 1, Vec::new);
            }
            groups[level].push(task.id);
        }

        ExecutionPlan {
            execution_order: ordered.iter().map(|t| t.id).collect(),
            tasks: ordered,
            parallel_groups: groups,
        }
    }

    /// Edges for a task: registered graph edges when present, otherwise the
    /// task's own declared dependencies (supports ad hoc batches).
    fn effective_deps(&self, task: &Task) -> Vec<TaskDependency> {
        self.edges
            .get(&task.id)
            .cloned()
            .unwrap_or_else(|| task.dependencies.clone())
    }

    /// Whether `to` is reachable from `from` following dependency edges.
    fn is_reachable(&self, from: Uuid, to: Uuid) -> bool {
        if from == to {
            return true;
        }
        let mut stack = vec![from];
        let mut seen: HashSet<Uuid> = HashSet::new();
        while let Some(node) = stack.pop() {
            if !seen.insert(node) {
                continue;
            }
            if let Some(deps) = self.edges.get(&node) {
                for dep in deps {
                    if dep.depends_on == to {
                        return true;
                    }
                    stack.push(dep.depends_on);
                }
            }
        }
        false
    }
}

impl Default for DependencyManager {
    fn default() -> Self {
        Self::new()
    }
}

fn condition_met(condition: Option<DependencyCondition>, status: Option<TaskStatus>) -> bool {
    match condition {
        None => true,
        Some(DependencyCondition::Success) => status == Some(TaskStatus::Completed),
        Some(DependencyCondition::Failure) => status == Some(TaskStatus::Failed),
        Some(DependencyCondition::Completion) => status.is_some_and(|s| s.is_terminal()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dep(on: Uuid) -> TaskDependency {
        TaskDependency::completion(on)
    }

    #[test]
    fn test_self_dependency_rejected() {
        let mut dm = DependencyManager::new();
        let id = Uuid::new_v4();
        assert!(dm.add_dependency(id, dep(id)).is_err());
    }

    #[test]
    fn test_cycle_rejected_before_insertion() {
        let mut dm = DependencyManager::new();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        dm.add_dependency(b, dep(a)).unwrap();
        dm.add_dependency(c, dep(b)).unwrap();
        // a -> c would close the loop a <- b <- c <- a.
        assert!(dm.add_dependency(a, dep(c)).is_err());
        // The graph was not mutated by the failed insert.
        assert!(dm.dependencies(a).is_empty());
    }

    #[test]
    fn test_prevention_detection_consistency() {
        // An edge set accepted by add_dependency never yields cycles.
        let mut dm = DependencyManager::new();
        let a = Task::new("a");
        let b = Task::new("b").depends_on(a.id);
        let c = Task::new("c").depends_on(b.id);
        dm.add_dependency(b.id, dep(a.id)).unwrap();
        dm.add_dependency(c.id, dep(b.id)).unwrap();
        let tasks = vec![a, b, c];
        assert!(dm.detect_circular_dependencies(&tasks).is_empty());
    }

    #[test]
    fn test_detect_cycle_in_ad_hoc_batch() {
        // Tasks carrying their own cyclic dependency lists (never inserted
        // through add_dependency) are still detected.
        let mut a = Task::new("a");
        let mut b = Task::new("b");
        a.dependencies.push(dep(b.id));
        b.dependencies.push(dep(a.id));
        let dm = DependencyManager::new();
        let cycles = dm.detect_circular_dependencies(&[a.clone(), b.clone()]);
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].len(), 2);
        assert!(cycles[0].contains(&a.id));
        assert!(cycles[0].contains(&b.id));
    }

    #[test]
    fn test_readiness_completion_kind() {
        let mut dm = DependencyManager::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        dm.add_dependency(b, dep(a)).unwrap();

        assert!(!dm.is_ready(b));
        dm.set_status(a, TaskStatus::Running);
        assert!(!dm.is_ready(b));
        dm.set_status(a, TaskStatus::Completed);
        assert!(dm.is_ready(b));
    }

    #[test]
    fn test_readiness_resource_kind() {
        let mut dm = DependencyManager::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        dm.add_dependency(b, TaskDependency::resource(a)).unwrap();

        // Not running (no status at all) is fine: mutual exclusion only.
        assert!(dm.is_ready(b));
        dm.set_status(a, TaskStatus::Running);
        assert!(!dm.is_ready(b));
        dm.set_status(a, TaskStatus::Failed);
        assert!(dm.is_ready(b));
    }

    #[test]
    fn test_resource_edge_waits_for_paused_holder() {
        // A paused holder still occupies its resource.
        let mut dm = DependencyManager::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        dm.add_dependency(b, TaskDependency::resource(a)).unwrap();

        dm.set_status(a, TaskStatus::Paused);
        assert!(!dm.is_ready(b));
        dm.set_status(a, TaskStatus::Completed);
        assert!(dm.is_ready(b));
    }

    #[test]
    fn test_readiness_condition_gate() {
        let mut dm = DependencyManager::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        dm.add_dependency(
            b,
            TaskDependency::completion(a).with_condition(DependencyCondition::Success),
        )
        .unwrap();
        dm.set_status(a, TaskStatus::Completed);
        assert!(dm.is_ready(b));

        // A failure-conditioned resource edge is satisfied once the
        // dependency actually failed.
        let (c, d) = (Uuid::new_v4(), Uuid::new_v4());
        dm.add_dependency(
            d,
            TaskDependency::resource(c).with_condition(DependencyCondition::Failure),
        )
        .unwrap();
        assert!(!dm.is_ready(d));
        dm.set_status(c, TaskStatus::Failed);
        assert!(dm.is_ready(d));
    }

    #[test]
    fn test_failure_condition_replaces_success_gate() {
        // A cleanup task that must run only when its dependency fails.
        let mut dm = DependencyManager::new();
        let (a, cleanup) = (Uuid::new_v4(), Uuid::new_v4());
        dm.add_dependency(
            cleanup,
            TaskDependency::completion(a).with_condition(DependencyCondition::Failure),
        )
        .unwrap();

        dm.set_status(a, TaskStatus::Completed);
        assert!(!dm.is_ready(cleanup));
        // A successful dependency can never fail anymore.
        assert!(dm.is_permanently_blocked(cleanup));

        let mut dm = DependencyManager::new();
        dm.add_dependency(
            cleanup,
            TaskDependency::completion(a).with_condition(DependencyCondition::Failure),
        )
        .unwrap();
        dm.set_status(a, TaskStatus::Failed);
        assert!(dm.is_ready(cleanup));
        assert!(!dm.is_permanently_blocked(cleanup));
    }

    #[test]
    fn test_permanently_blocked_on_cancelled_dependency() {
        let mut dm = DependencyManager::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        dm.add_dependency(b, dep(a)).unwrap();
        dm.set_status(a, TaskStatus::Cancelled);
        assert!(!dm.is_ready(b));
        assert!(dm.is_permanently_blocked(b));
    }

    #[test]
    fn test_topological_order_valid() {
        let mut dm = DependencyManager::new();
        let a = Task::new("a");
        let b = Task::new("b");
        let c = Task::new("c");
        dm.add_dependency(b.id, dep(a.id)).unwrap();
        dm.add_dependency(c.id, dep(b.id)).unwrap();

        // Submit in reverse order; the sort must still put deps first.
        let ordered = dm.resolve_execution_order(&[c.clone(), b.clone(), a.clone()]);
        let pos = |id: Uuid| ordered.iter().position(|t| t.id == id).unwrap();
        assert!(pos(a.id) < pos(b.id));
        assert!(pos(b.id) < pos(c.id));
    }

    #[test]
    fn test_topological_order_ignores_out_of_set_edges() {
        let mut dm = DependencyManager::new();
        let external = Uuid::new_v4();
        let a = Task::new("a");
        dm.add_dependency(a.id, dep(external)).unwrap();
        let ordered = dm.resolve_execution_order(std::slice::from_ref(&a));
        assert_eq!(ordered.len(), 1);
    }

    #[test]
    fn test_fail_open_on_residual_cycle() {
        // Ad hoc batch with a cycle: every task still appears in the output.
        let mut a = Task::new("a");
        let mut b = Task::new("b");
        a.dependencies.push(dep(b.id));
        b.dependencies.push(dep(a.id));
        let dm = DependencyManager::new();
        let ordered = dm.resolve_execution_order(&[a, b]);
        assert_eq!(ordered.len(), 2);
    }

    #[test]
    fn test_execution_plan_groups() {
        let mut dm = DependencyManager::new();
        let a = Task::new("a");
        let b = Task::new("b");
        let c = Task::new("c");
        let d = Task::new("d");
        // b and c both depend on a; d depends on b.
        dm.add_dependency(b.id, dep(a.id)).unwrap();
        dm.add_dependency(c.id, dep(a.id)).unwrap();
        dm.add_dependency(d.id, dep(b.id)).unwrap();

        let plan = dm.build_execution_plan(&[a.clone(), b.clone(), c.clone(), d.clone()]);
        assert_eq!(plan.parallel_groups.len(), 3);
        assert_eq!(plan.parallel_groups[0], vec![a.id]);
        assert!(plan.parallel_groups[1].contains(&b.id));
        assert!(plan.parallel_groups[1].contains(&c.id));
        assert_eq!(plan.parallel_groups[2], vec![d.id]);
        assert_eq!(plan.execution_order.len(), 4);
    }

    #[test]
    fn test_dependents_reverse_index() {
        let mut dm = DependencyManager::new();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        dm.add_dependency(b, dep(a)).unwrap();
        dm.add_dependency(c, dep(a)).unwrap();

        let mut dependents = dm.dependents(a);
        dependents.sort();
        let mut expected = vec![b, c];
        expected.sort();
        assert_eq!(dependents, expected);

        assert!(dm.remove_dependency(b, a));
        assert_eq!(dm.dependents(a), vec![c]);
    }
}
