use chrono::{Duration, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use taskhive_core::{Agent, AgentStatus, Capability, HiveError, HiveResult};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Thread-safe store of registered agents.
///
/// Owns the canonical [`Agent`] records. Load accounting keeps the status
/// convention the balancer relies on: an agent is `Idle` while it has spare
/// capacity and `Busy` only when fully loaded.
#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<Uuid, Agent>>,
}

impl AgentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent. Fails if the ID is already taken.
    pub fn register(&self, agent: Agent) -> HiveResult<()> {
        let mut agents = self.agents.write();
        if agents.contains_key(&agent.id) {
            return Err(HiveError::Agent(format!(
                "agent {} is already registered",
                agent.id
            )));
        }
        info!(agent_id = %agent.id, name = %agent.name, agent_type = %agent.agent_type, "agent registered");
        agents.insert(agent.id, agent);
        Ok(())
    }

    /// Remove an agent, returning its final record.
    pub fn unregister(&self, agent_id: Uuid) -> Option<Agent> {
        let removed = self.agents.write().remove(&agent_id);
        if removed.is_some() {
            info!(agent_id = %agent_id, "agent unregistered");
        }
        removed
    }

    /// Snapshot of one agent.
    pub fn get(&self, agent_id: Uuid) -> Option<Agent> {
        self.agents.read().get(&agent_id).cloned()
    }

    /// Snapshot of all agents.
    pub fn list(&self) -> Vec<Agent> {
        self.agents.read().values().cloned().collect()
    }

    /// Agents that are idle with spare capacity, optionally filtered by a
    /// required capability.
    pub fn available(&self, required: Option<&Capability>) -> Vec<Agent> {
        self.agents
            .read()
            .values()
            .filter(|a| a.status == AgentStatus::Idle && a.has_capacity())
            .filter(|a| required.is_none_or(|cap| a.can_handle(cap)))
            .cloned()
            .collect()
    }

    /// Number of registered agents.
    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    /// Whether no agents are registered.
    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }

    /// Account for a task being assigned to the agent. Fails when the agent
    /// is unknown or already at capacity.
    pub fn increment_load(&self, agent_id: Uuid) -> HiveResult<()> {
        let mut agents = self.agents.write();
        let agent = agents
            .get_mut(&agent_id)
            .ok_or_else(|| HiveError::Agent(format!("unknown agent {agent_id}")))?;
        if !agent.has_capacity() {
            return Err(HiveError::Agent(format!(
                "agent {agent_id} is at capacity ({}/{})",
                agent.current_load, agent.max_concurrent_tasks
            )));
        }
        agent.current_load += 1;
        if !agent.has_capacity() {
            agent.status = AgentStatus::Busy;
        }
        agent.touch();
        debug!(agent_id = %agent_id, load = agent.current_load, "agent load incremented");
        Ok(())
    }

    /// Account for a task leaving the agent.
    pub fn decrement_load(&self, agent_id: Uuid) {
        let mut agents = self.agents.write();
        let Some(agent) = agents.get_mut(&agent_id) else {
            warn!(agent_id = %agent_id, "decrement_load for unknown agent");
            return;
        };
        if agent.current_load == 0 {
            warn!(agent_id = %agent_id, "decrement_load below zero ignored");
            return;
        }
        agent.current_load -= 1;
        if agent.status == AgentStatus::Busy && agent.has_capacity() {
            agent.status = AgentStatus::Idle;
        }
        agent.touch();
    }

    /// Record an execution outcome on the agent's rolling statistics.
    pub fn record_outcome(&self, agent_id: Uuid, success: bool, execution_secs: f64) {
        let mut agents = self.agents.write();
        if let Some(agent) = agents.get_mut(&agent_id) {
            agent.record_outcome(success, execution_secs);
            if !success && agent.status == AgentStatus::Idle {
                agent.status = AgentStatus::Error;
            }
            if success && agent.status == AgentStatus::Error {
                agent.status = if agent.has_capacity() {
                    AgentStatus::Idle
                } else {
                    AgentStatus::Busy
                };
            }
        }
    }

    /// Record non-execution activity (heartbeat). Revives an `Unavailable`
    /// agent.
    pub fn record_activity(&self, agent_id: Uuid) {
        let mut agents = self.agents.write();
        if let Some(agent) = agents.get_mut(&agent_id) {
            agent.touch();
            if agent.status == AgentStatus::Unavailable {
                agent.status = if agent.has_capacity() {
                    AgentStatus::Idle
                } else {
                    AgentStatus::Busy
                };
                info!(agent_id = %agent_id, "agent revived by activity");
            }
        }
    }

    /// Clear a sticky `Error` status back to availability.
    pub fn clear_error(&self, agent_id: Uuid) {
        let mut agents = self.agents.write();
        if let Some(agent) = agents.get_mut(&agent_id) {
            if agent.status == AgentStatus::Error {
                agent.status = if agent.has_capacity() {
                    AgentStatus::Idle
                } else {
                    AgentStatus::Busy
                };
            }
        }
    }

    /// Mark agents with no activity inside `threshold_secs` as unavailable.
    /// Returns the IDs that were transitioned.
    pub fn mark_stale(&self, threshold_secs: i64) -> Vec<Uuid> {
        let cutoff = Utc::now() - Duration::seconds(threshold_secs);
        let mut stale = Vec::new();
        let mut agents = self.agents.write();
        for agent in agents.values_mut() {
            if agent.status != AgentStatus::Unavailable && agent.last_activity < cutoff {
                agent.status = AgentStatus::Unavailable;
                stale.push(agent.id);
                warn!(agent_id = %agent.id, name = %agent.name, "agent marked unavailable (stale)");
            }
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(max: u32) -> Agent {
        Agent::new("worker", "code").with_max_concurrent_tasks(max)
    }

    #[test]
    fn test_register_and_get() {
        let registry = AgentRegistry::new();
        let agent = worker(2);
        let id = agent.id;
        registry.register(agent).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(id).unwrap().name, "worker");
    }

    #[test]
    fn test_register_duplicate_fails() {
        let registry = AgentRegistry::new();
        let agent = worker(1);
        registry.register(agent.clone()).unwrap();
        assert!(registry.register(agent).is_err());
    }

    #[test]
    fn test_unregister() {
        let registry = AgentRegistry::new();
        let agent = worker(1);
        let id = agent.id;
        registry.register(agent).unwrap();
        assert!(registry.unregister(id).is_some());
        assert!(registry.unregister(id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_load_accounting_toggles_status() {
        let registry = AgentRegistry::new();
        let agent = worker(2);
        let id = agent.id;
        registry.register(agent).unwrap();

        registry.increment_load(id).unwrap();
        assert_eq!(registry.get(id).unwrap().status, AgentStatus::Idle);
        registry.increment_load(id).unwrap();
        assert_eq!(registry.get(id).unwrap().status, AgentStatus::Busy);
        assert!(registry.increment_load(id).is_err());

        registry.decrement_load(id);
        let agent = registry.get(id).unwrap();
        assert_eq!(agent.status, AgentStatus::Idle);
        assert_eq!(agent.current_load, 1);
    }

    #[test]
    fn test_decrement_below_zero_ignored() {
        let registry = AgentRegistry::new();
        let agent = worker(1);
        let id = agent.id;
        registry.register(agent).unwrap();
        registry.decrement_load(id);
        assert_eq!(registry.get(id).unwrap().current_load, 0);
    }

    #[test]
    fn test_available_filters_capability() {
        let registry = AgentRegistry::new();
        let coder = Agent::new("coder", "code.rust");
        let tester = Agent::new("tester", "test");
        registry.register(coder.clone()).unwrap();
        registry.register(tester).unwrap();

        let cap = Capability::new("code");
        let available = registry.available(Some(&cap));
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].id, coder.id);
        assert_eq!(registry.available(None).len(), 2);
    }

    #[test]
    fn test_record_outcome_error_status() {
        let registry = AgentRegistry::new();
        let agent = worker(2);
        let id = agent.id;
        registry.register(agent).unwrap();

        registry.record_outcome(id, false, 5.0);
        assert_eq!(registry.get(id).unwrap().status, AgentStatus::Error);
        // A success clears the sticky error.
        registry.record_outcome(id, true, 5.0);
        assert_eq!(registry.get(id).unwrap().status, AgentStatus::Idle);
    }

    #[test]
    fn test_mark_stale_and_revive() {
        let registry = AgentRegistry::new();
        let mut agent = worker(1);
        agent.last_activity = Utc::now() - Duration::hours(2);
        let id = agent.id;
        registry.register(agent).unwrap();

        let stale = registry.mark_stale(3600);
        assert_eq!(stale, vec![id]);
        assert_eq!(registry.get(id).unwrap().status, AgentStatus::Unavailable);
        // Already-unavailable agents are not reported twice.
        assert!(registry.mark_stale(3600).is_empty());

        registry.record_activity(id);
        assert_eq!(registry.get(id).unwrap().status, AgentStatus::Idle);
    }
}
