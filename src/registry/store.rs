use crate::config::{AgentProfile, ArenaConfig, TeamConfig};
use crate::geometry::Point;
use crate::registry::entity::{Agent, Base};
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Why an agent record could not be created this tick
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    #[error("agent marker {0} has no configured address")]
    UnknownAgent(u32),

    #[error("agent marker {0} is not paired with a base")]
    Unpaired(u32),

    #[error("base {base} for agent {agent} has not been observed yet")]
    BaseNotFound { agent: u32, base: u32 },
}

/// Outcome of one agent discovery pass
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DiscoveryReport {
    /// Agents created by this pass
    pub created: Vec<u32>,
    /// Agents waiting for their base to be observed
    pub deferred: Vec<u32>,
    /// Agents that cannot be created with the current configuration
    pub rejected: Vec<(u32, RegistryError)>,
}

/// Owns every agent and base record in the arena.
///
/// Records live for the whole process; a marker that disappears keeps its
/// record with a growing miss count instead of being removed.
pub struct AgentRegistry {
    /// Static directory: marker id -> name/address
    directory: HashMap<u32, AgentProfile>,

    teams: Vec<TeamConfig>,

    agents: DashMap<u32, Agent>,

    bases: DashMap<u32, Base>,

    /// Agent markers already reported as uncreatable
    rejected: DashSet<u32>,
}

impl AgentRegistry {
    pub fn new(config: &ArenaConfig) -> Self {
        Self {
            directory: config.agent_directory(),
            teams: config.teams.clone(),
            agents: DashMap::new(),
            bases: DashMap::new(),
            rejected: DashSet::new(),
        }
    }

    /// Merge newly observed bases into the base set.
    ///
    /// Known bases are left untouched. Returns the number of known bases.
    pub fn discover_bases(&self, observed: &HashMap<u32, Point>) -> usize {
        for (&id, point) in observed {
            if self.bases.contains_key(&id) {
                continue;
            }

            let Some(team) = self.teams.iter().find(|t| t.bases.contains(&id)) else {
                warn!(base_id = id, "Observed base belongs to no team, ignoring");
                continue;
            };

            info!(base_id = id, team = %team.name, x = point.x, y = point.y, "Base found");
            self.bases.insert(
                id,
                Base {
                    id,
                    point: Point::new(point.x, point.y),
                    team: team.name.clone(),
                    colour: team.colour.clone(),
                },
            );
        }

        self.bases.len()
    }

    /// Create records for newly observed agents.
    ///
    /// An agent whose paired base is not known yet is skipped for this pass
    /// and picked up by a later one; it never blocks other agents.
    pub fn discover_agents(
        &self,
        observed: &HashMap<u32, Point>,
        base_pairing: &HashMap<u32, u32>,
    ) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();

        let mut ids: Vec<u32> = observed.keys().copied().collect();
        ids.sort_unstable();

        for id in ids {
            if self.agents.contains_key(&id) {
                continue;
            }

            match self.create_agent(id, &observed[&id], base_pairing) {
                Ok(agent) => {
                    info!(
                        agent_id = id,
                        name = %agent.name,
                        home_base = agent.home_base,
                        team = %agent.team,
                        "Agent found"
                    );
                    self.agents.insert(id, agent);
                    report.created.push(id);
                }
                Err(RegistryError::BaseNotFound { agent, base }) => {
                    debug!(agent_id = agent, base_id = base, "Deferring agent until its base is seen");
                    report.deferred.push(id);
                }
                Err(e) => {
                    if self.rejected.insert(id) {
                        warn!(agent_id = id, error = %e, "Cannot create agent");
                    } else {
                        debug!(agent_id = id, error = %e, "Agent still cannot be created");
                    }
                    report.rejected.push((id, e));
                }
            }
        }

        report
    }

    fn create_agent(
        &self,
        id: u32,
        pose: &Point,
        base_pairing: &HashMap<u32, u32>,
    ) -> Result<Agent, RegistryError> {
        let profile = self.directory.get(&id).ok_or(RegistryError::UnknownAgent(id))?;
        let base_id = *base_pairing.get(&id).ok_or(RegistryError::Unpaired(id))?;
        let base = self
            .get_base(base_id)
            .ok_or(RegistryError::BaseNotFound { agent: id, base: base_id })?;

        Ok(Agent {
            id,
            name: profile.name.clone(),
            address: profile.address.clone(),
            pose: *pose,
            missed_ticks: 0,
            home: base.point,
            home_base: base.id,
            team: base.team,
            colour: base.colour,
            last_seen: Utc::now(),
        })
    }

    /// Refresh the pose of every known agent from this tick's observation.
    ///
    /// Agents missing from `observed` keep their last pose and count a miss.
    pub fn update_pose(&self, observed: &HashMap<u32, Point>) {
        let now = Utc::now();

        for mut entry in self.agents.iter_mut() {
            let agent = entry.value_mut();
            match observed.get(&agent.id) {
                Some(pose) => {
                    if agent.missed_ticks > 0 {
                        debug!(agent_id = agent.id, missed = agent.missed_ticks, "Agent reacquired");
                    }
                    agent.pose = *pose;
                    agent.missed_ticks = 0;
                    agent.last_seen = now;
                }
                None => {
                    agent.missed_ticks = agent.missed_ticks.saturating_add(1);
                }
            }
        }
    }

    /// True iff the agent exists and is within `tolerance` of its home point
    pub fn is_home(&self, agent_id: u32, tolerance: f64) -> bool {
        self.agents
            .get(&agent_id)
            .map(|a| a.is_home(tolerance))
            .unwrap_or(false)
    }

    pub fn get_agent(&self, agent_id: u32) -> Option<Agent> {
        self.agents.get(&agent_id).map(|a| a.clone())
    }

    pub fn get_base(&self, base_id: u32) -> Option<Base> {
        self.bases.get(&base_id).map(|b| b.clone())
    }

    /// All agents, ordered by marker id
    pub fn agents(&self) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self.agents.iter().map(|a| a.value().clone()).collect();
        agents.sort_by_key(|a| a.id);
        agents
    }

    /// All bases, ordered by marker id
    pub fn bases(&self) -> Vec<Base> {
        let mut bases: Vec<Base> = self.bases.iter().map(|b| b.value().clone()).collect();
        bases.sort_by_key(|b| b.id);
        bases
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    pub fn base_count(&self) -> usize {
        self.bases.len()
    }

    /// Agent markers that were seen but could not be created, ordered by id
    pub fn rejected(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.rejected.iter().map(|id| *id).collect();
        ids.sort_unstable();
        ids
    }
}
