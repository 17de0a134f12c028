use anyhow::{ensure, Context, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use crate::channel::BrokerConfig;
use crate::marker::MarkerClassification;

/// Complete arena configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ArenaConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub arena: ArenaSettings,
    /// Known agents (marker id -> name and broker address)
    #[serde(default)]
    pub agents: Vec<AgentProfile>,
    #[serde(default)]
    pub teams: Vec<TeamConfig>,
    /// Agent -> home base assignments
    #[serde(default)]
    pub pairings: Vec<Pairing>,
}

/// One physical agent and the address its controller listens on
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AgentProfile {
    pub id: u32,
    pub name: String,
    pub address: String,
}

/// A team: its colour code and the base markers it owns
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TeamConfig {
    pub name: String,
    pub colour: String,
    pub bases: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Pairing {
    pub agent: u32,
    pub base: u32,
}

/// Arena thresholds and timing
#[derive(Debug, Clone, Deserialize)]
pub struct ArenaSettings {
    /// Marker id of the calibration square
    #[serde(default = "default_calibration_marker")]
    pub calibration_marker: u32,
    /// Printed side length of the calibration square (mm)
    #[serde(default = "default_calibration_size_mm")]
    pub calibration_size_mm: f64,
    /// Pixels per mm used until the calibration marker is seen
    #[serde(default = "default_initial_scale")]
    pub initial_scale: f64,
    /// Side length of a home base marker (mm); half of it is the home tolerance
    #[serde(default = "default_home_base_side_mm")]
    pub home_base_side_mm: f64,
    /// Margin added around the bases to form the arena rectangle (mm)
    #[serde(default = "default_boundary_margin_mm")]
    pub boundary_margin_mm: f64,
    #[serde(default = "default_ball_diameter_mm")]
    pub ball_diameter_mm: f64,
    /// Accepted relative error on the ball diameter
    #[serde(default = "default_ball_tolerance")]
    pub ball_tolerance: f64,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// How long an unacknowledged command keeps an agent busy
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Consecutive ticks without a sighting before an agent is treated as lost
    #[serde(default = "default_max_missed_ticks")]
    pub max_missed_ticks: u32,
    #[serde(default = "default_base_discovery_timeout_secs")]
    pub base_discovery_timeout_secs: u64,
    #[serde(default = "default_agent_discovery_timeout_secs")]
    pub agent_discovery_timeout_secs: u64,
    #[serde(default = "default_homing_timeout_secs")]
    pub homing_timeout_secs: u64,
    #[serde(default = "default_ball_timeout_secs")]
    pub ball_timeout_secs: u64,
    /// Status payload meaning "previous command complete"
    #[serde(default = "default_ack_sentinel")]
    pub ack_sentinel: String,
    /// Tell each agent its pose and the ball position while playing
    #[serde(default)]
    pub broadcast_poses: bool,
    /// Program uploaded to each agent when it is discovered
    #[serde(default)]
    pub agent_program: Option<PathBuf>,
}

fn default_calibration_marker() -> u32 {
    49
}

fn default_calibration_size_mm() -> f64 {
    54.0
}

fn default_initial_scale() -> f64 {
    1.2
}

fn default_home_base_side_mm() -> f64 {
    54.0
}

fn default_boundary_margin_mm() -> f64 {
    100.0
}

fn default_ball_diameter_mm() -> f64 {
    120.0
}

fn default_ball_tolerance() -> f64 {
    0.04
}

fn default_tick_interval_ms() -> u64 {
    100
}

fn default_busy_timeout_ms() -> u64 {
    10_000
}

fn default_max_missed_ticks() -> u32 {
    5
}

fn default_base_discovery_timeout_secs() -> u64 {
    60
}

fn default_agent_discovery_timeout_secs() -> u64 {
    60
}

fn default_homing_timeout_secs() -> u64 {
    120
}

fn default_ball_timeout_secs() -> u64 {
    300
}

fn default_ack_sentinel() -> String {
    "1".to_string()
}

impl Default for ArenaSettings {
    fn default() -> Self {
        Self {
            calibration_marker: default_calibration_marker(),
            calibration_size_mm: default_calibration_size_mm(),
            initial_scale: default_initial_scale(),
            home_base_side_mm: default_home_base_side_mm(),
            boundary_margin_mm: default_boundary_margin_mm(),
            ball_diameter_mm: default_ball_diameter_mm(),
            ball_tolerance: default_ball_tolerance(),
            tick_interval_ms: default_tick_interval_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
            max_missed_ticks: default_max_missed_ticks(),
            base_discovery_timeout_secs: default_base_discovery_timeout_secs(),
            agent_discovery_timeout_secs: default_agent_discovery_timeout_secs(),
            homing_timeout_secs: default_homing_timeout_secs(),
            ball_timeout_secs: default_ball_timeout_secs(),
            ack_sentinel: default_ack_sentinel(),
            broadcast_poses: false,
            agent_program: None,
        }
    }
}

impl ArenaSettings {
    /// Radius within which an agent counts as being on its base
    pub fn home_tolerance_mm(&self) -> f64 {
        self.home_base_side_mm / 2.0
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl ArenaConfig {
    /// Marker id -> agent profile
    pub fn agent_directory(&self) -> HashMap<u32, AgentProfile> {
        self.agents.iter().map(|a| (a.id, a.clone())).collect()
    }

    /// Agent marker id -> base marker id
    pub fn pairing_table(&self) -> HashMap<u32, u32> {
        self.pairings.iter().map(|p| (p.agent, p.base)).collect()
    }

    pub fn base_count(&self) -> usize {
        self.teams.iter().map(|t| t.bases.len()).sum()
    }

    /// Which marker ids are bases, agents or the calibration square
    pub fn classification(&self) -> MarkerClassification {
        let bases: HashSet<u32> = self.teams.iter().flat_map(|t| t.bases.iter().copied()).collect();
        let agents: HashSet<u32> = self
            .agents
            .iter()
            .map(|a| a.id)
            .chain(self.pairings.iter().map(|p| p.agent))
            .collect();

        MarkerClassification {
            calibration: self.arena.calibration_marker,
            bases,
            agents,
        }
    }

    /// Check cross-references between agents, teams and pairings
    pub fn validate(&self) -> Result<()> {
        let classification = self.classification();

        ensure!(
            classification.bases.is_disjoint(&classification.agents),
            "a marker id cannot be both a base and an agent"
        );
        ensure!(
            !classification.bases.contains(&self.arena.calibration_marker)
                && !classification.agents.contains(&self.arena.calibration_marker),
            "calibration marker {} is also used as a base or agent",
            self.arena.calibration_marker
        );
        ensure!(
            self.arena.calibration_size_mm > 0.0,
            "calibration_size_mm must be positive"
        );
        ensure!(self.arena.tick_interval_ms > 0, "tick_interval_ms must be positive");
        ensure!(
            self.arena.ball_diameter_mm > 0.0,
            "ball_diameter_mm must be positive"
        );
        ensure!(
            self.arena.ball_tolerance >= 0.0,
            "ball_tolerance cannot be negative"
        );
        ensure!(
            self.arena.home_base_side_mm > 0.0,
            "home_base_side_mm must be positive"
        );

        let mut paired_bases = HashSet::new();
        for pairing in &self.pairings {
            ensure!(
                classification.bases.contains(&pairing.base),
                "agent {} is paired with base {} which belongs to no team",
                pairing.agent,
                pairing.base
            );
            ensure!(
                self.agents.iter().any(|a| a.id == pairing.agent),
                "agent {} is paired with base {} but has no [[agents]] entry",
                pairing.agent,
                pairing.base
            );
            ensure!(
                paired_bases.insert(pairing.base),
                "base {} is paired with more than one agent",
                pairing.base
            );
        }

        Ok(())
    }
}

/// Load configuration from a TOML file, apply env overrides and validate it
pub fn load_config(path: impl AsRef<Path>) -> Result<ArenaConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let mut config = parse_config(&contents)?;
    config.broker.apply_env_overrides();
    Ok(config)
}

/// Parse and validate configuration from TOML text
pub fn parse_config(contents: &str) -> Result<ArenaConfig> {
    let config: ArenaConfig = toml::from_str(contents).context("Failed to parse arena config")?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
        [broker]
        url = "nats://arena.local:4222"
        subject_prefix = "bots"

        [arena]
        calibration_marker = 49
        home_base_side_mm = 60.0
        busy_timeout_ms = 2500

        [[agents]]
        id = 0
        name = "Agent Orange"
        address = "CLB-da3371"

        [[agents]]
        id = 1
        name = "Alloys Boys"
        address = "CLB-d3343a"

        [[teams]]
        name = "red"
        colour = "R"
        bases = [40]

        [[teams]]
        name = "blue"
        colour = "B"
        bases = [41]

        [[pairings]]
        agent = 0
        base = 40

        [[pairings]]
        agent = 1
        base = 41
    "#;

    #[test]
    fn test_default_config() {
        let config = ArenaConfig::default();
        assert_eq!(config.arena.calibration_marker, 49);
        assert_eq!(config.arena.calibration_size_mm, 54.0);
        assert_eq!(config.arena.ack_sentinel, "1");
        assert_eq!(config.arena.home_tolerance_mm(), 27.0);
        assert_eq!(config.broker.subject_prefix, "pixelbot");
        assert!(config.agents.is_empty());
    }

    #[test]
    fn test_config_deserialization() {
        let config = parse_config(SAMPLE).unwrap();
        assert_eq!(config.broker.url, "nats://arena.local:4222");
        assert_eq!(config.broker.subject_prefix, "bots");
        assert_eq!(config.arena.busy_timeout(), Duration::from_millis(2500));
        assert_eq!(config.arena.home_tolerance_mm(), 30.0);
        assert_eq!(config.base_count(), 2);
        assert_eq!(config.pairing_table().get(&1), Some(&41));
        assert_eq!(config.agent_directory()[&0].address, "CLB-da3371");
    }

    #[test]
    fn test_partial_config() {
        let config = parse_config(
            r#"
            [arena]
            tick_interval_ms = 250
        "#,
        )
        .unwrap();
        assert_eq!(config.arena.tick_interval(), Duration::from_millis(250));
        assert_eq!(config.arena.ball_diameter_mm, 120.0); // Default
        assert_eq!(config.broker.connect_timeout_secs, 10); // Default
    }

    #[test]
    fn test_classification() {
        let config = parse_config(SAMPLE).unwrap();
        let classes = config.classification();
        assert_eq!(classes.calibration, 49);
        assert!(classes.bases.contains(&40) && classes.bases.contains(&41));
        assert!(classes.agents.contains(&0) && classes.agents.contains(&1));
    }

    #[test]
    fn test_rejects_pairing_to_unknown_base() {
        let toml = r#"
            [[teams]]
            name = "red"
            colour = "R"
            bases = [40]

            [[pairings]]
            agent = 0
            base = 77
        "#;
        let err = parse_config(toml).unwrap_err();
        assert!(err.to_string().contains("base 77"));
    }

    #[test]
    fn test_rejects_pairing_without_agent_entry() {
        let toml = r#"
            [[teams]]
            name = "red"
            colour = "R"
            bases = [40]

            [[pairings]]
            agent = 7
            base = 40
        "#;
        let err = parse_config(toml).unwrap_err();
        assert!(err.to_string().contains("agent 7"));
        assert!(err.to_string().contains("no [[agents]] entry"));
    }

    #[test]
    fn test_rejects_non_positive_tick_interval() {
        let err = parse_config("[arena]\ntick_interval_ms = 0\n").unwrap_err();
        assert!(err.to_string().contains("tick_interval_ms"));
    }

    #[test]
    fn test_rejects_non_positive_ball_diameter() {
        let err = parse_config("[arena]\nball_diameter_mm = 0.0\n").unwrap_err();
        assert!(err.to_string().contains("ball_diameter_mm"));

        assert!(parse_config("[arena]\nball_diameter_mm = -120.0\n").is_err());
    }

    #[test]
    fn test_rejects_negative_ball_tolerance() {
        let err = parse_config("[arena]\nball_tolerance = -0.01\n").unwrap_err();
        assert!(err.to_string().contains("ball_tolerance"));

        // an exact-size requirement is allowed
        assert!(parse_config("[arena]\nball_tolerance = 0.0\n").is_ok());
    }

    #[test]
    fn test_rejects_non_positive_home_base_side() {
        let err = parse_config("[arena]\nhome_base_side_mm = 0.0\n").unwrap_err();
        assert!(err.to_string().contains("home_base_side_mm"));
    }

    #[test]
    fn test_rejects_shared_base() {
        let toml = r#"
            [[agents]]
            id = 0
            name = "Agent Orange"
            address = "CLB-da3371"

            [[agents]]
            id = 1
            name = "Alloys Boys"
            address = "CLB-d3343a"

            [[teams]]
            name = "red"
            colour = "R"
            bases = [40]

            [[pairings]]
            agent = 0
            base = 40

            [[pairings]]
            agent = 1
            base = 40
        "#;
        let err = parse_config(toml).unwrap_err();
        assert!(err.to_string().contains("more than one agent"));
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.agents.len(), 2);
    }

    #[test]
    fn test_load_config_missing_file() {
        let err = load_config("/nonexistent/arena.toml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
