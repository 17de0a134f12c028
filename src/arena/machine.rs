use super::state::{ArenaState, StageFailure, Transition};
use crate::busy::BusyTracker;
use crate::calibration::ScaleCalibrator;
use crate::channel::{Addressing, Callback, Command, CommandChannel, Instruction};
use crate::config::{ArenaConfig, ArenaSettings};
use crate::geometry::{course_change, expand_rect, try_heading_and_range, Point, Rect};
use crate::marker::{BallFilter, MarkerClassification, Observation, RawFrame};
use crate::registry::{Agent, AgentRegistry};
use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Heading for agents whose home is on the southern half of the arena
const FACE_NORTH: f64 = 0.0;
const FACE_SOUTH: f64 = 180.0;

/// External stop signal; cheap to clone and safe to trigger from any task
#[derive(Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Drives the arena: discovery, homing, orientation and play.
///
/// One call to [`tick`](Self::tick) per camera frame. Each tick refreshes
/// scale, ball and agent poses from the frame first, then runs the work of
/// the current stage. Acknowledgements arrive on broker tasks and only touch
/// the shared [`BusyTracker`].
pub struct ArenaStateMachine {
    session: Uuid,
    settings: ArenaSettings,
    classification: MarkerClassification,
    pairing: HashMap<u32, u32>,
    expected_bases: usize,
    expected_agents: usize,
    /// Program text uploaded to each new agent
    program: Option<String>,

    calibrator: ScaleCalibrator,
    registry: Arc<AgentRegistry>,
    busy: Arc<BusyTracker>,
    channel: CommandChannel,
    addressing: Addressing,
    ball_filter: BallFilter,

    state: ArenaState,
    /// When the current stage was entered; set on the first tick
    stage_started: Option<Instant>,
    tick: u64,
    ball: Option<Point>,
    /// Agents whose facing turn has been issued
    oriented: HashSet<u32>,
    failure: Option<StageFailure>,

    stop: StopHandle,
    transitions: broadcast::Sender<Transition>,
}

impl ArenaStateMachine {
    /// Build a machine for `config`, reading the agent program if one is set
    pub fn new(config: &ArenaConfig, channel: CommandChannel) -> Result<Self> {
        let program = match &config.arena.agent_program {
            Some(path) => Some(std::fs::read_to_string(path).with_context(|| {
                format!("Failed to read agent program {}", path.display())
            })?),
            None => None,
        };

        let (transitions, _) = broadcast::channel(64);
        let settings = config.arena.clone();

        Ok(Self {
            session: Uuid::now_v7(),
            classification: config.classification(),
            pairing: config.pairing_table(),
            expected_bases: config.base_count(),
            expected_agents: config.pairings.len(),
            program,
            calibrator: ScaleCalibrator::new(settings.calibration_size_mm, settings.initial_scale),
            registry: Arc::new(AgentRegistry::new(config)),
            busy: Arc::new(BusyTracker::new()),
            channel,
            addressing: Addressing::new(config.broker.subject_prefix.clone()),
            ball_filter: BallFilter {
                diameter_mm: settings.ball_diameter_mm,
                tolerance: settings.ball_tolerance,
                bounds: None,
            },
            state: ArenaState::FindingBases,
            stage_started: None,
            tick: 0,
            ball: None,
            oriented: HashSet::new(),
            failure: None,
            stop: StopHandle::default(),
            transitions,
            settings,
        })
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    pub fn state(&self) -> ArenaState {
        self.state
    }

    /// Ticks processed so far
    pub fn tick_count(&self) -> u64 {
        self.tick
    }

    /// Ball position from the latest tick, if a plausible ball was seen
    pub fn ball(&self) -> Option<Point> {
        self.ball
    }

    /// Set when the arena stopped itself because a stage timed out
    pub fn failure(&self) -> Option<&StageFailure> {
        self.failure.as_ref()
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn busy(&self) -> &Arc<BusyTracker> {
        &self.busy
    }

    pub fn current_scale(&self) -> f64 {
        self.calibrator.current_scale()
    }

    /// Arena rectangle, known once every base has been found
    pub fn bounds(&self) -> Option<Rect> {
        self.ball_filter.bounds
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn subscribe_transitions(&self) -> broadcast::Receiver<Transition> {
        self.transitions.subscribe()
    }

    /// Process one frame. Returns the state after the tick.
    pub async fn tick(&mut self, frame: &RawFrame, now: Instant) -> ArenaState {
        if self.state.is_terminal() {
            return self.state;
        }

        self.tick += 1;

        if self.stop.is_stopped() {
            info!(session = %self.session, "Stop requested");
            self.halt(None, now).await;
            return self.state;
        }

        let stage_started = *self.stage_started.get_or_insert(now);

        let observation = Observation::from_frame(frame, &self.classification, &self.calibrator);

        // ball is refreshed in every stage so a loss is seen on the tick it happens
        self.ball = observation
            .observed_ball()
            .and_then(|sighting| self.ball_filter.accept(&sighting));

        self.registry.update_pose(observation.observed_agents());

        let advanced = match self.state {
            ArenaState::FindingBases => self.find_bases(&observation, now),
            ArenaState::FindingAgents => self.find_agents(&observation, now).await,
            ArenaState::HomingAgents => self.home_agents(now).await,
            ArenaState::FacingOpponents => self.face_opponents(now).await,
            ArenaState::WaitingForBall => self.wait_for_ball(now),
            ArenaState::PlayingGame => self.play(now).await,
            ArenaState::Stopped => true,
        };

        if !advanced {
            self.enforce_stage_timeout(stage_started, now).await;
        }

        self.state
    }

    /// Account for a tick that produced no usable frame.
    ///
    /// Poses and stage work are left alone, but a stop request and the
    /// current stage's deadline still apply. The tick counter does not move.
    pub async fn tick_without_frame(&mut self, now: Instant) -> ArenaState {
        if self.state.is_terminal() {
            return self.state;
        }

        if self.stop.is_stopped() {
            info!(session = %self.session, "Stop requested");
            self.halt(None, now).await;
            return self.state;
        }

        let stage_started = *self.stage_started.get_or_insert(now);
        self.enforce_stage_timeout(stage_started, now).await;
        self.state
    }

    /// Stop the arena and tell every agent to stop
    pub async fn stop(&mut self, now: Instant) {
        if !self.state.is_terminal() {
            self.halt(None, now).await;
        }
    }

    fn stage_timeout(&self) -> Option<Duration> {
        let secs = match self.state {
            ArenaState::FindingBases => self.settings.base_discovery_timeout_secs,
            ArenaState::FindingAgents => self.settings.agent_discovery_timeout_secs,
            ArenaState::HomingAgents => self.settings.homing_timeout_secs,
            ArenaState::WaitingForBall => self.settings.ball_timeout_secs,
            _ => return None,
        };
        Some(Duration::from_secs(secs))
    }

    async fn enforce_stage_timeout(&mut self, stage_started: Instant, now: Instant) {
        let Some(timeout) = self.stage_timeout() else {
            return;
        };
        if now.saturating_duration_since(stage_started) < timeout {
            return;
        }

        let failure = StageFailure::Timeout {
            stage: self.state,
            timeout,
        };
        warn!(session = %self.session, error = %failure, "Stage timed out");
        self.halt(Some(failure), now).await;
    }

    fn transition(&mut self, to: ArenaState, now: Instant) {
        let from = self.state;
        self.state = to;
        self.stage_started = Some(now);

        info!(
            session = %self.session,
            tick = self.tick,
            from = %from,
            to = %to,
            "Arena state changed"
        );

        // no receivers is fine
        let _ = self.transitions.send(Transition {
            session: self.session,
            from,
            to,
            tick: self.tick,
            at: Utc::now(),
        });
    }

    async fn halt(&mut self, failure: Option<StageFailure>, now: Instant) {
        self.failure = failure;
        self.transition(ArenaState::Stopped, now);

        for agent in self.registry.agents() {
            let command = Command::new(agent.id, Instruction::Stop);
            let address = self.addressing.command_address(&agent.address);
            if let Err(e) = self.channel.publish_command(&address, &command).await {
                warn!(agent_id = agent.id, error = %e, "Failed to stop agent");
            }
        }
    }

    fn find_bases(&mut self, observation: &Observation, now: Instant) -> bool {
        let known = self.registry.discover_bases(observation.observed_bases());
        if known < self.expected_bases {
            debug!(known = known, expected = self.expected_bases, "Still looking for bases");
            return false;
        }

        let points: Vec<Point> = self.registry.bases().into_iter().map(|b| b.point).collect();
        if let Some(rect) = Rect::bounding(&points) {
            let bounds = expand_rect(
                &Point::new(rect.left, rect.top),
                &Point::new(rect.right, rect.bottom),
                self.settings.boundary_margin_mm,
            );
            info!(
                left = bounds.left,
                top = bounds.top,
                right = bounds.right,
                bottom = bounds.bottom,
                "Arena bounds set"
            );
            self.ball_filter.bounds = Some(bounds);
        }

        self.transition(ArenaState::FindingAgents, now);
        true
    }

    async fn find_agents(&mut self, observation: &Observation, now: Instant) -> bool {
        let report = self
            .registry
            .discover_agents(observation.observed_agents(), &self.pairing);

        for id in &report.created {
            if let Some(agent) = self.registry.get_agent(*id) {
                self.introduce(&agent).await;
            }
        }

        if self.registry.agent_count() < self.expected_agents {
            return false;
        }

        self.transition(ArenaState::HomingAgents, now);
        true
    }

    /// Wire up a newly created agent: acknowledgement route, colour, program, run
    async fn introduce(&self, agent: &Agent) {
        let busy = Arc::clone(&self.busy);
        let sentinel = self.settings.ack_sentinel.clone();
        let agent_id = agent.id;
        let on_status: Callback = Arc::new(move |address: &str, payload: &str| {
            if payload.trim() == sentinel {
                busy.clear(agent_id);
            } else {
                debug!(agent_id = agent_id, address = %address, payload = %payload, "Agent status");
            }
        });

        let status = self.addressing.status_address(&agent.address);
        if let Err(e) = self.channel.subscribe(&status, on_status).await {
            // route stays registered and is attached on the next reconnect
            warn!(agent_id = agent.id, error = %e, "Status subscription failed");
        }

        let mut setup = vec![Command::new(
            agent.id,
            Instruction::Light {
                colour: agent.colour.clone(),
            },
        )];
        if let Some(source) = &self.program {
            setup.push(Command::new(
                agent.id,
                Instruction::LoadProgram {
                    source: source.clone(),
                },
            ));
        }
        setup.push(Command::new(agent.id, Instruction::Run));

        let address = self.addressing.command_address(&agent.address);
        for command in setup {
            if let Err(e) = self.channel.publish_command(&address, &command).await {
                warn!(agent_id = agent.id, kind = %command.kind(), error = %e, "Setup command failed");
            }
        }
    }

    async fn home_agents(&mut self, now: Instant) -> bool {
        let tolerance = self.settings.home_tolerance_mm();
        let agents = self.registry.agents();

        if agents
            .iter()
            .all(|a| !a.is_lost(self.settings.max_missed_ticks) && a.is_home(tolerance))
        {
            self.transition(ArenaState::FacingOpponents, now);
            return true;
        }

        for agent in &agents {
            if agent.is_home(tolerance) || !self.can_command(agent, now) {
                continue;
            }
            self.steer(agent, &agent.home, now).await;
        }

        false
    }

    async fn face_opponents(&mut self, now: Instant) -> bool {
        let bases = self.registry.bases();
        let mean_y = if bases.is_empty() {
            0.0
        } else {
            bases.iter().map(|b| b.point.y).sum::<f64>() / bases.len() as f64
        };

        let agents = self.registry.agents();
        for agent in &agents {
            if self.oriented.contains(&agent.id) || !self.can_command(agent, now) {
                continue;
            }

            let target = if agent.home.y > mean_y {
                FACE_NORTH
            } else {
                FACE_SOUTH
            };
            let turn = course_change(agent.pose.heading, target).round() as i32;

            let oriented = match Command::drive(agent.id, turn, 0) {
                None => true,
                Some(command) => self.send(agent, command, now).await,
            };
            if oriented {
                debug!(agent_id = agent.id, turn = turn, "Agent oriented");
                self.oriented.insert(agent.id);
            }
        }

        if agents.iter().all(|a| self.oriented.contains(&a.id)) {
            self.transition(ArenaState::WaitingForBall, now);
            return true;
        }
        false
    }

    fn wait_for_ball(&mut self, now: Instant) -> bool {
        if self.ball.is_none() {
            return false;
        }
        self.transition(ArenaState::PlayingGame, now);
        true
    }

    async fn play(&mut self, now: Instant) -> bool {
        let Some(ball) = self.ball else {
            info!(session = %self.session, tick = self.tick, "Ball lost");
            self.transition(ArenaState::WaitingForBall, now);
            return true;
        };

        for agent in self.registry.agents() {
            if agent.is_lost(self.settings.max_missed_ticks) {
                continue;
            }
            if self.settings.broadcast_poses {
                self.broadcast_pose(&agent, &ball).await;
            }
            if self.busy.is_busy(agent.id, self.settings.busy_timeout(), now) {
                continue;
            }
            self.steer(&agent, &ball, now).await;
        }

        // staying in PlayingGame is the steady state, not a stall
        true
    }

    /// Not lost and not waiting on an acknowledgement
    fn can_command(&self, agent: &Agent, now: Instant) -> bool {
        if agent.is_lost(self.settings.max_missed_ticks) {
            debug!(agent_id = agent.id, missed = agent.missed_ticks, "Agent lost, not commanding");
            return false;
        }
        !self.busy.is_busy(agent.id, self.settings.busy_timeout(), now)
    }

    /// Turn towards `target` and drive the range to it.
    ///
    /// Only a combined turn and move is issued; an agent already lined up
    /// with its target, or already on it, is left alone.
    async fn steer(&self, agent: &Agent, target: &Point, now: Instant) -> bool {
        let Some((heading, distance)) = try_heading_and_range(&agent.pose, target) else {
            return false;
        };

        let turn = course_change(agent.pose.heading, heading).round() as i32;
        let distance = distance.round() as i32;
        if turn == 0 || distance == 0 {
            debug!(agent_id = agent.id, turn = turn, distance = distance, "No combined move needed");
            return false;
        }

        let Some(command) = Command::drive(agent.id, turn, distance) else {
            return false;
        };
        self.send(agent, command, now).await
    }

    /// Publish a command, tracking it as outstanding when it expects an ack
    async fn send(&self, agent: &Agent, command: Command, now: Instant) -> bool {
        // marked before publishing so an early ack is not lost
        if command.require_ack {
            self.busy.mark_busy(agent.id, now);
        }

        let address = self.addressing.command_address(&agent.address);
        match self.channel.publish_command(&address, &command).await {
            Ok(_) => true,
            Err(e) => {
                self.busy.cancel(agent.id);
                warn!(agent_id = agent.id, error = %e, "Command not delivered, retrying next tick");
                false
            }
        }
    }

    /// Tell an agent where it and the ball are
    async fn broadcast_pose(&self, agent: &Agent, ball: &Point) {
        let set = |name: &str, value: f64| Instruction::SetVariable {
            name: name.to_string(),
            value: value.round() as i64,
        };
        let command = Command::new(agent.id, set("x", agent.pose.x))
            .then(set("y", agent.pose.y))
            .then(set("heading", agent.pose.heading))
            .then(set("ballx", ball.x))
            .then(set("bally", ball.y));

        let address = self.addressing.command_address(&agent.address);
        if let Err(e) = self.channel.publish_command(&address, &command).await {
            warn!(agent_id = agent.id, error = %e, "Pose broadcast failed");
        }
    }
}
