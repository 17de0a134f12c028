use super::machine::ArenaStateMachine;
use super::state::StageFailure;
use crate::marker::MarkerSource;
use std::time::{Duration, Instant};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, info_span, warn, Instrument};

/// How an arena run ended
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Stop signal or Ctrl-C
    Interrupted,
    /// The marker source ran out of frames
    SourceExhausted,
    /// A stage did not complete in time
    Failed(StageFailure),
}

/// Poll `source` every `tick_interval` and feed each frame to `machine`
/// until the arena stops.
///
/// A failed refresh skips the stage work for that tick; it is not fatal, but
/// stage deadlines keep running.
pub async fn run(
    machine: &mut ArenaStateMachine,
    source: &mut dyn MarkerSource,
    tick_interval: Duration,
) -> RunOutcome {
    let span = info_span!("arena", session = %machine.session());
    run_loop(machine, source, tick_interval).instrument(span).await
}

async fn run_loop(
    machine: &mut ArenaStateMachine,
    source: &mut dyn MarkerSource,
    tick_interval: Duration,
) -> RunOutcome {
    info!(tick_ms = tick_interval.as_millis() as u64, "Arena loop starting");

    let mut timer = interval(tick_interval);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = timer.tick() => {}
            _ = &mut ctrl_c => {
                info!("Interrupted, stopping arena");
                machine.stop(Instant::now()).await;
                return RunOutcome::Interrupted;
            }
        }

        let frame = match source.refresh() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                info!(ticks = machine.tick_count(), "Marker source exhausted, stopping arena");
                machine.stop(Instant::now()).await;
                return RunOutcome::SourceExhausted;
            }
            Err(e) => {
                warn!(error = %e, "Marker refresh failed, skipping tick");
                if machine.tick_without_frame(Instant::now()).await.is_terminal() {
                    return finished(machine);
                }
                continue;
            }
        };

        if machine.tick(&frame, Instant::now()).await.is_terminal() {
            return finished(machine);
        }
    }
}

fn finished(machine: &ArenaStateMachine) -> RunOutcome {
    match machine.failure() {
        Some(failure) => RunOutcome::Failed(failure.clone()),
        None => RunOutcome::Interrupted,
    }
}
