use crate::generator::MessageGenerator;
use crate::progress::{EventSink, Progress, Total};
use crate::record::{RecordError, RecordPolicy, Recorder};
use crate::target::{Target, TargetError};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Consecutive failures on one message after which the target counts as crashed.
pub const STRIKES: u32 = 3;

const BACKOFF_EXPONENT: f64 = 0.75;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Running,
    Finished,
    Canceled,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Idle => "IDLE",
            EngineState::Running => "RUNNING",
            EngineState::Finished => "FINISHED",
            EngineState::Canceled => "CANCELED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    State(EngineState),
    Progress(Progress),
    /// The current message failed and will be resent after `wait`.
    Retry { attempt: u32, wait: Duration },
    /// The message of `iteration` was recorded as a crash.
    Crash { iteration: u64 },
    Reconnecting { attempt: u64, wait: Duration },
    Reconnected { outage: Duration },
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Engine already ran; create a new one for another run")]
    AlreadyStarted,
    #[error("Failed to connect to target {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: TargetError,
    },
    #[error(transparent)]
    Record(#[from] RecordError),
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Pause between iterations; also the base of every backoff wait.
    pub interval: Duration,
    pub policy: RecordPolicy,
    /// Stop after this many iterations even if the generator could go on.
    pub max_iterations: Option<u64>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            policy: RecordPolicy::Critical,
            max_iterations: None,
        }
    }
}

/// Outcome of one run. The recorder still owns the records' temporary files;
/// call [`Recorder::persist`] to keep them.
#[derive(Debug)]
pub struct RunReport {
    pub state: EngineState,
    pub iterations: u64,
    pub crashes: usize,
    /// Wall-clock time of the run minus `outage`.
    pub duration: Duration,
    /// Time spent reconnecting to a crashed target.
    pub outage: Duration,
    pub recorder: Recorder,
}

/// Wait before resending after the `attempt`-th consecutive failure.
pub fn retry_backoff(attempt: u32, interval: Duration) -> Duration {
    scaled(f64::from(attempt + 2), interval)
}

/// Wait before reconnect number `attempt`, counting from 1.
pub fn reconnect_backoff(attempt: u64, interval: Duration) -> Duration {
    scaled(attempt as f64, interval)
}

fn scaled(base: f64, interval: Duration) -> Duration {
    let millis = (base.powf(BACKOFF_EXPONENT) * interval.as_millis() as f64).round();
    Duration::from_millis(millis as u64)
}

async fn until_canceled<F: Future>(cancel: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        out = fut => Some(out),
    }
}

enum Delivery {
    Answered(Vec<u8>),
    Crashed,
}

/// Drives one fuzzing run against a target.
///
/// Messages are sent strictly one after another. A message that goes
/// unanswered is resent after a growing backoff; the third consecutive
/// failure records it as a crash and the engine reconnects until the target
/// is reachable again, then carries on with the next message.
pub struct FuzzingEngine<T: Target> {
    target: T,
    generator: MessageGenerator,
    settings: EngineSettings,
    events: EventSink<EngineEvent>,
    state: EngineState,
}

impl<T: Target> FuzzingEngine<T> {
    pub fn new(
        target: T,
        generator: MessageGenerator,
        settings: EngineSettings,
        events: EventSink<EngineEvent>,
    ) -> Self {
        Self {
            target,
            generator,
            settings,
            events,
            state: EngineState::Idle,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    fn set_state(&mut self, state: EngineState) {
        info!("Fuzzing engine {} -> {}", self.state, state);
        self.state = state;
        self.events.emit(EngineEvent::State(state));
    }

    /// Total work for the run, honouring the iteration cap.
    pub fn total(&self) -> Total {
        match (self.generator.iterations(), self.settings.max_iterations) {
            (Total::Finite(n), Some(cap)) => Total::Finite(n.min(cap)),
            (Total::Unbounded, Some(cap)) => Total::Finite(cap),
            (total, None) => total,
        }
    }

    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<RunReport, EngineError> {
        if self.state != EngineState::Idle {
            return Err(EngineError::AlreadyStarted);
        }
        let mut recorder = Recorder::new(self.settings.policy)?;
        let total = self.total();
        self.set_state(EngineState::Running);
        info!(
            "Fuzzing {} with {} iterations",
            self.target.describe(),
            total
        );

        let started = Instant::now();
        let mut outage = Duration::ZERO;
        let mut iterations = 0u64;

        let finished = 'run: {
            match until_canceled(cancel, self.target.connect()).await {
                None => break 'run false,
                Some(Err(source)) => {
                    self.set_state(EngineState::Canceled);
                    return Err(EngineError::Connect {
                        target: self.target.describe(),
                        source,
                    });
                }
                Some(Ok(())) => {}
            }

            loop {
                if total.finite().is_some_and(|n| iterations >= n) {
                    break 'run true;
                }
                let Some(message) = self.generator.next_message() else {
                    break 'run true;
                };

                let Some(delivery) = self.deliver(cancel, &message).await else {
                    break 'run false;
                };
                match delivery {
                    Delivery::Answered(response) => {
                        recorder.record_exchange(iterations, &message, &response)?;
                    }
                    Delivery::Crashed => {
                        error!(
                            "Target {} crashed on iteration {} ({} byte message)",
                            self.target.describe(),
                            iterations,
                            message.len()
                        );
                        recorder.record_crash(iterations, &message)?;
                        self.events.emit(EngineEvent::Crash {
                            iteration: iterations,
                        });
                        let Some(lost) = self.reconnect(cancel).await else {
                            break 'run false;
                        };
                        outage += lost;
                    }
                }

                iterations += 1;
                self.events.emit(EngineEvent::Progress(Progress {
                    done: iterations,
                    total,
                }));

                if until_canceled(cancel, tokio::time::sleep(self.settings.interval))
                    .await
                    .is_none()
                {
                    break 'run false;
                }
            }
        };

        self.set_state(if finished {
            EngineState::Finished
        } else {
            EngineState::Canceled
        });
        let duration = started.elapsed().saturating_sub(outage);
        let crashes = recorder.crash_count();
        info!(
            "Run ended after {} iterations, {} crashes, {:?} active",
            iterations, crashes, duration
        );
        Ok(RunReport {
            state: self.state,
            iterations,
            crashes,
            duration,
            outage,
            recorder,
        })
    }

    /// Sends `message` until it is answered or has failed [`STRIKES`] times.
    /// `None` means the run was canceled.
    async fn deliver(&mut self, cancel: &CancellationToken, message: &[u8]) -> Option<Delivery> {
        let interval = self.settings.interval;
        let mut failures = 0u32;
        loop {
            match until_canceled(cancel, self.target.send_receive(message)).await? {
                Ok(response) => return Some(Delivery::Answered(response)),
                Err(e) => {
                    failures += 1;
                    if failures >= STRIKES {
                        return Some(Delivery::Crashed);
                    }
                    let wait = retry_backoff(failures, interval);
                    warn!(
                        "Send failed ({}), strike {}/{}; resending in {:?}",
                        e, failures, STRIKES, wait
                    );
                    self.events.emit(EngineEvent::Retry {
                        attempt: failures,
                        wait,
                    });
                    until_canceled(cancel, tokio::time::sleep(wait)).await?;
                }
            }
        }
    }

    /// Tries to reach the target until it accepts a connection again. Returns the
    /// time spent, or `None` when canceled.
    async fn reconnect(&mut self, cancel: &CancellationToken) -> Option<Duration> {
        let interval = self.settings.interval;
        let outage_started = Instant::now();
        let mut attempt = 1u64;
        loop {
            let wait = reconnect_backoff(attempt, interval);
            warn!(
                "Reconnecting to {} in {:?} (attempt {})",
                self.target.describe(),
                wait,
                attempt
            );
            self.events.emit(EngineEvent::Reconnecting { attempt, wait });
            until_canceled(cancel, tokio::time::sleep(wait)).await?;
            match until_canceled(cancel, self.target.connect()).await? {
                Ok(()) => break,
                Err(e) => debug!("Reconnect attempt {} failed: {}", attempt, e),
            }
            attempt += 1;
        }
        let outage = outage_started.elapsed();
        info!("Target {} reachable again after {:?}", self.target.describe(), outage);
        self.events.emit(EngineEvent::Reconnected { outage });
        Some(outage)
    }
}
