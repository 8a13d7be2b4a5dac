//! Persistent loop controller.
//!
//! A [`Session`] forks once per generation and runs up to `max_iterations`
//! test cases inside each child, pausing with `SIGSTOP` between them. The
//! parent of every generation stays behind as the fork server: it waits for
//! the child to die, reports the status, waits for the supervisor's go word
//! and forks again. It never returns to the harness.
//!
//! ```text
//! Uninitialized ──► Handshaking ──► ForkedParent (fork server, never returns)
//!       │                 │
//!       │                 ├──► RunningChild ──► Exhausted ──► Terminated
//!       │                 └──► Degraded ──────► Exhausted
//!       └── max_iterations == 0 ──────────────► Exhausted
//! ```

use crate::channel::{ControlChannel, FdControlChannel, ProtocolError};
use crate::config::BridgeConfig;
use crate::coverage::{self, MappedRegion};
use crate::process::{ForkError, ForkRole, OsProcess, ProcessControl};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Exit status used when the supervisor protocol breaks down.
pub const PROTOCOL_EXIT_STATUS: i32 = 3;
/// Exit status used when a generation cannot be forked or reaped.
pub const FORK_EXIT_STATUS: i32 = 4;
/// Exit status used for API misuse in release builds.
pub const STATE_EXIT_STATUS: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Uninitialized,
    Handshaking,
    /// Fork server role. A session in this state is blocked in its serve loop.
    ForkedParent,
    RunningChild,
    /// No supervisor: iterations are only counted.
    Degraded,
    Exhausted,
    Terminated,
}

#[derive(Error, Debug)]
pub enum StateError {
    #[error("loop called after it reported exhaustion; the caller must force_exit")]
    AfterExhaustion,
    #[error("loop called on a terminated session")]
    Terminated,
    #[error("loop re-entered while in state {0:?}")]
    Reentered(LoopState),
}

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Fork(#[from] ForkError),
    #[error(transparent)]
    State(#[from] StateError),
}

impl BridgeError {
    /// The status the process exits with when this error ends it.
    pub fn exit_status(&self) -> i32 {
        match self {
            BridgeError::Protocol(_) => PROTOCOL_EXIT_STATUS,
            BridgeError::Fork(_) => FORK_EXIT_STATUS,
            BridgeError::State(_) => STATE_EXIT_STATUS,
        }
    }
}

/// Per-process bridge state.
///
/// The session owns the control channel and the coverage mapping; nothing
/// else in the process touches either.
pub struct Session<C, P> {
    config: BridgeConfig,
    shm_handle: Option<String>,
    channel: Option<C>,
    process: P,
    coverage: Option<MappedRegion>,
    state: LoopState,
    handshake_done: bool,
    is_forked_child: bool,
    iterations_remaining: Option<u64>,
    generation: u64,
}

impl Session<FdControlChannel, OsProcess> {
    /// A session for this process, configured from the environment.
    pub fn from_env() -> Self {
        let config = BridgeConfig::from_env().unwrap_or_else(|e| {
            warn!(error = %e, "ignoring invalid bridge environment, using defaults");
            BridgeConfig::default()
        });
        Self::from_config(config)
    }

    /// A session using `config`, the inherited descriptors and the map handle
    /// named by `config.shm_env_var`.
    pub fn from_config(config: BridgeConfig) -> Self {
        let shm_handle = std::env::var(&config.shm_env_var).ok();
        let channel = match FdControlChannel::inherit(config.read_fd(), config.write_fd()) {
            Ok(channel) => Some(channel),
            Err(e) => {
                debug!(error = %e, "control channel not inherited");
                None
            }
        };
        Self::new(config, shm_handle, channel, OsProcess)
    }
}

impl<C: ControlChannel, P: ProcessControl> Session<C, P> {
    /// `channel` is `None` when no control descriptors were inherited.
    pub fn new(
        config: BridgeConfig,
        shm_handle: Option<String>,
        channel: Option<C>,
        process: P,
    ) -> Self {
        Self {
            config,
            shm_handle,
            channel,
            process,
            coverage: None,
            state: LoopState::Uninitialized,
            handshake_done: false,
            is_forked_child: false,
            iterations_remaining: None,
            generation: 0,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn handshake_done(&self) -> bool {
        self.handshake_done
    }

    pub fn is_forked_child(&self) -> bool {
        self.is_forked_child
    }

    pub fn iterations_remaining(&self) -> Option<u64> {
        self.iterations_remaining
    }

    /// Number of generations forked by this process (or its fork-server ancestor).
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn coverage(&self) -> Option<&MappedRegion> {
        self.coverage.as_ref()
    }

    pub fn coverage_mut(&mut self) -> Option<&mut MappedRegion> {
        self.coverage.as_mut()
    }

    pub fn channel(&self) -> Option<&C> {
        self.channel.as_ref()
    }

    pub fn process(&self) -> &P {
        &self.process
    }

    /// Performs the handshake and the first fork, once.
    ///
    /// Returns in the child (or in a process without supervisor). In the
    /// fork-server parent it only returns with a fatal error.
    pub fn init(&mut self) -> Result<(), BridgeError> {
        match self.state {
            LoopState::Uninitialized => self.start(),
            LoopState::RunningChild | LoopState::Degraded => Ok(()),
            LoopState::Exhausted => Err(StateError::AfterExhaustion.into()),
            LoopState::Terminated => Err(StateError::Terminated.into()),
            state @ (LoopState::Handshaking | LoopState::ForkedParent) => {
                Err(StateError::Reentered(state).into())
            }
        }
    }

    /// Advances the loop. `Ok(true)` means run one more test case; `Ok(false)`
    /// means the budget is spent and the caller must exit immediately.
    ///
    /// The budget is fixed by the first call that sees a fresh child; later
    /// values of `max_iterations` are ignored.
    pub fn next(&mut self, max_iterations: u64) -> Result<bool, BridgeError> {
        match self.state {
            LoopState::Uninitialized => {
                if max_iterations == 0 {
                    self.iterations_remaining = Some(0);
                    self.state = LoopState::Exhausted;
                    return Ok(false);
                }
                self.start()?;
                Ok(self.begin_budget(max_iterations))
            }
            LoopState::RunningChild | LoopState::Degraded => match self.iterations_remaining {
                None => Ok(self.begin_budget(max_iterations)),
                Some(remaining) => self.advance(remaining),
            },
            LoopState::Exhausted => Err(StateError::AfterExhaustion.into()),
            LoopState::Terminated => Err(StateError::Terminated.into()),
            state @ (LoopState::Handshaking | LoopState::ForkedParent) => {
                Err(StateError::Reentered(state).into())
            }
        }
    }

    /// Records that the process is leaving through the immediate-exit path.
    pub fn mark_terminated(&mut self) {
        self.state = LoopState::Terminated;
    }

    fn start(&mut self) -> Result<(), BridgeError> {
        self.state = LoopState::Handshaking;

        // The map must be in place before the supervisor hears from us.
        let mut region = match coverage::attach(self.shm_handle.as_deref(), self.config.map_size) {
            Ok(region) => region,
            Err(e) => {
                warn!(error = %e, "coverage map unavailable, running uninstrumented");
                MappedRegion::Inert
            }
        };
        if region.is_instrumented() {
            region.publish();
        }
        self.coverage = Some(region);

        let handshake = match self.channel.as_mut() {
            Some(channel) => channel.handshake(),
            None => Err(ProtocolError::Unavailable {
                fd: self.config.read_fd(),
            }),
        };

        match handshake {
            Ok(ack) => {
                self.handshake_done = true;
                debug!(ack = ack.0, "supervisor handshake complete");
                self.serve()
            }
            Err(e) if !e.is_fatal() => {
                info!("no supervisor attached, running iterations without forking");
                self.channel = None;
                self.state = LoopState::Degraded;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Fork-server loop. Returns `Ok` only in a freshly forked child.
    fn serve(&mut self) -> Result<(), BridgeError> {
        loop {
            self.generation += 1;
            match self.process.fork_child()? {
                ForkRole::Child => {
                    self.is_forked_child = true;
                    self.state = LoopState::RunningChild;
                    let pid = self.process.current_pid();
                    self.channel_mut()?.announce(pid)?;
                    return Ok(());
                }
                ForkRole::Parent { child } => {
                    self.state = LoopState::ForkedParent;
                    debug!(generation = self.generation, child, "forked generation");

                    let report = self.process.wait_child(child)?;
                    debug!(generation = self.generation, %report, "generation ended");

                    let channel = self.channel_mut()?;
                    channel.report_exit(report.raw())?;
                    channel.wait_go()?;
                }
            }
        }
    }

    fn begin_budget(&mut self, max_iterations: u64) -> bool {
        let budget = if self.state == LoopState::RunningChild && !self.config.persistent {
            max_iterations.min(1)
        } else {
            max_iterations
        };

        self.iterations_remaining = Some(budget);
        if budget == 0 {
            self.state = LoopState::Exhausted;
            return false;
        }
        true
    }

    fn advance(&mut self, remaining: u64) -> Result<bool, BridgeError> {
        let left = remaining.saturating_sub(1);
        self.iterations_remaining = Some(left);
        if left == 0 {
            self.state = LoopState::Exhausted;
            return Ok(false);
        }

        if self.state == LoopState::RunningChild {
            let fd = self.config.read_fd();
            let channel = self
                .channel
                .as_mut()
                .ok_or(ProtocolError::Unavailable { fd })?;
            channel.signal_done()?;
            self.process.pause_self().map_err(ProtocolError::Io)?;
            channel.wait_go()?;
        }
        Ok(true)
    }

    fn channel_mut(&mut self) -> Result<&mut C, ProtocolError> {
        let fd = self.config.read_fd();
        self.channel
            .as_mut()
            .ok_or(ProtocolError::Unavailable { fd })
    }
}
