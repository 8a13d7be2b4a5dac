//! Persistent-mode fork-server bridge for coverage-guided fuzzing supervisors.
//!
//! A harness runs its test body in a loop:
//!
//! ```no_run
//! while forkbridge_core::persistent_loop(1000) {
//!     // read the input, exercise the target
//! }
//! forkbridge_core::force_exit(0);
//! ```
//!
//! Under a supervisor the process forks once per generation and pauses
//! between iterations; without one the loop simply counts iterations.
//! When `persistent_loop` returns `false` the caller must call [`force_exit`]
//! before doing anything else, logging included.

pub mod channel;
pub mod config;
pub mod controller;
pub mod coverage;
pub mod process;

pub use channel::{Ack, ControlChannel, FdControlChannel, ProtocolError};
pub use config::BridgeConfig;
pub use controller::{BridgeError, LoopState, Session, StateError};
pub use coverage::{AttachError, MappedRegion, area_len, area_ptr};
pub use process::{ExitReport, ForkError, ForkRole, OsProcess, ProcessControl};

use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use tracing::error;

type ProcessSession = Session<FdControlChannel, OsProcess>;

static SESSION: OnceLock<Mutex<ProcessSession>> = OnceLock::new();

fn lock_session() -> MutexGuard<'static, ProcessSession> {
    SESSION
        .get_or_init(|| Mutex::new(Session::from_env()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// Installs `config` for the process-wide session.
///
/// Must run before the first [`persistent_loop`] or [`init`] call; returns
/// `false` if the session already exists.
pub fn configure(config: BridgeConfig) -> bool {
    // Only build a session when none exists: building one takes ownership of
    // the control descriptors, and dropping a spare would close them.
    let mut installed = false;
    SESSION.get_or_init(|| {
        installed = true;
        Mutex::new(Session::from_config(config))
    });
    installed
}

/// Runs the next iteration of the persistent loop.
///
/// Returns `true` while the caller should execute one more test case.
/// On `false` the caller must call [`force_exit`] immediately; continuing
/// instead either hangs waiting for a go word that never comes or runs code
/// the supervisor is not tracking. Fatal bridge errors end the process with
/// a non-zero status and never reach the caller.
pub fn persistent_loop(max_iterations: u64) -> bool {
    let mut session = lock_session();
    let was_child = session.is_forked_child();
    match session.next(max_iterations) {
        Ok(more) => {
            if !was_child {
                arm_child(&session);
            }
            more
        }
        Err(err) => fail(err),
    }
}

/// Performs the supervisor handshake and the first fork right now.
///
/// For harnesses with expensive setup: call this after the setup so every
/// generation starts from the prepared state. Later calls are no-ops.
pub fn init() {
    let mut session = lock_session();
    let was_child = session.is_forked_child();
    if let Err(err) = session.init() {
        fail(err);
    }
    if !was_child {
        arm_child(&session);
    }
}

/// Leaves the process immediately with `status`, skipping all cleanup.
pub fn force_exit(status: i32) -> ! {
    if let Some(lock) = SESSION.get() {
        if let Ok(mut session) = lock.try_lock() {
            session.mark_terminated();
        }
    }
    process::force_exit(status)
}

fn arm_child(session: &ProcessSession) {
    if session.is_forked_child() && session.config().abort_on_panic {
        process::install_abort_on_panic();
    }
}

fn fail(err: BridgeError) -> ! {
    if cfg!(debug_assertions) {
        if let BridgeError::State(state_err) = &err {
            panic!("forkbridge loop misuse: {state_err}");
        }
    }
    error!(error = %err, status = err.exit_status(), "fork server bridge failed");
    process::force_exit(err.exit_status())
}
