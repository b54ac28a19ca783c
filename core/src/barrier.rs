//! Distributed counting barrier
//!
//! Lets independent worker processes that run parts of the same scope agree
//! on "first in performs setup, last out performs teardown" without a live
//! coordinator. Every registrant increments a pair of counters persisted in a
//! shared directory while holding an exclusive advisory lock on that
//! directory:
//!
//! ```text
//! <base>/distributed_setup/<run_uid>/<scope path>/
//!     lock
//!     root_state.json      {"setup_count": n, "teardown_count": m}
//!     client-workspace/    created on first use
//! ```
//!
//! The lock stays held while the caller's body runs, and the incremented
//! counters are only persisted when the guard is committed.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use testfan_common::lock::DEFAULT_POLL_INTERVAL;
use testfan_common::{ErrorContext, FileLock, state_file};
use tracing::{debug, info};

use crate::config::BarrierConfig;
use crate::error::{CoordinationError, CoordinationResult};
use crate::grouping::SCOPE_SEPARATOR;
use crate::types::WorkerId;

/// Directory under the base dir holding all barriers.
pub const BARRIER_DIR_NAME: &str = "distributed_setup";
const LOCK_FILE_NAME: &str = "lock";
const STATE_FILE_NAME: &str = "root_state.json";
const CLIENT_DIR_NAME: &str = "client-workspace";

/// Persisted counters. `teardown_count <= setup_count` always holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrierState {
    pub setup_count: u64,
    pub teardown_count: u64,
}

impl fmt::Display for BarrierState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "setup_count={}; teardown_count={}",
            self.setup_count, self.teardown_count
        )
    }
}

/// Path segment for one piece of a scope id. `.` and `..` are escaped so they
/// cannot walk out of the run directory.
fn escape_segment(segment: &str) -> String {
    match segment {
        "." => "%2E".to_string(),
        ".." => "%2E%2E".to_string(),
        other => other.to_string(),
    }
}

/// A barrier rooted at one scope directory, seen from one registrant.
#[derive(Debug, Clone)]
pub struct CountingBarrier {
    root_dir: PathBuf,
    worker_id: WorkerId,
    poll_interval: Duration,
}

impl CountingBarrier {
    pub fn new(root_dir: impl Into<PathBuf>, worker_id: impl Into<WorkerId>) -> Self {
        Self {
            root_dir: root_dir.into(),
            worker_id: worker_id.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// The barrier of `scope` for the run described by `config`.
    ///
    /// Every `::`-separated component of the scope becomes one path level.
    /// The resulting directory always lies below the run directory.
    pub fn for_scope(
        config: &BarrierConfig,
        scope: &str,
        worker_id: impl Into<WorkerId>,
    ) -> Self {
        let mut root_dir = config.base_dir.join(BARRIER_DIR_NAME).join(&config.run_uid);
        for component in scope.split(SCOPE_SEPARATOR) {
            for segment in component.split(['/', '\\']).filter(|s| !s.is_empty()) {
                root_dir.push(escape_segment(segment));
            }
        }
        Self::new(root_dir, worker_id).with_poll_interval(config.poll_interval())
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn lock_path(&self) -> PathBuf {
        self.root_dir.join(LOCK_FILE_NAME)
    }

    fn state_path(&self) -> PathBuf {
        self.root_dir.join(STATE_FILE_NAME)
    }

    /// Persisted counters, read without taking the lock.
    pub fn state(&self) -> CoordinationResult<Option<BarrierState>> {
        Ok(state_file::load(&self.state_path())?)
    }

    fn lock(&self, timeout: Duration) -> CoordinationResult<FileLock> {
        let path = self.lock_path();
        FileLock::acquire_with_poll(&path, timeout, self.poll_interval)
            .map_err(|e| CoordinationError::from_lock(path, e))
    }

    fn invalid_state(&self, message: String) -> CoordinationError {
        CoordinationError::InvalidState {
            path: self.state_path(),
            message: format!("{} (worker {})", message, self.worker_id),
        }
    }

    /// Register for setup. Setup is allowed for the first registrant only.
    pub fn acquire_setup(&self, timeout: Duration) -> CoordinationResult<SetupGuard> {
        let lock = self.lock(timeout)?;
        let state_path = self.state_path();

        let mut state = match state_file::load::<BarrierState>(&state_path)? {
            Some(state) if state.setup_count == 0 => {
                return Err(self.invalid_state(format!("non-positive setup count; {}", state)));
            }
            // No teardown may start before every setup is accounted for.
            Some(state) if state.teardown_count != 0 => {
                return Err(self.invalid_state(format!(
                    "teardown started before setup completed; {}",
                    state
                )));
            }
            Some(state) => state,
            None => BarrierState::default(),
        };
        state.setup_count += 1;

        let context = SetupContext {
            setup_allowed: state.setup_count == 1,
            root_dir: self.root_dir.clone(),
            worker_id: self.worker_id.clone(),
        };
        info!("Acquired distributed setup: {}; {}", context, state);
        Ok(SetupGuard {
            lock,
            state,
            state_path,
            context,
        })
    }

    /// Register for teardown. Teardown is allowed for the last registrant only.
    pub fn acquire_teardown(
        &self,
        setup: &SetupContext,
        timeout: Duration,
    ) -> CoordinationResult<TeardownGuard> {
        assert_eq!(
            setup.root_dir, self.root_dir,
            "setup context belongs to another barrier"
        );
        let lock = self.lock(timeout)?;
        let state_path = self.state_path();

        let mut state = match state_file::load::<BarrierState>(&state_path)? {
            None => return Err(self.invalid_state("state file not found".to_string())),
            Some(state) if state.teardown_count >= state.setup_count => {
                return Err(self.invalid_state(format!(
                    "teardown count already reached setup count; {}",
                    state
                )));
            }
            Some(state) => state,
        };
        state.teardown_count += 1;

        let context = TeardownContext {
            teardown_allowed: state.teardown_count == state.setup_count,
            root_dir: self.root_dir.clone(),
            worker_id: self.worker_id.clone(),
        };
        info!("Acquired distributed teardown: {}; {}", context, state);
        Ok(TeardownGuard {
            lock,
            state,
            state_path,
            context,
        })
    }
}

fn client_dir(root_dir: &Path) -> CoordinationResult<PathBuf> {
    let path = root_dir.join(CLIENT_DIR_NAME);
    std::fs::create_dir_all(&path)
        .with_io_context(|| format!("creating client workspace {}", path.display()))?;
    Ok(path)
}

/// Outcome of a setup registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupContext {
    setup_allowed: bool,
    root_dir: PathBuf,
    worker_id: WorkerId,
}

impl SetupContext {
    /// Whether this registrant must perform the shared setup.
    pub fn setup_allowed(&self) -> bool {
        self.setup_allowed
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Directory shared by all registrants of the barrier, created on demand.
    pub fn client_dir(&self) -> CoordinationResult<PathBuf> {
        client_dir(&self.root_dir)
    }
}

impl fmt::Display for SetupContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "setup_allowed={}; worker_id={}; root_dir={}",
            self.setup_allowed,
            self.worker_id,
            self.root_dir.display()
        )
    }
}

/// Outcome of a teardown registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownContext {
    teardown_allowed: bool,
    root_dir: PathBuf,
    worker_id: WorkerId,
}

impl TeardownContext {
    /// Whether this registrant must perform the shared teardown.
    pub fn teardown_allowed(&self) -> bool {
        self.teardown_allowed
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn client_dir(&self) -> CoordinationResult<PathBuf> {
        client_dir(&self.root_dir)
    }
}

impl fmt::Display for TeardownContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "teardown_allowed={}; worker_id={}; root_dir={}",
            self.teardown_allowed,
            self.worker_id,
            self.root_dir.display()
        )
    }
}

/// Holds the barrier lock during setup. Dropping it without [`commit`]
/// releases the lock and forgets the registration.
///
/// [`commit`]: SetupGuard::commit
#[derive(Debug)]
pub struct SetupGuard {
    lock: FileLock,
    state: BarrierState,
    state_path: PathBuf,
    context: SetupContext,
}

impl SetupGuard {
    pub fn context(&self) -> &SetupContext {
        &self.context
    }

    /// Persist the registration and release the lock.
    pub fn commit(self) -> CoordinationResult<SetupContext> {
        state_file::save(&self.state_path, &self.state)?;
        debug!("Committed setup of {}: {}", self.context.worker_id, self.state);
        drop(self.lock);
        Ok(self.context)
    }
}

/// Holds the barrier lock during teardown.
#[derive(Debug)]
pub struct TeardownGuard {
    lock: FileLock,
    state: BarrierState,
    state_path: PathBuf,
    context: TeardownContext,
}

impl TeardownGuard {
    pub fn context(&self) -> &TeardownContext {
        &self.context
    }

    pub fn commit(self) -> CoordinationResult<TeardownContext> {
        state_file::save(&self.state_path, &self.state)?;
        debug!(
            "Committed teardown of {}: {}",
            self.context.worker_id, self.state
        );
        drop(self.lock);
        Ok(self.context)
    }
}

/// Runs a setup callback on the first registrant and a teardown callback on
/// the last one.
///
/// Each registrant calls [`maybe_call_setup`] exactly once, then
/// [`maybe_call_teardown`] exactly once. Any other order panics.
///
/// [`maybe_call_setup`]: SetupCoordinator::maybe_call_setup
/// [`maybe_call_teardown`]: SetupCoordinator::maybe_call_teardown
#[derive(Debug)]
pub struct SetupCoordinator {
    barrier: CountingBarrier,
    setup: Option<SetupContext>,
    teardown: Option<TeardownContext>,
}

impl SetupCoordinator {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(90);

    pub fn new(barrier: CountingBarrier) -> Self {
        Self {
            barrier,
            setup: None,
            teardown: None,
        }
    }

    pub fn barrier(&self) -> &CountingBarrier {
        &self.barrier
    }

    pub fn setup_context(&self) -> Option<&SetupContext> {
        self.setup.as_ref()
    }

    pub fn teardown_context(&self) -> Option<&TeardownContext> {
        self.teardown.as_ref()
    }

    /// Register for setup and run `callback` if this is the first registrant.
    ///
    /// Returns whether the callback ran. A failing callback leaves the
    /// registration unpersisted.
    pub fn maybe_call_setup<F>(&mut self, callback: F, timeout: Duration) -> CoordinationResult<bool>
    where
        F: FnOnce(&SetupContext) -> anyhow::Result<()>,
    {
        assert!(
            self.setup.is_none(),
            "maybe_call_setup() already called for worker {}",
            self.barrier.worker_id()
        );
        let guard = self.barrier.acquire_setup(timeout)?;
        self.setup = Some(guard.context().clone());

        let allowed = guard.context().setup_allowed();
        if allowed {
            callback(guard.context()).map_err(CoordinationError::Callback)?;
        }
        guard.commit()?;
        Ok(allowed)
    }

    /// Register for teardown and run `callback` if this is the last registrant.
    pub fn maybe_call_teardown<F>(
        &mut self,
        callback: F,
        timeout: Duration,
    ) -> CoordinationResult<bool>
    where
        F: FnOnce(&TeardownContext) -> anyhow::Result<()>,
    {
        let Some(setup) = self.setup.as_ref() else {
            panic!(
                "maybe_call_setup() not called yet for worker {}",
                self.barrier.worker_id()
            );
        };
        assert!(
            self.teardown.is_none(),
            "maybe_call_teardown() already called for worker {}",
            self.barrier.worker_id()
        );
        let guard = self.barrier.acquire_teardown(setup, timeout)?;
        self.teardown = Some(guard.context().clone());

        let allowed = guard.context().teardown_allowed();
        if allowed {
            callback(guard.context()).map_err(CoordinationError::Callback)?;
        }
        guard.commit()?;
        Ok(allowed)
    }
}
