/*!
 # Run-state guard

 Single-flight admission for animations. At most one animation runs at a
 time across every trigger source; a request that arrives while another
 is running is rejected immediately rather than queued.

 Each granted run gets its own [`CancellationToken`]. Cancelling only ever
 reaches the token of the run that is current at the moment of the call,
 and a permit can only clear the state it created, so a late cancel or a
 late release from an earlier run can never leak into the next one.
*/

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// What kind of animation holds the guard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    /// Scheduled or manually triggered sunrise
    Alarm,
    /// Any other animation (fills, scans, diagnostics)
    Pattern,
}

#[derive(Debug)]
struct CurrentRun {
    id: u64,
    kind: RunKind,
    token: CancellationToken,
}

#[derive(Debug, Default)]
struct GuardState {
    next_id: u64,
    current: Option<CurrentRun>,
}

/// Shared run-state guard; clones observe and control the same state
#[derive(Debug, Clone, Default)]
pub struct RunStateGuard {
    state: Arc<Mutex<GuardState>>,
}

/// Outcome of [`RunStateGuard::try_acquire`]
#[derive(Debug)]
pub enum Acquire {
    /// The caller now owns the strip until the permit is released
    Granted(RunPermit),
    /// Another animation is running
    Busy,
}

impl Acquire {
    /// Returns the permit if the guard was granted
    pub fn granted(self) -> Option<RunPermit> {
        match self {
            Acquire::Granted(permit) => Some(permit),
            Acquire::Busy => None,
        }
    }
}

impl RunStateGuard {
    /// Creates an idle guard
    pub fn new() -> Self {
        Self::default()
    }

    /// Transitions idle to running, or reports busy without blocking
    pub fn try_acquire(&self, kind: RunKind) -> Acquire {
        let mut state = self.state.lock();
        if let Some(current) = &state.current {
            trace!("Guard busy with run {} ({:?})", current.id, current.kind);
            return Acquire::Busy;
        }

        state.next_id += 1;
        let id = state.next_id;
        let token = CancellationToken::new();
        state.current = Some(CurrentRun {
            id,
            kind,
            token: token.clone(),
        });
        debug!("Run {} ({:?}) acquired the strip", id, kind);

        Acquire::Granted(RunPermit {
            guard: self.clone(),
            id,
            kind,
            token,
            released: false,
        })
    }

    /// Whether an animation currently holds the guard
    pub fn is_running(&self) -> bool {
        self.state.lock().current.is_some()
    }

    /// Kind of the animation holding the guard, if any
    pub fn running_kind(&self) -> Option<RunKind> {
        self.state.lock().current.as_ref().map(|run| run.kind)
    }

    /// Signals the current run to stop; returns false when idle
    pub fn request_cancel(&self) -> bool {
        self.cancel_where(|_| true)
    }

    /// Signals the current run to stop only if it is of `kind`
    pub fn request_cancel_kind(&self, kind: RunKind) -> bool {
        self.cancel_where(|run| run.kind == kind)
    }

    fn cancel_where(&self, predicate: impl Fn(&CurrentRun) -> bool) -> bool {
        let state = self.state.lock();
        match &state.current {
            Some(run) if predicate(run) => {
                debug!("Cancelling run {} ({:?})", run.id, run.kind);
                run.token.cancel();
                true
            }
            Some(_) => false,
            None => {
                trace!("Cancel requested while idle, ignoring");
                false
            }
        }
    }

    fn release(&self, id: u64) {
        let mut state = self.state.lock();
        if state.current.as_ref().is_some_and(|run| run.id == id) {
            state.current = None;
            debug!("Run {} released the strip", id);
        } else {
            trace!("Run {} already released", id);
        }
    }
}

/// Proof of holding the guard, released explicitly or on drop
pub struct RunPermit {
    guard: RunStateGuard,
    id: u64,
    kind: RunKind,
    token: CancellationToken,
    released: bool,
}

impl RunPermit {
    /// Identifier of this run, unique per guard
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Kind the run was acquired as
    pub fn kind(&self) -> RunKind {
        self.kind
    }

    /// This run's cancellation token
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Whether this run has been asked to stop
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Returns the guard to idle
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.guard.release(self.id);
        }
    }
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        self.release_once();
    }
}

impl fmt::Debug for RunPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunPermit")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}
