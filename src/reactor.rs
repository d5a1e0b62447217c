//! A single-threaded, event-driven I/O reactor.
//!
//! [`Reactor`] owns the poll loop: a lazily-rebuilt [`transport::TransportTable`]
//! polled via `libc::poll`, a [`timer::TimerWheel`] of delayed callbacks, and
//! an [`events::EventRegistry`] of system-event hooks (STARTUP/SHUTDOWN/PERSIST
//! x BEFORE/DURING/AFTER) driving a strict INIT -> RUNNING -> STOPPING -> DONE
//! lifecycle. A process-wide [`signal`] latch feeds SIGINT/SIGTERM into
//! orderly shutdown.

mod events;
mod method;
mod signal;
mod timer;
mod transport;

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;

use events::{CompletionIds, EventRegistry};
use timer::TimerWheel;
use transport::TransportTable;

pub use events::{CompletionHandle, CompletionId, EventPhase, EventType, Hook, Outcome};
pub use method::MethodId;
pub use transport::{Transport, TransportState};

/// The error type threaded through every fallible callback the reactor
/// invokes: event hooks, timers, and transport read/write hooks.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// The reactor's lifecycle state. Transitions form a strict DAG with no
/// backward edges: a reactor that reaches [`State::Done`] does not restart.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    Init,
    Running,
    Stopping,
    Done,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Init => "INIT",
            State::Running => "RUNNING",
            State::Stopping => "STOPPING",
            State::Done => "DONE",
        };
        f.write_str(s)
    }
}

/// Errors returned by the reactor's registration APIs and poll loop.
#[derive(Debug, Error)]
pub enum Error {
    #[error("a reactor is already stepping in this process")]
    AlreadyRunning,
    #[error("poll(2) failed: {0}")]
    Poll(#[source] std::io::Error),
    #[error("{0:?} is not a valid event phase")]
    InvalidPhase(String),
    #[error("{0:?} is not a valid event type")]
    InvalidEventType(String),
    #[error("no method registered with id {0:?}")]
    UnknownMethod(MethodId),
    #[error("no pending completion with id {0:?}")]
    UnknownCompletion(CompletionId),
    #[error("operation is not implemented")]
    NotImplemented,
}

/// Process-wide re-entrancy guard: at most one reactor may be stepping at a
/// time, matching the original C reactor's single active-loop invariant.
static STEPPING: AtomicBool = AtomicBool::new(false);

struct StepGuard;

impl StepGuard {
    fn acquire() -> Result<Self, Error> {
        if STEPPING.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }
        Ok(Self)
    }
}

impl Drop for StepGuard {
    fn drop(&mut self) {
        STEPPING.store(false, Ordering::SeqCst);
    }
}

fn duration_from_secs(seconds: f64) -> Duration {
    Duration::try_from_secs_f64(seconds.max(0.0)).unwrap_or(Duration::ZERO)
}

/// The reactor: owns hook registrations, timers, and transports, and drives
/// them through `run`/`iterate`.
pub struct Reactor {
    state: State,
    event_triggers: EventRegistry,
    completion_ids: CompletionIds,
    /// Completion ids outstanding for `deferred_event`'s BEFORE phase.
    ///
    /// Tracked by identity rather than by holding the completion handle
    /// itself, matching the original source's choice to store a handle's
    /// numeric identity rather than the handle object (see `DESIGN.md`).
    defer_list: HashSet<CompletionId>,
    deferred_event: Option<EventType>,
    /// Set by `stop()` when called while `defer_list` is draining for a
    /// different event; consumed once that event's phase chain finishes.
    pending_shutdown: bool,
    startup_fired: bool,
    transports: TransportTable,
    timed_methods: TimerWheel,
}

impl Default for Reactor {
    fn default() -> Self {
        Self {
            state: State::Init,
            event_triggers: EventRegistry::new(),
            completion_ids: CompletionIds::new(),
            defer_list: HashSet::new(),
            deferred_event: None,
            pending_shutdown: false,
            startup_fired: false,
            transports: TransportTable::new(),
            timed_methods: TimerWheel::new(),
        }
    }
}

impl Reactor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn live_transport_count(&self) -> usize {
        self.transports.live_count()
    }

    pub fn pending_completion_count(&self) -> usize {
        self.defer_list.len()
    }

    pub fn is_deferring(&self) -> bool {
        !self.defer_list.is_empty()
    }

    /// Allocates a fresh [`CompletionHandle`] with a stable identity.
    ///
    /// A BEFORE-phase hook that needs to suspend its phase chain calls this
    /// before returning `Ok(Outcome::Pending(handle))`, then later passes
    /// that same handle to [`Reactor::resolve_completion`] once whatever it
    /// was waiting on finishes. This is the only supported way to construct
    /// a `CompletionHandle`: its inner id is crate-private, so an embedding
    /// application cannot build one by hand.
    pub fn new_completion_handle(&mut self) -> CompletionHandle {
        CompletionHandle(self.completion_ids.advance())
    }

    /// Registers `hook` to run during `phase` of `event_type`; returns an id
    /// usable with [`Reactor::remove_system_event_trigger`].
    pub fn add_system_event_trigger(
        &mut self,
        phase: EventPhase,
        event_type: EventType,
        hook: Box<Hook>,
    ) -> MethodId {
        self.event_triggers.add(event_type, phase, hook)
    }

    /// Like [`Reactor::add_system_event_trigger`], but taking the wire-level
    /// string spellings (`"before"`/`"startup"` etc.), validating them the
    /// way the original's string-keyed `addSystemEventTrigger` binding did.
    pub fn add_system_event_trigger_named(
        &mut self,
        phase: &str,
        event_type: &str,
        hook: Box<Hook>,
    ) -> Result<MethodId, Error> {
        let phase =
            EventPhase::parse(phase).ok_or_else(|| Error::InvalidPhase(phase.to_string()))?;
        let event_type = EventType::parse(event_type)
            .ok_or_else(|| Error::InvalidEventType(event_type.to_string()))?;
        Ok(self.add_system_event_trigger(phase, event_type, hook))
    }

    /// Removes a previously registered hook. Implemented in full, unlike the
    /// original's `removeSystemEventTrigger`, which is declared but never
    /// implemented upstream.
    pub fn remove_system_event_trigger(&mut self, id: MethodId) -> Result<(), Error> {
        if self.event_triggers.remove(id) {
            Ok(())
        } else {
            Err(Error::UnknownMethod(id))
        }
    }

    /// Schedules `callback` to run `delay` seconds from now.
    pub fn call_later(
        &mut self,
        delay: f64,
        callback: Box<dyn FnMut() -> Result<(), CallbackError>>,
    ) -> MethodId {
        self.timed_methods
            .schedule(duration_from_secs(delay), Instant::now(), callback)
    }

    /// Cancels a pending timer. Implemented in full, unlike the original's
    /// `cancelCallLater`, which is declared but never implemented upstream.
    pub fn cancel_call_later(&mut self, id: MethodId) -> Result<(), Error> {
        if self.timed_methods.cancel(id) {
            Ok(())
        } else {
            Err(Error::UnknownMethod(id))
        }
    }

    /// Adds a transport to the poll set. Ownership transfers to the reactor.
    pub fn add_transport(&mut self, transport: Box<dyn Transport>) {
        self.transports.add(transport);
    }

    /// Name resolution is an external collaborator's concern; not implemented
    /// here by design (see `DESIGN.md`).
    pub fn resolve(&self, _name: &str, _kind: &str, _timeout: f64) -> Result<(), Error> {
        Err(Error::NotImplemented)
    }

    /// Cross-thread scheduling is out of scope; not implemented by design.
    pub fn call_from_thread(&mut self, _callback: Box<dyn FnOnce() + Send>) -> Result<(), Error> {
        Err(Error::NotImplemented)
    }

    /// Cross-thread scheduling is out of scope; not implemented by design.
    pub fn crash(&mut self) -> Result<(), Error> {
        Err(Error::NotImplemented)
    }

    /// Initiates shutdown. A no-op once STOPPING or DONE. If STARTUP's BEFORE
    /// phase is still draining, the request is recorded and honored once
    /// that phase chain finishes, so the two chains never interleave.
    pub fn stop(&mut self) {
        match self.state {
            State::Running if self.defer_list.is_empty() => self.begin_shutdown(),
            State::Running => {
                log::debug!(target: "reactor", "stop() deferred until the current event finishes draining");
                self.pending_shutdown = true;
            }
            State::Init => {
                log::warn!(target: "reactor", "stop() called before the reactor has started");
            }
            State::Stopping | State::Done => {}
        }
    }

    fn begin_shutdown(&mut self) {
        self.state = State::Stopping;
        log::info!(target: "reactor", "Stopping: firing SHUTDOWN");
        self.fire_system_event(EventType::Shutdown);
    }

    /// Runs the three-phase hook protocol for `event_type`. Refuses to start
    /// a new event while another is still draining its BEFORE phase.
    pub fn fire_system_event(&mut self, event_type: EventType) {
        if !self.defer_list.is_empty() && self.deferred_event != Some(event_type) {
            log::warn!(
                target: "reactor",
                "Refusing to fire {event_type} while {:?} is still draining",
                self.deferred_event,
            );
            return;
        }

        log::debug!(target: "reactor::events", "Firing {event_type} BEFORE");
        let mut pending = false;
        {
            let hooks = self.event_triggers.list_mut(event_type, EventPhase::Before);
            for method in hooks.iter_mut() {
                match (method.callback)() {
                    Ok(Outcome::Done) => {}
                    Ok(Outcome::Pending(handle)) => {
                        self.defer_list.insert(handle.0);
                        pending = true;
                    }
                    Err(err) => {
                        log::error!(target: "reactor::events", "BEFORE hook for {event_type} failed: {err}");
                    }
                }
            }
        }

        if pending {
            self.deferred_event = Some(event_type);
            log::debug!(
                target: "reactor::events",
                "{event_type} deferred on {} pending completion(s)",
                self.defer_list.len(),
            );
        } else {
            self.finish_event(event_type);
        }
    }

    /// Runs DURING then AFTER for `event_type`, then applies whatever state
    /// transition and deferred stop request that completion unblocks.
    fn finish_event(&mut self, event_type: EventType) {
        for phase in [EventPhase::During, EventPhase::After] {
            log::debug!(target: "reactor::events", "Firing {event_type} {phase}");
            let hooks = self.event_triggers.list_mut(event_type, phase);
            for method in hooks.iter_mut() {
                if let Err(err) = (method.callback)() {
                    log::error!(target: "reactor::events", "{phase} hook for {event_type} failed: {err}");
                }
            }
        }

        if event_type == EventType::Shutdown && self.state == State::Stopping {
            self.state = State::Done;
            log::info!(target: "reactor", "Reactor is DONE");
        }

        if self.pending_shutdown && self.state == State::Running {
            self.pending_shutdown = false;
            self.begin_shutdown();
        }
    }

    /// Resolves a completion handle returned earlier by a BEFORE hook. Once
    /// the last outstanding handle for the deferred event resolves, its
    /// DURING and AFTER phases run.
    pub fn resolve_completion(&mut self, handle: CompletionHandle) -> Result<(), Error> {
        let CompletionHandle(id) = handle;
        if !self.defer_list.remove(&id) {
            return Err(Error::UnknownCompletion(id));
        }

        if self.defer_list.is_empty() {
            if let Some(event_type) = self.deferred_event.take() {
                self.finish_event(event_type);
            }
        }
        Ok(())
    }

    /// Runs steps until the reactor reaches DONE.
    pub fn run(&mut self) -> Result<(), Error> {
        loop {
            self.iterate(-1.0)?;
            if self.state == State::Done {
                return Ok(());
            }
        }
    }

    /// Runs exactly one step. `delay` is an upper bound on the wait, in
    /// seconds; 0.0 is non-blocking, negative waits for the next deadline
    /// only (or forever, if none is scheduled).
    pub fn iterate(&mut self, delay: f64) -> Result<(), Error> {
        let _guard = StepGuard::acquire()?;

        if !self.startup_fired {
            self.startup_fired = true;
            self.state = State::Running;
            signal::clear();
            signal::install();
            log::info!(target: "reactor", "Entering RUNNING: firing STARTUP");
            self.fire_system_event(EventType::Startup);
        }

        if self.state == State::Done {
            return Ok(());
        }

        let now = Instant::now();
        let method_delay = self.timed_methods.next_delay(now);
        let sleep_delay = match method_delay {
            None => delay,
            Some(d) => {
                let d_secs = d.as_secs_f64();
                if delay >= 0.0 {
                    d_secs.min(delay)
                } else {
                    d_secs
                }
            }
        };

        if self.transports.is_stale() {
            self.transports.rebuild();
        }

        let timeout_ms = Self::poll_timeout_ms(sleep_delay);
        let poll_array = self.transports.as_poll_array();
        let nfds = poll_array.len() as libc::nfds_t;

        log::trace!(target: "reactor", "Polling {nfds} descriptor(s) with timeout {timeout_ms}ms");
        let ret = unsafe { libc::poll(poll_array.as_mut_ptr(), nfds, timeout_ms) };

        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                log::trace!(target: "reactor", "poll(2) interrupted by a signal");
            } else {
                return Err(Error::Poll(err));
            }
        } else if ret > 0 {
            self.transports.dispatch_ready();
        }

        let now = Instant::now();
        self.timed_methods.run_due(now);

        if self.state == State::Running && signal::is_tripped() {
            log::info!(target: "reactor", "Signal observed, initiating shutdown");
            self.stop();
        }

        Ok(())
    }

    fn poll_timeout_ms(sleep_delay: f64) -> libc::c_int {
        if sleep_delay < 0.0 {
            -1
        } else {
            let millis = sleep_delay * 1000.0;
            if millis >= i32::MAX as f64 {
                i32::MAX
            } else {
                millis as i32
            }
        }
    }
}

/// Serializes tests that touch process-wide state (the re-entrancy guard,
/// the signal latch) so they don't observe each other's transient state when
/// the test harness runs them on parallel threads.
#[cfg(test)]
pub(crate) static TEST_SERIAL: std::sync::Mutex<()> = std::sync::Mutex::new(());
