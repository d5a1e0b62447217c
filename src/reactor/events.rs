//! System events (`STARTUP`, `SHUTDOWN`, `PERSIST`) and their three-phase
//! (`BEFORE`, `DURING`, `AFTER`) hook protocol.
//!
//! This module owns the matrix of hook lists ([`EventRegistry`]). The
//! sequencing rules that make BEFORE-phase hooks able to defer DURING/AFTER —
//! by returning a [`CompletionHandle`] — live on [`crate::reactor::Reactor`]
//! itself, since they need access to the reactor's `defer_list` and `state`.

use std::fmt;

use crate::reactor::method::{MethodId, MethodList};
use crate::reactor::CallbackError;

/// The named lifecycle points a reactor fires hooks for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    Startup,
    Shutdown,
    Persist,
}

impl EventType {
    pub(crate) const ALL: [EventType; 3] = [EventType::Startup, EventType::Shutdown, EventType::Persist];

    pub(crate) fn index(self) -> usize {
        match self {
            EventType::Startup => 0,
            EventType::Shutdown => 1,
            EventType::Persist => 2,
        }
    }

    /// Parses the wire-level spelling used by `addSystemEventTrigger` callers.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "startup" => Some(EventType::Startup),
            "shutdown" => Some(EventType::Shutdown),
            "persist" => Some(EventType::Persist),
            _ => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventType::Startup => "startup",
            EventType::Shutdown => "shutdown",
            EventType::Persist => "persist",
        };
        f.write_str(s)
    }
}

/// One of the three phases a system event runs its hooks through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventPhase {
    Before,
    During,
    After,
}

impl EventPhase {
    pub(crate) const ALL: [EventPhase; 3] = [EventPhase::Before, EventPhase::During, EventPhase::After];

    pub(crate) fn index(self) -> usize {
        match self {
            EventPhase::Before => 0,
            EventPhase::During => 1,
            EventPhase::After => 2,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "before" => Some(EventPhase::Before),
            "during" => Some(EventPhase::During),
            "after" => Some(EventPhase::After),
            _ => None,
        }
    }
}

impl fmt::Display for EventPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventPhase::Before => "before",
            EventPhase::During => "during",
            EventPhase::After => "after",
        };
        f.write_str(s)
    }
}

/// Opaque identity of a completion handle returned by a BEFORE hook.
///
/// The reactor tracks this value, not the handle itself, mirroring the
/// original's choice to record a Deferred's `id()` rather than the Deferred
/// object (so the handle's own lifetime is entirely up to the caller).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CompletionId(pub(crate) u64);

/// A value returned by a BEFORE hook signaling that the phase chain must
/// pause until the wrapped identity is resolved via
/// [`crate::reactor::Reactor::resolve_completion`].
///
/// Hooks never build one of these by hand: a BEFORE hook obtains its handle
/// from [`crate::reactor::Reactor::new_completion_handle`] before returning
/// `Outcome::Pending`, then hands that same handle back later to
/// [`crate::reactor::Reactor::resolve_completion`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CompletionHandle(pub(crate) CompletionId);

/// Generates fresh, monotonically increasing [`CompletionId`]s.
///
/// Mirrors [`crate::reactor::method::MethodIds`]'s counter-with-wraparound
/// scheme; kept separate since completion ids and method ids are different
/// namespaces.
#[derive(Debug)]
pub(crate) struct CompletionIds {
    next: u64,
}

impl CompletionIds {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    #[inline]
    pub fn advance(&mut self) -> CompletionId {
        let current = self.next;
        self.next = current.checked_add(1).unwrap_or_else(|| {
            log::info!(target: "reactor::events", "Completion ids wrapped.");
            1
        });
        CompletionId(current)
    }
}

impl Default for CompletionIds {
    fn default() -> Self {
        Self::new()
    }
}

/// What a system-event hook did.
pub enum Outcome {
    /// The hook ran to completion synchronously.
    Done,
    /// The hook needs to suspend the phase chain; resolve the handle later.
    ///
    /// Only meaningful when returned from a BEFORE-phase hook — see
    /// [`crate::reactor::Reactor::fire_system_event`].
    Pending(CompletionHandle),
}

/// A system-event hook: `FnMut() -> Result<Outcome, CallbackError>`.
pub type Hook = dyn FnMut() -> Result<Outcome, CallbackError>;

/// The full 3x3 matrix of hook lists, indexed by `(EventType, EventPhase)`.
#[derive(Default)]
pub struct EventRegistry {
    triggers: [[MethodList<Hook>; 3]; 3],
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, event_type: EventType, phase: EventPhase, hook: Box<Hook>) -> MethodId {
        self.triggers[event_type.index()][phase.index()].push(hook)
    }

    /// Removes a hook by id from wherever it is registered.
    ///
    /// The id alone doesn't say which `(EventType, EventPhase)` cell it lives
    /// in, so every cell is checked; this mirrors `removeSystemEventTrigger`,
    /// which the original declares but never implements (see `DESIGN.md`).
    pub fn remove(&mut self, id: MethodId) -> bool {
        for event_type in EventType::ALL {
            for phase in EventPhase::ALL {
                if self.triggers[event_type.index()][phase.index()]
                    .remove(id)
                    .is_some()
                {
                    return true;
                }
            }
        }
        false
    }

    pub(crate) fn list_mut(&mut self, event_type: EventType, phase: EventPhase) -> &mut MethodList<Hook> {
        &mut self.triggers[event_type.index()][phase.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_roundtrips_through_its_wire_spelling() {
        for ty in EventType::ALL {
            assert_eq!(EventType::parse(&ty.to_string()), Some(ty));
        }
        assert_eq!(EventType::parse("bogus"), None);
    }

    #[test]
    fn event_phase_roundtrips_through_its_wire_spelling() {
        for phase in EventPhase::ALL {
            assert_eq!(EventPhase::parse(&phase.to_string()), Some(phase));
        }
        assert_eq!(EventPhase::parse("bogus"), None);
    }

    #[test]
    fn registry_cells_are_independent() {
        let mut registry = EventRegistry::new();
        registry.add(EventType::Startup, EventPhase::Before, Box::new(|| Ok(Outcome::Done)));

        assert!(!registry.list_mut(EventType::Startup, EventPhase::Before).is_empty());
        assert!(registry.list_mut(EventType::Startup, EventPhase::During).is_empty());
        assert!(registry.list_mut(EventType::Shutdown, EventPhase::Before).is_empty());
    }

    #[test]
    fn remove_finds_hook_in_whichever_cell_holds_it() {
        let mut registry = EventRegistry::new();
        let id = registry.add(EventType::Shutdown, EventPhase::After, Box::new(|| Ok(Outcome::Done)));

        assert!(registry.remove(id));
        assert!(!registry.remove(id), "removing twice is a no-op");
    }

    #[test]
    fn completion_ids_wrap_instead_of_overflowing() {
        let mut ids = CompletionIds { next: u64::MAX };
        let last = ids.advance();
        let wrapped = ids.advance();
        assert_eq!(last, CompletionId(u64::MAX));
        assert_eq!(wrapped, CompletionId(1));
    }
}
