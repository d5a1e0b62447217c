//! A single-threaded, event-driven I/O reactor with a structured
//! startup/shutdown lifecycle.
//!
//! [`reactor::Reactor`] is the crate's whole surface: register system-event
//! hooks with [`reactor::Reactor::add_system_event_trigger`], delayed calls
//! with [`reactor::Reactor::call_later`], and transports with
//! [`reactor::Reactor::add_transport`], then drive it with
//! [`reactor::Reactor::run`] or step it by hand with
//! [`reactor::Reactor::iterate`].

pub mod reactor;

pub use reactor::{
    CallbackError, CompletionHandle, CompletionId, Error, EventPhase, EventType, Hook, MethodId,
    Outcome, Reactor, State, Transport, TransportState,
};
