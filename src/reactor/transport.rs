//! Transports and the descriptor table used to poll them.
//!
//! Mirrors the sibling reactor's `Transport<S: Session>`/`EventHandler` split,
//! but without a generic `Session`: a transport here is a trait object, and
//! the table keeps transport and cached readiness mask together in a single
//! `Vec<Slot>` rather than a transport list plus a parallel mio registry.

use std::os::unix::io::RawFd;

use crate::reactor::CallbackError;

/// Lifecycle state of a registered [`Transport`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportState {
    /// Eligible for readiness polling.
    Active,
    /// Torn down; evicted and released on the next rebuild.
    Closed,
}

/// An I/O endpoint the reactor polls for readiness.
///
/// Ownership transfers to the [`TransportTable`] on [`TransportTable::add`];
/// a transport is dropped once its state becomes [`TransportState::Closed`]
/// and a rebuild sweeps it.
pub trait Transport {
    fn descriptor(&self) -> RawFd;
    fn state(&self) -> TransportState;

    fn has_read_capability(&self) -> bool {
        false
    }

    fn has_write_capability(&self) -> bool {
        false
    }

    /// Bytes currently queued in the outbound buffer.
    fn pending_bytes(&self) -> usize {
        0
    }

    /// Whether a producer is attached that may still have bytes to write
    /// even with an empty outbound buffer.
    fn has_producer(&self) -> bool {
        false
    }

    fn read(&mut self) -> Result<(), CallbackError> {
        Ok(())
    }

    fn write(&mut self) -> Result<(), CallbackError> {
        Ok(())
    }

    /// Forces `state()` to report [`TransportState::Closed`] from now on.
    ///
    /// Called by the table itself when `poll(2)` reports an error or hangup
    /// bit for this transport's descriptor; distinct from [`Transport::close`],
    /// which runs once, later, when the table actually evicts it.
    fn force_close(&mut self);

    /// Runs once, when the table releases this transport.
    fn close(&mut self) {}
}

struct Slot {
    transport: Box<dyn Transport>,
    /// `libc::POLLIN`/`libc::POLLOUT` bits requested as of the last rebuild.
    mask: libc::c_short,
}

const INITIAL_CAPACITY: usize = 8;

/// Ordered transports plus the contiguous `pollfd` array mirroring them for
/// `libc::poll`.
///
/// The array is rebuilt lazily: adding a transport or marking one
/// [`TransportState::Closed`] sets `stale`, and the next poll step rebuilds
/// before waiting on readiness.
pub struct TransportTable {
    slots: Vec<Slot>,
    descriptors: Vec<libc::pollfd>,
    stale: bool,
}

impl Default for TransportTable {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            descriptors: Vec::with_capacity(INITIAL_CAPACITY),
            stale: true,
        }
    }
}

impl TransportTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `transport` to the table; ownership transfers to the table.
    pub fn add(&mut self, transport: Box<dyn Transport>) {
        self.slots.push(Slot { transport, mask: 0 });
        self.stale = true;
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn mark_closed(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index) {
            slot.transport.force_close();
        }
        self.stale = true;
    }

    pub fn live_count(&self) -> usize {
        self.slots.len()
    }

    /// Evicts CLOSED transports, then recomputes the requested-events mask
    /// for everything that remains. Reallocates the descriptor array to
    /// twice the live count if its element capacity is insufficient.
    pub fn rebuild(&mut self) {
        let mut i = 0;
        while i < self.slots.len() {
            if self.slots[i].transport.state() == TransportState::Closed {
                let mut slot = self.slots.remove(i);
                slot.transport.close();
                log::debug!(target: "reactor::transport", "Released closed transport fd={}", slot.transport.descriptor());
            } else {
                i += 1;
            }
        }

        if self.descriptors.capacity() < self.slots.len() {
            self.descriptors = Vec::with_capacity(self.slots.len() * 2);
        }
        self.descriptors.clear();

        for slot in &mut self.slots {
            let mut mask: libc::c_short = 0;
            if slot.transport.state() == TransportState::Active && slot.transport.has_read_capability() {
                mask |= libc::POLLIN;
            }
            if slot.transport.has_write_capability()
                && (slot.transport.pending_bytes() > 0 || slot.transport.has_producer())
            {
                mask |= libc::POLLOUT;
            }
            slot.mask = mask;
            self.descriptors.push(libc::pollfd {
                fd: slot.transport.descriptor(),
                events: mask,
                revents: 0,
            });
        }

        self.stale = false;
    }

    /// Raw pointer/len pair handed to `libc::poll`.
    pub(crate) fn as_poll_array(&mut self) -> &mut [libc::pollfd] {
        &mut self.descriptors
    }

    /// Walks transports and descriptor slots in lockstep, dispatching
    /// read/write hooks for non-zero `revents` and marking error/hangup
    /// descriptors CLOSED. Returns the number of transports dispatched to.
    pub fn dispatch_ready(&mut self) -> usize {
        let mut dispatched = 0;

        for (index, descriptor) in self.descriptors.iter().enumerate() {
            let revents = descriptor.revents;
            if revents == 0 {
                continue;
            }
            dispatched += 1;

            if revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
                self.mark_closed(index);
                continue;
            }

            let slot = &mut self.slots[index];
            if revents & libc::POLLIN != 0 {
                if let Err(err) = slot.transport.read() {
                    log::error!(target: "reactor::transport", "Read hook failed: {err}");
                }
            }
            if revents & libc::POLLOUT != 0 {
                if let Err(err) = slot.transport.write() {
                    log::error!(target: "reactor::transport", "Write hook failed: {err}");
                }
            }
        }
        dispatched
    }
}
