//! Manages timed callbacks and triggers timeouts.
//!
//! Adapted from the sibling reactor's `Timer` (a `BTreeSet<Instant>` of bare
//! deadlines with no cancellation). The reactor core needs callbacks attached
//! to each deadline plus cancel-by-id, so entries are kept in a `Vec` sorted
//! by `(deadline, sequence)` instead.

use std::time::{Duration, Instant};

use crate::reactor::method::{MethodId, MethodIds};
use crate::reactor::CallbackError;

struct Entry {
    id: MethodId,
    deadline: Instant,
    /// Insertion order, used to break ties between equal deadlines.
    sequence: u64,
    callback: Box<dyn FnMut() -> Result<(), CallbackError>>,
}

/// A `MethodList` of timed callbacks sorted by earliest-first deadline, with
/// cancellation support.
#[derive(Default)]
pub struct TimerWheel {
    ids: MethodIds,
    sequence: u64,
    entries: Vec<Entry>,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` to run at `now + delay`, returning a fresh id.
    pub fn schedule(
        &mut self,
        delay: Duration,
        now: Instant,
        callback: Box<dyn FnMut() -> Result<(), CallbackError>>,
    ) -> MethodId {
        let id = self.ids.advance();
        let sequence = self.sequence;
        self.sequence += 1;
        let deadline = now + delay;

        let pos = self
            .entries
            .partition_point(|e| (e.deadline, e.sequence) <= (deadline, sequence));
        self.entries.insert(
            pos,
            Entry {
                id,
                deadline,
                sequence,
                callback,
            },
        );
        id
    }

    /// Removes the timer with the given id. No-op if absent.
    pub fn cancel(&mut self, id: MethodId) -> bool {
        if let Some(pos) = self.entries.iter().position(|e| e.id == id) {
            self.entries.remove(pos);
            true
        } else {
            false
        }
    }

    #[cfg(test)]
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn has_timers(&self) -> bool {
        !self.entries.is_empty()
    }

    /// Seconds until the head deadline, clamped to zero; `None` if empty.
    ///
    /// Matches `IReactorTime`'s convention of `-1` meaning "nothing
    /// scheduled" at the `f64`-seconds API boundary in
    /// [`crate::reactor::Reactor`]; internally this stays a `Duration`/`None`
    /// pair, which is easier to reason about and compose with `min`.
    pub fn next_delay(&self, now: Instant) -> Option<Duration> {
        let head = self.entries.first()?;
        Some(if head.deadline > now {
            head.deadline - now
        } else {
            Duration::ZERO
        })
    }

    /// Removes and invokes every timer whose deadline is `<= now`, in
    /// deadline order (ties broken by insertion order), returning how many
    /// ran.
    ///
    /// A callback that returns `Err` is reported and swallowed; it does not
    /// stop the sweep over the remaining due timers.
    pub fn run_due(&mut self, now: Instant) -> usize {
        let split = self.entries.partition_point(|e| e.deadline <= now);
        let due: Vec<Entry> = self.entries.drain(..split).collect();
        let count = due.len();

        for mut entry in due {
            if let Err(err) = (entry.callback)() {
                log::error!(target: "reactor::timer", "Timer {:?} failed: {err}", entry.id);
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use qcheck_macros::quickcheck;

    #[test]
    fn fires_in_deadline_order_not_registration_order() {
        let mut wheel = TimerWheel::new();
        let now = Instant::now();
        let order = Rc::new(RefCell::new(Vec::new()));

        let push = |wheel: &mut TimerWheel, order: Rc<RefCell<Vec<&'static str>>>, delay, tag| {
            wheel.schedule(
                Duration::from_millis(delay),
                now,
                Box::new(move || {
                    order.borrow_mut().push(tag);
                    Ok(())
                }),
            )
        };

        push(&mut wheel, order.clone(), 200, "a");
        push(&mut wheel, order.clone(), 100, "b");
        push(&mut wheel, order.clone(), 150, "c");

        assert_eq!(wheel.run_due(now + Duration::from_millis(250)), 3);
        assert_eq!(*order.borrow(), vec!["b", "c", "a"]);
    }

    #[test]
    fn ties_break_by_insertion_order() {
        let mut wheel = TimerWheel::new();
        let now = Instant::now();
        let order = Rc::new(RefCell::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = order.clone();
            wheel.schedule(
                Duration::from_millis(100),
                now,
                Box::new(move || {
                    order.borrow_mut().push(tag);
                    Ok(())
                }),
            );
        }

        wheel.run_due(now + Duration::from_millis(100));
        assert_eq!(*order.borrow(), vec!["first", "second", "third"]);
    }

    #[test]
    fn cancel_before_deadline_prevents_firing() {
        let mut wheel = TimerWheel::new();
        let now = Instant::now();
        let fired = Rc::new(RefCell::new(false));
        let fired2 = fired.clone();

        let id = wheel.schedule(
            Duration::from_millis(50),
            now,
            Box::new(move || {
                *fired2.borrow_mut() = true;
                Ok(())
            }),
        );

        assert!(wheel.cancel(id));
        assert!(!wheel.cancel(id), "cancelling twice is a no-op");
        wheel.run_due(now + Duration::from_millis(100));
        assert!(!*fired.borrow());
    }

    #[test]
    fn no_timer_fires_before_its_deadline() {
        let mut wheel = TimerWheel::new();
        let now = Instant::now();
        wheel.schedule(Duration::from_secs(10), now, Box::new(|| Ok(())));

        assert_eq!(wheel.run_due(now + Duration::from_secs(9)), 0);
        assert_eq!(wheel.count(), 1);
        assert_eq!(wheel.run_due(now + Duration::from_secs(10)), 1);
        assert!(!wheel.has_timers());
    }

    #[test]
    fn next_delay_tracks_the_clock() {
        let mut wheel = TimerWheel::new();
        let mut now = Instant::now();
        wheel.schedule(Duration::from_secs(3), now, Box::new(|| Ok(())));

        assert_eq!(wheel.next_delay(now), Some(Duration::from_secs(3)));
        now += Duration::from_secs(2);
        assert_eq!(wheel.next_delay(now), Some(Duration::from_secs(1)));
        now += Duration::from_secs(5);
        assert_eq!(wheel.next_delay(now), Some(Duration::ZERO));
    }

    #[test]
    fn a_failing_callback_does_not_stop_the_sweep() {
        let mut wheel = TimerWheel::new();
        let now = Instant::now();
        let ran = Rc::new(RefCell::new(0));

        wheel.schedule(Duration::ZERO, now, Box::new(|| Err("boom".into())));
        let ran2 = ran.clone();
        wheel.schedule(
            Duration::ZERO,
            now,
            Box::new(move || {
                *ran2.borrow_mut() += 1;
                Ok(())
            }),
        );

        assert_eq!(wheel.run_due(now), 2);
        assert_eq!(*ran.borrow(), 1);
    }

    /// Timer deadline: no timer fires before its deadline, and every timer
    /// whose deadline has elapsed does fire.
    #[quickcheck]
    fn no_timer_fires_early_and_every_due_timer_fires(delays_ms: Vec<u16>) {
        let mut wheel = TimerWheel::new();
        let now = Instant::now();
        let fired = Rc::new(RefCell::new(Vec::new()));

        let deadlines: Vec<Instant> = delays_ms
            .iter()
            .take(12)
            .enumerate()
            .map(|(i, ms)| {
                let deadline = now + Duration::from_millis(*ms as u64);
                let fired = fired.clone();
                wheel.schedule(
                    Duration::from_millis(*ms as u64),
                    now,
                    Box::new(move || {
                        fired.borrow_mut().push(i);
                        Ok(())
                    }),
                );
                deadline
            })
            .collect();

        let check_at = now + Duration::from_millis(500);
        wheel.run_due(check_at);

        for (i, deadline) in deadlines.iter().enumerate() {
            let did_fire = fired.borrow().contains(&i);
            assert_eq!(did_fire, *deadline <= check_at);
        }
    }
}
