use parking_lot::{Condvar, Mutex};

use crate::{error::ExecError, value::Value};

/// The final state of a result slot.
pub type Outcome = Result<Value, ExecError>;

/// Callback fired exactly once with the outcome of a slot.
pub type Notify = Box<dyn FnOnce(Outcome) + Send + 'static>;

#[derive(Default)]
struct SlotState {
    outcome: Option<Outcome>,
    subscribers: Vec<Notify>,
}

/// A single-assignment future.
///
/// Set exactly once by the producing worker, waited on by any number of
/// resolvers, all of which observe the same outcome.
#[derive(Default)]
pub struct ResultSlot {
    state: Mutex<SlotState>,
    cv: Condvar,
}

impl ResultSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the outcome, wakes every waiter and fires every subscriber.
    ///
    /// Subscribers run on the calling thread after the lock is released.
    ///
    /// # Returns
    /// `false` if the slot had already been set, in which case nothing changes.
    pub fn set(&self, outcome: Outcome) -> bool {
        let subscribers = {
            let mut state = self.state.lock();
            if state.outcome.is_some() {
                return false;
            }

            state.outcome = Some(outcome.clone());
            std::mem::take(&mut state.subscribers)
        };

        self.cv.notify_all();
        for notify in subscribers {
            notify(outcome.clone());
        }

        true
    }

    /// Blocks the calling thread until the slot is set.
    pub fn wait(&self) -> Outcome {
        let mut state = self.state.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            self.cv.wait(&mut state);
        }
    }

    pub fn is_set(&self) -> bool {
        self.state.lock().outcome.is_some()
    }

    /// Registers `notify` to run once the slot is set.
    ///
    /// If the slot is already set, `notify` runs immediately on the calling thread.
    pub fn subscribe(&self, notify: Notify) {
        let outcome = {
            let mut state = self.state.lock();
            match &state.outcome {
                Some(outcome) => outcome.clone(),
                None => {
                    state.subscribers.push(notify);
                    return;
                }
            }
        };

        notify(outcome);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        thread,
        time::Duration,
    };

    use super::*;

    #[test]
    fn second_set_is_rejected() {
        let slot = ResultSlot::new();
        assert!(slot.set(Ok(Value::Int(1))));
        assert!(!slot.set(Ok(Value::Int(2))));
        assert_eq!(slot.wait(), Ok(Value::Int(1)));
    }

    #[test]
    fn repeated_waits_observe_the_same_error() {
        let slot = ResultSlot::new();
        let err = ExecError::new("s0", 1, "boom");
        slot.set(Err(err.clone()));

        for _ in 0..3 {
            assert_eq!(slot.wait(), Err(err.clone()));
        }
    }

    #[test]
    fn waiters_wake_up_on_set() {
        let slot = Arc::new(ResultSlot::new());

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let slot = Arc::clone(&slot);
                thread::spawn(move || slot.wait())
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        slot.set(Ok(Value::Float(2.5)));

        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), Ok(Value::Float(2.5)));
        }
    }

    #[test]
    fn subscribers_fire_once_before_and_after_set() {
        let slot = ResultSlot::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let early = Arc::clone(&fired);
        slot.subscribe(Box::new(move |out| {
            assert_eq!(out, Ok(Value::Bool(true)));
            early.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        slot.set(Ok(Value::Bool(true)));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let late = Arc::clone(&fired);
        slot.subscribe(Box::new(move |_| {
            late.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
