use std::sync::{Arc, Mutex, PoisonError, Weak};

type Observer = Arc<dyn Fn(f64) + Send + Sync>;

#[derive(Default)]
struct Inner {
    value: f64,
    closed: bool,
    next_id: u64,
    observers: Vec<(u64, Observer)>,
}

/// Monotonic progress in [0, 1] with any number of observers.
/// Each observer sees a value at most once, and only values that moved forward.
#[derive(Clone, Default)]
pub struct ProgressNotifier {
    inner: Arc<Mutex<Inner>>,
    // held while delivering so observers see values in the order they were set.
    delivery: Arc<Mutex<()>>,
}

/// Dropping the handle unsubscribes.
#[must_use = "dropping the subscription unsubscribes right away"]
pub struct Subscription {
    id: u64,
    inner: Weak<Mutex<Inner>>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
            inner.observers.retain(|(id, _)| *id != self.id);
        }
    }
}

impl ProgressNotifier {
    pub fn value(&self) -> f64 {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).value
    }

    pub fn subscribe(&self, observer: impl Fn(f64) + Send + Sync + 'static) -> Subscription {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let id = inner.next_id;
        inner.next_id += 1;
        inner.observers.push((id, Arc::new(observer)));
        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Returns true if the value moved and observers were told.
    pub fn set(&self, value: f64) -> bool {
        let value = value.clamp(0.0, 1.0);
        let _delivery = self.delivery.lock().unwrap_or_else(PoisonError::into_inner);
        let observers: Vec<Observer> = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            if inner.closed || value <= inner.value {
                return false;
            }
            inner.value = value;
            inner.observers.iter().map(|(_, o)| o.clone()).collect()
        };
        for observer in observers {
            observer(value);
        }
        true
    }

    /// Freeze the value. Used once the task reached a terminal state.
    pub fn close(&self) {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).closed = true;
    }
}
