use std::sync::{Arc, Mutex};

/// A registry of listener callbacks.
///
/// The listener list is copy-on-read: `notify` clones the current list under the lock and invokes
/// the callbacks after releasing it, so a listener may freely call back into the SDK (including
/// registering or removing listeners) without deadlocking.
pub struct Listeners<T> {
    inner: Mutex<ListenersInner<T>>,
}

struct ListenersInner<T> {
    next_id: u64,
    listeners: Vec<(u64, Arc<dyn Fn(&T) + Send + Sync>)>,
}

/// Identifies a registered listener so it can be removed later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerHandle(u64);

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Listeners {
            inner: Mutex::new(ListenersInner {
                next_id: 0,
                listeners: Vec::new(),
            }),
        }
    }
}

impl<T> Listeners<T> {
    pub fn new() -> Self {
        Listeners::default()
    }

    pub fn add(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> ListenerHandle {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.listeners.push((id, Arc::new(listener)));
        ListenerHandle(id)
    }

    pub fn remove(&self, handle: ListenerHandle) {
        let mut inner = self.inner.lock().unwrap();
        inner.listeners.retain(|(id, _)| *id != handle.0);
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().listeners.is_empty()
    }

    pub fn notify(&self, value: &T) {
        let snapshot: Vec<_> = {
            let inner = self.inner.lock().unwrap();
            inner.listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
        };
        for listener in snapshot {
            listener(value);
        }
    }
}
