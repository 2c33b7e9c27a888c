use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::persistence::{PersistenceAdapter, StoreState};

type Capture = Box<dyn Fn() -> StoreState + Send + Sync>;

/// Background saver for one store.
///
/// Producers only mark the store dirty. The writer thread takes the snapshot
/// itself, after clearing the flag, so every change committed before a
/// [`request_save`](Self::request_save) is in the next saved state and
/// producers never wait on other buckets or on I/O. Requests that arrive
/// while a save is running coalesce into one more save.
pub(crate) struct PersistenceWriter {
    shared: Arc<WriterShared>,
    handle: Option<JoinHandle<()>>,
}

struct WriterShared {
    store: String,
    adapter: Arc<dyn PersistenceAdapter>,
    capture: Capture,
    slot: Mutex<Slot>,
    wake: Condvar,
    idle: Condvar,
}

#[derive(Default)]
struct Slot {
    dirty: bool,
    in_flight: bool,
    closed: bool,
}

impl PersistenceWriter {
    pub(crate) fn spawn(
        store: &str,
        adapter: Arc<dyn PersistenceAdapter>,
        capture: impl Fn() -> StoreState + Send + Sync + 'static,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(WriterShared {
            store: store.to_string(),
            adapter,
            capture: Box::new(capture),
            slot: Mutex::new(Slot::default()),
            wake: Condvar::new(),
            idle: Condvar::new(),
        });

        let worker = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name(format!("rate-limit-persist-{}", store))
            .spawn(move || worker.run())?;

        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    /// Ask for the current state to be saved.
    pub(crate) fn request_save(&self) {
        let mut slot = self.shared.slot.lock();
        if slot.closed {
            return;
        }
        slot.dirty = true;
        self.shared.wake.notify_one();
    }

    /// Block until every state requested so far has been handed to the
    /// adapter.
    pub(crate) fn flush(&self) {
        let mut slot = self.shared.slot.lock();
        while slot.dirty || slot.in_flight {
            self.shared.idle.wait(&mut slot);
        }
    }
}

impl Drop for PersistenceWriter {
    fn drop(&mut self) {
        {
            let mut slot = self.shared.slot.lock();
            slot.closed = true;
            self.shared.wake.notify_one();
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!(store = %self.shared.store, "rate limit persistence thread panicked");
            }
        }
    }
}

impl WriterShared {
    fn run(&self) {
        loop {
            {
                let mut slot = self.slot.lock();
                while !slot.dirty && !slot.closed {
                    self.wake.wait(&mut slot);
                }
                if !slot.dirty {
                    // Closed with nothing left to write.
                    break;
                }
                slot.dirty = false;
                slot.in_flight = true;
            }

            let state = (self.capture)();
            self.save(&state);

            let mut slot = self.slot.lock();
            slot.in_flight = false;
            if !slot.dirty {
                self.idle.notify_all();
            }
        }

        self.idle.notify_all();
        tracing::trace!(store = %self.store, "rate limit persistence thread exiting");
    }

    fn save(&self, state: &StoreState) {
        let result = state
            .encode()
            .and_then(|raw| self.adapter.save(&self.store, &raw));
        if let Err(e) = result {
            tracing::warn!(
                store = %self.store,
                error = %e,
                "failed to persist rate limit state, keeping in-memory state"
            );
        }
    }
}
