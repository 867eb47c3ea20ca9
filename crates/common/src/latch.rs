use std::{collections::HashMap, sync::Arc};

use log::trace;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Process-wide registry of named latches.
///
/// Collaborating tasks serialize on a key by awaiting [`acquire`] with the
/// same name. The returned [`LatchGuard`] releases the latch when dropped,
/// on every exit path.
static LATCHES: Mutex<Option<HashMap<String, Arc<AsyncMutex<()>>>>> = Mutex::new(None);

/// An acquired named latch. Dropping the guard releases the latch.
#[derive(Debug)]
pub struct LatchGuard {
    name: String,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for LatchGuard {
    fn drop(&mut self) {
        trace!("latch released: {}", self.name);
    }
}

/// Acquire the latch registered under `name`, waiting until any current
/// holder releases it.
///
/// Latches are created on first use and live for the remainder of the
/// process. Names are expected to be of the form `Component.operation:<key>`,
/// e.g. `Collection.sync:<collectionId>`.
pub async fn acquire(name: impl Into<String>) -> LatchGuard {
    let name = name.into();
    let mutex = {
        let mut latches = LATCHES.lock();
        let latches = latches.get_or_insert_with(HashMap::new);
        Arc::clone(latches.entry(name.clone()).or_default())
    };
    let guard = mutex.lock_owned().await;
    trace!("latch acquired: {name}");
    LatchGuard { name, _guard: guard }
}
