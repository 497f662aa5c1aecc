//! RT-safe deferred deallocation for sample data
//!
//! Voices keep a `basedrop::Shared<SampleData>` for as long as they sound.
//! When the control thread swaps in a new sample while a voice still holds
//! the old one, the last reference is released on the audio thread. With a
//! plain `Arc` that would free a potentially huge buffer inside the audio
//! callback; with `Shared<T>` the drop only enqueues the pointer and the
//! actual free happens on the collector thread started here.
//!
//! ```ignore
//! use basedrop::Shared;
//! use crate::engine::gc::gc_handle;
//!
//! let data = Shared::new(&gc_handle(), SampleData::mono(samples, 48000.0)?);
//! ```

use basedrop::{Collector, Handle};
use std::sync::mpsc;
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

/// How often the collector thread reclaims deferred drops
const COLLECT_INTERVAL: Duration = Duration::from_millis(50);

static GC_HANDLE: OnceLock<Handle> = OnceLock::new();

/// Spawn the collector thread and return a handle to it
///
/// The `Collector` is `!Sync`, so it is created on, and never leaves, its
/// own thread. Only the `Handle` is sent back.
fn spawn_collector() -> Handle {
    let (tx, rx) = mpsc::channel();

    let spawned = thread::Builder::new()
        .name("tessera-gc".to_string())
        .spawn(move || {
            let mut collector = Collector::new();
            if tx.send(collector.handle()).is_err() {
                return;
            }
            log::info!("Sample collector thread started");

            loop {
                collector.collect();
                thread::sleep(COLLECT_INTERVAL);
            }
        });

    match spawned.ok().and_then(|_| rx.recv().ok()) {
        Some(handle) => handle,
        None => {
            // No collector thread: fall back to a collector that is never
            // drained. Memory handed to it is leaked instead of being freed
            // on the audio thread.
            log::error!("Failed to start sample collector thread, deferred drops will leak");
            let collector = Box::leak(Box::new(Collector::new()));
            collector.handle()
        }
    }
}

/// Handle for creating `Shared<T>` allocations (cheap to clone)
pub fn gc_handle() -> Handle {
    GC_HANDLE.get_or_init(spawn_collector).clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use basedrop::Shared;

    #[test]
    fn test_shared_values_survive_clones() {
        let a = Shared::new(&gc_handle(), vec![1.0f32; 16]);
        let b = a.clone();
        drop(a);
        assert_eq!(b.len(), 16);
    }
}
