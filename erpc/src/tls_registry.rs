//! Dense per-thread IDs for threads that use eRPC.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// (registry id, ETID) for each registry this thread initialized with.
    static ETIDS: RefCell<Vec<(u64, usize)>> = const { RefCell::new(Vec::new()) };
}

/// Hands out eRPC thread IDs (ETIDs) 0, 1, 2, ... to threads that initialize.
///
/// ETIDs are scoped to the registry: a thread initializing with two
/// registries gets an independent ID from each.
#[derive(Debug)]
pub struct TlsRegistry {
    id: u64,
    cur_etid: AtomicUsize,
}

impl TlsRegistry {
    pub fn new() -> Self {
        Self {
            id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
            cur_etid: AtomicUsize::new(0),
        }
    }

    /// Assign the calling thread an ETID if it has none in this registry, and
    /// return it.
    pub fn init(&self) -> usize {
        ETIDS.with(|etids| {
            let mut etids = etids.borrow_mut();
            match etids.iter().find(|(reg, _)| *reg == self.id) {
                Some(&(_, etid)) => etid,
                None => {
                    let etid = self.cur_etid.fetch_add(1, Ordering::Relaxed);
                    etids.push((self.id, etid));
                    etid
                }
            }
        })
    }

    /// ETID of the calling thread, if it has initialized with this registry.
    pub fn etid(&self) -> Option<usize> {
        ETIDS.with(|etids| {
            etids
                .borrow()
                .iter()
                .find(|(reg, _)| *reg == self.id)
                .map(|&(_, etid)| etid)
        })
    }

    /// Number of ETIDs handed out so far.
    pub fn num_threads(&self) -> usize {
        self.cur_etid.load(Ordering::Relaxed)
    }
}

impl Default for TlsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_distinct_ids_per_thread() {
        let registry = Arc::new(TlsRegistry::new());
        let mut ids: Vec<usize> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    let id = registry.init();
                    assert_eq!(registry.init(), id);
                    assert_eq!(registry.etid(), Some(id));
                    id
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect();
        ids.sort();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert_eq!(registry.num_threads(), 4);
    }

    #[test]
    fn test_ids_are_scoped_to_registry() {
        let first = Arc::new(TlsRegistry::new());
        let second = Arc::new(TlsRegistry::new());

        // A thread that already holds an ID from `first` ...
        let (a, b) = {
            let first = Arc::clone(&first);
            let second = Arc::clone(&second);
            thread::spawn(move || {
                first.init();
                first.init();
                (first.init(), second.init())
            })
            .join()
            .unwrap()
        };
        assert_eq!((a, b), (0, 0));

        // ... does not collide with a fresh thread in `second`.
        let c = {
            let second = Arc::clone(&second);
            thread::spawn(move || second.init()).join().unwrap()
        };
        assert_eq!(c, 1);
        assert_eq!(first.num_threads(), 1);
        assert_eq!(second.num_threads(), 2);
        assert_eq!(second.etid(), None);
    }
}
