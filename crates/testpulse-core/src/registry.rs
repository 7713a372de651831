//! Checkpoint registry: load queues, their worker threads, and each
//! thread's open checkpoints.
//!
//! Shared between the consumer task and agent-side relays, so the inner
//! state sits behind one `std::sync::Mutex`; every critical section is a
//! handful of map operations and leaves the maps consistent, which makes
//! poison recovery safe.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

use testpulse_types::CheckpointInfo;

use crate::error::RegistryError;

#[derive(Debug, Default)]
struct ThreadSlot {
    queue_name: String,
    load_queue_id: i64,
    open: HashSet<CheckpointInfo>,
}

#[derive(Debug, Default)]
struct RegistryState {
    queues: HashMap<String, i64>,
    threads: HashMap<String, ThreadSlot>,
}

/// Registry of running load queues and per-thread checkpoint state.
#[derive(Debug, Default)]
pub struct CheckpointRegistry {
    state: Mutex<RegistryState>,
}

impl CheckpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a load queue. A queue name may be active only once.
    pub fn add_load_queue(&self, name: &str, load_queue_id: i64) -> Result<(), RegistryError> {
        let mut state = self.lock();
        if state.queues.contains_key(name) {
            return Err(RegistryError::LoadQueueAlreadyRunning(name.to_owned()));
        }
        state.queues.insert(name.to_owned(), load_queue_id);
        Ok(())
    }

    pub fn is_load_queue_running(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    pub fn load_queue_id(&self, name: &str) -> Result<i64, RegistryError> {
        self.lock()
            .queues
            .get(name)
            .copied()
            .ok_or_else(|| RegistryError::NoSuchLoadQueue(name.to_owned()))
    }

    /// Forget a queue and every thread registered with it, returning the
    /// queue's id.
    pub fn remove_load_queue(&self, name: &str) -> Result<i64, RegistryError> {
        let mut state = self.lock();
        let id = state
            .queues
            .remove(name)
            .ok_or_else(|| RegistryError::NoSuchLoadQueue(name.to_owned()))?;
        state.threads.retain(|_, slot| slot.queue_name != name);
        Ok(id)
    }

    /// Bind a worker thread to a running queue. Re-registering a thread
    /// that was bound to a since-removed queue replaces the stale slot
    /// (open checkpoints included); re-registering within the same active
    /// queue is a producer bug.
    pub fn register_thread(&self, thread: &str, queue_name: &str) -> Result<(), RegistryError> {
        let mut state = self.lock();
        let load_queue_id = *state
            .queues
            .get(queue_name)
            .ok_or_else(|| RegistryError::NoSuchLoadQueue(queue_name.to_owned()))?;
        if let Some(slot) = state.threads.get(thread) {
            if slot.queue_name == queue_name {
                return Err(RegistryError::ThreadAlreadyRegistered {
                    thread: thread.to_owned(),
                    queue: queue_name.to_owned(),
                });
            }
        }
        state.threads.insert(
            thread.to_owned(),
            ThreadSlot {
                queue_name: queue_name.to_owned(),
                load_queue_id,
                open: HashSet::new(),
            },
        );
        Ok(())
    }

    /// The queue id the thread is currently bound to.
    pub fn load_queue_for_thread(&self, thread: &str) -> Result<i64, RegistryError> {
        self.lock()
            .threads
            .get(thread)
            .map(|slot| slot.load_queue_id)
            .ok_or_else(|| RegistryError::ThreadNotRegistered(thread.to_owned()))
    }

    /// Record an opened checkpoint. At most one open checkpoint per
    /// `(thread, name)` pair.
    pub fn start_checkpoint(
        &self,
        thread: &str,
        info: CheckpointInfo,
    ) -> Result<(), RegistryError> {
        let mut state = self.lock();
        let slot = state
            .threads
            .get_mut(thread)
            .ok_or_else(|| RegistryError::ThreadNotRegistered(thread.to_owned()))?;
        if slot.open.contains(info.name.as_str()) {
            return Err(RegistryError::CheckpointAlreadyStarted {
                thread: thread.to_owned(),
                name: info.name,
            });
        }
        slot.open.insert(info);
        Ok(())
    }

    /// Take the open checkpoint named `name` off the thread's slot.
    pub fn end_checkpoint(
        &self,
        thread: &str,
        name: &str,
    ) -> Result<CheckpointInfo, RegistryError> {
        let mut state = self.lock();
        let slot = state
            .threads
            .get_mut(thread)
            .ok_or_else(|| RegistryError::ThreadNotRegistered(thread.to_owned()))?;
        slot.open
            .take(name)
            .ok_or_else(|| RegistryError::CheckpointNotStarted {
                thread: thread.to_owned(),
                name: name.to_owned(),
            })
    }

    /// Drop all queues, threads, and open checkpoints. Called when the
    /// owning testcase ends.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.queues.clear();
        state.threads.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn info(name: &str) -> CheckpointInfo {
        CheckpointInfo {
            name: name.to_owned(),
            summary_id: 1,
            checkpoint_id: 0,
            started_at: Utc::now(),
        }
    }

    #[test]
    fn duplicate_queue_name_is_rejected() {
        let reg = CheckpointRegistry::new();
        reg.add_load_queue("q1", 5).unwrap();
        assert_eq!(
            reg.add_load_queue("q1", 6),
            Err(RegistryError::LoadQueueAlreadyRunning("q1".into()))
        );
        assert_eq!(reg.load_queue_id("q1").unwrap(), 5);
    }

    #[test]
    fn checkpoint_pairing_per_thread_and_name() {
        let reg = CheckpointRegistry::new();
        reg.add_load_queue("q1", 5).unwrap();
        reg.register_thread("worker-1", "q1").unwrap();

        reg.start_checkpoint("worker-1", info("login")).unwrap();
        assert_eq!(
            reg.start_checkpoint("worker-1", info("login")),
            Err(RegistryError::CheckpointAlreadyStarted {
                thread: "worker-1".into(),
                name: "login".into(),
            })
        );

        let taken = reg.end_checkpoint("worker-1", "login").unwrap();
        assert_eq!(taken.name, "login");
        assert_eq!(
            reg.end_checkpoint("worker-1", "login"),
            Err(RegistryError::CheckpointNotStarted {
                thread: "worker-1".into(),
                name: "login".into(),
            })
        );
    }

    #[test]
    fn same_name_on_two_threads_is_independent() {
        let reg = CheckpointRegistry::new();
        reg.add_load_queue("q1", 5).unwrap();
        reg.register_thread("worker-1", "q1").unwrap();
        reg.register_thread("worker-2", "q1").unwrap();

        reg.start_checkpoint("worker-1", info("login")).unwrap();
        reg.start_checkpoint("worker-2", info("login")).unwrap();
        reg.end_checkpoint("worker-1", "login").unwrap();
        reg.end_checkpoint("worker-2", "login").unwrap();
    }

    #[test]
    fn reregistration_after_queue_removal_clears_stale_checkpoints() {
        let reg = CheckpointRegistry::new();
        reg.add_load_queue("q1", 5).unwrap();
        reg.register_thread("worker-1", "q1").unwrap();
        reg.start_checkpoint("worker-1", info("dangling")).unwrap();

        reg.remove_load_queue("q1").unwrap();
        assert!(reg.load_queue_for_thread("worker-1").is_err());

        reg.add_load_queue("q2", 9).unwrap();
        reg.register_thread("worker-1", "q2").unwrap();
        assert_eq!(reg.load_queue_for_thread("worker-1").unwrap(), 9);
        assert_eq!(
            reg.end_checkpoint("worker-1", "dangling"),
            Err(RegistryError::CheckpointNotStarted {
                thread: "worker-1".into(),
                name: "dangling".into(),
            })
        );
    }

    #[test]
    fn double_registration_in_active_queue_is_an_error() {
        let reg = CheckpointRegistry::new();
        reg.add_load_queue("q1", 5).unwrap();
        reg.register_thread("worker-1", "q1").unwrap();
        assert!(matches!(
            reg.register_thread("worker-1", "q1"),
            Err(RegistryError::ThreadAlreadyRegistered { .. })
        ));
    }

    #[test]
    fn clear_wipes_everything() {
        let reg = CheckpointRegistry::new();
        reg.add_load_queue("q1", 5).unwrap();
        reg.register_thread("worker-1", "q1").unwrap();
        reg.clear();
        assert!(!reg.is_load_queue_running("q1"));
        assert!(reg.load_queue_for_thread("worker-1").is_err());
    }
}
