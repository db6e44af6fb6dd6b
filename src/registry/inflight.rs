//! Registry-wide table of objects being materialized.
//!
//! The per-request chain on [`ApiContext`](super::ApiContext) only sees cycles
//! within one task. When two tasks materialize `A -> B` and `B -> A` at the same
//! time, each ends up waiting for an object the other one owns. The table records
//! which task owns each pending identity and which identity each task waits for,
//! so a wait that would close a loop fails with `circular-reference` instead.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use crate::core::error::GatewayResult;
use crate::manifest::ResourceId;

use super::context::circular_reference;

/// Identity of one materialization task, shared by its nested resolutions
pub type TaskId = u64;

struct Pending {
    task: TaskId,
    // dropped when the owner finishes, waking every subscriber
    done: watch::Sender<()>,
}

#[derive(Default)]
struct State {
    pending: HashMap<ResourceId, Pending>,
    waiting: HashMap<TaskId, ResourceId>,
}

impl State {
    /// Identities `me` would transitively wait on, if that loops back to `me`
    fn wait_loop(&self, id: &ResourceId, me: TaskId) -> Option<Vec<ResourceId>> {
        let mut path = vec![id.clone()];
        let mut owner = self.pending.get(id)?.task;
        for _ in 0..=self.waiting.len() {
            if owner == me {
                return Some(path);
            }
            let next = self.waiting.get(&owner)?;
            path.push(next.clone());
            owner = self.pending.get(next)?.task;
        }
        None
    }
}

/// Outcome of [`InFlight::claim`]
pub enum Claim {
    /// The caller creates the object; dropping the guard releases waiters
    Owner(OwnerGuard),
    /// Another task is creating it; wait, then look again
    Wait(WaitGuard),
}

pub struct InFlight {
    state: Mutex<State>,
    next_task: AtomicU64,
}

impl Default for InFlight {
    fn default() -> Self {
        Self {
            state: Mutex::new(State::default()),
            next_task: AtomicU64::new(1),
        }
    }
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `id`, or register a wait on its current owner
    ///
    /// `chain` is the caller's materialization chain, outermost first, and `task`
    /// its task id when it already owns something. Fails with
    /// `circular-reference` when waiting would deadlock.
    pub fn claim(
        self: &Arc<Self>,
        id: &ResourceId,
        chain: &[ResourceId],
        task: Option<TaskId>,
    ) -> GatewayResult<Claim> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let done = match state.pending.get(id) {
            Some(pending) => pending.done.subscribe(),
            None => {
                let task = task.unwrap_or_else(|| self.next_task.fetch_add(1, Ordering::Relaxed));
                let (done, _) = watch::channel(());
                state.pending.insert(id.clone(), Pending { task, done });
                return Ok(Claim::Owner(OwnerGuard {
                    inflight: self.clone(),
                    id: id.clone(),
                    task,
                }));
            }
        };

        // a caller owning nothing cannot be part of a loop
        let Some(me) = task else {
            return Ok(Claim::Wait(WaitGuard { inflight: self.clone(), task: None, done }));
        };
        if let Some(path) = state.wait_loop(id, me) {
            let mut full: Vec<ResourceId> = chain.to_vec();
            full.extend(path);
            return Err(circular_reference(id, &full));
        }
        state.waiting.insert(me, id.clone());
        Ok(Claim::Wait(WaitGuard {
            inflight: self.clone(),
            task: Some(me),
            done,
        }))
    }

    /// Number of identities currently being created
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }
}

pub struct OwnerGuard {
    inflight: Arc<InFlight>,
    id: ResourceId,
    task: TaskId,
}

impl OwnerGuard {
    pub fn task(&self) -> TaskId {
        self.task
    }
}

impl Drop for OwnerGuard {
    fn drop(&mut self) {
        let mut state = self.inflight.state.lock();
        if state.pending.get(&self.id).is_some_and(|p| p.task == self.task) {
            state.pending.remove(&self.id);
        }
    }
}

pub struct WaitGuard {
    inflight: Arc<InFlight>,
    task: Option<TaskId>,
    done: watch::Receiver<()>,
}

impl WaitGuard {
    /// Resolve once the owner has finished, successfully or not
    pub async fn finished(&mut self) {
        // only the sender closing ever wakes this
        let _ = self.done.changed().await;
    }
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        if let Some(task) = self.task {
            self.inflight.state.lock().waiting.remove(&task);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;

    fn id(kind: &str) -> ResourceId {
        ResourceId::new("core/v1", kind, "", "")
    }

    #[test]
    fn test_first_claim_owns() {
        let inflight = Arc::new(InFlight::new());
        let owner = match inflight.claim(&id("A"), &[], None).unwrap() {
            Claim::Owner(guard) => guard,
            Claim::Wait(_) => panic!("expected ownership"),
        };
        assert_eq!(inflight.pending(), 1);
        assert!(matches!(inflight.claim(&id("A"), &[], None).unwrap(), Claim::Wait(_)));

        drop(owner);
        assert_eq!(inflight.pending(), 0);
    }

    #[test]
    fn test_crossed_waits_are_circular() {
        let inflight = Arc::new(InFlight::new());
        let Claim::Owner(a) = inflight.claim(&id("A"), &[], None).unwrap() else {
            panic!("expected ownership")
        };
        let Claim::Owner(b) = inflight.claim(&id("B"), &[], None).unwrap() else {
            panic!("expected ownership")
        };

        // A's task waits for B, then B's task asks for A
        let _waiting = match inflight.claim(&id("B"), &[id("A")], Some(a.task())).unwrap() {
            Claim::Wait(guard) => guard,
            Claim::Owner(_) => panic!("B is owned"),
        };
        let err = match inflight.claim(&id("A"), &[id("B")], Some(b.task())) {
            Err(err) => err,
            Ok(_) => panic!("expected a cycle"),
        };
        assert_eq!(err.kind, ErrorKind::CircularReference);
        assert!(err.detail.contains("core/v1/B/default/default -> core/v1/A/default/default -> core/v1/B"));
    }

    #[tokio::test]
    async fn test_waiter_wakes_when_owner_drops() {
        let inflight = Arc::new(InFlight::new());
        let Claim::Owner(owner) = inflight.claim(&id("A"), &[], None).unwrap() else {
            panic!("expected ownership")
        };
        let Claim::Wait(mut waiter) = inflight.claim(&id("A"), &[], None).unwrap() else {
            panic!("expected a wait")
        };
        drop(owner);
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter.finished())
            .await
            .unwrap();
    }
}
