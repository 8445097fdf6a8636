//! Ownership of the agent's background tasks.
//!
//! At most one task per role is live. Starting a role first cancels and
//! reaps the previous holder, so a late task never outlives its replacement.
//! Every spawn gets a fresh generation number; events carrying an older
//! generation are stale and must be ignored.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Listener bring-up and serve loop.
    Server,
    /// Registry registration loop, nested under the server.
    Registration,
}

struct TaskSlot {
    generation: u64,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl TaskSlot {
    fn is_live(&self) -> bool {
        !self.handle.is_finished()
    }
}

#[derive(Default)]
pub struct Supervisor {
    last_generation: u64,
    server: Option<TaskSlot>,
    registration: Option<TaskSlot>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop whatever runs, then spawn a new server task.
    ///
    /// Returns the generation of the new task.
    pub async fn replace_server<F, Fut>(&mut self, grace: Duration, spawn: F) -> u64
    where
        F: FnOnce(u64, CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.stop_all(grace, grace).await;

        let generation = self.next_generation();
        let token = CancellationToken::new();
        let handle = tokio::spawn(spawn(generation, token.clone()));
        debug!(generation, "Server task spawned");

        self.server = Some(TaskSlot {
            generation,
            token,
            handle,
        });
        generation
    }

    /// Replace the registration task. Its token is a child of the server's,
    /// so cancelling the server cancels it too.
    ///
    /// Returns `None` without spawning when no server task is live.
    pub async fn replace_registration<F, Fut>(&mut self, grace: Duration, spawn: F) -> Option<u64>
    where
        F: FnOnce(u64, CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let parent = match &self.server {
            Some(slot) if slot.is_live() => slot.token.clone(),
            _ => return None,
        };

        self.stop_registration(grace).await;

        let generation = self.next_generation();
        let token = parent.child_token();
        let handle = tokio::spawn(spawn(generation, token.clone()));
        debug!(generation, "Registration task spawned");

        self.registration = Some(TaskSlot {
            generation,
            token,
            handle,
        });
        Some(generation)
    }

    /// Cancel and reap the registration task. Returns whether one existed.
    pub async fn stop_registration(&mut self, grace: Duration) -> bool {
        match self.registration.take() {
            Some(slot) => {
                stop_slot(Role::Registration, slot, grace).await;
                true
            }
            None => false,
        }
    }

    /// Cancel and reap both roles, registration first.
    pub async fn stop_all(&mut self, server_grace: Duration, registration_grace: Duration) {
        if let Some(slot) = &self.server {
            slot.token.cancel();
        }
        self.stop_registration(registration_grace).await;
        if let Some(slot) = self.server.take() {
            stop_slot(Role::Server, slot, server_grace).await;
        }
    }

    /// Whether `generation` is the live holder of `role`.
    pub fn is_current(&self, role: Role, generation: u64) -> bool {
        let slot = match role {
            Role::Server => &self.server,
            Role::Registration => &self.registration,
        };
        slot.as_ref().is_some_and(|s| s.generation == generation)
    }

    pub fn server_running(&self) -> bool {
        self.server.as_ref().is_some_and(TaskSlot::is_live)
    }

    pub fn registration_running(&self) -> bool {
        self.registration.as_ref().is_some_and(TaskSlot::is_live)
    }

    fn next_generation(&mut self) -> u64 {
        self.last_generation += 1;
        self.last_generation
    }
}

async fn stop_slot(role: Role, slot: TaskSlot, grace: Duration) {
    let TaskSlot {
        generation,
        token,
        mut handle,
    } = slot;
    token.cancel();

    match tokio::time::timeout(grace, &mut handle).await {
        Ok(Ok(())) => debug!(?role, generation, "Task stopped"),
        Ok(Err(e)) => warn!(?role, generation, error = %e, "Task ended abnormally"),
        Err(_) => {
            warn!(?role, generation, ?grace, "Task did not stop in time, aborting");
            handle.abort();
        }
    }
}
