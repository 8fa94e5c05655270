//! Registry of live workspaces

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use cide_core::{ProjectType, ResourceNames, WorkspaceId, WorkspaceState};

/// Handle to a live workspace
///
/// State changes go through [`WorkspaceHandle::transition`], which only
/// applies legal successors, so concurrent cleanup paths race safely: the
/// first to move the workspace to `Terminating` wins and the others no-op.
#[derive(Debug)]
pub struct WorkspaceHandle {
    pub id: WorkspaceId,
    pub project: ProjectType,
    pub names: ResourceNames,
    pub created_at: DateTime<Utc>,
    state: watch::Sender<WorkspaceState>,
    cancel: CancellationToken,
}

impl WorkspaceHandle {
    fn new(id: WorkspaceId, project: ProjectType, cancel: CancellationToken) -> Self {
        let (state, _) = watch::channel(WorkspaceState::Created);
        Self {
            names: ResourceNames::for_workspace(&id),
            id,
            project,
            created_at: Utc::now(),
            state,
            cancel,
        }
    }

    /// Current state
    pub fn state(&self) -> WorkspaceState {
        *self.state.borrow()
    }

    /// Receiver notified on every state change
    pub fn subscribe(&self) -> watch::Receiver<WorkspaceState> {
        self.state.subscribe()
    }

    /// Move to `next` if it is a legal successor; returns whether it moved
    pub fn transition(&self, next: WorkspaceState) -> bool {
        let moved = self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                false
            }
        });
        if moved {
            tracing::info!("Workspace {} is now {}", self.id, next);
        }
        moved
    }

    /// Claim cleanup of this workspace
    ///
    /// Returns `true` for exactly one caller. Cancels the workspace token so
    /// attached terminals are torn down.
    pub fn begin_termination(&self) -> bool {
        let claimed = self.transition(WorkspaceState::Terminating);
        if claimed {
            self.cancel.cancel();
        }
        claimed
    }

    /// Token cancelled when the workspace starts terminating
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether terminals may attach
    pub fn is_ready(&self) -> bool {
        self.state() == WorkspaceState::Ready
    }
}

/// Workspaces by id, shared by every session of the process
pub struct WorkspaceRegistry {
    workspaces: DashMap<WorkspaceId, Arc<WorkspaceHandle>>,
    id_length: usize,
}

impl WorkspaceRegistry {
    pub fn new(id_length: usize) -> Self {
        Self {
            workspaces: DashMap::new(),
            id_length,
        }
    }

    /// Reserve a fresh, unique id for a new workspace
    pub fn reserve(&self, project: ProjectType, parent: &CancellationToken) -> Arc<WorkspaceHandle> {
        let len = self.id_length;
        self.reserve_with(project, parent, || WorkspaceId::generate(len))
    }

    /// Reserve using ids drawn from `next_id` until one is free
    ///
    /// The check and the insert happen under the same shard lock, so two
    /// sessions can never be handed the same id.
    pub fn reserve_with<F>(
        &self,
        project: ProjectType,
        parent: &CancellationToken,
        mut next_id: F,
    ) -> Arc<WorkspaceHandle>
    where
        F: FnMut() -> WorkspaceId,
    {
        loop {
            let id = next_id();
            match self.workspaces.entry(id.clone()) {
                Entry::Occupied(_) => {
                    tracing::debug!("Workspace id {} already taken, regenerating", id);
                }
                Entry::Vacant(slot) => {
                    let handle = Arc::new(WorkspaceHandle::new(id, project, parent.child_token()));
                    slot.insert(Arc::clone(&handle));
                    tracing::info!("Reserved workspace {} ({})", handle.id, project);
                    return handle;
                }
            }
        }
    }

    /// Get a workspace by id
    pub fn get(&self, id: &WorkspaceId) -> Option<Arc<WorkspaceHandle>> {
        self.workspaces.get(id).map(|r| Arc::clone(&r))
    }

    /// Drop a workspace, freeing its id
    pub fn release(&self, id: &WorkspaceId) -> Option<Arc<WorkspaceHandle>> {
        self.workspaces.remove(id).map(|(_, handle)| handle)
    }

    /// List all workspaces
    pub fn list(&self) -> Vec<Arc<WorkspaceHandle>> {
        self.workspaces.iter().map(|r| Arc::clone(&r)).collect()
    }

    /// Number of live workspaces
    pub fn len(&self) -> usize {
        self.workspaces.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.workspaces.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_collision_adopts_fresh_id() {
        let registry = WorkspaceRegistry::new(10);
        let root = CancellationToken::new();

        let first = registry.reserve_with(ProjectType::Python, &root, || {
            WorkspaceId::parse("aaaa").unwrap()
        });

        let mut candidates = vec!["bbbb", "aaaa"];
        let second = registry.reserve_with(ProjectType::Python, &root, || {
            WorkspaceId::parse(candidates.pop().unwrap()).unwrap()
        });

        assert_eq!(first.id.as_str(), "aaaa");
        assert_eq!(second.id.as_str(), "bbbb");
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_concurrent_reservations_are_unique() {
        let registry = Arc::new(WorkspaceRegistry::new(2));
        let root = CancellationToken::new();

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let root = root.clone();
                std::thread::spawn(move || {
                    (0..20)
                        .map(|_| registry.reserve(ProjectType::Golang, &root).id.clone())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let ids: Vec<_> = threads
            .into_iter()
            .flat_map(|t| t.join().unwrap())
            .collect();
        let unique: HashSet<_> = ids.iter().collect();
        assert_eq!(ids.len(), 160);
        assert_eq!(unique.len(), 160);
        assert_eq!(registry.len(), 160);
    }

    #[test]
    fn test_termination_claimed_once() {
        let registry = WorkspaceRegistry::new(10);
        let root = CancellationToken::new();
        let handle = registry.reserve(ProjectType::React, &root);

        assert!(handle.transition(WorkspaceState::Provisioning));
        assert!(handle.transition(WorkspaceState::Ready));
        assert!(!handle.transition(WorkspaceState::Failed));

        assert!(handle.begin_termination());
        assert!(handle.cancel_token().is_cancelled());
        assert!(!handle.begin_termination());
        assert!(!root.is_cancelled());

        assert!(handle.transition(WorkspaceState::Terminated));
        assert!(registry.release(&handle.id).is_some());
        assert!(registry.get(&handle.id).is_none());
    }

    #[test]
    fn test_shutdown_cancels_workspaces() {
        let registry = WorkspaceRegistry::new(10);
        let root = CancellationToken::new();
        let handle = registry.reserve(ProjectType::Cpp, &root);

        root.cancel();
        assert!(handle.cancel_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_subscribe_sees_transitions() {
        let registry = WorkspaceRegistry::new(10);
        let handle = registry.reserve(ProjectType::Python, &CancellationToken::new());
        let mut rx = handle.subscribe();

        handle.transition(WorkspaceState::Provisioning);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), WorkspaceState::Provisioning);
    }
}
