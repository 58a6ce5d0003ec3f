//! Cross-project coordinator - serialises shared-resource use.
//!
//! Acquires are FIFO within priority class and carry deadlines. Granting a
//! wait that would close a holder→waiter cycle fails the lowest-priority
//! participant with `DeadlockAvoided`. Preemptible kinds (services, ports)
//! let a higher-priority project displace the current holder; paths and
//! credentials never preempt.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{oneshot, Mutex};

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::event::{Component, EngineEvent, EventPayload};
use crate::domain::models::ids::{ProjectId, ResourceId};
use crate::domain::models::project::ProjectPriority;
use crate::domain::models::resource::{ResourceKind, SharedResource, Waiter};
use crate::services::event_bus::EventBus;

/// Two filesystem subtrees conflict when either contains the other.
pub fn paths_conflict(a: &Path, b: &Path) -> bool {
    a.starts_with(b) || b.starts_with(a)
}

struct PendingGrant {
    project_id: ProjectId,
    tx: oneshot::Sender<EngineResult<()>>,
}

struct ResourceEntry {
    resource: SharedResource,
    /// Priority the current holder acquired with.
    holder_priority: Option<ProjectPriority>,
    /// Grant channels for queued waiters, keyed by project.
    pending: Vec<PendingGrant>,
}

struct CoordinatorInner {
    resources: HashMap<ResourceId, ResourceEntry>,
}

impl CoordinatorInner {
    /// Wait-for edges: waiter project → holder project.
    fn wait_edges(&self) -> Vec<(ProjectId, ProjectId)> {
        let mut edges = Vec::new();
        for entry in self.resources.values() {
            if let Some(holder) = entry.resource.holder {
                for waiter in &entry.resource.waiters {
                    edges.push((waiter.project_id, holder));
                }
            }
        }
        edges
    }

    /// Projects reachable from `start` along wait-for edges.
    fn reachable(&self, start: ProjectId, extra_edge: (ProjectId, ProjectId)) -> Vec<ProjectId> {
        let mut edges = self.wait_edges();
        edges.push(extra_edge);
        let mut seen = vec![start];
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            for (from, to) in &edges {
                if *from == node && !seen.contains(to) {
                    seen.push(*to);
                    stack.push(*to);
                }
            }
        }
        seen
    }
}

/// Global arbiter of shared resources (C8).
pub struct CrossProjectCoordinator {
    bus: Arc<EventBus>,
    inner: Mutex<CoordinatorInner>,
    arrival_seq: AtomicU64,
}

impl CrossProjectCoordinator {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            inner: Mutex::new(CoordinatorInner { resources: HashMap::new() }),
            arrival_seq: AtomicU64::new(0),
        }
    }

    /// Acquire a resource for a project, waiting at most `deadline`.
    ///
    /// Unknown resources are registered on first acquire with the given
    /// kind. The caller owns the resource until [`release`](Self::release).
    pub async fn acquire(
        &self,
        resource_id: ResourceId,
        kind: ResourceKind,
        project_id: ProjectId,
        priority: ProjectPriority,
        deadline: Duration,
    ) -> EngineResult<()> {
        let rx = {
            let mut inner = self.inner.lock().await;
            let entry = inner
                .resources
                .entry(resource_id.clone())
                .or_insert_with(|| ResourceEntry {
                    resource: SharedResource::new(resource_id.clone(), kind),
                    holder_priority: None,
                    pending: Vec::new(),
                });

            match entry.resource.holder {
                None => {
                    entry.resource.holder = Some(project_id);
                    entry.holder_priority = Some(priority);
                    return Ok(());
                }
                Some(holder) if holder == project_id => {
                    // Re-acquiring a held resource is a no-op.
                    return Ok(());
                }
                Some(holder) => {
                    // Preemptible kinds: displace a lower-priority holder.
                    if entry.resource.kind.is_preemptible()
                        && entry.holder_priority < Some(priority)
                    {
                        let displaced = holder;
                        entry.resource.holder = Some(project_id);
                        entry.holder_priority = Some(priority);
                        drop(inner);
                        self.emit_conflict(
                            "Preempted",
                            format!("{displaced} displaced from {resource_id} by {project_id}"),
                            Some(displaced),
                            Some(resource_id),
                        )
                        .await;
                        return Ok(());
                    }

                    // Deadlock check: waiting here adds project → holder.
                    let reachable = inner.reachable(holder, (project_id, holder));
                    if reachable.contains(&project_id) {
                        drop(inner);
                        self.emit_conflict(
                            "DeadlockAvoided",
                            format!("acquire of {resource_id} by {project_id} refused"),
                            Some(project_id),
                            Some(resource_id.clone()),
                        )
                        .await;
                        return Err(EngineError::DeadlockAvoided {
                            resource: resource_id,
                            project: project_id,
                        });
                    }

                    let entry = inner
                        .resources
                        .get_mut(&resource_id)
                        .expect("entry inserted above");
                    let waiter = Waiter {
                        project_id,
                        priority,
                        arrival_seq: self.arrival_seq.fetch_add(1, Ordering::SeqCst),
                        enqueued_at: Utc::now(),
                    };
                    // FIFO within priority class: insert after the last
                    // waiter of equal or higher priority.
                    let pos = entry
                        .resource
                        .waiters
                        .iter()
                        .position(|w| w.priority < waiter.priority)
                        .unwrap_or(entry.resource.waiters.len());
                    entry.resource.waiters.insert(pos, waiter);

                    let (tx, rx) = oneshot::channel();
                    entry.pending.push(PendingGrant { project_id, tx });
                    rx
                }
            }
        };

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(EngineError::InternalInvariantViolated {
                detail: format!("grant channel for {resource_id} dropped"),
            }),
            Err(_) => {
                // The grant may have landed exactly at the deadline; if the
                // resource is already ours, keep it.
                if self.remove_waiter(&resource_id, project_id).await {
                    return Ok(());
                }
                Err(EngineError::AcquireTimeout {
                    resource: resource_id,
                    deadline_secs: deadline.as_secs(),
                })
            }
        }
    }

    /// Release a held resource and grant the next waiter.
    ///
    /// Releasing a resource the project no longer holds (it was preempted)
    /// is a no-op.
    pub async fn release(&self, resource_id: &ResourceId, project_id: ProjectId) {
        let granted = {
            let mut inner = self.inner.lock().await;
            let Some(entry) = inner.resources.get_mut(resource_id) else {
                return;
            };
            if entry.resource.holder != Some(project_id) {
                return;
            }
            entry.resource.holder = None;
            entry.holder_priority = None;
            if entry.resource.waiters.is_empty() {
                None
            } else {
                let next = entry.resource.waiters.remove(0);
                entry.resource.holder = Some(next.project_id);
                entry.holder_priority = Some(next.priority);
                let pos = entry.pending.iter().position(|p| p.project_id == next.project_id);
                pos.map(|i| entry.pending.remove(i))
            }
        };
        if let Some(grant) = granted {
            let _ = grant.tx.send(Ok(()));
        }
    }

    /// Remove an expired waiter. Returns true when the waiter had already
    /// been granted the resource in the meantime.
    async fn remove_waiter(&self, resource_id: &ResourceId, project_id: ProjectId) -> bool {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.resources.get_mut(resource_id) {
            if entry.resource.holder == Some(project_id) {
                return true;
            }
            entry.resource.waiters.retain(|w| w.project_id != project_id);
            entry.pending.retain(|p| p.project_id != project_id);
        }
        false
    }

    /// Atomic snapshot of all resources, holders and waiter queues.
    pub async fn inspect(&self) -> Vec<SharedResource> {
        let inner = self.inner.lock().await;
        let mut resources: Vec<SharedResource> =
            inner.resources.values().map(|e| e.resource.clone()).collect();
        resources.sort_by(|a, b| a.id.cmp(&b.id));
        resources
    }

    /// Projects currently waiting on resources held by `holder`.
    pub async fn waiters_on(&self, holder: ProjectId) -> Vec<ProjectId> {
        let inner = self.inner.lock().await;
        let mut waiting = Vec::new();
        for entry in inner.resources.values() {
            if entry.resource.holder == Some(holder) {
                for waiter in &entry.resource.waiters {
                    if !waiting.contains(&waiter.project_id) {
                        waiting.push(waiter.project_id);
                    }
                }
            }
        }
        waiting
    }

    async fn emit_conflict(
        &self,
        kind: &str,
        detail: String,
        project_id: Option<ProjectId>,
        resource: Option<ResourceId>,
    ) {
        self.bus
            .publish(EngineEvent::unstamped(
                Component::CrossProjectCoordinator,
                EventPayload::ConflictDetected {
                    kind: kind.to_string(),
                    detail,
                    project_id,
                    resource,
                },
            ))
            .await;
    }
}
