use std::sync::Arc;

use futures::channel::mpsc;

use crate::ProjectSnapshot;

/// Holds the current project snapshot and fans new ones out to subscribers.
#[derive(Default)]
pub struct ProjectStore {
    current: Option<Arc<ProjectSnapshot>>,
    subscribers: Vec<mpsc::UnboundedSender<Arc<ProjectSnapshot>>>,
}

impl ProjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&Arc<ProjectSnapshot>> {
        self.current.as_ref()
    }

    /// Replace the current snapshot and notify every live subscriber.
    pub fn publish(&mut self, snapshot: ProjectSnapshot) -> Arc<ProjectSnapshot> {
        let snapshot = Arc::new(snapshot);
        self.current = Some(snapshot.clone());
        self.subscribers
            .retain(|tx| tx.unbounded_send(snapshot.clone()).is_ok());
        log::trace!(
            "published project snapshot to {} subscribers",
            self.subscribers.len()
        );
        snapshot
    }

    /// Apply an edit to the current snapshot (or an empty one) and publish it.
    pub fn update(&mut self, edit: impl FnOnce(ProjectSnapshot) -> ProjectSnapshot) -> Arc<ProjectSnapshot> {
        let base = self
            .current
            .as_deref()
            .cloned()
            .unwrap_or_default();
        self.publish(edit(base))
    }

    /// Subscribe to future snapshots. The current one, if any, is delivered first.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<Arc<ProjectSnapshot>> {
        let (tx, rx) = mpsc::unbounded();
        if let Some(current) = &self.current {
            let _ = tx.unbounded_send(current.clone());
        }
        self.subscribers.push(tx);
        rx
    }
}
