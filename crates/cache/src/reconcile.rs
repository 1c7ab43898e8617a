//! Users whose last publish failed and must be picked up by the next sweep.

use dashmap::DashSet;

#[derive(Debug, Default)]
pub struct ReconciliationBacklog {
    users: DashSet<String>,
}

impl ReconciliationBacklog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flag(&self, user_id: &str) {
        if self.users.insert(user_id.to_string()) {
            metrics::gauge!("reconcile.backlog").increment(1.0);
        }
    }

    /// A successful publish supersedes any earlier failure.
    pub fn resolve(&self, user_id: &str) {
        if self.users.remove(user_id).is_some() {
            metrics::gauge!("reconcile.backlog").decrement(1.0);
        }
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.users.contains(user_id)
    }

    /// Flagged users, sorted. Entries stay until a publish resolves them.
    pub fn users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.users.iter().map(|u| u.key().clone()).collect();
        users.sort();
        users
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}
