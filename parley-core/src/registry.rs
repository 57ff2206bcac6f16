// ABOUTME: Registry of sessions currently being dispatched
// ABOUTME: Continuations check it to detect use after their session completed

use crate::session::Session;
use crate::sync::lock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use uuid::Uuid;

/// Active sessions, referenced but not owned
#[derive(Default)]
pub struct SessionRegistry {
    active: Mutex<HashMap<Uuid, Weak<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&self, session: &Arc<Session>) {
        lock(&self.active).insert(session.id, Arc::downgrade(session));
    }

    /// Returns false if the session was not active
    pub fn release(&self, id: Uuid) -> bool {
        lock(&self.active).remove(&id).is_some()
    }

    pub fn is_active(&self, id: Uuid) -> bool {
        lock(&self.active).contains_key(&id)
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<Session>> {
        lock(&self.active).get(&id).and_then(Weak::upgrade)
    }

    pub fn active_ids(&self) -> Vec<Uuid> {
        lock(&self.active).keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.active).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
