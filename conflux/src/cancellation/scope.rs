//! Hierarchical cancellation scopes.

use crate::errors::{CanceledError, FlowError};
use crate::stage::StageControl;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::warn;
use uuid::Uuid;

type TriggerCallback = Box<dyn Fn(&str) + Send + Sync>;

/// A node in a tree of cancellation scopes.
///
/// Triggering a scope injects a [`CanceledError`] fault into every stage
/// registered under it and all descendant scopes, as if one of the stage's
/// transforms had failed - cancellation is a fault cause, not a separate
/// mechanism. Triggering is idempotent and the first reason wins.
pub struct CancellationScope {
    id: Uuid,
    triggered: AtomicBool,
    reason: RwLock<Option<String>>,
    children: RwLock<Vec<Arc<CancellationScope>>>,
    stages: DashMap<Uuid, Arc<dyn StageControl>>,
    callbacks: RwLock<Vec<Option<TriggerCallback>>>,
}

impl CancellationScope {
    /// Creates a new root scope.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            triggered: AtomicBool::new(false),
            reason: RwLock::new(None),
            children: RwLock::new(Vec::new()),
            stages: DashMap::new(),
            callbacks: RwLock::new(Vec::new()),
        })
    }

    /// Returns the scope id.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Creates a child scope. A child created under an already-triggered
    /// parent is born triggered.
    #[must_use]
    pub fn child(self: &Arc<Self>) -> Arc<Self> {
        let child = Self::new();
        self.children.write().push(child.clone());
        // Close the race with a concurrent trigger that missed the push.
        if self.is_triggered() && !child.is_triggered() {
            child.trigger(
                self.reason()
                    .unwrap_or_else(|| "parent scope triggered".to_string()),
            );
        }
        child
    }

    /// Registers a stage to receive this scope's cancellation fault. A stage
    /// registered after the trigger is injected immediately.
    pub fn register(&self, stage: Arc<dyn StageControl>) {
        if self.is_triggered() {
            stage.inject_fault(self.canceled_error());
            return;
        }
        let id = stage.id();
        self.stages.insert(id, stage);
        // Close the race with a concurrent trigger that missed the insert.
        if self.is_triggered() {
            if let Some((_, stage)) = self.stages.remove(&id) {
                stage.inject_fault(self.canceled_error());
            }
        }
    }

    /// Registers a callback invoked on trigger with the reason. If the scope
    /// is already triggered, the callback runs immediately and the returned
    /// registration is inert. Panics in callbacks are logged and suppressed.
    pub fn on_trigger<F>(self: &Arc<Self>, callback: F) -> CallbackRegistration
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        if self.is_triggered() {
            let reason = self.reason().unwrap_or_default();
            invoke_callback(self.id, &callback, &reason);
            return CallbackRegistration::inert();
        }
        let mut slots = self.callbacks.write();
        let index = slots.len();
        slots.push(Some(Box::new(callback)));
        CallbackRegistration {
            scope: Arc::downgrade(self),
            index,
            active: AtomicBool::new(true),
        }
    }

    /// Triggers the scope: idempotent, first reason wins. Injects the
    /// cancellation fault into every registered stage, runs callbacks, and
    /// triggers all child scopes.
    pub fn trigger(&self, reason: impl Into<String>) {
        if self
            .triggered
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let reason = reason.into();
        *self.reason.write() = Some(reason.clone());
        warn!(scope = %self.id, reason = %reason, "cancellation scope triggered");

        let error = self.canceled_error();
        let registered: Vec<_> = self
            .stages
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.stages.clear();
        for stage in registered {
            stage.inject_fault(error.clone());
        }

        for slot in self.callbacks.read().iter() {
            if let Some(callback) = slot {
                invoke_callback(self.id, callback, &reason);
            }
        }

        let children: Vec<_> = self.children.write().drain(..).collect();
        for child in children {
            child.trigger(reason.clone());
        }
    }

    /// Returns true once the scope has been triggered.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Returns the trigger reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.read().clone()
    }

    fn canceled_error(&self) -> FlowError {
        let reason = self
            .reason()
            .unwrap_or_else(|| "scope triggered".to_string());
        CanceledError::new(reason).with_scope_id(self.id).into()
    }
}

impl std::fmt::Debug for CancellationScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationScope")
            .field("id", &self.id)
            .field("triggered", &self.is_triggered())
            .field("reason", &self.reason())
            .finish()
    }
}

fn invoke_callback(scope: Uuid, callback: &(dyn Fn(&str) + Send + Sync), reason: &str) {
    if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        callback(reason);
    })) {
        warn!(scope = %scope, "trigger callback panicked: {panic:?}");
    }
}

/// Handle to a registered trigger callback: a slot index into the owning
/// scope's callback arena plus a still-valid flag.
pub struct CallbackRegistration {
    scope: Weak<CancellationScope>,
    index: usize,
    active: AtomicBool,
}

impl CallbackRegistration {
    fn inert() -> Self {
        Self {
            scope: Weak::new(),
            index: 0,
            active: AtomicBool::new(false),
        }
    }

    /// Returns true while the callback is still registered.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Removes the callback from its scope. Idempotent.
    pub fn deregister(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(scope) = self.scope.upgrade() {
            if let Some(slot) = scope.callbacks.write().get_mut(self.index) {
                *slot = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_scope_default_not_triggered() {
        let scope = CancellationScope::new();
        assert!(!scope.is_triggered());
        assert!(scope.reason().is_none());
    }

    #[test]
    fn test_trigger_idempotent_first_reason_wins() {
        let scope = CancellationScope::new();
        scope.trigger("first");
        scope.trigger("second");
        assert!(scope.is_triggered());
        assert_eq!(scope.reason(), Some("first".to_string()));
    }

    #[test]
    fn test_child_triggered_with_parent() {
        let parent = CancellationScope::new();
        let child = parent.child();
        let grandchild = child.child();

        parent.trigger("shutdown");
        assert!(child.is_triggered());
        assert!(grandchild.is_triggered());
        assert_eq!(grandchild.reason(), Some("shutdown".to_string()));
    }

    #[test]
    fn test_child_of_triggered_parent_born_triggered() {
        let parent = CancellationScope::new();
        parent.trigger("done");
        let child = parent.child();
        assert!(child.is_triggered());
    }

    #[test]
    fn test_triggering_child_leaves_parent_alone() {
        let parent = CancellationScope::new();
        let child = parent.child();
        child.trigger("local");
        assert!(!parent.is_triggered());
    }

    #[test]
    fn test_callback_invoked_on_trigger() {
        let scope = CancellationScope::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let registration = scope.on_trigger(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert!(registration.is_active());

        scope.trigger("go");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_invoked_immediately_when_already_triggered() {
        let scope = CancellationScope::new();
        scope.trigger("done");
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let registration = scope.on_trigger(move |reason| {
            assert_eq!(reason, "done");
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!registration.is_active());
    }

    #[test]
    fn test_deregistered_callback_not_invoked() {
        let scope = CancellationScope::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let registration = scope.on_trigger(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        registration.deregister();
        assert!(!registration.is_active());

        scope.trigger("go");
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_callback_panic_suppressed() {
        let scope = CancellationScope::new();
        let _registration = scope.on_trigger(|_| panic!("intentional"));
        scope.trigger("go");
        assert!(scope.is_triggered());
    }
}
