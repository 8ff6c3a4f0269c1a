//! Collaborator boundaries the orchestrator consults for user-facing sends.
//!
//! The in-memory implementations back tests and the default binary wiring.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::selection::{DeliveryWindow, MessageCandidate};

/// Where a user wants to be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryTarget {
    pub channel: String,
    pub recipient: String,
}

impl DeliveryTarget {
    pub fn new(channel: impl Into<String>, recipient: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            recipient: recipient.into(),
        }
    }
}

/// Per-user delivery preferences.
pub trait PreferenceStore: Send + Sync {
    fn delivery_target(&self, user_id: &str) -> Option<DeliveryTarget>;

    /// Time-of-day windows used to pick period-specific messages.
    fn delivery_windows(&self, user_id: &str) -> Vec<DeliveryWindow>;
}

/// Supplies message candidates per category.
pub trait MessageSource: Send + Sync {
    fn candidates(&self, category: &str) -> Vec<MessageCandidate>;
}

/// Looks up task details for reminders.
pub trait TaskSource: Send + Sync {
    fn task_title(&self, user_id: &str, task_id: &str) -> Option<String>;
}

/// The collaborators handed to the orchestrator.
#[derive(Clone)]
pub struct Collaborators {
    pub preferences: Arc<dyn PreferenceStore>,
    pub messages: Arc<dyn MessageSource>,
    pub tasks: Arc<dyn TaskSource>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            preferences: Arc::new(InMemoryPreferences::new()),
            messages: Arc::new(InMemoryMessages::new()),
            tasks: Arc::new(InMemoryTasks::new()),
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

// ── In-memory implementations ───────────────────────────────────────

#[derive(Debug, Default)]
pub struct InMemoryPreferences {
    targets: RwLock<HashMap<String, DeliveryTarget>>,
    windows: RwLock<HashMap<String, Vec<DeliveryWindow>>>,
}

impl InMemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_target(&self, user_id: impl Into<String>, target: DeliveryTarget) {
        write(&self.targets).insert(user_id.into(), target);
    }

    pub fn set_windows(&self, user_id: impl Into<String>, windows: Vec<DeliveryWindow>) {
        write(&self.windows).insert(user_id.into(), windows);
    }
}

impl PreferenceStore for InMemoryPreferences {
    fn delivery_target(&self, user_id: &str) -> Option<DeliveryTarget> {
        read(&self.targets).get(user_id).cloned()
    }

    fn delivery_windows(&self, user_id: &str) -> Vec<DeliveryWindow> {
        read(&self.windows).get(user_id).cloned().unwrap_or_default()
    }
}

#[derive(Debug, Default)]
pub struct InMemoryMessages {
    by_category: RwLock<HashMap<String, Vec<MessageCandidate>>>,
}

impl InMemoryMessages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, category: impl Into<String>, candidate: MessageCandidate) {
        write(&self.by_category)
            .entry(category.into())
            .or_default()
            .push(candidate);
    }
}

impl MessageSource for InMemoryMessages {
    fn candidates(&self, category: &str) -> Vec<MessageCandidate> {
        read(&self.by_category)
            .get(category)
            .cloned()
            .unwrap_or_default()
    }
}

#[derive(Debug, Default)]
pub struct InMemoryTasks {
    titles: RwLock<HashMap<(String, String), String>>,
}

impl InMemoryTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        user_id: impl Into<String>,
        task_id: impl Into<String>,
        title: impl Into<String>,
    ) {
        write(&self.titles).insert((user_id.into(), task_id.into()), title.into());
    }
}

impl TaskSource for InMemoryTasks {
    fn task_title(&self, user_id: &str, task_id: &str) -> Option<String> {
        read(&self.titles)
            .get(&(user_id.to_string(), task_id.to_string()))
            .cloned()
    }
}
