// In-memory implementations for examples and testing
//
// These keep everything in memory, making them suitable for:
// - Unit and integration tests of the dispatcher and coordinator
// - Running the relay headless (e.g. in CI) without a notification daemon

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::NotifyError;
use crate::notifier::Notifier;

/// A notification that was accepted by [`InMemoryNotifier`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub title: String,
    pub body: String,
}

#[derive(Debug, Default)]
struct State {
    delivered: Vec<Delivered>,
    attempts: usize,
    fail_next: usize,
    failing_titles: HashSet<String>,
}

/// Records notifications instead of showing them
///
/// Clones share state, so a test can hand one clone to the relay and inspect
/// another.
#[derive(Debug, Default, Clone)]
pub struct InMemoryNotifier {
    state: Arc<Mutex<State>>,
}

impl InMemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `count` notifications
    pub async fn fail_next(&self, count: usize) {
        self.state.lock().await.fail_next = count;
    }

    /// Always reject notifications with this title
    pub async fn fail_title(&self, title: impl Into<String>) {
        self.state.lock().await.failing_titles.insert(title.into());
    }

    /// Stop rejecting anything
    pub async fn heal(&self) {
        let mut state = self.state.lock().await;
        state.fail_next = 0;
        state.failing_titles.clear();
    }

    /// Notifications accepted so far, in order
    pub async fn delivered(&self) -> Vec<Delivered> {
        self.state.lock().await.delivered.clone()
    }

    /// Titles of accepted notifications, in order
    pub async fn titles(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .delivered
            .iter()
            .map(|d| d.title.clone())
            .collect()
    }

    /// Number of notify calls, accepted or not
    pub async fn attempts(&self) -> usize {
        self.state.lock().await.attempts
    }
}

#[async_trait]
impl Notifier for InMemoryNotifier {
    async fn notify(&self, title: &str, body: &str) -> Result<(), NotifyError> {
        let mut state = self.state.lock().await;
        state.attempts += 1;

        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(NotifyError::Rejected(format!("scripted failure for {title}")));
        }
        if state.failing_titles.contains(title) {
            return Err(NotifyError::Rejected(format!("title {title} is failing")));
        }

        state.delivered.push(Delivered {
            title: title.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }
}
