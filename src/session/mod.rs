//! Authenticated sessions and their lifecycle.
//!
//! A session pins a user to a branch, carries the watch subscriptions for
//! the three event channels, and records its last activity. The manager
//! guards the session table, refreshes activity on every lookup, and runs a
//! background sweeper that closes sessions idle beyond the configured
//! timeout.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::auth::User;
use crate::events::{
    push_quit, watch_channel, BlackboardUpdate, DepiUpdate, QueueItem, ResourceUpdateNotice,
};
use crate::storage::Branch;

/// Sweep interval for expired sessions.
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

struct SessionInner {
    branch: Arc<dyn Branch>,
    watched_groups: HashSet<(String, String)>,
    last_request: DateTime<Utc>,
    depi_tx: Option<mpsc::Sender<QueueItem<DepiUpdate>>>,
    blackboard_tx: Option<mpsc::Sender<QueueItem<BlackboardUpdate>>>,
    resource_tx: Option<mpsc::Sender<QueueItem<ResourceUpdateNotice>>>,
}

pub struct Session {
    pub session_id: String,
    pub tool_id: String,
    pub user: Arc<User>,
    inner: Mutex<SessionInner>,
}

impl Session {
    pub fn new(
        session_id: impl Into<String>,
        tool_id: impl Into<String>,
        user: Arc<User>,
        branch: Arc<dyn Branch>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            tool_id: tool_id.into(),
            user,
            inner: Mutex::new(SessionInner {
                branch,
                watched_groups: HashSet::new(),
                last_request: Utc::now(),
                depi_tx: None,
                blackboard_tx: None,
                resource_tx: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionInner> {
        // A poisoned session lock means a panic mid-update; recover the data.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn branch(&self) -> Arc<dyn Branch> {
        Arc::clone(&self.lock().branch)
    }

    pub fn branch_name(&self) -> String {
        self.lock().branch.name()
    }

    pub fn set_branch(&self, branch: Arc<dyn Branch>) {
        self.lock().branch = branch;
    }

    pub fn touch(&self) {
        self.lock().last_request = Utc::now();
    }

    pub fn idle_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.lock().last_request).num_seconds()
    }

    pub fn watch_depi(&self) -> mpsc::Receiver<QueueItem<DepiUpdate>> {
        let (tx, rx) = watch_channel();
        self.lock().depi_tx = Some(tx);
        rx
    }

    pub fn unwatch_depi(&self) {
        if let Some(tx) = self.lock().depi_tx.take() {
            push_quit(&tx);
        }
    }

    pub fn depi_sender(&self) -> Option<mpsc::Sender<QueueItem<DepiUpdate>>> {
        self.lock().depi_tx.clone()
    }

    pub fn watch_blackboard(&self) -> mpsc::Receiver<QueueItem<BlackboardUpdate>> {
        let (tx, rx) = watch_channel();
        self.lock().blackboard_tx = Some(tx);
        rx
    }

    pub fn unwatch_blackboard(&self) {
        if let Some(tx) = self.lock().blackboard_tx.take() {
            push_quit(&tx);
        }
    }

    pub fn blackboard_sender(&self) -> Option<mpsc::Sender<QueueItem<BlackboardUpdate>>> {
        self.lock().blackboard_tx.clone()
    }

    pub fn watch_resources(&self) -> mpsc::Receiver<QueueItem<ResourceUpdateNotice>> {
        let (tx, rx) = watch_channel();
        self.lock().resource_tx = Some(tx);
        rx
    }

    pub fn unwatch_resources(&self) {
        if let Some(tx) = self.lock().resource_tx.take() {
            push_quit(&tx);
        }
    }

    pub fn resource_sender(&self) -> Option<mpsc::Sender<QueueItem<ResourceUpdateNotice>>> {
        self.lock().resource_tx.clone()
    }

    pub fn add_watched_group(&self, tool_id: impl Into<String>, url: impl Into<String>) {
        self.lock()
            .watched_groups
            .insert((tool_id.into(), url.into()));
    }

    pub fn remove_watched_group(&self, tool_id: &str, url: &str) {
        self.lock()
            .watched_groups
            .remove(&(tool_id.to_string(), url.to_string()));
    }

    pub fn watches_group(&self, tool_id: &str, url: &str) -> bool {
        self.lock()
            .watched_groups
            .contains(&(tool_id.to_string(), url.to_string()))
    }

    /// Terminate all three streams and drop the subscriptions.
    pub fn close(&self) {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(tx) = inner.depi_tx.take() {
            push_quit(&tx);
        }
        if let Some(tx) = inner.blackboard_tx.take() {
            push_quit(&tx);
        }
        if let Some(tx) = inner.resource_tx.take() {
            push_quit(&tx);
        }
    }
}

pub struct SessionManager {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    timeout_secs: u64,
}

impl SessionManager {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            timeout_secs,
        }
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Session>>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Look up a session, refreshing its activity timestamp.
    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        let session = self.table().get(session_id).cloned()?;
        session.touch();
        Some(session)
    }

    pub fn add(&self, session: Arc<Session>) {
        self.table().insert(session.session_id.clone(), session);
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<Session>> {
        self.table().remove(session_id)
    }

    /// Snapshot of every live session, for fan-out.
    pub fn all(&self) -> Vec<Arc<Session>> {
        self.table().values().cloned().collect()
    }

    /// Close and drop sessions idle beyond the timeout.
    pub fn expire_idle(&self) {
        let now = Utc::now();
        let expired: Vec<Arc<Session>> = {
            let table = self.table();
            table
                .values()
                .filter(|s| s.idle_seconds(now) > self.timeout_secs as i64)
                .cloned()
                .collect()
        };
        if expired.is_empty() {
            return;
        }
        let mut table = self.table();
        for session in expired {
            info!("session {} has timed out", session.session_id);
            session.close();
            table.remove(&session.session_id);
        }
    }

    /// Background task sweeping expired sessions every five minutes.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let manager = Arc::clone(&manager);
                if let Err(err) =
                    tokio::task::spawn_blocking(move || manager.expire_idle()).await
                {
                    error!("error checking sessions: {}", err);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DepiConfig;
    use crate::storage::MemJsonDatabase;
    use tempfile::TempDir;

    async fn main_branch(dir: &TempDir) -> Arc<dyn Branch> {
        let mut config = DepiConfig::default();
        config.db.state_dir = dir.path().join("state").to_string_lossy().to_string();
        let db = MemJsonDatabase::new(Arc::new(config)).unwrap();
        use crate::storage::DepiDatabase;
        db.branch("main").await.unwrap()
    }

    fn user() -> Arc<User> {
        Arc::new(User {
            name: "mark".into(),
            password: "mark".into(),
            authorization: None,
        })
    }

    #[tokio::test]
    async fn lookup_refreshes_activity() {
        let dir = TempDir::new().unwrap();
        let manager = SessionManager::new(3600);
        let session = Arc::new(Session::new("s1", "git", user(), main_branch(&dir).await));
        manager.add(Arc::clone(&session));

        assert!(manager.get("s1").is_some());
        assert!(manager.get("nope").is_none());
        assert!(session.idle_seconds(Utc::now()) <= 1);
    }

    #[tokio::test]
    async fn expire_closes_idle_sessions() {
        let dir = TempDir::new().unwrap();
        let manager = SessionManager::new(0);
        let session = Arc::new(Session::new("s1", "git", user(), main_branch(&dir).await));
        let mut rx = session.watch_depi();
        manager.add(session);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        manager.expire_idle();
        assert!(manager.get("s1").is_none());
        assert!(matches!(rx.recv().await, Some(QueueItem::Quit)));
    }

    #[tokio::test]
    async fn unwatch_pushes_sentinel() {
        let dir = TempDir::new().unwrap();
        let session = Session::new("s1", "git", user(), main_branch(&dir).await);
        let mut rx = session.watch_depi();
        assert!(session.depi_sender().is_some());
        session.unwatch_depi();
        assert!(session.depi_sender().is_none());
        assert!(matches!(rx.recv().await, Some(QueueItem::Quit)));
    }
}
