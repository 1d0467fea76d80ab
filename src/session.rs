//! Session registry (C6) and tab ownership tracking (C8)
//!
//! An `RwLock<HashMap<...>>` keyed by session id, each entry holding its
//! own interior-mutable state rather than one giant lock over the whole
//! broker.

use crate::envelope::TabId;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Nascent,
    Active,
    Draining,
    Terminated,
}

pub struct Session {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    state: RwLock<SessionState>,
    last_active_at: RwLock<DateTime<Utc>>,
    /// Port of the extension this session is currently bound to, if any
    /// — a session is bound to exactly one extension at a time.
    port: RwLock<Option<u16>>,
    owned_tabs: RwLock<HashSet<TabId>>,
    last_focused_tab: RwLock<Option<TabId>>,
}

impl Session {
    fn new(session_id: String) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            created_at: now,
            state: RwLock::new(SessionState::Nascent),
            last_active_at: RwLock::new(now),
            port: RwLock::new(None),
            owned_tabs: RwLock::new(HashSet::new()),
            last_focused_tab: RwLock::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.read().unwrap()
    }

    pub fn set_state(&self, state: SessionState) {
        *self.state.write().unwrap() = state;
    }

    pub fn last_active_at(&self) -> DateTime<Utc> {
        *self.last_active_at.read().unwrap()
    }

    pub fn touch(&self) {
        *self.last_active_at.write().unwrap() = Utc::now();
        if self.state() == SessionState::Nascent {
            self.set_state(SessionState::Active);
        }
    }

    pub fn port(&self) -> Option<u16> {
        *self.port.read().unwrap()
    }

    pub fn bind_port(&self, port: u16) {
        *self.port.write().unwrap() = Some(port);
    }

    pub fn owned_tabs(&self) -> Vec<TabId> {
        self.owned_tabs.read().unwrap().iter().copied().collect()
    }

    pub fn own_tab(&self, tab_id: TabId) {
        self.owned_tabs.write().unwrap().insert(tab_id);
    }

    pub fn disown_tab(&self, tab_id: TabId) {
        self.owned_tabs.write().unwrap().remove(&tab_id);
        let mut last = self.last_focused_tab.write().unwrap();
        if *last == Some(tab_id) {
            *last = None;
        }
    }

    pub fn last_focused_tab(&self) -> Option<TabId> {
        *self.last_focused_tab.read().unwrap()
    }

    /// Records the tab a command most recently touched as the session's
    /// focus, implicitly taking ownership of it.
    pub fn set_focused_tab(&self, tab_id: TabId) {
        self.own_tab(tab_id);
        *self.last_focused_tab.write().unwrap() = Some(tab_id);
    }

    /// Resolves which tab a command with no explicit `tabId` should
    /// target: the session's last-focused tab, or `None` if it has never
    /// focused one (the dispatcher then requires an explicit target).
    pub fn resolve_implicit_tab(&self) -> Option<TabId> {
        self.last_focused_tab()
    }

    pub fn idle_for(&self) -> chrono::Duration {
        Utc::now() - self.last_active_at()
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, session_id: String) -> Arc<Session> {
        let session = Arc::new(Session::new(session_id.clone()));
        self.sessions.write().unwrap().insert(session_id, session.clone());
        session
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().unwrap().get(session_id).cloned()
    }

    pub fn get_or_create(&self, session_id: &str) -> Arc<Session> {
        if let Some(existing) = self.get(session_id) {
            return existing;
        }
        self.create(session_id.to_string())
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.write().unwrap().remove(session_id)
    }

    pub fn is_live(&self, session_id: &str) -> bool {
        self.sessions
            .read()
            .unwrap()
            .get(session_id)
            .is_some_and(|s| s.state() != SessionState::Terminated)
    }

    pub fn list(&self) -> Vec<Arc<Session>> {
        self.sessions.read().unwrap().values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    /// Marks every session idle for longer than `idle_timeout` as
    /// `Draining` and returns their ids, for the idle-session reaper to
    /// finish tearing down.
    pub fn mark_idle_sessions_draining(&self, idle_timeout: chrono::Duration) -> Vec<String> {
        let sessions = self.sessions.read().unwrap();
        let mut drained = Vec::new();
        for session in sessions.values() {
            if session.state() == SessionState::Active && session.idle_for() > idle_timeout {
                session.set_state(SessionState::Draining);
                drained.push(session.session_id.clone());
            }
        }
        drained
    }
}
