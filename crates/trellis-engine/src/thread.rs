//! Nested sessions.
//!
//! Each agent owns one [`ThreadHierarchy`]: a tree of threads rooted at the
//! agent's primary session. Entering a nested session carves a fraction of
//! the parent's window budget out for the child and leaves an anchor in the
//! parent. Anchors render relative to the reader: the child and its
//! descendants see a one-line pointer, everyone else sees the chronicle and
//! the most recent raw exchanges.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use trellis_core::config::ThreadConfig;
use trellis_core::error::{Result, TrellisError};
use trellis_core::types::{PromptMessage, Role, ThreadId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    Active,
    Completed,
    Aborted,
}

impl ThreadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ThreadEntry {
    Message {
        role: Role,
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tags: Vec<String>,
    },
    /// Placeholder for a child session. Rendered on read, never stored as text.
    Anchor { child: ThreadId },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: ThreadId,
    pub parent_id: Option<ThreadId>,
    pub depth: usize,
    pub window_ratio: f64,
    /// Window budget in tokens.
    pub budget: u64,
    pub status: ThreadStatus,
    pub chronicle_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub entries: Vec<ThreadEntry>,
}

impl Thread {
    fn root(budget: u64) -> Self {
        Self {
            id: ThreadId::new(),
            parent_id: None,
            depth: 0,
            window_ratio: 1.0,
            budget,
            status: ThreadStatus::Active,
            chronicle_summary: None,
            label: None,
            created_at: Utc::now(),
            completed_at: None,
            entries: Vec::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Own messages, oldest first. Anchors are skipped.
    pub fn messages(&self) -> impl Iterator<Item = (Role, &str)> {
        self.entries.iter().filter_map(|e| match e {
            ThreadEntry::Message { role, content, .. } => Some((*role, content.as_str())),
            ThreadEntry::Anchor { .. } => None,
        })
    }

    fn title(&self) -> String {
        match &self.label {
            Some(label) => format!("nested session {} ({})", self.id.short(), label),
            None => format!("nested session {}", self.id.short()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThreadLimits {
    pub max_depth: usize,
    pub default_window_ratio: f64,
    /// Raw messages shown under a fully rendered anchor.
    pub anchor_recent: usize,
}

impl Default for ThreadLimits {
    fn default() -> Self {
        Self::from(&ThreadConfig::default())
    }
}

impl From<&ThreadConfig> for ThreadLimits {
    fn from(config: &ThreadConfig) -> Self {
        Self {
            max_depth: config.max_depth,
            default_window_ratio: config.default_window_ratio,
            anchor_recent: config.anchor_recent_exchanges,
        }
    }
}

/// One agent's session tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadHierarchy {
    pub agent_id: String,
    root: ThreadId,
    active: ThreadId,
    threads: BTreeMap<ThreadId, Thread>,
    #[serde(skip, default)]
    limits: ThreadLimits,
}

impl ThreadHierarchy {
    pub fn new(agent_id: impl Into<String>, root_budget: u64, limits: ThreadLimits) -> Self {
        let root = Thread::root(root_budget);
        let id = root.id.clone();
        Self {
            agent_id: agent_id.into(),
            root: id.clone(),
            active: id.clone(),
            threads: BTreeMap::from([(id, root)]),
            limits,
        }
    }

    /// Replace the limits of a restored snapshot with the current ones.
    pub fn with_limits(mut self, limits: ThreadLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn limits(&self) -> ThreadLimits {
        self.limits
    }

    pub fn root_id(&self) -> &ThreadId {
        &self.root
    }

    pub fn active_id(&self) -> &ThreadId {
        &self.active
    }

    pub fn get(&self, id: &ThreadId) -> Option<&Thread> {
        self.threads.get(id)
    }

    fn require(&self, id: &ThreadId) -> Result<&Thread> {
        self.threads
            .get(id)
            .ok_or_else(|| TrellisError::ThreadNotFound(id.to_string()))
    }

    fn require_mut(&mut self, id: &ThreadId) -> Result<&mut Thread> {
        self.threads
            .get_mut(id)
            .ok_or_else(|| TrellisError::ThreadNotFound(id.to_string()))
    }

    pub fn active(&self) -> Result<&Thread> {
        self.require(&self.active)
    }

    pub fn budget(&self, id: &ThreadId) -> Option<u64> {
        self.threads.get(id).map(|t| t.budget)
    }

    pub fn threads(&self) -> impl Iterator<Item = &Thread> {
        self.threads.values()
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Children of a thread, in creation order. Anchors are pushed as each
    /// child is entered, so the parent's entries carry that order.
    pub fn children(&self, id: &ThreadId) -> Vec<&Thread> {
        let Some(parent) = self.threads.get(id) else {
            return Vec::new();
        };
        parent
            .entries
            .iter()
            .filter_map(|entry| match entry {
                ThreadEntry::Anchor { child } => self.threads.get(child),
                ThreadEntry::Message { .. } => None,
            })
            .collect()
    }

    /// Open a nested session under the active thread.
    ///
    /// Rejected when the active thread is already at `max_depth`; the parent
    /// is left exactly as it was. The anchor is in the parent before this
    /// returns, so it precedes anything the child records.
    pub fn enter(&mut self, window_ratio: Option<f64>, label: Option<String>) -> Result<ThreadId> {
        let max_depth = self.limits.max_depth;
        let ratio = window_ratio.unwrap_or(self.limits.default_window_ratio);
        let parent = self.active()?;
        if parent.depth >= max_depth {
            warn!(
                agent_id = %self.agent_id,
                depth = parent.depth + 1,
                max_depth,
                "Nested session rejected"
            );
            return Err(TrellisError::DepthExceeded {
                depth: parent.depth + 1,
                max_depth,
            });
        }

        let child = Thread {
            id: ThreadId::new(),
            parent_id: Some(parent.id.clone()),
            depth: parent.depth + 1,
            window_ratio: ratio,
            budget: (parent.budget as f64 * ratio).round() as u64,
            status: ThreadStatus::Active,
            chronicle_summary: None,
            label,
            created_at: Utc::now(),
            completed_at: None,
            entries: Vec::new(),
        };
        let child_id = child.id.clone();
        let parent_id = parent.id.clone();

        info!(
            agent_id = %self.agent_id,
            thread_id = %child_id,
            depth = child.depth,
            budget = child.budget,
            "Entered nested session"
        );
        self.require_mut(&parent_id)?.entries.push(ThreadEntry::Anchor {
            child: child_id.clone(),
        });
        self.threads.insert(child_id.clone(), child);
        self.active = child_id.clone();
        Ok(child_id)
    }

    /// Close the active nested session normally and restore its parent.
    pub fn leave(&mut self, id: &ThreadId, chronicle: Option<String>) -> Result<()> {
        if *id != self.active {
            return Err(TrellisError::ThreadNotFound(format!("{} is not the active session", id)));
        }
        let thread = self.require_mut(id)?;
        let Some(parent) = thread.parent_id.clone() else {
            return Err(TrellisError::NoOpenSession);
        };
        thread.status = ThreadStatus::Completed;
        thread.chronicle_summary = chronicle;
        thread.completed_at = Some(Utc::now());
        debug!(thread_id = %id, chronicle = thread.chronicle_summary.is_some(), "Left nested session");
        self.active = parent;
        Ok(())
    }

    /// Abort a nested session and any sessions still open beneath it. No
    /// chronicle is generated. If the active thread was inside, the aborted
    /// session's parent becomes active.
    pub fn abort(&mut self, id: &ThreadId) -> Result<Vec<ThreadId>> {
        let parent = self
            .require(id)?
            .parent_id
            .clone()
            .ok_or(TrellisError::NoOpenSession)?;

        let mut aborted = Vec::new();
        let now = Utc::now();
        let open: Vec<ThreadId> = self
            .threads
            .values()
            .filter(|t| t.status == ThreadStatus::Active && self.is_descendant_or_self(&t.id, id))
            .map(|t| t.id.clone())
            .collect();
        for tid in open {
            let thread = self.require_mut(&tid)?;
            thread.status = ThreadStatus::Aborted;
            thread.chronicle_summary = None;
            thread.completed_at = Some(now);
            aborted.push(tid);
        }
        if self.is_descendant_or_self(&self.active, id) {
            self.active = parent;
        }
        if !aborted.is_empty() {
            warn!(agent_id = %self.agent_id, thread_id = %id, count = aborted.len(), "Aborted nested session");
        }
        Ok(aborted)
    }

    /// Abort every session opened beneath `mark`, restoring `mark` as the
    /// active thread. Used when a run or an inline call ends in an error or
    /// cancellation.
    pub fn abort_above(&mut self, mark: &ThreadId) -> Result<Vec<ThreadId>> {
        if self.active == *mark {
            return Ok(Vec::new());
        }
        let path = self.path_to(&self.active);
        let Some(at) = path.iter().position(|t| t.id == *mark) else {
            return Ok(Vec::new());
        };
        let Some(outermost) = path.get(at + 1).map(|t| t.id.clone()) else {
            return Ok(Vec::new());
        };
        self.abort(&outermost)
    }

    /// Abort after a run that started in `mark` failed or was cancelled.
    ///
    /// The nearest open thread at or above `mark` is aborted together with
    /// everything open beneath it. The root is never aborted; when the nearest
    /// open thread is the root, only the sessions beneath it are.
    pub fn abort_run(&mut self, mark: &ThreadId) -> Result<Vec<ThreadId>> {
        let open = self
            .path_to(mark)
            .into_iter()
            .rev()
            .find(|t| t.status == ThreadStatus::Active)
            .map(|t| t.id.clone())
            .unwrap_or_else(|| self.root.clone());
        if open == self.root {
            self.abort_above(&open)
        } else {
            self.abort(&open)
        }
    }

    /// Append a message to the active thread.
    pub fn record(&mut self, role: Role, content: impl Into<String>, tags: Vec<String>) -> Result<()> {
        let active = self.active.clone();
        self.record_in(&active, role, content, tags)
    }

    pub fn record_in(
        &mut self,
        id: &ThreadId,
        role: Role,
        content: impl Into<String>,
        tags: Vec<String>,
    ) -> Result<()> {
        self.require_mut(id)?.entries.push(ThreadEntry::Message {
            role,
            content: content.into(),
            tags,
        });
        Ok(())
    }

    /// A session's own messages, for chronicle generation.
    pub fn transcript(&self, id: &ThreadId) -> Result<Vec<PromptMessage>> {
        Ok(self
            .require(id)?
            .messages()
            .map(|(role, content)| PromptMessage::new(role, content))
            .collect())
    }

    /// Root-first path to `id`, inclusive.
    pub fn path_to(&self, id: &ThreadId) -> Vec<&Thread> {
        let mut path = Vec::new();
        let mut cursor = self.threads.get(id);
        while let Some(thread) = cursor {
            path.push(thread);
            cursor = thread.parent_id.as_ref().and_then(|p| self.threads.get(p));
        }
        path.reverse();
        path
    }

    pub fn is_descendant_or_self(&self, candidate: &ThreadId, ancestor: &ThreadId) -> bool {
        self.path_to(candidate).iter().any(|t| t.id == *ancestor)
    }

    /// History as seen from `reader`: every thread on the root-to-reader
    /// path contributes its entries in order, with anchors rendered for this
    /// reader.
    pub fn history_view(&self, reader: &ThreadId) -> Vec<PromptMessage> {
        let mut view = Vec::new();
        for thread in self.path_to(reader) {
            for entry in &thread.entries {
                match entry {
                    ThreadEntry::Message { role, content, .. } => {
                        view.push(PromptMessage::new(*role, content.clone()));
                    }
                    ThreadEntry::Anchor { child } => {
                        view.push(PromptMessage::system(self.render_anchor(child, reader)));
                    }
                }
            }
        }
        view
    }

    /// Render the anchor for `child` as read from `reader`.
    pub fn render_anchor(&self, child: &ThreadId, reader: &ThreadId) -> String {
        let Some(thread) = self.threads.get(child) else {
            return format!("[nested session {} unavailable]", child.short());
        };
        if self.is_descendant_or_self(reader, child) {
            return format!("[{}: current session]", thread.title());
        }

        let mut out = match thread.status {
            ThreadStatus::Active => format!("[{} in progress]", thread.title()),
            ThreadStatus::Aborted => format!("[{} ended without summary]", thread.title()),
            ThreadStatus::Completed => format!("[{} completed]", thread.title()),
        };
        if let Some(chronicle) = &thread.chronicle_summary {
            out.push_str("\nChronicle: ");
            out.push_str(chronicle);
        }
        let messages: Vec<_> = thread.messages().collect();
        let recent = &messages[messages.len().saturating_sub(self.limits.anchor_recent)..];
        if !recent.is_empty() {
            out.push_str("\nRecent exchanges:");
            for (role, content) in recent {
                out.push_str(&format!("\n- {}: {}", role.as_str(), content));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hierarchy(budget: u64) -> ThreadHierarchy {
        ThreadHierarchy::new("ada", budget, ThreadLimits::default())
    }

    #[test]
    fn test_child_budget_from_ratio() {
        let mut h = hierarchy(10_000);
        let child = h.enter(Some(0.8), None).unwrap();
        let thread = h.get(&child).unwrap();
        assert_eq!(thread.budget, 8_000);
        assert_eq!(thread.depth, 1);
        assert_eq!(h.active_id(), &child);
    }

    #[test]
    fn test_depth_and_budget_up_to_max_depth() {
        let mut h = hierarchy(100_000);
        let ratios = [0.8, 0.5, 0.25];
        let mut parent = h.root_id().clone();
        for ratio in ratios {
            let child = h.enter(Some(ratio), None).unwrap();
            let (p, c) = (h.get(&parent).unwrap(), h.get(&child).unwrap());
            assert_eq!(c.depth, p.depth + 1);
            assert_eq!(c.budget, (p.budget as f64 * ratio).round() as u64);
            parent = child;
        }
        assert_eq!(h.active().unwrap().depth, 3);
        assert_eq!(h.active().unwrap().budget, 10_000);

        let before = h.get(&parent).unwrap().clone();
        let err = h.enter(Some(0.5), None).unwrap_err();
        assert!(matches!(err, TrellisError::DepthExceeded { depth: 4, max_depth: 3 }));
        assert!(err.is_rejection());
        let after = h.get(&parent).unwrap();
        assert_eq!(after.entries, before.entries);
        assert_eq!(after.status, ThreadStatus::Active);
        assert_eq!(h.active_id(), &parent);
        assert_eq!(h.len(), 4);
    }

    #[test]
    fn test_default_ratio() {
        let mut h = hierarchy(1_000);
        let child = h.enter(None, None).unwrap();
        assert_eq!(h.get(&child).unwrap().window_ratio, 0.8);
        assert_eq!(h.budget(&child), Some(800));
    }

    #[test]
    fn test_anchor_renders_by_viewer_position() {
        let mut h = hierarchy(10_000);
        let root = h.root_id().clone();
        h.record(Role::User, "let's research oceans", vec![]).unwrap();
        let child = h.enter(None, Some("research".into())).unwrap();
        h.record(Role::Assistant, "found three sources", vec![]).unwrap();
        let grandchild = h.enter(None, None).unwrap();
        h.record(Role::Assistant, "reading source one", vec![]).unwrap();
        h.leave(&grandchild, Some("read source one".into())).unwrap();
        h.leave(&child, Some("oceans cover 71%".into())).unwrap();

        let full = h.render_anchor(&child, &root);
        assert!(full.contains("completed"));
        assert!(full.contains("Chronicle: oceans cover 71%"));
        assert!(full.contains("- assistant: found three sources"));

        for reader in [&child, &grandchild] {
            let pointer = h.render_anchor(&child, reader);
            assert!(!pointer.contains('\n'));
            assert!(!pointer.contains("oceans cover"));
        }

        // An unrelated sibling sees full detail too.
        let sibling = h.enter(None, None).unwrap();
        assert!(h.render_anchor(&child, &sibling).contains("Chronicle"));
    }

    #[test]
    fn test_history_view_walks_root_path() {
        let mut h = hierarchy(10_000);
        h.record(Role::User, "hello", vec![]).unwrap();
        let child = h.enter(None, None).unwrap();
        h.record(Role::Assistant, "inside", vec![]).unwrap();

        let view = h.history_view(&child);
        assert_eq!(view.len(), 3);
        assert_eq!(view[0].content, "hello");
        assert_eq!(view[1].role, Role::System);
        assert!(view[1].content.ends_with("current session]"));
        assert_eq!(view[2].content, "inside");

        // From the root the child is invisible except through its anchor.
        let root_view = h.history_view(&h.root_id().clone());
        assert_eq!(root_view.len(), 2);
        assert!(root_view[1].content.contains("in progress"));
    }

    #[test]
    fn test_abort_marks_open_descendants() {
        let mut h = hierarchy(10_000);
        let root = h.root_id().clone();
        let child = h.enter(None, None).unwrap();
        let grandchild = h.enter(None, None).unwrap();
        h.record(Role::Assistant, "half done", vec![]).unwrap();

        let aborted = h.abort(&child).unwrap();
        assert_eq!(aborted.len(), 2);
        for id in [&child, &grandchild] {
            let t = h.get(id).unwrap();
            assert_eq!(t.status, ThreadStatus::Aborted);
            assert!(t.chronicle_summary.is_none());
        }
        assert_eq!(h.active_id(), &root);
        assert!(h.render_anchor(&child, &root).contains("ended without summary"));
    }

    #[test]
    fn test_abort_above_mark() {
        let mut h = hierarchy(10_000);
        let outer = h.enter(None, None).unwrap();
        let inner = h.enter(None, None).unwrap();
        let innermost = h.enter(None, None).unwrap();

        let aborted = h.abort_above(&outer).unwrap();
        assert_eq!(aborted.len(), 2);
        assert_eq!(h.active_id(), &outer);
        assert_eq!(h.get(&inner).unwrap().status, ThreadStatus::Aborted);
        assert_eq!(h.get(&innermost).unwrap().status, ThreadStatus::Aborted);
        assert_eq!(h.get(&outer).unwrap().status, ThreadStatus::Active);
        assert!(h.abort_above(&outer).unwrap().is_empty());
    }

    #[test]
    fn test_abort_run_includes_session_open_at_start() {
        let mut h = hierarchy(10_000);
        let root = h.root_id().clone();
        let earlier = h.enter(None, Some("planning".into())).unwrap();
        let opened = h.enter(None, None).unwrap();

        let aborted = h.abort_run(&earlier).unwrap();
        assert_eq!(aborted.len(), 2);
        assert_eq!(h.get(&earlier).unwrap().status, ThreadStatus::Aborted);
        assert_eq!(h.get(&opened).unwrap().status, ThreadStatus::Aborted);
        assert_eq!(h.active_id(), &root);
        assert_eq!(h.get(&root).unwrap().status, ThreadStatus::Active);
    }

    #[test]
    fn test_abort_run_from_root_keeps_root() {
        let mut h = hierarchy(10_000);
        let root = h.root_id().clone();
        let child = h.enter(None, None).unwrap();

        let aborted = h.abort_run(&root).unwrap();
        assert_eq!(aborted, vec![child]);
        assert_eq!(h.active_id(), &root);
        assert_eq!(h.get(&root).unwrap().status, ThreadStatus::Active);
        assert!(h.abort_run(&root).unwrap().is_empty());
    }

    #[test]
    fn test_abort_run_after_mark_was_left() {
        let mut h = hierarchy(10_000);
        let outer = h.enter(None, None).unwrap();
        let mark = h.enter(None, None).unwrap();
        h.leave(&mark, None).unwrap();
        let sibling = h.enter(None, None).unwrap();

        // The run closed its starting session, so the nearest open thread
        // above it is the one aborted.
        h.abort_run(&mark).unwrap();
        assert_eq!(h.get(&mark).unwrap().status, ThreadStatus::Completed);
        assert_eq!(h.get(&outer).unwrap().status, ThreadStatus::Aborted);
        assert_eq!(h.get(&sibling).unwrap().status, ThreadStatus::Aborted);
        assert!(h.active().unwrap().is_root());
    }

    #[test]
    fn test_children_follow_anchor_order() {
        let mut h = hierarchy(10_000);
        let root = h.root_id().clone();
        let mut entered = Vec::new();
        for label in ["first", "second", "third", "fourth"] {
            let child = h.enter(None, Some(label.into())).unwrap();
            h.leave(&child, None).unwrap();
            entered.push(child);
        }
        // Identical timestamps must not reorder siblings.
        let stamp = h.get(&entered[0]).unwrap().created_at;
        for id in &entered {
            h.threads.get_mut(id).unwrap().created_at = stamp;
        }

        let ids: Vec<ThreadId> = h.children(&root).iter().map(|t| t.id.clone()).collect();
        assert_eq!(ids, entered);
        assert!(h.children(&entered[0]).is_empty());
    }

    #[test]
    fn test_leave_requires_active_non_root() {
        let mut h = hierarchy(10_000);
        let root = h.root_id().clone();
        assert!(matches!(h.leave(&root, None), Err(TrellisError::NoOpenSession)));

        let child = h.enter(None, None).unwrap();
        let grandchild = h.enter(None, None).unwrap();
        assert!(h.leave(&child, None).is_err());
        h.leave(&grandchild, None).unwrap();
        h.leave(&child, None).unwrap();
        assert_eq!(h.active_id(), &root);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut h = hierarchy(10_000);
        h.enter(Some(0.5), Some("plan".into())).unwrap();
        h.record(Role::User, "step", vec!["conversation".into()]).unwrap();
        let json = serde_json::to_string(&h).unwrap();
        let restored: ThreadHierarchy = serde_json::from_str(&json).unwrap();
        let restored = restored.with_limits(ThreadLimits::default());
        assert_eq!(restored.active_id(), h.active_id());
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.active().unwrap().label.as_deref(), Some("plan"));
    }
}
