//! Context profiles.
//!
//! A `generate` node names a profile instead of spelling out what its prompt
//! contains. The set is closed; deployments may tune a profile's tier and
//! router history depth through `[profiles.<name>]`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use tiktoken_rs::CoreBPE;
use tracing::debug;

use trellis_core::config::{AppConfig, ProfileOverride};
use trellis_core::error::Result;
use trellis_core::traits::MemoryStore;
use trellis_core::types::{AgentIdentity, MemoryEntry, ModelTier, PromptContext, PromptMessage, ThreadId};

use crate::state::ExecutionState;
use crate::thread::ThreadHierarchy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileName {
    /// Everything an ordinary reply sees.
    Conversation,
    /// Short recent history for picking the next action.
    Router,
    /// Node region only.
    Worker,
    /// Node region only, cheaper tier.
    WorkerLight,
}

impl ProfileName {
    pub const ALL: [ProfileName; 4] = [
        ProfileName::Conversation,
        ProfileName::Router,
        ProfileName::Worker,
        ProfileName::WorkerLight,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conversation => "conversation",
            Self::Router => "router",
            Self::Worker => "worker",
            Self::WorkerLight => "worker_light",
        }
    }
}

impl fmt::Display for ProfileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryPolicy {
    /// Running history plus the thread view, trimmed to the thread budget.
    Full,
    /// The last `n` messages.
    Recent(usize),
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileSpec {
    pub tier: ModelTier,
    pub history: HistoryPolicy,
    pub long_term_memory: bool,
    pub environment: bool,
}

const DEFAULT_ROUTER_HISTORY: usize = 6;

impl ProfileSpec {
    pub fn builtin(profile: ProfileName) -> Self {
        match profile {
            ProfileName::Conversation => Self {
                tier: ModelTier::Standard,
                history: HistoryPolicy::Full,
                long_term_memory: true,
                environment: true,
            },
            ProfileName::Router => Self {
                tier: ModelTier::Light,
                history: HistoryPolicy::Recent(DEFAULT_ROUTER_HISTORY),
                long_term_memory: false,
                environment: false,
            },
            ProfileName::Worker => Self {
                tier: ModelTier::Standard,
                history: HistoryPolicy::None,
                long_term_memory: false,
                environment: false,
            },
            ProfileName::WorkerLight => Self {
                tier: ModelTier::Light,
                history: HistoryPolicy::None,
                long_term_memory: false,
                environment: false,
            },
        }
    }

    fn apply(mut self, tuning: Option<&ProfileOverride>) -> Self {
        let Some(tuning) = tuning else {
            return self;
        };
        if let Some(tier) = tuning.tier {
            self.tier = tier;
        }
        if let (HistoryPolicy::Recent(_), Some(n)) = (self.history, tuning.history_messages) {
            self.history = HistoryPolicy::Recent(n);
        }
        self
    }
}

fn tokenizer() -> Option<&'static CoreBPE> {
    static TOKENIZER: OnceLock<Option<CoreBPE>> = OnceLock::new();
    TOKENIZER.get_or_init(|| tiktoken_rs::cl100k_base().ok()).as_ref()
}

/// BPE token count (cl100k_base), or a chars/4 estimate if the tokenizer
/// could not be loaded.
pub fn estimate_tokens(text: &str) -> usize {
    match tokenizer() {
        Some(bpe) => bpe.encode_ordinary(text).len(),
        None => text.chars().count().div_ceil(4),
    }
}

fn message_tokens(message: &PromptMessage) -> usize {
    estimate_tokens(&message.content) + 4
}

/// Everything a user-facing reply is built from.
#[derive(Debug, Clone, Copy)]
pub struct ReplySources<'a> {
    pub agent: &'a AgentIdentity,
    pub history: &'a [PromptMessage],
    pub thread_view: &'a [PromptMessage],
    pub long_term: &'a [MemoryEntry],
    pub environment: &'a BTreeMap<String, String>,
    /// Window budget of the thread the reply is generated in.
    pub budget: u64,
}

/// Build the context of an ordinary reply. Hosts call this for replies
/// generated outside the engine, and the `conversation` profile calls it for
/// `generate` nodes, so both produce the same bytes for the same state.
pub fn assemble_reply_context(src: &ReplySources<'_>) -> PromptContext {
    let mut system = format!("You are {}.", src.agent.name);
    if let Some(persona) = &src.agent.persona {
        system.push_str("\n\n");
        system.push_str(persona);
    }
    if !src.long_term.is_empty() {
        system.push_str("\n\n## Long-term memory");
        for entry in src.long_term {
            system.push_str("\n- ");
            system.push_str(&entry.content);
        }
    }
    if !src.environment.is_empty() {
        system.push_str("\n\n## Environment");
        for (key, value) in src.environment {
            system.push_str(&format!("\n- {}: {}", key, value));
        }
    }

    let mut messages: Vec<PromptMessage> = src
        .history
        .iter()
        .chain(src.thread_view)
        .cloned()
        .collect();
    trim_to_budget(&mut messages, estimate_tokens(&system), src.budget as usize);

    PromptContext { system, messages }
}

/// Drop the oldest messages until the context fits. The newest message is
/// always kept.
fn trim_to_budget(messages: &mut Vec<PromptMessage>, fixed: usize, budget: usize) {
    let mut total: usize = fixed + messages.iter().map(message_tokens).sum::<usize>();
    let mut drop = 0;
    while total > budget && drop + 1 < messages.len() {
        total -= message_tokens(&messages[drop]);
        drop += 1;
    }
    if drop > 0 {
        debug!(dropped = drop, budget, "Trimmed history to thread budget");
        messages.drain(..drop);
    }
}

/// The prompt context a profile resolved to, plus the tier to request.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedContext {
    pub profile: ProfileName,
    pub tier: ModelTier,
    pub context: PromptContext,
}

pub struct ProfileResolver {
    conversation: ProfileSpec,
    router: ProfileSpec,
    worker: ProfileSpec,
    worker_light: ProfileSpec,
    recall_limit: usize,
    memory: Arc<dyn MemoryStore>,
}

impl ProfileResolver {
    pub fn new(memory: Arc<dyn MemoryStore>, config: &AppConfig) -> Self {
        let tuning = &config.profiles;
        Self {
            conversation: ProfileSpec::builtin(ProfileName::Conversation)
                .apply(tuning.conversation.as_ref()),
            router: ProfileSpec::builtin(ProfileName::Router).apply(tuning.router.as_ref()),
            worker: ProfileSpec::builtin(ProfileName::Worker).apply(tuning.worker.as_ref()),
            worker_light: ProfileSpec::builtin(ProfileName::WorkerLight)
                .apply(tuning.worker_light.as_ref()),
            recall_limit: config.memory.recall_limit,
            memory,
        }
    }

    pub fn spec(&self, profile: ProfileName) -> &ProfileSpec {
        match profile {
            ProfileName::Conversation => &self.conversation,
            ProfileName::Router => &self.router,
            ProfileName::Worker => &self.worker,
            ProfileName::WorkerLight => &self.worker_light,
        }
    }

    /// Context for an ordinary reply in `thread`, generated outside any
    /// playbook.
    pub async fn reply_context(
        &self,
        agent: &AgentIdentity,
        history: &[PromptMessage],
        environment: &BTreeMap<String, String>,
        hierarchy: &ThreadHierarchy,
        thread: &ThreadId,
    ) -> Result<PromptContext> {
        let spec = &self.conversation;
        let long_term = if spec.long_term_memory {
            self.memory.recall(&agent.id, self.recall_limit).await?
        } else {
            Vec::new()
        };
        let empty = BTreeMap::new();
        let thread_view = hierarchy.history_view(thread);
        let budget = hierarchy.budget(thread).unwrap_or(u64::MAX);
        Ok(assemble_reply_context(&ReplySources {
            agent,
            history,
            thread_view: &thread_view,
            long_term: &long_term,
            environment: if spec.environment { environment } else { &empty },
            budget,
        }))
    }

    /// Resolve the context a `generate` node in `state` should use.
    pub async fn resolve(
        &self,
        profile: ProfileName,
        state: &ExecutionState,
        hierarchy: &ThreadHierarchy,
    ) -> Result<ResolvedContext> {
        let spec = *self.spec(profile);
        let system = &state.system;
        let context = match spec.history {
            HistoryPolicy::Full => {
                self.reply_context(
                    &system.agent,
                    &system.history,
                    &system.environment,
                    hierarchy,
                    &state.thread,
                )
                .await?
            }
            HistoryPolicy::Recent(n) => {
                let view = hierarchy.history_view(&state.thread);
                let all: Vec<&PromptMessage> = system.history.iter().chain(&view).collect();
                let messages = all[all.len().saturating_sub(n)..]
                    .iter()
                    .map(|m| (*m).clone())
                    .collect();
                PromptContext {
                    system: format!(
                        "You are {}. Decide the next action from the recent conversation.",
                        system.agent.name
                    ),
                    messages,
                }
            }
            HistoryPolicy::None => PromptContext::default(),
        };
        Ok(ResolvedContext {
            profile,
            tier: spec.tier,
            context,
        })
    }
}
