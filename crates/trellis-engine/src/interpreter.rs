use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use futures::channel::mpsc::{self, UnboundedSender};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::{debug, error, info};

use trellis_core::config::AppConfig;
use trellis_core::error::{Result, TrellisError};
use trellis_core::event::EventBus;
use trellis_core::traits::{MemoryStore, ModelClient, Surface};
use trellis_core::types::{EngineEvent, Usage};
use trellis_tools::ToolRegistry;

use crate::executor::{self, publish_aborted, Step};
use crate::playbook::registry::check_arguments;
use crate::playbook::{PlaybookDefinition, PlaybookRegistry};
use crate::profile::ProfileResolver;
use crate::session::SessionRegistry;
use crate::state::{ExecutionState, NodeRegion, Output, OutputFragment, SystemContext, SystemRegion, TraceEntry};
use crate::thread::ThreadHierarchy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    /// Stopped at a cancellation point. Not an error.
    Cancelled,
}

/// What a finished top-level run hands back.
#[derive(Debug)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub outputs: Vec<Output>,
    pub state: ExecutionState,
    pub steps: usize,
}

impl RunOutcome {
    pub fn usage(&self) -> Usage {
        self.state.system.usage
    }

    /// The run's `last` value, if any node wrote one.
    pub fn last(&self) -> Option<&serde_json::Value> {
        self.state.node.get(crate::playbook::node::DEFAULT_OUTPUT_KEY)
    }
}

/// One walked playbook graph (top-level or sub-workflow).
#[derive(Debug)]
pub(crate) struct Walk {
    pub state: ExecutionState,
    pub steps: usize,
    pub cancelled: bool,
}

/// A walk that stopped on an error. The system region keeps the usage and
/// trace accumulated up to the failing node.
#[derive(Debug)]
pub(crate) struct WalkFailure {
    pub error: TrellisError,
    pub system: SystemRegion,
}

pub(crate) type WalkResult = std::result::Result<Walk, WalkFailure>;

/// The playbook interpreter and the collaborators its nodes call.
pub struct Engine {
    pub(crate) playbooks: Arc<PlaybookRegistry>,
    pub(crate) model: Arc<dyn ModelClient>,
    pub(crate) tools: Arc<ToolRegistry>,
    pub(crate) memory: Arc<dyn MemoryStore>,
    pub(crate) surface: Arc<dyn Surface>,
    pub(crate) sessions: Arc<SessionRegistry>,
    pub(crate) resolver: ProfileResolver,
    pub(crate) config: AppConfig,
    pub(crate) events: Arc<EventBus>,
    pub(crate) working_dir: PathBuf,
}

impl Engine {
    pub fn new(
        playbooks: Arc<PlaybookRegistry>,
        model: Arc<dyn ModelClient>,
        memory: Arc<dyn MemoryStore>,
        surface: Arc<dyn Surface>,
        config: AppConfig,
    ) -> Self {
        Self {
            playbooks,
            model,
            tools: Arc::new(ToolRegistry::with_builtins()),
            resolver: ProfileResolver::new(Arc::clone(&memory), &config),
            memory,
            surface,
            sessions: Arc::new(SessionRegistry::new(&config.threads)),
            events: Arc::new(EventBus::default()),
            working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            config,
        }
    }

    pub fn with_tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_sessions(mut self, sessions: Arc<SessionRegistry>) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = dir;
        self
    }

    pub fn playbooks(&self) -> &PlaybookRegistry {
        &self.playbooks
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// The resolver hosts use for replies generated outside any playbook.
    pub fn resolver(&self) -> &ProfileResolver {
        &self.resolver
    }

    /// Run a playbook for the agent in `ctx`, holding that agent's session
    /// for the whole run. The hierarchy is saved afterwards, whatever the
    /// outcome.
    pub async fn run(
        &self,
        playbook: &str,
        args: BTreeMap<String, serde_json::Value>,
        ctx: SystemContext,
    ) -> Result<RunOutcome> {
        self.run_inner(playbook, args, ctx, None).await
    }

    /// Run as a stream: each emission as it happens, then one terminal
    /// fragment.
    pub fn run_stream(
        self: Arc<Self>,
        playbook: &str,
        args: BTreeMap<String, serde_json::Value>,
        ctx: SystemContext,
    ) -> BoxStream<'static, OutputFragment> {
        let (tx, rx) = mpsc::unbounded();
        let playbook = playbook.to_string();
        tokio::spawn(async move {
            let terminal = match self.run_inner(&playbook, args, ctx, Some(tx.clone())).await {
                Ok(outcome) => match outcome.status {
                    RunStatus::Completed => OutputFragment::Completed {
                        usage: outcome.usage(),
                        outputs: outcome.outputs,
                    },
                    RunStatus::Cancelled => OutputFragment::Cancelled {
                        outputs: outcome.outputs,
                    },
                },
                Err(e) => OutputFragment::Failed {
                    error: e.to_string(),
                },
            };
            let _ = tx.unbounded_send(terminal);
        });
        rx.boxed()
    }

    async fn run_inner(
        &self,
        playbook: &str,
        args: BTreeMap<String, serde_json::Value>,
        ctx: SystemContext,
        emitter: Option<UnboundedSender<OutputFragment>>,
    ) -> Result<RunOutcome> {
        let session = self.sessions.session(&ctx.agent.id)?;
        let mut hierarchy = session.lock().await;
        let result = self
            .run_with_hierarchy(playbook, args, ctx, emitter, &mut hierarchy)
            .await;
        let saved = self.sessions.save(&hierarchy);
        let outcome = result?;
        saved?;
        Ok(outcome)
    }

    /// Run against a hierarchy the caller already holds.
    ///
    /// On error or cancellation the thread the run acted in is aborted along
    /// with every session opened beneath it; the root itself is never
    /// aborted. Sessions still open after a successful run stay open.
    pub async fn run_with_hierarchy(
        &self,
        playbook: &str,
        args: BTreeMap<String, serde_json::Value>,
        ctx: SystemContext,
        emitter: Option<UnboundedSender<OutputFragment>>,
        hierarchy: &mut ThreadHierarchy,
    ) -> Result<RunOutcome> {
        let agent_id = ctx.agent.id.clone();
        let mark = hierarchy.active_id().clone();

        let walked = match self.bind(playbook, args) {
            Ok((def, node)) => {
                self.events.publish(EngineEvent::RunStarted {
                    agent_id: agent_id.clone(),
                    playbook: def.name.clone(),
                });
                info!(agent_id = %agent_id, playbook, "Run started");
                let mut system = SystemRegion::new(ctx);
                system.emitter = emitter;
                let state = ExecutionState::new(system, node, mark.clone());
                self.execute_playbook(def, state, hierarchy)
                    .await
                    .map_err(|failure| failure.error)
            }
            Err(e) => Err(e),
        };

        match walked {
            Ok(walk) if !walk.cancelled => {
                info!(
                    agent_id = %agent_id,
                    playbook,
                    steps = walk.steps,
                    outputs = walk.state.outputs.len(),
                    "Run completed"
                );
                self.events.publish(EngineEvent::RunCompleted {
                    agent_id,
                    playbook: playbook.to_string(),
                    steps: walk.steps,
                    outputs: walk.state.outputs.len(),
                });
                Ok(RunOutcome {
                    status: RunStatus::Completed,
                    outputs: walk.state.outputs.clone(),
                    steps: walk.steps,
                    state: walk.state,
                })
            }
            Ok(mut walk) => {
                let aborted = hierarchy.abort_run(&mark)?;
                publish_aborted(self, &agent_id, &aborted);
                walk.state.thread = hierarchy.active_id().clone();
                info!(
                    agent_id = %agent_id,
                    playbook,
                    steps = walk.steps,
                    aborted = aborted.len(),
                    "Run cancelled"
                );
                self.events.publish(EngineEvent::RunCancelled {
                    agent_id,
                    playbook: playbook.to_string(),
                });
                Ok(RunOutcome {
                    status: RunStatus::Cancelled,
                    outputs: walk.state.outputs.clone(),
                    steps: walk.steps,
                    state: walk.state,
                })
            }
            Err(e) => {
                match hierarchy.abort_run(&mark) {
                    Ok(aborted) => publish_aborted(self, &agent_id, &aborted),
                    Err(abort_err) => error!(error = %abort_err, "Failed to abort open sessions"),
                }
                error!(agent_id = %agent_id, playbook, error = %e, "Run failed");
                self.events.publish(EngineEvent::RunFailed {
                    agent_id,
                    playbook: playbook.to_string(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Look up the playbook and bind caller arguments to its parameters.
    fn bind(
        &self,
        playbook: &str,
        args: BTreeMap<String, serde_json::Value>,
    ) -> Result<(Arc<PlaybookDefinition>, NodeRegion)> {
        let def = self.playbooks.require(playbook)?;
        check_arguments(&def, args.keys().map(String::as_str)).map_err(|reason| {
            TrellisError::ArgumentMismatch {
                playbook: def.name.clone(),
                reason,
            }
        })?;
        Ok((def, NodeRegion::from_args(args)?))
    }

    /// Walk one playbook graph from its start node.
    pub(crate) fn execute_playbook<'a>(
        &'a self,
        def: Arc<PlaybookDefinition>,
        mut state: ExecutionState,
        hierarchy: &'a mut ThreadHierarchy,
    ) -> BoxFuture<'a, WalkResult> {
        Box::pin(async move {
            let mut steps = 0;
            match self.walk(&def, &mut state, hierarchy, &mut steps).await {
                Ok(cancelled) => Ok(Walk {
                    state,
                    steps,
                    cancelled,
                }),
                Err(error) => Err(WalkFailure {
                    error,
                    system: state.system,
                }),
            }
        })
    }

    /// The node loop. Returns whether the walk stopped at a cancellation
    /// point.
    async fn walk(
        &self,
        def: &PlaybookDefinition,
        state: &mut ExecutionState,
        hierarchy: &mut ThreadHierarchy,
        steps: &mut usize,
    ) -> Result<bool> {
        let max_steps = self.config.engine.max_steps;
        let mut current = Some(def.start_node.clone());

        while let Some(node_id) = current {
            if state.system.cancel.is_cancelled() {
                info!(playbook = %def.name, node_id = %node_id, "Cancellation observed");
                return Ok(true);
            }
            if *steps >= max_steps {
                return Err(TrellisError::StepLimitExceeded(max_steps));
            }
            let node = def.node(&node_id).ok_or_else(|| TrellisError::NodeNotFound {
                playbook: def.name.clone(),
                node: node_id.clone(),
            })?;
            *steps += 1;

            info!(
                playbook = %def.name,
                node_id = %node.id,
                node_type = node.kind.type_name(),
                step = *steps,
                call_depth = state.system.call_depth,
                "Dispatching node"
            );
            self.events.publish(EngineEvent::NodeStarted {
                agent_id: state.system.agent.id.clone(),
                playbook: def.name.clone(),
                node_id: node.id.clone(),
                step: *steps,
            });

            let started = Instant::now();
            let step = executor::dispatch(self, node, state, hierarchy).await?;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            state.system.trace.push(TraceEntry {
                playbook: def.name.clone(),
                node_id: node.id.clone(),
                node_type: node.kind.type_name().to_string(),
                step: *steps,
                call_depth: state.system.call_depth,
                elapsed_ms,
            });
            self.events.publish(EngineEvent::NodeCompleted {
                agent_id: state.system.agent.id.clone(),
                node_id: node.id.clone(),
                elapsed_ms,
            });

            current = match step {
                Step::Continue => node.select_next(&state.node).map(str::to_string),
                Step::Branch(target) => Some(target),
                Step::Halt => return Ok(true),
            };
            debug!(from = %node.id, to = ?current, "Transition");
        }

        Ok(false)
    }
}
