// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tracing::warn;

use conductor_model::{ChatRole, LlmClient};
use conductor_store::{
    AgentKind, AgentRun, ContextParams, MessageStore, NewMessage, NewRun, RunConfig, RunError,
    RunPatch, RunStatus, RunStore, ThreadStore,
};
use conductor_tools::{
    CompositeToolProvider, ExecutionStrategy, StaticToolProvider, Tool, ToolContext,
    ToolDefinition, ToolParameter, ToolProvider, ToolResult, ToolsetOrchestrator,
};

use crate::agent::{AgentRunner, CancelFlag, RunContext, ToolOutputSubmission};
use crate::delegate::DelegateToSpecialistTool;
use crate::errors::{codes, CoreError};
use crate::events::{EventEnvelope, RunEvent, SubAgentNotice};
use crate::prompts::{generic_tools_prompt, planner_prompt, toolsets_router_prompt};

/// Which agent class runs and which tool surface it sees.
#[derive(Clone)]
pub enum InteractionMode {
    /// A single externally built tool provider (e.g. from an OpenAPI spec);
    /// the base agent runs against it directly.
    GenericOpenApi { provider: Arc<dyn ToolProvider> },
    /// Named toolsets behind an orchestrator; a planning agent delegates to
    /// specialists unless the agent class is explicitly overridden, in which
    /// case the override runs against the aggregated master provider.
    HierarchicalPlanner { orchestrator: Arc<dyn ToolsetOrchestrator> },
    /// Legacy: one synthetic router tool fronting every toolset.
    ToolsetsRouter { orchestrator: Arc<dyn ToolsetOrchestrator> },
}

/// Static configuration for an [`InteractionManager`].
#[derive(Clone)]
pub struct ManagerConfig {
    pub mode: InteractionMode,
    pub default_model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub max_tool_call_continuations: u32,
    pub execution_strategy: ExecutionStrategy,
    pub context: ContextParams,
    /// Explicit agent-class override; `None` lets the mode choose.
    pub agent_kind_override: Option<AgentKind>,
    /// Full system-prompt override; `None` uses the mode's default prompt.
    pub system_prompt_override: Option<String>,
    /// Opaque per-source credentials handed to tool providers.
    pub credentials: HashMap<String, String>,
}

impl ManagerConfig {
    pub fn new(mode: InteractionMode, default_model: impl Into<String>) -> Self {
        Self {
            mode,
            default_model: default_model.into(),
            temperature: None,
            max_tokens: None,
            max_tool_call_continuations: 10,
            execution_strategy: ExecutionStrategy::default(),
            context: ContextParams::default(),
            agent_kind_override: None,
            system_prompt_override: None,
            credentials: HashMap::new(),
        }
    }
}

/// Entry point for external callers: creates run records, wires the
/// per-mode tool provider and agent, surfaces the event stream, and mirrors
/// terminal events into the run record.
pub struct InteractionManager {
    config: ManagerConfig,
    llm: Arc<dyn LlmClient>,
    threads: Arc<dyn ThreadStore>,
    messages: Arc<dyn MessageStore>,
    runs: Arc<dyn RunStore>,
    credentials: RwLock<HashMap<String, String>>,
    /// Cancellation flags of currently running runs.
    active: Mutex<HashMap<String, CancelFlag>>,
}

impl InteractionManager {
    pub fn new(
        config: ManagerConfig,
        llm: Arc<dyn LlmClient>,
        threads: Arc<dyn ThreadStore>,
        messages: Arc<dyn MessageStore>,
        runs: Arc<dyn RunStore>,
    ) -> Result<Arc<Self>, CoreError> {
        if config.default_model.is_empty() {
            return Err(CoreError::Configuration("no default model configured".into()));
        }
        // Surface bad context budgets at construction, not mid-run.
        let probe = RunConfig {
            model: config.default_model.clone(),
            context: config.context.clone(),
            ..Default::default()
        };
        probe
            .validate()
            .map_err(|e| CoreError::Configuration(e.to_string()))?;

        let credentials = RwLock::new(config.credentials.clone());
        Ok(Arc::new(Self {
            config,
            llm,
            threads,
            messages,
            runs,
            credentials,
            active: Mutex::new(HashMap::new()),
        }))
    }

    /// The agent class the current mode and overrides select.
    fn agent_kind(&self) -> AgentKind {
        match (&self.config.mode, self.config.agent_kind_override) {
            (_, Some(kind)) => kind,
            (InteractionMode::HierarchicalPlanner { .. }, None) => AgentKind::Planner,
            (_, None) => AgentKind::Base,
        }
    }

    fn run_config(&self) -> RunConfig {
        RunConfig {
            agent_kind: self.agent_kind(),
            model: self.config.default_model.clone(),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            system_prompt: self.config.system_prompt_override.clone(),
            max_tool_call_continuations: self.config.max_tool_call_continuations,
            execution_strategy: self.config.execution_strategy,
            context: self.config.context.clone(),
        }
    }

    /// Build the tool provider and system prompt for a run, per mode.
    fn wire_agent(
        &self,
        run_config: &RunConfig,
    ) -> (Arc<dyn ToolProvider>, String, mpsc::Receiver<SubAgentNotice>) {
        let (notice_tx, notice_rx) = mpsc::channel::<SubAgentNotice>(64);
        let override_prompt = self.config.system_prompt_override.clone();

        let (provider, prompt): (Arc<dyn ToolProvider>, String) = match &self.config.mode {
            InteractionMode::GenericOpenApi { provider } => {
                let definitions: Vec<ToolDefinition> =
                    provider.get_tools().iter().map(|t| t.definition()).collect();
                (
                    Arc::clone(provider),
                    override_prompt.unwrap_or_else(|| generic_tools_prompt(&definitions)),
                )
            }
            InteractionMode::HierarchicalPlanner { orchestrator } => {
                if self.config.agent_kind_override.is_none() {
                    // Planning agent: the delegate tool is its only tool.
                    let mut provider = StaticToolProvider::new();
                    provider.register(DelegateToSpecialistTool::new(
                        Arc::clone(orchestrator),
                        Arc::clone(&self.llm),
                        run_config.clone(),
                        notice_tx,
                    ));
                    (
                        Arc::new(provider),
                        override_prompt.unwrap_or_else(|| planner_prompt(&orchestrator.toolsets())),
                    )
                } else {
                    // Explicit agent-class override: aggregate every toolset
                    // into one master provider and fall back to the generic
                    // prompt.
                    let providers = orchestrator
                        .toolsets()
                        .iter()
                        .filter_map(|set| orchestrator.provider(&set.id))
                        .collect();
                    let master = Arc::new(CompositeToolProvider::new(providers));
                    let definitions: Vec<ToolDefinition> =
                        master.get_tools().iter().map(|t| t.definition()).collect();
                    (
                        master,
                        override_prompt.unwrap_or_else(|| generic_tools_prompt(&definitions)),
                    )
                }
            }
            InteractionMode::ToolsetsRouter { orchestrator } => {
                let mut provider = StaticToolProvider::new();
                provider.register(ToolsetRouterTool { orchestrator: Arc::clone(orchestrator) });
                (
                    Arc::new(provider),
                    override_prompt
                        .unwrap_or_else(|| toolsets_router_prompt(&orchestrator.toolsets())),
                )
            }
        };
        (provider, prompt, notice_rx)
    }

    /// Every provider the current mode can reach (for re-initialization).
    fn all_providers(&self) -> Vec<Arc<dyn ToolProvider>> {
        match &self.config.mode {
            InteractionMode::GenericOpenApi { provider } => vec![Arc::clone(provider)],
            InteractionMode::HierarchicalPlanner { orchestrator }
            | InteractionMode::ToolsetsRouter { orchestrator } => orchestrator
                .toolsets()
                .iter()
                .filter_map(|set| orchestrator.provider(&set.id))
                .collect(),
        }
    }

    /// Start a new run on `thread_id` (created when `None`) with one user
    /// input message.  Returns the run id and the event stream.
    pub async fn process_input(
        self: &Arc<Self>,
        thread_id: Option<&str>,
        user_input: &str,
    ) -> Result<(String, mpsc::Receiver<EventEnvelope>), CoreError> {
        let thread = match thread_id {
            Some(id) => self
                .threads
                .get(id)
                .await?
                .ok_or_else(|| CoreError::InvalidState(format!("unknown thread: {id}")))?,
            None => self.threads.create(Default::default()).await?,
        };

        let run_config = self.run_config();
        run_config
            .validate()
            .map_err(|e| CoreError::Configuration(e.to_string()))?;
        let run = self
            .runs
            .create(NewRun::new(thread.id.clone(), run_config))
            .await?;

        let initial = vec![NewMessage::new(&thread.id, ChatRole::User, user_input)];
        self.spawn_run(run, Invocation::Fresh(initial)).await
    }

    /// Resume a run paused in `requires_action` with externally produced
    /// tool outputs.
    pub async fn continue_run_with_tool_outputs(
        self: &Arc<Self>,
        run_id: &str,
        thread_id: &str,
        outputs: Vec<ToolOutputSubmission>,
    ) -> Result<(String, mpsc::Receiver<EventEnvelope>), CoreError> {
        let run = self
            .runs
            .get(run_id)
            .await?
            .ok_or_else(|| CoreError::InvalidState(format!("unknown run: {run_id}")))?;
        if run.thread_id != thread_id {
            return Err(CoreError::InvalidState(format!(
                "run {run_id} belongs to thread {}, not {thread_id}",
                run.thread_id
            )));
        }
        if run.status != RunStatus::RequiresAction {
            return Err(CoreError::InvalidState(format!(
                "run {run_id} is {}, not requires_action",
                run.status.as_str()
            )));
        }

        let run = self
            .runs
            .update(run_id, RunPatch::status(RunStatus::InProgress))
            .await?;
        self.spawn_run(run, Invocation::Continue(outputs)).await
    }

    /// Cooperatively cancel a running run.  Returns `false` when the run is
    /// not currently active.
    pub fn cancel_run(&self, run_id: &str) -> bool {
        match self.active.lock().unwrap().get(run_id) {
            Some(flag) => {
                flag.cancel();
                true
            }
            None => false,
        }
    }

    /// Rotate per-source credentials.  Returns `true` when a genuine change
    /// was detected, in which case the tool-provider graph is re-initialized.
    pub async fn update_authentication(
        &self,
        credentials: HashMap<String, String>,
    ) -> Result<bool, CoreError> {
        {
            let current = self.credentials.read().await;
            if *current == credentials {
                return Ok(false);
            }
        }
        *self.credentials.write().await = credentials;
        for provider in self.all_providers() {
            provider
                .ensure_initialized()
                .await
                .map_err(|e| CoreError::Configuration(e.to_string()))?;
        }
        Ok(true)
    }

    async fn spawn_run(
        self: &Arc<Self>,
        run: AgentRun,
        invocation: Invocation,
    ) -> Result<(String, mpsc::Receiver<EventEnvelope>), CoreError> {
        let (provider, system_prompt, notice_rx) = self.wire_agent(&run.config);
        provider
            .ensure_initialized()
            .await
            .map_err(|e| CoreError::Configuration(e.to_string()))?;

        let cancel = CancelFlag::new();
        self.active
            .lock()
            .unwrap()
            .insert(run.id.clone(), cancel.clone());

        let ctx = RunContext {
            run_id: run.id.clone(),
            thread_id: run.thread_id.clone(),
            config: run.config.clone(),
            system_prompt,
            cancel,
        };

        let mut runner = AgentRunner::new(
            Arc::clone(&self.llm),
            provider,
            Arc::clone(&self.messages),
            Arc::clone(&self.threads),
            Arc::clone(&self.runs),
            notice_rx,
        );

        let (inner_tx, inner_rx) = mpsc::channel::<EventEnvelope>(256);
        let (outer_tx, outer_rx) = mpsc::channel::<EventEnvelope>(256);

        let run_ctx = ctx.clone();
        tokio::spawn(async move {
            let result = match invocation {
                Invocation::Fresh(initial) => runner.run(&run_ctx, initial, inner_tx).await,
                Invocation::Continue(outputs) => {
                    runner.submit_tool_outputs(&run_ctx, outputs, inner_tx).await
                }
            };
            if let Err(e) = result {
                // Construction errors are caught before spawning; anything
                // surfacing here is a storage-level surprise.
                warn!(run_id = %run_ctx.run_id, "run invocation failed synchronously: {e}");
            }
        });

        let manager = Arc::clone(self);
        let run_id = run.id.clone();
        tokio::spawn(async move {
            manager.relay_events(&run_id, inner_rx, outer_tx).await;
        });

        Ok((run.id, outer_rx))
    }

    /// Forward run events to the caller, mirroring run-state changes into
    /// the record.  When the stream ends in a non-terminal state the run is
    /// forced to `failed{abnormal_termination}` and the caller still sees a
    /// terminal event.
    async fn relay_events(
        &self,
        run_id: &str,
        mut inner_rx: mpsc::Receiver<EventEnvelope>,
        outer_tx: mpsc::Sender<EventEnvelope>,
    ) {
        let mut saw_terminal = false;
        let mut thread_id = String::new();

        while let Some(envelope) = inner_rx.recv().await {
            thread_id = envelope.thread_id.clone();
            match &envelope.event {
                RunEvent::RunCompleted => {
                    saw_terminal = true;
                    self.mirror(run_id, RunPatch::finished(RunStatus::Completed)).await;
                }
                RunEvent::RunFailed { error } => {
                    saw_terminal = true;
                    self.mirror(
                        run_id,
                        RunPatch::finished(RunStatus::Failed).with_error(error.clone()),
                    )
                    .await;
                }
                RunEvent::StatusChanged { status: RunStatus::Cancelled } => {
                    saw_terminal = true;
                    self.mirror(run_id, RunPatch::finished(RunStatus::Cancelled)).await;
                }
                RunEvent::RunRequiresAction { .. } => {
                    self.mirror(run_id, RunPatch::status(RunStatus::RequiresAction)).await;
                }
                _ => {}
            }
            let _ = outer_tx.send(envelope).await;
        }

        // Paused runs keep their flag? No: the invocation ended; a
        // continuation registers a fresh flag.
        self.active.lock().unwrap().remove(run_id);

        if saw_terminal {
            return;
        }
        let paused = matches!(
            self.runs.get(run_id).await,
            Ok(Some(run)) if run.status == RunStatus::RequiresAction
        );
        if paused {
            return;
        }
        // The stream ended without a terminal event and the run is not
        // legitimately paused: force the record and synthesize the event.
        let error = RunError::new(codes::ABNORMAL_TERMINATION, "run ended without a terminal event");
        self.mirror(
            run_id,
            RunPatch::finished(RunStatus::Failed).with_error(error.clone()),
        )
        .await;
        let _ = outer_tx
            .send(EventEnvelope::now(run_id, &thread_id, RunEvent::RunFailed { error }))
            .await;
    }

    async fn mirror(&self, run_id: &str, patch: RunPatch) {
        if let Err(e) = self.runs.update(run_id, patch).await {
            warn!(run_id, "failed to mirror run state: {e}");
        }
    }
}

enum Invocation {
    Fresh(Vec<NewMessage>),
    Continue(Vec<ToolOutputSubmission>),
}

// ─── Legacy router tool ───────────────────────────────────────────────────────

/// Synthetic tool exposing every toolset through one entry point
/// (`toolsetsRouter` mode).  Execution resolves the named tool in the named
/// set and dispatches to it directly.
pub struct ToolsetRouterTool {
    orchestrator: Arc<dyn ToolsetOrchestrator>,
}

#[async_trait]
impl Tool for ToolsetRouterTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "invokeToolsetTool",
            "Invoke a tool from one of the available toolsets by naming the \
             toolset, the tool, and its parameters.",
        )
        .with_parameter(
            ToolParameter::new("toolSetId", "string", true)
                .with_description("Id of the toolset holding the tool"),
        )
        .with_parameter(
            ToolParameter::new("toolName", "string", true)
                .with_description("Name of the tool within the toolset"),
        )
        .with_parameter(
            ToolParameter::new("toolParameters", "object", false)
                .with_description("Arguments forwarded to the target tool"),
        )
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolResult {
        let Some(set_id) = args.get("toolSetId").and_then(Value::as_str) else {
            return ToolResult::fail("missing required parameter: toolSetId");
        };
        let Some(tool_name) = args.get("toolName").and_then(Value::as_str) else {
            return ToolResult::fail("missing required parameter: toolName");
        };
        let parameters = args
            .get("toolParameters")
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));

        let Some(provider) = self.orchestrator.provider(set_id) else {
            return ToolResult::fail(format!("unknown toolset: {set_id}"))
                .meta("errorName", "ToolNotFoundError");
        };
        let Some(tool) = provider.get_tool(tool_name) else {
            return ToolResult::fail(format!("unknown tool in {set_id}: {tool_name}"))
                .meta("errorName", "ToolNotFoundError");
        };
        tool.execute(parameters, ctx).await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
