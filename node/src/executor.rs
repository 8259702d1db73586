//! Task execution shared by the direct intake server and the relay
//! uplink. The LLM provider and the agent tools are external
//! collaborators injected through traits; the executor only enforces the
//! task contract: kinds, token ceilings and the agent iteration cap.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use log::info;
use serde_json::Value;
use thiserror::Error;

pub const TASK_KIND_ECHO: &str = "echo";
pub const TASK_KIND_CHAT: &str = "llm.chat";
pub const TASK_KIND_AGENT: &str = "agent";

/// Hard ceiling on a single completion, applied on top of the operator's
/// configured maximum.
pub const MAX_CHAT_TOKENS: u32 = 2048;

/// Returned as a successful result when the agent loop hits its cap
/// without producing a terminal message.
pub const ITERATION_LIMIT_MESSAGE: &str =
    "the task could not be completed within the iteration limit";

/// Tools a public node may ever expose to remote agent tasks. Anything
/// outside this list is dropped at construction, regardless of config.
pub const AGENT_TOOL_ALLOWLIST: [&str; 2] = ["web_search", "web_fetch"];

const AGENT_SYSTEM_PROMPT: &str = "You are a helpful remote agent. Solve the user's request. \
     You MAY use the available tools if needed. Keep the answer concise and directly usable.";

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("unsupported kind: {0}")]
    UnsupportedKind(String),
    #[error("this node does not allow agent tasks")]
    AgentTasksDisabled,
    #[error("no chat provider configured")]
    NoProvider,
    #[error("provider error: {0}")]
    Provider(String),
}

#[derive(Clone, Debug)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    pub tool_call_id: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain("user", content)
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
            tool_call_id: None,
            tool_calls,
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            tool_calls: Vec::new(),
        }
    }

    fn plain(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Clone, Debug)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Clone, Debug)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Clone, Debug, Default)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

/// Single-turn (and tool-turn) completion backend. Implementations wrap
/// whatever LLM API the operator uses.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> anyhow::Result<ChatResponse>;
}

/// One tool callable from remote agent tasks.
#[async_trait]
pub trait AgentTool: Send + Sync {
    fn spec(&self) -> ToolSpec;
    async fn execute(&self, arguments: &Value) -> anyhow::Result<String>;
}

#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    pub allow_agent_tasks: bool,
    pub max_tokens: u32,
    pub agent_max_iterations: u32,
    pub temperature: f32,
    /// Operator subset of [`AGENT_TOOL_ALLOWLIST`].
    pub tool_allowlist: Vec<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            allow_agent_tasks: false,
            max_tokens: 1024,
            agent_max_iterations: 8,
            temperature: 0.7,
            tool_allowlist: AGENT_TOOL_ALLOWLIST.iter().map(|s| s.to_string()).collect(),
        }
    }
}

pub struct TaskExecutor {
    cfg: ExecutorConfig,
    provider: Option<Arc<dyn ChatProvider>>,
    tools: Vec<Arc<dyn AgentTool>>,
}

impl TaskExecutor {
    pub fn new(
        cfg: ExecutorConfig,
        provider: Option<Arc<dyn ChatProvider>>,
        tools: Vec<Arc<dyn AgentTool>>,
    ) -> Self {
        // web-only tool surface: the hard allowlist always applies
        let tools = tools
            .into_iter()
            .filter(|tool| {
                let name = tool.spec().name;
                AGENT_TOOL_ALLOWLIST.contains(&name.as_str())
                    && cfg.tool_allowlist.iter().any(|allowed| *allowed == name)
            })
            .collect();
        Self {
            cfg,
            provider,
            tools,
        }
    }

    pub fn supported_kinds(&self) -> [&'static str; 3] {
        [TASK_KIND_ECHO, TASK_KIND_CHAT, TASK_KIND_AGENT]
    }

    pub async fn run(&self, kind: &str, prompt: &str) -> Result<String, ExecutorError> {
        match kind {
            TASK_KIND_ECHO => Ok(prompt.to_string()),
            TASK_KIND_CHAT => self.run_chat(prompt).await,
            TASK_KIND_AGENT => self.run_agent(prompt).await,
            other => Err(ExecutorError::UnsupportedKind(other.to_string())),
        }
    }

    fn provider(&self) -> Result<&Arc<dyn ChatProvider>, ExecutorError> {
        self.provider.as_ref().ok_or(ExecutorError::NoProvider)
    }

    fn max_tokens(&self) -> u32 {
        self.cfg.max_tokens.min(MAX_CHAT_TOKENS).max(1)
    }

    async fn run_chat(&self, prompt: &str) -> Result<String, ExecutorError> {
        let provider = self.provider()?;
        let response = provider
            .chat(ChatRequest {
                messages: vec![ChatMessage::user(prompt)],
                tools: Vec::new(),
                max_tokens: self.max_tokens(),
                temperature: self.cfg.temperature,
            })
            .await
            .map_err(|e| ExecutorError::Provider(e.to_string()))?;
        Ok(response.content)
    }

    /// Bounded tool loop. On reaching the iteration cap without a
    /// terminal message the documented exhaustion string is returned as a
    /// normal result, not an error.
    async fn run_agent(&self, prompt: &str) -> Result<String, ExecutorError> {
        if !self.cfg.allow_agent_tasks {
            return Err(ExecutorError::AgentTasksDisabled);
        }
        let provider = self.provider()?;

        let specs: Vec<ToolSpec> = self.tools.iter().map(|t| t.spec()).collect();
        let mut messages = vec![
            ChatMessage::system(AGENT_SYSTEM_PROMPT),
            ChatMessage::user(prompt),
        ];

        for _ in 0..self.cfg.agent_max_iterations {
            let response = provider
                .chat(ChatRequest {
                    messages: messages.clone(),
                    tools: specs.clone(),
                    max_tokens: self.max_tokens(),
                    temperature: self.cfg.temperature,
                })
                .await
                .map_err(|e| ExecutorError::Provider(e.to_string()))?;

            if response.tool_calls.is_empty() {
                return Ok(response.content);
            }

            messages.push(ChatMessage::assistant(
                response.content.clone(),
                response.tool_calls.clone(),
            ));
            for call in &response.tool_calls {
                let result = self.execute_tool(call).await;
                info!("agent tool call: {}", call.name);
                messages.push(ChatMessage::tool(call.id.clone(), result));
            }
            messages.push(ChatMessage::user(
                "Continue with the task using the tool results.",
            ));
        }

        Ok(ITERATION_LIMIT_MESSAGE.to_string())
    }

    async fn execute_tool(&self, call: &ToolCall) -> String {
        let Some(tool) = self
            .tools
            .iter()
            .find(|tool| tool.spec().name == call.name)
        else {
            return format!("tool not available: {}", call.name);
        };
        match tool.execute(&call.arguments).await {
            Ok(result) => result,
            Err(e) => format!("tool failed: {}", e),
        }
    }
}

/// Scripted provider for tests and dry runs: pops one canned response per
/// chat call and records the requests it saw.
pub struct ScriptedProvider {
    responses: std::sync::Mutex<VecDeque<ChatResponse>>,
    requests: std::sync::Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<ChatResponse>) -> Self {
        Self {
            responses: std::sync::Mutex::new(responses.into()),
            requests: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn seen_requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().expect("lock").clone()
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    async fn chat(&self, request: ChatRequest) -> anyhow::Result<ChatResponse> {
        self.requests.lock().expect("lock").push(request);
        self.responses
            .lock()
            .expect("lock")
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("no scripted response left"))
    }
}
