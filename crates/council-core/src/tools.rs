//! Parallel, validated, bounded external side-effect execution invoked by
//! council members.
//!
//! The `function` adapter registry follows the same handler-as-`Arc<dyn Fn>`
//! shape as `dashflow-testing::MockTool`; the `http` adapter uses `reqwest`
//! the way the provider adapters do for outbound calls.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

use crate::error::ToolError;
use crate::types::{ParamType, ToolAdapterKind, ToolCall, ToolDefinition, ToolResult};

/// Default per-call timeout for tool execution, per §4.6.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

type FunctionHandler =
    Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send>> + Send + Sync>;

/// Where a `tool_usage` row gets appended; failures here must not fail the call (§4.6).
pub trait ToolUsageLog: Send + Sync {
    fn record(&self, request_id: &str, member_id: &str, tool_name: &str, result: &ToolResult);
}

/// A log that drops every row, used when no persistence is configured.
#[derive(Default)]
pub struct NullToolUsageLog;

impl ToolUsageLog for NullToolUsageLog {
    fn record(&self, _request_id: &str, _member_id: &str, _tool_name: &str, _result: &ToolResult) {}
}

/// An in-memory log suitable for tests and for the in-process default.
#[derive(Default)]
pub struct InMemoryToolUsageLog {
    rows: Mutex<Vec<(String, String, String, ToolResult)>>,
}

impl InMemoryToolUsageLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn rows(&self) -> Vec<(String, String, String, ToolResult)> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl ToolUsageLog for InMemoryToolUsageLog {
    fn record(&self, request_id: &str, member_id: &str, tool_name: &str, result: &ToolResult) {
        self.rows.lock().unwrap_or_else(|e| e.into_inner()).push((
            request_id.to_string(),
            member_id.to_string(),
            tool_name.to_string(),
            result.clone(),
        ));
    }
}

/// Registry + execution pipeline for tools callable by council members.
pub struct ToolEngine {
    definitions: Mutex<HashMap<String, ToolDefinition>>,
    handlers: Mutex<HashMap<String, FunctionHandler>>,
    http_client: reqwest::Client,
    usage_log: Arc<dyn ToolUsageLog>,
    timeout: Duration,
}

impl ToolEngine {
    #[must_use]
    pub fn new(usage_log: Arc<dyn ToolUsageLog>) -> Self {
        Self {
            definitions: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            http_client: reqwest::Client::new(),
            usage_log,
            timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replace any prior definition with the same name.
    pub fn register_tool(&self, def: ToolDefinition) {
        self.definitions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(def.name.clone(), def);
    }

    /// Register the in-process handler backing a `Function`-adapter tool.
    pub fn register_function_handler<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        let name = name.into();
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name, Arc::new(move |params| Box::pin(handler(params))));
    }

    #[must_use]
    pub fn get_available_tools(&self) -> Vec<ToolDefinition> {
        self.definitions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    fn validate(&self, def: &ToolDefinition, params: &Value) -> Result<(), ToolError> {
        let obj = params.as_object();
        for param in &def.parameters {
            let value = obj.and_then(|o| o.get(&param.name));
            match value {
                None => {
                    if param.required && param.default.is_none() {
                        return Err(ToolError::MissingParameter {
                            tool: def.name.clone(),
                            param: param.name.clone(),
                        });
                    }
                }
                Some(v) => {
                    if !param.param_type.matches(v) {
                        return Err(ToolError::TypeMismatch {
                            tool: def.name.clone(),
                            param: param.name.clone(),
                            expected: format!("{:?}", param.param_type),
                            actual: ParamType::describe(v).to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    async fn invoke_adapter(&self, def: &ToolDefinition, params: Value) -> Result<Value, ToolError> {
        match def.adapter {
            ToolAdapterKind::Function => {
                let handler = self
                    .handlers
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .get(&def.name)
                    .cloned()
                    .ok_or_else(|| ToolError::NotFound { name: def.name.clone() })?;
                handler(params).await
            }
            ToolAdapterKind::Http => {
                let endpoint = def.endpoint.as_deref().ok_or_else(|| ToolError::ExecutionFailed {
                    tool: def.name.clone(),
                    message: "http adapter requires an endpoint".to_string(),
                })?;
                let response = self
                    .http_client
                    .post(endpoint)
                    .json(&params)
                    .send()
                    .await
                    .map_err(|e| ToolError::ExecutionFailed {
                        tool: def.name.clone(),
                        message: e.to_string(),
                    })?;
                if !response.status().is_success() {
                    return Err(ToolError::ExecutionFailed {
                        tool: def.name.clone(),
                        message: format!("http status {}", response.status()),
                    });
                }
                response.json().await.map_err(|e| ToolError::ExecutionFailed {
                    tool: def.name.clone(),
                    message: e.to_string(),
                })
            }
        }
    }

    /// `lookup -> validate -> execute (with adapter) -> persist -> return`.
    pub async fn execute_tool(&self, call: &ToolCall) -> ToolResult {
        let start = std::time::Instant::now();
        let def = self
            .definitions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&call.tool_name)
            .cloned();

        let Some(def) = def else {
            let result = ToolResult {
                tool_name: call.tool_name.clone(),
                success: false,
                output: None,
                error: Some(format!("no tool registered with name {}", call.tool_name)),
                latency: start.elapsed(),
            };
            self.persist(call, &result);
            return result;
        };

        if let Err(e) = self.validate(&def, &call.params) {
            let result = ToolResult {
                tool_name: call.tool_name.clone(),
                success: false,
                output: None,
                error: Some(e.to_string()),
                latency: start.elapsed(),
            };
            self.persist(call, &result);
            return result;
        }

        let result = match tokio::time::timeout(self.timeout, self.invoke_adapter(&def, call.params.clone())).await {
            Ok(Ok(output)) => ToolResult {
                tool_name: call.tool_name.clone(),
                success: true,
                output: Some(output),
                error: None,
                latency: start.elapsed(),
            },
            Ok(Err(e)) => ToolResult {
                tool_name: call.tool_name.clone(),
                success: false,
                output: None,
                error: Some(e.to_string()),
                latency: start.elapsed(),
            },
            Err(_) => ToolResult {
                tool_name: call.tool_name.clone(),
                success: false,
                output: None,
                error: Some(format!("tool {} timeout", call.tool_name)),
                latency: start.elapsed(),
            },
        };
        self.persist(call, &result);
        result
    }

    /// Executes all calls concurrently; result order matches input order;
    /// one call's failure does not cancel others.
    pub async fn execute_parallel(&self, calls: Vec<ToolCall>) -> Vec<ToolResult> {
        if calls.is_empty() {
            return Vec::new();
        }
        let futures = calls.iter().map(|call| self.execute_tool(call));
        futures::future::join_all(futures).await
    }

    fn persist(&self, call: &ToolCall, result: &ToolResult) {
        self.usage_log.record(&call.request_id, &call.member_id, &call.tool_name, result);
    }
}
