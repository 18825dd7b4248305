use std::collections::HashMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use stagewise_core::domain::routing::RequestClassification;
use stagewise_core::domain::tool::{ToolCall, ToolCatalog, ToolSpec};
use stagewise_core::pipeline::{OrchestratorInput, ToolExecutionResult};

/// Run context handed to the executor alongside a sanitized call.
#[derive(Clone, Copy, Debug)]
pub struct ToolContext<'a> {
    pub input: &'a OrchestratorInput,
    pub classification: &'a RequestClassification,
    pub pipeline_id: &'a str,
    pub task_id: &'a str,
    pub step_id: &'a str,
}

/// Boundary to the business tools. `Err` is reserved for faults the pipeline
/// cannot explain to the user; a tool that ran and failed returns
/// `success: false`.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    fn catalog(&self) -> &ToolCatalog;

    async fn execute(
        &self,
        call: &ToolCall,
        context: &ToolContext<'_>,
    ) -> Result<ToolExecutionResult>;
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;

    async fn execute(
        &self,
        call: &ToolCall,
        context: &ToolContext<'_>,
    ) -> Result<ToolExecutionResult>;
}

/// Executor backed by in-process [`Tool`] handlers. The catalog is exactly the
/// set of registered specs.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
    catalog: ToolCatalog,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T>(&mut self, tool: T)
    where
        T: Tool + 'static,
    {
        let spec = tool.spec();
        self.tools.insert(spec.name.clone(), Box::new(tool));
        self.catalog.insert(spec);
    }

    pub fn with_tool<T>(mut self, tool: T) -> Self
    where
        T: Tool + 'static,
    {
        self.register(tool);
        self
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    async fn execute(
        &self,
        call: &ToolCall,
        context: &ToolContext<'_>,
    ) -> Result<ToolExecutionResult> {
        let tool = self
            .tools
            .get(&call.name)
            .ok_or_else(|| anyhow!("tool `{}` is not registered", call.name))?;
        tool.execute(call, context).await
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::json;
    use stagewise_core::domain::routing::{RequestClassification, RiskLevel};
    use stagewise_core::domain::tool::{ToolCall, ToolSpec};
    use stagewise_core::pipeline::{OrchestratorInput, ToolExecutionResult};

    use super::{Tool, ToolContext, ToolExecutor, ToolRegistry};

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "echo".to_string(),
                description: "Echo arguments".to_string(),
                properties: Default::default(),
                required: Vec::new(),
                domains: Vec::new(),
                channels: Vec::new(),
                risk_level: RiskLevel::Low,
                requires_approval: false,
                policy: Default::default(),
            }
        }

        async fn execute(
            &self,
            call: &ToolCall,
            context: &ToolContext<'_>,
        ) -> Result<ToolExecutionResult> {
            Ok(ToolExecutionResult::succeeded(json!({
                "args": call.arguments,
                "step": context.step_id,
            })))
        }
    }

    #[tokio::test]
    async fn registry_dispatches_by_name_and_rejects_unknown_tools() {
        let registry = ToolRegistry::new().with_tool(EchoTool).with_tool(EchoTool);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.catalog().names(), vec!["echo"]);

        let input = OrchestratorInput::new("hi", "user-1", "trace-1");
        let classification = RequestClassification::bootstrap();
        let context = ToolContext {
            input: &input,
            classification: &classification,
            pipeline_id: "pipeline_1_user-1",
            task_id: "task_1",
            step_id: "task_1_step_1",
        };

        let result = registry
            .execute(&ToolCall::new("echo", Default::default()), &context)
            .await
            .expect("echo runs");
        assert!(result.success);
        assert_eq!(result.result, Some(json!({"args": {}, "step": "task_1_step_1"})));

        assert!(registry
            .execute(&ToolCall::new("missing", Default::default()), &context)
            .await
            .is_err());
    }
}
