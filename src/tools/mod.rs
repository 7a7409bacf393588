//! Tools the model may call, the typed dependencies they read, and the
//! registry that turns a [`ModelToolCall`] into a recorded [`ToolExecution`].

pub mod calculator;
pub mod haiku;

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::{Map, Value};

use crate::agent::RunContext;
use crate::error::{SchemaError, ToolError};
use crate::llm::{ModelToolCall, ModelToolDefinition};
use crate::sql::Role;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToolOutcome {
    Text(String),
    /// Ends the agent run with this message as the final response.
    Done(String),
}

/// What a tool call produced, as recorded in the conversation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolExecution {
    pub result_text: String,
    pub is_error: bool,
    pub done_message: Option<String>,
}

impl ToolExecution {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            result_text: message.into(),
            is_error: true,
            done_message: None,
        }
    }
}

impl From<Result<ToolOutcome, ToolError>> for ToolExecution {
    fn from(result: Result<ToolOutcome, ToolError>) -> Self {
        match result {
            Ok(ToolOutcome::Text(text)) => Self {
                result_text: text,
                is_error: false,
                done_message: None,
            },
            Ok(ToolOutcome::Done(message)) => Self {
                result_text: format!("Task completed: {message}"),
                is_error: false,
                done_message: Some(message),
            },
            Err(err) => Self::error(err.to_string()),
        }
    }
}

/// Values shared with tool handlers, one per type. Each run works on its own
/// copy that also holds the run's [`RunContext`].
#[derive(Clone, Default)]
pub struct DependencyMap {
    values: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl fmt::Debug for DependencyMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyMap")
            .field("len", &self.values.len())
            .finish()
    }
}

impl DependencyMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value`, replacing any earlier value of the same type.
    pub fn insert<T>(&mut self, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.values.insert(TypeId::of::<T>(), Arc::new(value));
    }

    pub fn with<T>(mut self, value: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        self.insert(value);
        self
    }

    pub fn get<T>(&self) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let value = self.values.get(&TypeId::of::<T>())?.clone();
        Arc::downcast::<T>(value).ok()
    }

    /// Like [`get`](Self::get), failing with [`ToolError::MissingDependency`]
    /// named after the type.
    pub fn require<T>(&self) -> Result<Arc<T>, ToolError>
    where
        T: Send + Sync + 'static,
    {
        self.get::<T>().ok_or_else(|| {
            let name = type_name::<T>();
            ToolError::MissingDependency(name.rsplit("::").next().unwrap_or(name))
        })
    }

    /// Copy of these dependencies scoped to one run.
    pub fn for_run(&self, ctx: &RunContext) -> Self {
        self.clone().with(ctx.clone())
    }

    pub fn run_context(&self) -> Option<Arc<RunContext>> {
        self.get::<RunContext>()
    }

    /// The caller's role; outside an agent run this is the default role.
    pub fn role(&self) -> Role {
        self.run_context().map(|ctx| ctx.role).unwrap_or_default()
    }
}

type ToolHandler = dyn Fn(Value, &DependencyMap) -> BoxFuture<'static, Result<ToolOutcome, ToolError>>
    + Send
    + Sync;

/// The subset of JSON schema checked before a handler runs: `required`
/// fields, primitive `type`s of declared properties, and
/// `additionalProperties: false`.
#[derive(Clone, Debug)]
struct ArgumentSchema {
    raw: Value,
    required: Vec<String>,
    properties: Map<String, Value>,
    closed: bool,
}

impl ArgumentSchema {
    fn permissive() -> Self {
        Self {
            raw: serde_json::json!({"type": "object", "properties": {}}),
            required: Vec::new(),
            properties: Map::new(),
            closed: false,
        }
    }

    fn parse(raw: Value) -> Result<Self, SchemaError> {
        let object = raw.as_object().ok_or(SchemaError::SchemaNotObject)?;
        if object.get("type").and_then(Value::as_str) != Some("object") {
            return Err(SchemaError::RootTypeMustBeObject);
        }

        let required = match object.get("required") {
            None => Vec::new(),
            Some(Value::Array(fields)) => fields
                .iter()
                .map(|field| field.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
                .ok_or(SchemaError::InvalidRequired)?,
            Some(_) => return Err(SchemaError::InvalidRequired),
        };
        let properties = object
            .get("properties")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let closed = object.get("additionalProperties") == Some(&Value::Bool(false));

        Ok(Self {
            raw,
            required,
            properties,
            closed,
        })
    }

    fn check(&self, tool: &str, args: &Value) -> Result<(), ToolError> {
        let invalid = |message: String| ToolError::InvalidArguments {
            tool: tool.to_string(),
            message,
        };

        let args = args
            .as_object()
            .ok_or_else(|| invalid("arguments must be a JSON object".to_string()))?;

        if let Some(field) = self.required.iter().find(|field| !args.contains_key(*field)) {
            return Err(invalid(format!("missing required field: {field}")));
        }

        for (key, value) in args {
            let Some(property) = self.properties.get(key) else {
                if self.closed {
                    return Err(invalid(format!("unknown field: {key}")));
                }
                continue;
            };
            if let Some(expected) = property.get("type").and_then(Value::as_str) {
                if !matches_type(value, expected) {
                    return Err(invalid(format!("field '{key}' must be of type {expected}")));
                }
            }
        }

        Ok(())
    }
}

fn matches_type(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

/// A named, schema-checked async function the model can call.
#[derive(Clone)]
pub struct ToolSpec {
    name: String,
    description: String,
    schema: ArgumentSchema,
    handler: Arc<ToolHandler>,
}

impl fmt::Debug for ToolSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolSpec")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema: ArgumentSchema::permissive(),
            handler: Arc::new(|_args, _deps| {
                Box::pin(async {
                    Err(ToolError::Execution("tool handler not configured".to_string()))
                })
            }),
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Result<Self, SchemaError> {
        self.schema = ArgumentSchema::parse(schema)?;
        Ok(self)
    }

    pub fn with_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Value, &DependencyMap) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolOutcome, ToolError>> + Send + 'static,
    {
        self.handler = Arc::new(move |args, deps| Box::pin(handler(args, deps)));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn json_schema(&self) -> &Value {
        &self.schema.raw
    }

    pub fn definition(&self) -> ModelToolDefinition {
        ModelToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.schema.raw.clone(),
        }
    }

    pub async fn execute(
        &self,
        args: Value,
        dependencies: &DependencyMap,
    ) -> Result<ToolOutcome, ToolError> {
        self.schema.check(&self.name, &args)?;
        (self.handler)(args, dependencies).await
    }
}

/// Tools registered with an agent, in registration order.
#[derive(Clone, Debug, Default)]
pub struct ToolRegistry {
    tools: Vec<ToolSpec>,
}

impl ToolRegistry {
    /// Adds `tool`; returns it back if the name is already taken.
    pub fn register(&mut self, tool: ToolSpec) -> Result<(), ToolSpec> {
        if self.contains(tool.name()) {
            return Err(tool);
        }
        self.tools.push(tool);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.iter().find(|tool| tool.name() == name)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn definitions(&self) -> Vec<ModelToolDefinition> {
        self.tools.iter().map(ToolSpec::definition).collect()
    }

    /// Runs `call`. Every failure, an unknown tool included, becomes an error
    /// execution for the model to read.
    pub async fn execute(&self, call: &ModelToolCall, dependencies: &DependencyMap) -> ToolExecution {
        let result = match self.get(&call.name) {
            Some(tool) => tool.execute(call.arguments.clone(), dependencies).await,
            None => Err(ToolError::NotFound {
                name: call.name.clone(),
                available: self
                    .tools
                    .iter()
                    .map(ToolSpec::name)
                    .collect::<Vec<_>>()
                    .join(", "),
            }),
        };

        let execution = ToolExecution::from(result);
        if execution.is_error {
            tracing::warn!(tool = %call.name, error = %execution.result_text, "tool call failed");
        }
        execution
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn query_tool() -> ToolSpec {
        ToolSpec::new("execute_query", "run sql")
            .with_schema(json!({
                "type": "object",
                "properties": {"query": {"type": "string"}},
                "required": ["query"],
                "additionalProperties": false
            }))
            .expect("schema valid")
            .with_handler(|args, deps| {
                let role = deps.role();
                async move {
                    let query = args["query"].as_str().unwrap_or_default();
                    Ok(ToolOutcome::Text(format!("{role}: {query}")))
                }
            })
    }

    #[test]
    fn schemas_are_checked_when_the_tool_is_built() {
        let result = ToolSpec::new("bad", "bad").with_schema(json!({"type": "string"}));
        assert!(matches!(result, Err(SchemaError::RootTypeMustBeObject)));

        let result = ToolSpec::new("bad", "bad")
            .with_schema(json!({"type": "object", "required": ["a", 1]}));
        assert!(matches!(result, Err(SchemaError::InvalidRequired)));
    }

    #[tokio::test]
    async fn arguments_are_checked_before_the_handler_runs() {
        let tool = query_tool();
        let deps = DependencyMap::new();

        let missing = tool.execute(json!({}), &deps).await.expect_err("missing");
        assert!(missing.to_string().contains("missing required field: query"));

        let mistyped = tool.execute(json!({"query": 5}), &deps).await.expect_err("mistyped");
        assert!(mistyped.to_string().contains("must be of type string"));

        let unknown = tool
            .execute(json!({"query": "SELECT 1", "limit": 5}), &deps)
            .await
            .expect_err("unknown field");
        assert!(unknown.to_string().contains("unknown field: limit"));
    }

    #[tokio::test]
    async fn run_scoped_dependencies_carry_the_callers_role() {
        let base = DependencyMap::new().with("shared".to_string());
        let ctx = RunContext::new("t-1").with_role(Role::Restricted);

        let scoped = base.for_run(&ctx);

        assert_eq!(scoped.role(), Role::Restricted);
        assert_eq!(base.role(), Role::Privileged);
        assert!(base.run_context().is_none());
        assert_eq!(scoped.get::<String>().as_deref().map(String::as_str), Some("shared"));

        let err = base.require::<RunContext>().expect_err("not scoped");
        assert!(matches!(err, ToolError::MissingDependency("RunContext")));
    }

    #[tokio::test]
    async fn registry_reports_unknown_tools_as_errors() {
        let mut registry = ToolRegistry::default();
        registry.register(query_tool()).expect("first registration");
        assert!(registry.register(query_tool()).is_err());

        let call = ModelToolCall {
            id: "call_1".to_string(),
            name: "drop_tables".to_string(),
            arguments: json!({}),
        };
        let execution = registry.execute(&call, &DependencyMap::new()).await;
        assert!(execution.is_error);
        assert_eq!(
            execution.result_text,
            "drop_tables is not a valid tool, try one of [execute_query]."
        );

        let call = ModelToolCall {
            name: "execute_query".to_string(),
            arguments: json!({"query": "SELECT 1"}),
            ..call
        };
        let ctx = RunContext::new("t-1").with_role(Role::Restricted);
        let execution = registry.execute(&call, &DependencyMap::new().for_run(&ctx)).await;
        assert_eq!(execution.result_text, "restricted: SELECT 1");
    }

    #[test]
    fn execution_maps_outcomes_and_errors() {
        let done = ToolExecution::from(Ok::<_, ToolError>(ToolOutcome::Done("finished".to_string())));
        assert_eq!(done.done_message.as_deref(), Some("finished"));
        assert_eq!(done.result_text, "Task completed: finished");

        let failed = ToolExecution::from(Err::<ToolOutcome, _>(ToolError::Execution("boom".to_string())));
        assert!(failed.is_error);
        assert_eq!(failed.result_text, "tool execution failed: boom");
    }
}
