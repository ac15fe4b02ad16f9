//! Tool trait: the abstraction over callables the model may invoke.
//!
//! A tool pairs a uniform "invoke with named arguments, return text"
//! interface with a schema descriptor the model is shown in its preamble.
//! Tools are collected once into an immutable [`ToolRegistry`] through
//! [`ToolRegistry::builder`].

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::{Error, ToolError};

/// JSON type of a tool parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
        }
    }
}

/// One typed, named parameter of a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    pub param_type: ParamType,
    pub description: String,
    pub required: bool,
}

impl ToolParameter {
    pub fn required(name: impl Into<String>, param_type: ParamType, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            param_type,
            description: description.into(),
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, param_type: ParamType, description: impl Into<String>) -> Self {
        Self {
            required: false,
            ..Self::required(name, param_type, description)
        }
    }
}

/// Name, description and ordered parameters of a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ToolParameter>,
}

impl ToolSchema {
    /// Function-calling JSON schema for this tool.
    ///
    /// The `required` list keeps declaration order.
    pub fn to_json(&self) -> Value {
        let mut properties = Map::new();
        for param in &self.parameters {
            properties.insert(
                param.name.clone(),
                json!({
                    "type": param.param_type.as_str(),
                    "description": param.description,
                }),
            );
        }
        let required: Vec<&str> = self
            .parameters
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();

        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": {
                    "type": "object",
                    "properties": properties,
                    "required": required,
                }
            }
        })
    }
}

/// The argument bag of a tool call: string keys, dynamically typed values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolArguments(Map<String, Value>);

impl ToolArguments {
    pub fn new(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Accepts a JSON object, or `null` for an empty bag.
    pub fn from_value(value: Value) -> Result<Self, ToolError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            Value::Null => Ok(Self::default()),
            other => Err(ToolError::InvalidArguments(format!(
                "expected an object, got {other}"
            ))),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn require(&self, key: &str) -> Result<&Value, ToolError> {
        self.0
            .get(key)
            .ok_or_else(|| ToolError::InvalidArguments(format!("missing argument '{key}'")))
    }

    /// Integer argument. Whole-valued floats such as `2.0` are accepted.
    pub fn i64(&self, key: &str) -> Result<i64, ToolError> {
        let value = self.require(key)?;
        if let Some(n) = value.as_i64() {
            return Ok(n);
        }
        match value.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Ok(f as i64),
            _ => Err(type_mismatch(key, "an integer", value)),
        }
    }

    pub fn f64(&self, key: &str) -> Result<f64, ToolError> {
        let value = self.require(key)?;
        value.as_f64().ok_or_else(|| type_mismatch(key, "a number", value))
    }

    pub fn str(&self, key: &str) -> Result<&str, ToolError> {
        let value = self.require(key)?;
        value.as_str().ok_or_else(|| type_mismatch(key, "a string", value))
    }

    pub fn bool(&self, key: &str) -> Result<bool, ToolError> {
        let value = self.require(key)?;
        value.as_bool().ok_or_else(|| type_mismatch(key, "a boolean", value))
    }

    pub fn opt_str(&self, key: &str) -> Result<Option<&str>, ToolError> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.str(key).map(Some),
        }
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

fn type_mismatch(key: &str, expected: &str, got: &Value) -> ToolError {
    ToolError::InvalidArguments(format!("argument '{key}' must be {expected}, got {got}"))
}

/// A request to execute a tool, parsed from one envelope in model output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: i64,
    pub name: String,
    pub arguments: ToolArguments,
}

/// The core Tool trait.
///
/// Implementations return plain text; failures are reported back to the
/// model as an error envelope rather than ending the session.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g. "calculator").
    fn name(&self) -> &str;

    /// What this tool does, shown to the model.
    fn description(&self) -> &str;

    /// Ordered parameters.
    fn parameters(&self) -> Vec<ToolParameter>;

    async fn execute(&self, arguments: ToolArguments) -> Result<String, ToolError>;

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}

type ToolFuture = Pin<Box<dyn Future<Output = Result<String, ToolError>> + Send>>;
type BoxedHandler = Arc<dyn Fn(ToolArguments) -> ToolFuture + Send + Sync>;

/// A tool built from an async closure plus an explicit schema.
///
/// ```ignore
/// let sum = FunctionTool::new("sum", "Add two integers", |args| async move {
///     Ok((args.i64("a")? + args.i64("b")?).to_string())
/// })
/// .param("a", ParamType::Integer, "first addend")
/// .param("b", ParamType::Integer, "second addend");
/// ```
#[derive(Clone)]
pub struct FunctionTool {
    name: String,
    description: String,
    parameters: Vec<ToolParameter>,
    handler: BoxedHandler,
}

impl FunctionTool {
    pub fn new<F, Fut>(name: impl Into<String>, description: impl Into<String>, handler: F) -> Self
    where
        F: Fn(ToolArguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, ToolError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
            handler: Arc::new(move |args| -> ToolFuture { Box::pin(handler(args)) }),
        }
    }

    pub fn param(mut self, name: impl Into<String>, param_type: ParamType, description: impl Into<String>) -> Self {
        self.parameters
            .push(ToolParameter::required(name, param_type, description));
        self
    }

    pub fn optional_param(
        mut self,
        name: impl Into<String>,
        param_type: ParamType,
        description: impl Into<String>,
    ) -> Self {
        self.parameters
            .push(ToolParameter::optional(name, param_type, description));
        self
    }
}

impl std::fmt::Debug for FunctionTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionTool")
            .field("name", &self.name)
            .field("parameters", &self.parameters)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Tool for FunctionTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Vec<ToolParameter> {
        self.parameters.clone()
    }

    async fn execute(&self, arguments: ToolArguments) -> Result<String, ToolError> {
        (self.handler)(arguments).await
    }
}

/// An immutable set of tools keyed by unique name.
///
/// Schemas are listed in registration order.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder::default()
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| tool.schema())
            .collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.order.iter().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Execute a tool call.
    pub async fn execute(&self, call: &ToolCall) -> Result<String, ToolError> {
        let tool = self
            .tools
            .get(&call.name)
            .ok_or_else(|| ToolError::NotFound(call.name.clone()))?;
        tracing::debug!(tool = %call.name, id = call.id, "executing tool");
        tool.execute(call.arguments.clone()).await
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry").field("tools", &self.order).finish()
    }
}

#[derive(Default)]
pub struct ToolRegistryBuilder {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistryBuilder {
    pub fn tool(mut self, tool: impl Tool + 'static) -> Self {
        self.tools.push(Arc::new(tool));
        self
    }

    pub fn shared(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    /// Fails on duplicate tool names.
    pub fn build(self) -> Result<ToolRegistry, Error> {
        let mut registry = ToolRegistry::default();
        for tool in self.tools {
            let name = tool.name().to_string();
            if registry.tools.contains_key(&name) {
                return Err(Error::config(format!("duplicate tool name '{name}'")));
            }
            registry.order.push(name.clone());
            registry.tools.insert(name, tool);
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A simple test tool for unit tests.
    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echoes back the input"
        }
        fn parameters(&self) -> Vec<ToolParameter> {
            vec![ToolParameter::required("text", ParamType::String, "text to echo")]
        }
        async fn execute(&self, arguments: ToolArguments) -> Result<String, ToolError> {
            Ok(arguments.str("text")?.to_string())
        }
    }

    fn args(value: Value) -> ToolArguments {
        ToolArguments::from_value(value).unwrap()
    }

    #[test]
    fn registry_register_and_lookup() {
        let registry = ToolRegistry::builder().tool(EchoTool).build().unwrap();
        assert!(registry.get("echo").is_some());
        assert!(registry.get("nonexistent").is_none());
        assert_eq!(registry.names(), vec!["echo"]);
    }

    #[test]
    fn registry_rejects_duplicate_names() {
        let err = ToolRegistry::builder()
            .tool(EchoTool)
            .tool(EchoTool)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("duplicate tool name 'echo'"));
    }

    #[test]
    fn schemas_keep_registration_order() {
        let noop = FunctionTool::new("noop", "Does nothing", |_| async { Ok(String::new()) });
        let registry = ToolRegistry::builder()
            .tool(noop)
            .tool(EchoTool)
            .build()
            .unwrap();
        let names: Vec<String> = registry.schemas().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["noop", "echo"]);
    }

    #[test]
    fn schema_json_lists_required_params_in_order() {
        let tool = FunctionTool::new("sum", "Add two integers", |_| async { Ok(String::new()) })
            .param("a", ParamType::Integer, "first")
            .optional_param("note", ParamType::String, "ignored")
            .param("b", ParamType::Integer, "second");
        let schema = tool.schema().to_json();
        assert_eq!(schema["function"]["name"], "sum");
        assert_eq!(schema["function"]["parameters"]["properties"]["a"]["type"], "integer");
        assert_eq!(schema["function"]["parameters"]["required"], json!(["a", "b"]));
    }

    #[tokio::test]
    async fn registry_execute_tool() {
        let registry = ToolRegistry::builder().tool(EchoTool).build().unwrap();
        let call = ToolCall {
            id: 1,
            name: "echo".into(),
            arguments: args(json!({"text": "hello world"})),
        };
        assert_eq!(registry.execute(&call).await.unwrap(), "hello world");
    }

    #[tokio::test]
    async fn registry_execute_missing_tool() {
        let registry = ToolRegistry::empty();
        let call = ToolCall {
            id: 1,
            name: "nonexistent".into(),
            arguments: ToolArguments::default(),
        };
        let err = registry.execute(&call).await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound(_)));
    }

    #[tokio::test]
    async fn function_tool_runs_closure() {
        let sum = FunctionTool::new("sum", "Add two integers", |args| async move {
            Ok((args.i64("a")? + args.i64("b")?).to_string())
        });
        let out = sum.execute(args(json!({"a": 1, "b": 2}))).await.unwrap();
        assert_eq!(out, "3");
    }

    #[test]
    fn arguments_report_type_mismatches() {
        let bag = args(json!({"a": "one", "b": 2.0, "flag": true}));
        assert!(matches!(bag.i64("a"), Err(ToolError::InvalidArguments(_))));
        assert_eq!(bag.i64("b").unwrap(), 2);
        assert!(bag.bool("flag").unwrap());
        assert!(bag.str("missing").unwrap_err().to_string().contains("missing argument"));
        assert_eq!(bag.opt_str("missing").unwrap(), None);
    }

    #[test]
    fn arguments_reject_non_objects() {
        assert!(ToolArguments::from_value(json!([1, 2])).is_err());
        assert!(ToolArguments::from_value(Value::Null).unwrap().is_empty());
    }
}
