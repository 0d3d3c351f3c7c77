//! Tool (function) calling types.
//!
//! Tool definitions and calls use the function-calling layout that most
//! vendors accept directly; adapters for vendors with their own layout
//! convert at the edge.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A function the model may call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema of the arguments
    #[serde(default = "empty_object_schema")]
    pub parameters: Value,
}

/// A tool offered to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type", default = "function_type")]
    pub kind: String,
    pub function: FunctionDefinition,
}

impl ToolDefinition {
    /// Create a function tool with a JSON Schema for its parameters
    pub fn function<S: Into<String>>(name: S, description: Option<String>, parameters: Value) -> Self {
        Self {
            kind: function_type(),
            function: FunctionDefinition {
                name: name.into(),
                description,
                parameters,
            },
        }
    }
}

/// Name and JSON-encoded arguments of a requested call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// Arguments as a JSON document in string form
    #[serde(default)]
    pub arguments: String,
}

/// A tool call requested by the assistant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Vendor call id, echoed back in the tool result
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub kind: String,
    pub function: FunctionCall,
}

impl ToolCall {
    /// Create a function call; `arguments` is the raw JSON string
    pub fn new<I: Into<String>, N: Into<String>>(id: I, name: N, arguments: String) -> Self {
        Self {
            id: id.into(),
            kind: function_type(),
            function: FunctionCall {
                name: name.into(),
                arguments,
            },
        }
    }

    /// Arguments parsed back into JSON; malformed arguments yield an empty object
    pub fn arguments_json(&self) -> Value {
        serde_json::from_str(&self.function.arguments).unwrap_or_else(|_| empty_object_schema())
    }
}

/// Partial tool call carried by a stream delta
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallDelta {
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

/// How the model should pick among offered tools
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    /// `"auto"`, `"none"` or `"required"`
    Mode(String),
    /// Force a particular function
    Function(Value),
}

fn function_type() -> String {
    "function".to_string()
}

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}
