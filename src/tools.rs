//! Tool definitions advertised to the model
//!
//! A [`ToolDefinition`] is pure data: a name, a description and a JSON Schema
//! for the arguments. Executing the tool is the host's business; the relay
//! only announces tools, resolves the calls the model makes and carries the
//! results back.
//!
//! # Schema shorthand
//!
//! Schemas may be written in full JSON Schema or in a compact form that is
//! normalized on construction:
//!
//! ```rust
//! use llm_relay::tool;
//! use serde_json::json;
//!
//! // Simple type notation: every parameter is required
//! let lookup = tool("lookup", "Fetch a receipt by id")
//!     .param("id", "integer")
//!     .build();
//!
//! // Extended notation with optional parameters
//! let search = tool("search", "Search products")
//!     .schema(json!({
//!         "query": "string",
//!         "limit": {"type": "integer", "optional": true}
//!     }))
//!     .build();
//!
//! assert_eq!(lookup.parameters()["required"], json!(["id"]));
//! assert_eq!(search.parameters()["required"], json!(["query"]));
//! ```
//!
//! Each backend wants the definition in its own envelope; the `to_*` methods
//! produce them.

use serde_json::{Value, json};

/// A tool the model may call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    name: String,
    description: String,
    parameters: Value,
}

impl ToolDefinition {
    /// Create a definition; `parameters` is normalized to a full object schema.
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: normalize_schema(parameters),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn parameters(&self) -> &Value {
        &self.parameters
    }

    /// Names of the declared argument properties.
    pub fn property_names(&self) -> Vec<&str> {
        self.parameters
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| props.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Names listed in the schema's `required` array.
    pub fn required_properties(&self) -> Vec<&str> {
        self.parameters
            .get("required")
            .and_then(Value::as_array)
            .map(|req| req.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    /// OpenAI chat-completions envelope (also accepted by Ollama).
    pub fn to_openai_format(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters
            }
        })
    }

    /// Responses-API envelope: flat, with `type` beside the name.
    pub fn to_responses_format(&self) -> Value {
        json!({
            "type": "function",
            "name": self.name,
            "description": self.description,
            "parameters": self.parameters
        })
    }

    /// YandexGPT completion envelope.
    pub fn to_yandex_format(&self) -> Value {
        json!({
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters
            }
        })
    }

    /// GigaChat `functions` entry.
    pub fn to_gigachat_format(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "parameters": self.parameters
        })
    }
}

/// Find a definition by name.
pub fn find_tool<'a>(tools: &'a [ToolDefinition], name: &str) -> Option<&'a ToolDefinition> {
    tools.iter().find(|t| t.name == name)
}

/// Expand shorthand schemas into a full JSON Schema object.
///
/// A value that already has `type` and `properties` passes through unchanged.
/// Otherwise each entry is either a type string (`"string"`, `"int"`, ...),
/// which is required, or a property schema that may carry non-standard
/// `optional`/`required` booleans. Properties with a `default` are optional.
fn normalize_schema(schema: Value) -> Value {
    let Some(obj) = schema.as_object() else {
        return json!({"type": "object", "properties": {}, "required": []});
    };
    if obj.contains_key("type") && obj.contains_key("properties") {
        return schema;
    }

    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();

    for (param_name, param_type) in obj {
        if let Some(type_str) = param_type.as_str() {
            properties.insert(param_name.clone(), type_to_json_schema(type_str));
            required.push(param_name.clone());
        } else if let Some(prop_obj) = param_type.as_object() {
            let mut prop_obj = prop_obj.clone();
            let is_optional = prop_obj
                .remove("optional")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let is_required = prop_obj.remove("required").and_then(|v| v.as_bool());
            let has_default = prop_obj.contains_key("default");

            properties.insert(param_name.clone(), Value::Object(prop_obj));

            match is_required {
                Some(true) => required.push(param_name.clone()),
                Some(false) => {}
                None if is_optional || has_default => {}
                None => required.push(param_name.clone()),
            }
        }
    }

    json!({
        "type": "object",
        "properties": properties,
        "required": required
    })
}

fn type_to_json_schema(type_str: &str) -> Value {
    let json_type = match type_str {
        "string" | "str" => "string",
        "integer" | "int" | "i32" | "i64" | "u32" | "u64" => "integer",
        "number" | "float" | "f32" | "f64" => "number",
        "boolean" | "bool" => "boolean",
        "array" | "list" | "vec" => "array",
        "object" | "dict" | "map" => "object",
        // Unknown names fall back to string
        _ => "string",
    };
    json!({ "type": json_type })
}

/// Fluent builder for [`ToolDefinition`].
pub struct ToolBuilder {
    name: String,
    description: String,
    schema: Value,
}

impl ToolBuilder {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema: json!({}),
        }
    }

    /// Replace the schema entirely (full or shorthand form).
    pub fn schema(mut self, schema: Value) -> Self {
        self.schema = schema;
        self
    }

    /// Add one required parameter in simple type notation.
    pub fn param(mut self, name: &str, type_str: &str) -> Self {
        if !self.schema.is_object() {
            self.schema = json!({});
        }
        if let Some(obj) = self.schema.as_object_mut() {
            obj.insert(name.to_string(), Value::String(type_str.to_string()));
        }
        self
    }

    pub fn build(self) -> ToolDefinition {
        ToolDefinition::new(self.name, self.description, self.schema)
    }
}

/// Start building a tool definition.
pub fn tool(name: impl Into<String>, description: impl Into<String>) -> ToolBuilder {
    ToolBuilder::new(name, description)
}
