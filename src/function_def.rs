use crate::error::{Error, Result};
use crate::mcp_client_manager::MCPClientManager;
use crate::types::{CallToolResult, ResourceContents, Tool, ToolContent};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// A tool in the shape chat-completion APIs take as a function definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescription {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl From<&Tool> for ToolDescription {
    fn from(tool: &Tool) -> Self {
        Self {
            name: tool.name.clone(),
            description: tool.description.clone().unwrap_or_default(),
            parameters: tool.input_schema.clone(),
        }
    }
}

impl ToolDescription {
    /// `{"type": "function", "function": {...}}`
    pub fn to_function_definition(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

/// Function definitions for the manager's whole catalog.
pub async fn describe_tools(manager: &MCPClientManager) -> Vec<ToolDescription> {
    manager
        .get_all_tools()
        .await
        .iter()
        .map(ToolDescription::from)
        .collect()
}

/// A tool call requested by a model.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: Value,
}

impl FunctionCall {
    /// Parses the JSON-encoded argument string models emit. An empty string
    /// means no arguments.
    pub fn parse(name: &str, arguments: &str) -> Result<Self> {
        let arguments = if arguments.trim().is_empty() {
            Value::Object(Map::new())
        } else {
            serde_json::from_str(arguments)?
        };
        if !arguments.is_object() {
            return Err(Error::protocol(format!(
                "arguments for '{name}' must be a JSON object"
            )));
        }
        Ok(Self {
            name: name.to_string(),
            arguments,
        })
    }

    /// Runs the call and renders the outcome as text for the model.
    pub async fn execute(&self, mcp_manager: &MCPClientManager) -> String {
        let result = mcp_manager
            .call_tool(&self.name, self.arguments.clone())
            .await;
        render_result(&result)
    }
}

/// Text items verbatim, other items summarized, one per line.
pub fn render_result(result: &CallToolResult) -> String {
    let body = result
        .content
        .iter()
        .map(|item| match item {
            ToolContent::Text { text } => text.clone(),
            ToolContent::Image { data, mime_type } => {
                format!("[image: {mime_type}, {} bytes base64]", data.len())
            }
            ToolContent::Resource { resource } => match resource {
                ResourceContents::Text { uri, text, .. } => format!("[resource: {uri}]\n{text}"),
                ResourceContents::Blob { uri, .. } => format!("[resource: {uri}]"),
            },
        })
        .collect::<Vec<_>>()
        .join("\n");

    if result.is_error {
        format!("Error: {body}")
    } else {
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_definition_shape() {
        let tool = Tool {
            name: "search".into(),
            description: Some("Full text search".into()),
            input_schema: json!({"type": "object", "properties": {"q": {"type": "string"}}}),
        };
        let def = ToolDescription::from(&tool).to_function_definition();
        assert_eq!(def["type"], "function");
        assert_eq!(def["function"]["name"], "search");
        assert_eq!(def["function"]["parameters"]["properties"]["q"]["type"], "string");
    }

    #[test]
    fn missing_description_becomes_empty() {
        let tool = Tool {
            name: "t".into(),
            description: None,
            input_schema: json!({"type": "object"}),
        };
        assert_eq!(ToolDescription::from(&tool).description, "");
    }

    #[test]
    fn parse_arguments() {
        let call = FunctionCall::parse("add", r#"{"a": 1}"#).unwrap();
        assert_eq!(call.arguments, json!({"a": 1}));

        let call = FunctionCall::parse("ping", "").unwrap();
        assert_eq!(call.arguments, json!({}));

        assert!(FunctionCall::parse("add", "[1]").is_err());
        assert!(FunctionCall::parse("add", "{").is_err());
    }

    #[test]
    fn render_mixed_content() {
        let result = CallToolResult::success(vec![
            ToolContent::text("hello"),
            ToolContent::Image {
                data: "aGk=".into(),
                mime_type: "image/png".into(),
            },
            ToolContent::Resource {
                resource: ResourceContents::Blob {
                    uri: "file:///x.bin".into(),
                    mime_type: None,
                    blob: "AA==".into(),
                },
            },
        ]);
        assert_eq!(
            render_result(&result),
            "hello\n[image: image/png, 4 bytes base64]\n[resource: file:///x.bin]"
        );
    }

    #[test]
    fn render_error_is_prefixed() {
        let result = CallToolResult::error("unknown tool 'x'");
        assert_eq!(render_result(&result), "Error: unknown tool 'x'");
    }

    #[tokio::test]
    async fn execute_without_servers_reports_unknown_tool() {
        let manager = MCPClientManager::new();
        let call = FunctionCall::parse("nothing", "{}").unwrap();
        let text = call.execute(&manager).await;
        assert!(text.starts_with("Error: "));
        assert!(text.contains("nothing"));
    }
}
