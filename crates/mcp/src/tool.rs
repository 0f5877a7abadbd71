use std::sync::Arc;

use async_trait::async_trait;
use huddle_agent::tools::{Tool, ToolInvocationError, ToolOutput};
use rmcp::model::{CallToolResult, RawContent, ResourceContents};
use serde_json::Value;
use tracing::debug;

use crate::registry::McpConnection;

pub const MAX_TOOL_OUTPUT_BYTES: usize = 50_000;

/// Proxies one remote tool through the connection that advertised it.
#[derive(Clone)]
pub struct McpToolAdapter {
    exposed_name: String,
    remote_name: String,
    description: String,
    input_schema: Value,
    connection: Arc<McpConnection>,
}

impl McpToolAdapter {
    pub fn new(tool: rmcp::model::Tool, connection: Arc<McpConnection>) -> Self {
        let input_schema = tool.schema_as_json_value();
        let description =
            tool.description.map(|description| description.into_owned()).unwrap_or_default();
        let remote_name = tool.name.into_owned();

        Self {
            exposed_name: remote_name.clone(),
            remote_name,
            description,
            input_schema,
            connection,
        }
    }

    pub fn exposed_name(&self) -> &str {
        &self.exposed_name
    }

    pub fn server_name(&self) -> &str {
        self.connection.name()
    }

    /// Re-exposes the tool as `<server>_<tool>`.
    pub fn namespaced(mut self) -> Self {
        self.exposed_name = format!(
            "{}_{}",
            sanitize_identifier(self.connection.name()),
            sanitize_identifier(&self.remote_name)
        );
        self
    }
}

#[async_trait]
impl Tool for McpToolAdapter {
    fn name(&self) -> &str {
        &self.exposed_name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> Value {
        self.input_schema.clone()
    }

    async fn invoke(&self, arguments: Value) -> Result<ToolOutput, ToolInvocationError> {
        debug!(
            event_name = "mcp.tool.invoke",
            server = %self.connection.name(),
            tool = %self.remote_name,
            "calling mcp tool"
        );
        let result = self
            .connection
            .call_tool(&self.remote_name, arguments)
            .await
            .map_err(|error| ToolInvocationError(error.to_string()))?;

        Ok(output_from_result(&result, self.connection.name(), &self.remote_name))
    }
}

fn output_from_result(result: &CallToolResult, server: &str, tool: &str) -> ToolOutput {
    let text = truncate_output(&collect_result_text(result), MAX_TOOL_OUTPUT_BYTES);

    if result.is_error.unwrap_or(false) {
        if text.is_empty() {
            return ToolOutput::error(format!(
                "server `{server}` reported an error while calling `{tool}`"
            ));
        }
        return ToolOutput::error(text);
    }
    if text.is_empty() {
        return ToolOutput::ok("[tool returned no content]");
    }
    ToolOutput::ok(text)
}

fn collect_result_text(result: &CallToolResult) -> String {
    let mut blocks = result
        .content
        .iter()
        .map(|content| match &content.raw {
            RawContent::Text(text) => text.text.clone(),
            RawContent::Resource(resource) => match &resource.resource {
                ResourceContents::TextResourceContents { text, .. } => text.clone(),
                _ => serde_json::to_string(&content.raw)
                    .unwrap_or_else(|_| "[unsupported resource content]".to_string()),
            },
            other => serde_json::to_string(other)
                .unwrap_or_else(|_| "[unsupported content]".to_string()),
        })
        .collect::<Vec<_>>();

    if let Some(structured) = &result.structured_content {
        blocks.push(structured.to_string());
    }
    blocks.join("\n")
}

fn truncate_output(value: &str, max_bytes: usize) -> String {
    if value.len() <= max_bytes {
        return value.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n\n[output truncated: {end} of {} bytes shown]", &value[..end], value.len())
}

fn sanitize_identifier(raw: &str) -> String {
    let mut value = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect::<String>();
    while value.contains("__") {
        value = value.replace("__", "_");
    }
    let value = value.trim_matches('_');
    if value.is_empty() {
        return "tool".to_string();
    }
    if value.starts_with(|c: char| c.is_ascii_digit()) {
        return format!("_{value}");
    }
    value.to_string()
}
