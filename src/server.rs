use rmcp::model::ErrorData as McpError;
use rmcp::{RoleServer, ServerHandler, model::*, service::RequestContext};

use crate::tools::ToolRegistry;

const INSTRUCTIONS: &str = "This server controls and queries a Home Assistant instance. \
Use ha_entity.list or ha_entity.search to discover entity ids, ha_area.list for areas, \
and ha_service.call for anything the dedicated tools do not cover.";

#[derive(Debug, Clone)]
pub struct SmartHomeServer {
    registry: ToolRegistry,
}

impl SmartHomeServer {
    pub fn new(registry: ToolRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }
}

impl ServerHandler for SmartHomeServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder()
                .enable_logging()
                .enable_tools()
                .build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(INSTRUCTIONS.into()),
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        Ok(ListToolsResult {
            tools: self.registry.tools(),
            next_cursor: None,
        })
    }

    async fn set_level(
        &self,
        request: SetLevelRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<(), McpError> {
        // Stdio clients get no log notifications.
        tracing::debug!(level = ?request.level, "client log level set");
        Ok(())
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.registry.call(&request.name, request.arguments).await
    }
}
