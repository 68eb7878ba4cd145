use std::str::FromStr;
use std::sync::Arc;

use futures::future::try_join_all;
use rmcp::model::{CallToolResult, Content, ErrorData as McpError, JsonObject, Tool};
use schemars::{JsonSchema, SchemaGenerator};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use strum::IntoEnumIterator;
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

use crate::client::{EntityMeta, EntityState, HomeAssistantClient};
use crate::error::HaError;

/// Input schema for a tool argument struct, as a JSON object.
fn schema_for_type<T: JsonSchema>() -> JsonObject {
    let schema = SchemaGenerator::default().into_root_schema_for::<T>();
    match serde_json::to_value(schema) {
        Ok(Value::Object(object)) => object,
        other => {
            tracing::error!(?other, "schema did not serialize to an object");
            JsonObject::new()
        }
    }
}

// =============================================================================
// Tool Names
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr, EnumString, EnumIter)]
pub enum ToolName {
    #[strum(serialize = "ha_light.turn_on")]
    LightTurnOn,
    #[strum(serialize = "ha_light.turn_off")]
    LightTurnOff,
    #[strum(serialize = "ha_light.set_brightness")]
    LightSetBrightness,
    #[strum(serialize = "ha_light.turn_on_in_area")]
    LightTurnOnInArea,
    #[strum(serialize = "ha_light.turn_off_in_area")]
    LightTurnOffInArea,
    #[strum(serialize = "ha_entity.get_state")]
    EntityGetState,
    #[strum(serialize = "ha_area.get_status")]
    AreaGetStatus,
    #[strum(serialize = "ha_area.list")]
    AreaList,
    #[strum(serialize = "ha_entity.list")]
    EntityList,
    #[strum(serialize = "ha_entity.search")]
    EntitySearch,
    #[strum(serialize = "ha_todo.get_items")]
    TodoGetItems,
    #[strum(serialize = "ha_todo.add_item")]
    TodoAddItem,
    #[strum(serialize = "ha_todo.update_item")]
    TodoUpdateItem,
    #[strum(serialize = "ha_todo.remove_item")]
    TodoRemoveItem,
    #[strum(serialize = "ha_service.call")]
    ServiceCall,
}

impl ToolName {
    pub fn description(self) -> &'static str {
        match self {
            ToolName::LightTurnOn => "Turn on a light entity",
            ToolName::LightTurnOff => "Turn off a light entity",
            ToolName::LightSetBrightness => "Set the brightness of a light (0-255)",
            ToolName::LightTurnOnInArea => {
                "Turn on all lights in a named area (e.g. 'kitchen', 'living_room')"
            }
            ToolName::LightTurnOffInArea => "Turn off all lights in a named area",
            ToolName::EntityGetState => "Get the current state and attributes of any entity",
            ToolName::AreaGetStatus => "Get the state of all entities in an area",
            ToolName::AreaList => "List all areas configured in Home Assistant",
            ToolName::EntityList => {
                "List all entities for a domain (e.g. light, sensor, switch, climate) with their current states. Optionally filter by device_class (e.g. temperature, humidity, motion)."
            }
            ToolName::EntitySearch => {
                "Search entities by keyword across entity IDs and friendly names. Returns matching entities with their current states."
            }
            ToolName::TodoGetItems => {
                "Get items from a Home Assistant todo list. Use ha_entity.list with domain 'todo' to discover available lists first."
            }
            ToolName::TodoAddItem => "Add an item to a Home Assistant todo list",
            ToolName::TodoUpdateItem => {
                "Update a todo item's text or status (mark as completed/needs_action). Use ha_todo.get_items first to find the item name."
            }
            ToolName::TodoRemoveItem => "Remove an item from a Home Assistant todo list",
            ToolName::ServiceCall => {
                "Call any Home Assistant service (escape hatch for anything not covered by other tools)"
            }
        }
    }

    fn input_schema(self) -> JsonObject {
        match self {
            ToolName::LightTurnOn | ToolName::LightTurnOff => schema_for_type::<LightArgs>(),
            ToolName::LightSetBrightness => schema_for_type::<SetBrightnessArgs>(),
            ToolName::LightTurnOnInArea | ToolName::LightTurnOffInArea => {
                schema_for_type::<AreaArgs>()
            }
            ToolName::EntityGetState => schema_for_type::<EntityIdArgs>(),
            ToolName::AreaGetStatus => schema_for_type::<AreaArgs>(),
            ToolName::AreaList => schema_for_type::<NoArgs>(),
            ToolName::EntityList => schema_for_type::<EntityListArgs>(),
            ToolName::EntitySearch => schema_for_type::<EntitySearchArgs>(),
            ToolName::TodoGetItems => schema_for_type::<TodoGetItemsArgs>(),
            ToolName::TodoAddItem | ToolName::TodoRemoveItem => schema_for_type::<TodoItemArgs>(),
            ToolName::TodoUpdateItem => schema_for_type::<TodoUpdateItemArgs>(),
            ToolName::ServiceCall => schema_for_type::<ServiceCallArgs>(),
        }
    }

    /// Argument shape quoted back to the caller when decoding fails.
    fn usage(self) -> &'static str {
        match self {
            ToolName::LightTurnOn | ToolName::LightTurnOff | ToolName::EntityGetState => {
                r#"{"entity_id": "string"}"#
            }
            ToolName::LightSetBrightness => r#"{"entity_id": "string", "brightness": 0-255}"#,
            ToolName::LightTurnOnInArea | ToolName::LightTurnOffInArea | ToolName::AreaGetStatus => {
                r#"{"area": "string"}"#
            }
            ToolName::AreaList => "{}",
            ToolName::EntityList => {
                r#"{"domain": "string", "device_class": "string (optional)", "state": "string (optional)"}"#
            }
            ToolName::EntitySearch => r#"{"query": "string", "domain": "string (optional)"}"#,
            ToolName::TodoGetItems => {
                r#"{"entity_id": "string", "status": "needs_action|completed (optional)"}"#
            }
            ToolName::TodoAddItem | ToolName::TodoRemoveItem => {
                r#"{"entity_id": "string", "item": "string"}"#
            }
            ToolName::TodoUpdateItem => {
                r#"{"entity_id": "string", "item": "string", "rename": "string (optional)", "status": "needs_action|completed (optional)"}"#
            }
            ToolName::ServiceCall => {
                r#"{"domain": "string", "service": "string", "data": {} (optional)}"#
            }
        }
    }

    pub fn definition(self) -> Tool {
        Tool::new(self.as_ref().to_string(), self.description(), Arc::new(self.input_schema()))
    }
}

// =============================================================================
// Argument Structs with JSON Schema
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Display, AsRefStr)]
#[schemars(title = "Todo Item Status")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TodoStatus {
    NeedsAction,
    Completed,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct NoArgs {}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct LightArgs {
    /// The light entity id, e.g. light.kitchen
    pub entity_id: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SetBrightnessArgs {
    /// The light entity id
    pub entity_id: String,
    /// Brightness level 0-255
    pub brightness: u8,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct AreaArgs {
    /// Area id as known in Home Assistant
    pub area: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct EntityIdArgs {
    /// Entity id, e.g. sensor.temperature
    pub entity_id: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct EntityListArgs {
    /// Entity domain: light, sensor, switch, binary_sensor, climate, etc.
    pub domain: String,
    /// Filter by device_class attribute, e.g. 'temperature', 'humidity', 'motion'
    #[serde(default)]
    pub device_class: Option<String>,
    /// Filter by state value, e.g. 'on', 'off'. Omit to return all.
    #[serde(default)]
    pub state: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct EntitySearchArgs {
    /// Search term to match against entity_id and friendly_name
    pub query: String,
    /// Optionally restrict to a domain (light, sensor, etc.)
    #[serde(default)]
    pub domain: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct TodoGetItemsArgs {
    /// Todo list entity id, e.g. todo.shopping_list
    pub entity_id: String,
    /// Filter by status. Omit to return all items.
    #[serde(default)]
    pub status: Option<TodoStatus>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct TodoItemArgs {
    /// Todo list entity id, e.g. todo.shopping_list
    pub entity_id: String,
    /// The item text (must match exactly when removing)
    pub item: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct TodoUpdateItemArgs {
    /// Todo list entity id
    pub entity_id: String,
    /// Current item text (must match exactly)
    pub item: String,
    /// New text for the item
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rename: Option<String>,
    /// New status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TodoStatus>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ServiceCallArgs {
    /// Service domain, e.g. 'switch', 'climate'
    pub domain: String,
    /// Service name, e.g. 'turn_on', 'set_temperature'
    pub service: String,
    /// Service data payload
    #[serde(default)]
    #[schemars(with = "Option<std::collections::HashMap<String, serde_json::Value>>")]
    pub data: Option<Map<String, Value>>,
}

// =============================================================================
// Result Shaping
// =============================================================================

const USEFUL_ATTRIBUTES: &[&str] = &[
    "brightness",
    "color_temp",
    "rgb_color",
    "unit_of_measurement",
    "device_class",
    "current_temperature",
    "temperature",
    "hvac_action",
];

/// Compact view of a state: id, state, friendly name and a few useful attributes.
pub fn summarize_state(entity: &EntityState) -> Map<String, Value> {
    let mut summary = Map::new();
    summary.insert("entity_id".into(), json!(entity.entity_id));
    summary.insert("state".into(), json!(entity.state));
    summary.insert(
        "friendly_name".into(),
        entity
            .attributes
            .get("friendly_name")
            .filter(|v| !v.is_null())
            .cloned()
            .unwrap_or_else(|| json!(entity.entity_id)),
    );
    for key in USEFUL_ATTRIBUTES {
        if let Some(value) = entity.attributes.get(*key) {
            summary.insert((*key).into(), value.clone());
        }
    }
    summary
}

fn summarize_with_location(entity: &EntityState, meta: Option<&EntityMeta>) -> Map<String, Value> {
    let mut summary = summarize_state(entity);
    summary.insert("area".into(), json!(meta.and_then(|m| m.area.clone())));
    summary.insert("device".into(), json!(meta.and_then(|m| m.device.clone())));
    summary
}

fn text_result<T: Serialize + ?Sized>(data: &T) -> Result<CallToolResult, ToolFailure> {
    let pretty_json = serde_json::to_string_pretty(data)
        .map_err(|e| McpError::internal_error(e.to_string(), None))?;
    Ok(CallToolResult::success(vec![Content::text(pretty_json)]))
}

/// Optional text arguments count as absent when empty.
fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

fn parse_args<T: DeserializeOwned>(tool: ToolName, arguments: JsonObject) -> Result<T, McpError> {
    serde_json::from_value(Value::Object(arguments)).map_err(|e| {
        McpError::invalid_params(
            format!("{tool}: Invalid arguments - {e}. Expected: {}", tool.usage()),
            None,
        )
    })
}

// =============================================================================
// Tool Registry
// =============================================================================

/// Why a tool call did not produce a result.
#[derive(Debug)]
enum ToolFailure {
    /// Answered as a JSON-RPC error: bad arguments or an internal fault.
    Protocol(McpError),
    /// Home Assistant could not carry out the call.
    HomeAssistant(HaError),
}

impl From<McpError> for ToolFailure {
    fn from(err: McpError) -> Self {
        ToolFailure::Protocol(err)
    }
}

impl From<HaError> for ToolFailure {
    fn from(err: HaError) -> Self {
        ToolFailure::HomeAssistant(err)
    }
}

/// Maps tool names to Home Assistant calls. Shared by every transport.
#[derive(Debug, Clone)]
pub struct ToolRegistry {
    client: Arc<HomeAssistantClient>,
}

impl ToolRegistry {
    pub fn new(client: HomeAssistantClient) -> Self {
        Self {
            client: Arc::new(client),
        }
    }

    pub fn tools(&self) -> Vec<Tool> {
        ToolName::iter().map(ToolName::definition).collect()
    }

    /// Run a tool. Home Assistant failures come back as an error result the
    /// agent can read; only unknown tools and bad arguments are protocol errors.
    pub async fn call(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<CallToolResult, McpError> {
        let Ok(tool) = ToolName::from_str(name) else {
            let available: Vec<String> = ToolName::iter().map(|t| t.to_string()).collect();
            return Err(McpError::invalid_params(
                format!(
                    "Unknown tool: '{}'. Available tools: {}",
                    name,
                    available.join(", ")
                ),
                None,
            ));
        };

        tracing::info!(%tool, "tool call");
        let arguments = arguments.unwrap_or_default();
        match self.dispatch(tool, arguments).await {
            Ok(result) => Ok(result),
            Err(ToolFailure::Protocol(error)) => {
                tracing::warn!(%tool, message = %error.message, "tool call rejected");
                Err(error)
            }
            Err(ToolFailure::HomeAssistant(error)) => {
                tracing::warn!(%tool, %error, "tool call failed");
                Ok(CallToolResult::error(vec![Content::text(error.to_string())]))
            }
        }
    }

    async fn dispatch(&self, tool: ToolName, arguments: JsonObject) -> Result<CallToolResult, ToolFailure> {
        match tool {
            ToolName::LightTurnOn => {
                let args: LightArgs = parse_args(tool, arguments)?;
                self.light_service("turn_on", json!({ "entity_id": args.entity_id })).await
            }
            ToolName::LightTurnOff => {
                let args: LightArgs = parse_args(tool, arguments)?;
                self.light_service("turn_off", json!({ "entity_id": args.entity_id })).await
            }
            ToolName::LightSetBrightness => {
                let args: SetBrightnessArgs = parse_args(tool, arguments)?;
                self.light_service(
                    "turn_on",
                    json!({ "entity_id": args.entity_id, "brightness": args.brightness }),
                )
                .await
            }
            ToolName::LightTurnOnInArea => {
                let args: AreaArgs = parse_args(tool, arguments)?;
                self.lights_in_area(&args.area, "turn_on").await
            }
            ToolName::LightTurnOffInArea => {
                let args: AreaArgs = parse_args(tool, arguments)?;
                self.lights_in_area(&args.area, "turn_off").await
            }
            ToolName::EntityGetState => {
                let args: EntityIdArgs = parse_args(tool, arguments)?;
                let state = self.client.get_state(&args.entity_id).await?;
                text_result(&summarize_state(&state))
            }
            ToolName::AreaGetStatus => {
                let args: AreaArgs = parse_args(tool, arguments)?;
                self.area_status(args.area).await
            }
            ToolName::AreaList => {
                let _: NoArgs = parse_args(tool, arguments)?;
                self.area_list().await
            }
            ToolName::EntityList => {
                let args: EntityListArgs = parse_args(tool, arguments)?;
                self.entity_list(args).await
            }
            ToolName::EntitySearch => {
                let args: EntitySearchArgs = parse_args(tool, arguments)?;
                self.entity_search(args).await
            }
            ToolName::TodoGetItems => {
                let args: TodoGetItemsArgs = parse_args(tool, arguments)?;
                let mut data = json!({ "entity_id": args.entity_id });
                if let Some(status) = args.status {
                    data["status"] = json!(status);
                }
                let response = self
                    .client
                    .call_service_with_response("todo", "get_items", Some(data))
                    .await?;
                text_result(&response)
            }
            ToolName::TodoAddItem => {
                let args: TodoItemArgs = parse_args(tool, arguments)?;
                let state = self
                    .client
                    .call_service(
                        "todo",
                        "add_item",
                        Some(json!({ "entity_id": args.entity_id, "item": args.item })),
                    )
                    .await?;
                text_result(&json!({ "added": args.item, "list": args.entity_id, "state": state }))
            }
            ToolName::TodoUpdateItem => {
                let mut args: TodoUpdateItemArgs = parse_args(tool, arguments)?;
                args.rename = non_empty(args.rename);
                let data = serde_json::to_value(&args)
                    .map_err(|e| McpError::internal_error(e.to_string(), None))?;
                let state = self
                    .client
                    .call_service("todo", "update_item", Some(data))
                    .await?;
                text_result(&json!({ "updated": args.item, "list": args.entity_id, "state": state }))
            }
            ToolName::TodoRemoveItem => {
                let args: TodoItemArgs = parse_args(tool, arguments)?;
                let state = self
                    .client
                    .call_service(
                        "todo",
                        "remove_item",
                        Some(json!({ "entity_id": args.entity_id, "item": args.item })),
                    )
                    .await?;
                text_result(&json!({ "removed": args.item, "list": args.entity_id, "state": state }))
            }
            ToolName::ServiceCall => {
                let args: ServiceCallArgs = parse_args(tool, arguments)?;
                let state = self
                    .client
                    .call_service(&args.domain, &args.service, args.data.map(Value::Object))
                    .await?;
                text_result(&state)
            }
        }
    }

    // =============================================================================
    // Tool Implementations
    // =============================================================================

    async fn light_service(&self, service: &str, data: Value) -> Result<CallToolResult, ToolFailure> {
        let changed = self
            .client
            .call_service_for_states("light", service, Some(data))
            .await?;
        let summaries: Vec<_> = changed.iter().map(summarize_state).collect();
        text_result(&summaries)
    }

    async fn lights_in_area(&self, area: &str, service: &str) -> Result<CallToolResult, ToolFailure> {
        let lights: Vec<String> = self
            .client
            .get_entities_in_area(area)
            .await?
            .into_iter()
            .filter(|id| id.starts_with("light."))
            .collect();

        if lights.is_empty() {
            return text_result(&json!({ "message": format!("No lights found in area '{area}'") }));
        }

        tracing::debug!(area, count = lights.len(), service, "switching lights in area");
        self.light_service(service, json!({ "entity_id": lights })).await
    }

    async fn area_status(&self, area: String) -> Result<CallToolResult, ToolFailure> {
        let entity_ids = self.client.get_entities_in_area(&area).await?;
        let states = try_join_all(entity_ids.iter().map(|id| self.client.get_state(id))).await?;
        let entities: Vec<_> = states.iter().map(summarize_state).collect();
        text_result(&json!({ "area": area, "entities": entities }))
    }

    async fn area_list(&self) -> Result<CallToolResult, ToolFailure> {
        let area_ids = self.client.get_areas().await?;
        let names = try_join_all(area_ids.iter().map(|id| self.client.get_area_name(id))).await?;
        let areas: Vec<Value> = area_ids
            .into_iter()
            .zip(names)
            .map(|(id, name)| json!({ "id": id, "name": name }))
            .collect();
        text_result(&areas)
    }

    async fn entity_list(&self, args: EntityListArgs) -> Result<CallToolResult, ToolFailure> {
        let mut entities = self.client.get_states_by_domain(&args.domain).await?;

        if let Some(device_class) = non_empty(args.device_class) {
            entities.retain(|e| {
                e.attributes.get("device_class").and_then(|v| v.as_str()) == Some(device_class.as_str())
            });
        }
        if let Some(state) = non_empty(args.state) {
            entities.retain(|e| e.state == state);
        }

        self.with_locations(&entities).await
    }

    async fn entity_search(&self, args: EntitySearchArgs) -> Result<CallToolResult, ToolFailure> {
        let states = match non_empty(args.domain) {
            Some(domain) => self.client.get_states_by_domain(&domain).await?,
            None => self.client.get_states().await?,
        };

        let query = args.query.to_lowercase();
        let matches: Vec<EntityState> = states
            .into_iter()
            .filter(|e| {
                let name = e.friendly_name().unwrap_or_default().to_lowercase();
                e.entity_id.to_lowercase().contains(&query) || name.contains(&query)
            })
            .collect();

        self.with_locations(&matches).await
    }

    async fn with_locations(&self, entities: &[EntityState]) -> Result<CallToolResult, ToolFailure> {
        let ids: Vec<String> = entities.iter().map(|e| e.entity_id.clone()).collect();
        let meta = self.client.get_entity_meta_map(&ids).await?;
        let summaries: Vec<_> = entities
            .iter()
            .map(|e| summarize_with_location(e, meta.get(&e.entity_id)))
            .collect();
        text_result(&summaries)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::HomeAssistantConfig;
    use pretty_assertions::assert_eq;
    use rmcp::model::RawContent;
    use wiremock::matchers::{body_json, body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn registry_for(server: &MockServer) -> ToolRegistry {
        let config =
            HomeAssistantConfig::new(server.uri(), "token".into(), Duration::from_secs(5)).unwrap();
        ToolRegistry::new(HomeAssistantClient::new(&config).unwrap())
    }

    fn state(entity_id: &str, state: &str, attributes: Value) -> Value {
        json!({ "entity_id": entity_id, "state": state, "attributes": attributes })
    }

    fn args(value: Value) -> Option<JsonObject> {
        match value {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    fn result_text(result: &CallToolResult) -> String {
        let content = result.content.first().expect("tool returned no content");
        match &content.raw {
            RawContent::Text(text) => text.text.clone(),
            other => panic!("unexpected content: {other:?}"),
        }
    }

    fn result_json(result: &CallToolResult) -> Value {
        serde_json::from_str(&result_text(result)).unwrap()
    }

    #[test]
    fn registers_all_tools() {
        let mut names: Vec<String> = ToolName::iter().map(|t| t.to_string()).collect();
        names.sort();
        let mut expected = vec![
            "ha_light.turn_on",
            "ha_light.turn_off",
            "ha_light.set_brightness",
            "ha_light.turn_on_in_area",
            "ha_light.turn_off_in_area",
            "ha_entity.get_state",
            "ha_area.get_status",
            "ha_area.list",
            "ha_entity.list",
            "ha_entity.search",
            "ha_todo.get_items",
            "ha_todo.add_item",
            "ha_todo.update_item",
            "ha_todo.remove_item",
            "ha_service.call",
        ];
        expected.sort();
        assert_eq!(names, expected);
    }

    #[test]
    fn schemas_describe_objects_with_required_fields() {
        for tool in ToolName::iter() {
            let schema = tool.input_schema();
            assert_eq!(schema.get("type"), Some(&json!("object")), "{tool}");
        }
        let schema = ToolName::LightSetBrightness.input_schema();
        let required = schema["required"].as_array().unwrap();
        assert!(required.contains(&json!("entity_id")));
        assert!(required.contains(&json!("brightness")));
    }

    #[test]
    fn summary_keeps_useful_attributes_only() {
        let entity: EntityState = serde_json::from_value(state(
            "light.kitchen",
            "on",
            json!({"brightness": 180, "friendly_name": "Kitchen", "icon": "mdi:lamp"}),
        ))
        .unwrap();
        assert_eq!(
            Value::Object(summarize_state(&entity)),
            json!({"entity_id": "light.kitchen", "state": "on", "friendly_name": "Kitchen", "brightness": 180})
        );
    }

    #[test]
    fn summary_falls_back_to_entity_id_for_name() {
        let entity: EntityState =
            serde_json::from_value(state("sensor.temp", "21.5", json!({"unit_of_measurement": "°C"})))
                .unwrap();
        let summary = summarize_state(&entity);
        assert_eq!(summary["friendly_name"], json!("sensor.temp"));
        assert_eq!(summary["unit_of_measurement"], json!("°C"));
    }

    #[tokio::test]
    async fn unknown_tool_lists_available_tools() {
        let server = MockServer::start().await;
        let err = registry_for(&server).call("light.explode", None).await.unwrap_err();
        assert!(err.message.contains("Unknown tool: 'light.explode'"));
        assert!(err.message.contains("ha_service.call"));
    }

    #[tokio::test]
    async fn invalid_arguments_name_the_tool() {
        let server = MockServer::start().await;
        let err = registry_for(&server)
            .call(
                "ha_light.set_brightness",
                args(json!({"entity_id": "light.kitchen", "brightness": 300})),
            )
            .await
            .unwrap_err();
        assert!(err.message.starts_with("ha_light.set_brightness: Invalid arguments"));
    }

    #[tokio::test]
    async fn set_brightness_turns_light_on() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/services/light/turn_on"))
            .and(body_json(json!({"entity_id": "light.kitchen", "brightness": 128})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                state("light.kitchen", "on", json!({"brightness": 128, "friendly_name": "Kitchen"}))
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let result = registry_for(&server)
            .call(
                "ha_light.set_brightness",
                args(json!({"entity_id": "light.kitchen", "brightness": 128})),
            )
            .await
            .unwrap();
        assert_eq!(
            result_json(&result),
            json!([{"entity_id": "light.kitchen", "state": "on", "friendly_name": "Kitchen", "brightness": 128}])
        );
    }

    #[tokio::test]
    async fn area_without_lights_reports_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/template"))
            .respond_with(ResponseTemplate::new(200).set_body_string("['sensor.hall_temp']"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/services/light/turn_off"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(0)
            .mount(&server)
            .await;

        let result = registry_for(&server)
            .call("ha_light.turn_off_in_area", args(json!({"area": "hall"})))
            .await
            .unwrap();
        assert_eq!(result_json(&result), json!({"message": "No lights found in area 'hall'"}));
    }

    #[tokio::test]
    async fn area_lights_are_switched_in_one_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/template"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("['light.a', 'sensor.b', 'light.c']"),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/services/light/turn_on"))
            .and(body_json(json!({"entity_id": ["light.a", "light.c"]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                state("light.a", "on", json!({})),
                state("light.c", "on", json!({})),
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let result = registry_for(&server)
            .call("ha_light.turn_on_in_area", args(json!({"area": "kitchen"})))
            .await
            .unwrap();
        assert_eq!(result_json(&result).as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn area_status_fetches_each_entity() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/template"))
            .respond_with(ResponseTemplate::new(200).set_body_string("['light.a', 'sensor.t']"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/states/light.a"))
            .respond_with(ResponseTemplate::new(200).set_body_json(state("light.a", "off", json!({}))))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/states/sensor.t"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(state("sensor.t", "20", json!({}))),
            )
            .mount(&server)
            .await;

        let result = registry_for(&server)
            .call("ha_area.get_status", args(json!({"area": "office"})))
            .await
            .unwrap();
        assert_eq!(
            result_json(&result),
            json!({
                "area": "office",
                "entities": [
                    {"entity_id": "light.a", "state": "off", "friendly_name": "light.a"},
                    {"entity_id": "sensor.t", "state": "20", "friendly_name": "sensor.t"}
                ]
            })
        );
    }

    #[tokio::test]
    async fn area_status_fails_when_any_state_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/template"))
            .respond_with(ResponseTemplate::new(200).set_body_string("['light.a', 'light.gone']"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/states/light.a"))
            .respond_with(ResponseTemplate::new(200).set_body_json(state("light.a", "off", json!({}))))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/states/light.gone"))
            .respond_with(ResponseTemplate::new(404).set_body_string("Entity not found."))
            .mount(&server)
            .await;

        let result = registry_for(&server)
            .call("ha_area.get_status", args(json!({"area": "office"})))
            .await
            .unwrap();
        assert_eq!(result.is_error, Some(true));
        assert_eq!(result_text(&result), "HA API 404: Not Found - Entity not found.");
    }

    #[tokio::test]
    async fn unreachable_home_assistant_is_an_error_result() {
        let config = HomeAssistantConfig::new(
            "http://127.0.0.1:9".into(),
            "token".into(),
            Duration::from_secs(2),
        )
        .unwrap();
        let registry = ToolRegistry::new(HomeAssistantClient::new(&config).unwrap());

        let result = registry
            .call("ha_entity.get_state", args(json!({"entity_id": "light.kitchen"})))
            .await
            .unwrap();
        assert_eq!(result.is_error, Some(true));
        assert!(result_text(&result).contains("http://127.0.0.1:9"));
    }

    #[tokio::test]
    async fn area_list_resolves_names() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/template"))
            .and(body_json(json!({"template": "{{ areas() | list }}"})))
            .respond_with(ResponseTemplate::new(200).set_body_string("['kitchen']"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/template"))
            .and(body_json(json!({"template": "{{ area_name('kitchen') }}"})))
            .respond_with(ResponseTemplate::new(200).set_body_string("Kitchen"))
            .mount(&server)
            .await;

        let result = registry_for(&server).call("ha_area.list", None).await.unwrap();
        assert_eq!(result_json(&result), json!([{"id": "kitchen", "name": "Kitchen"}]));
    }

    #[tokio::test]
    async fn entity_list_filters_and_adds_location() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/states"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                state("sensor.temp", "21", json!({"device_class": "temperature", "friendly_name": "Temp"})),
                state("sensor.hum", "40", json!({"device_class": "humidity"})),
                state("light.kitchen", "on", json!({})),
            ])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/template"))
            .and(body_string_contains("'sensor.temp'"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"sensor.temp": {"area": "Living Room", "device": "Thermo"}}"#,
            ))
            .expect(1)
            .mount(&server)
            .await;

        let result = registry_for(&server)
            .call(
                "ha_entity.list",
                args(json!({"domain": "sensor", "device_class": "temperature"})),
            )
            .await
            .unwrap();
        assert_eq!(
            result_json(&result),
            json!([{
                "entity_id": "sensor.temp",
                "state": "21",
                "friendly_name": "Temp",
                "device_class": "temperature",
                "area": "Living Room",
                "device": "Thermo"
            }])
        );
    }

    #[tokio::test]
    async fn entity_search_matches_friendly_name_case_insensitively() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/states"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                state("switch.coffee", "off", json!({"friendly_name": "Coffee Maker"})),
                state("light.porch", "on", json!({"friendly_name": "Porch"})),
            ])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/template"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let result = registry_for(&server)
            .call("ha_entity.search", args(json!({"query": "COFFEE"})))
            .await
            .unwrap();
        assert_eq!(
            result_json(&result),
            json!([{
                "entity_id": "switch.coffee",
                "state": "off",
                "friendly_name": "Coffee Maker",
                "area": null,
                "device": null
            }])
        );
    }

    #[tokio::test]
    async fn todo_update_omits_absent_fields() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/services/todo/update_item"))
            .and(body_json(json!({"entity_id": "todo.shopping", "item": "milk", "status": "completed"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let result = registry_for(&server)
            .call(
                "ha_todo.update_item",
                args(json!({"entity_id": "todo.shopping", "item": "milk", "status": "completed"})),
            )
            .await
            .unwrap();
        assert_eq!(
            result_json(&result),
            json!({"updated": "milk", "list": "todo.shopping", "state": []})
        );
    }

    #[tokio::test]
    async fn todo_get_items_returns_raw_response() {
        let server = MockServer::start().await;
        let response = json!({
            "changed_states": [],
            "service_response": {"todo.shopping": {"items": [{"summary": "milk", "status": "needs_action"}]}}
        });
        Mock::given(method("POST"))
            .and(path("/api/services/todo/get_items"))
            .and(body_json(json!({"entity_id": "todo.shopping", "status": "needs_action"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(response.clone()))
            .expect(1)
            .mount(&server)
            .await;

        let result = registry_for(&server)
            .call(
                "ha_todo.get_items",
                args(json!({"entity_id": "todo.shopping", "status": "needs_action"})),
            )
            .await
            .unwrap();
        assert_eq!(result_json(&result), response);
    }

    #[tokio::test]
    async fn service_call_passes_data_through() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/services/climate/set_temperature"))
            .and(body_json(json!({"entity_id": "climate.hall", "temperature": 21})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                state("climate.hall", "heat", json!({"temperature": 21}))
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let result = registry_for(&server)
            .call(
                "ha_service.call",
                args(json!({
                    "domain": "climate",
                    "service": "set_temperature",
                    "data": {"entity_id": "climate.hall", "temperature": 21}
                })),
            )
            .await
            .unwrap();
        assert_eq!(result_json(&result)[0]["state"], json!("heat"));
    }

    #[tokio::test]
    async fn service_call_returns_home_assistant_json_verbatim() {
        let server = MockServer::start().await;
        let changed = json!([{
            "entity_id": "switch.fan",
            "state": "on",
            "attributes": {},
            "last_reported": "2025-01-01T00:00:00+00:00"
        }]);
        Mock::given(method("POST"))
            .and(path("/api/services/switch/turn_on"))
            .and(body_json(json!({})))
            .respond_with(ResponseTemplate::new(200).set_body_json(changed.clone()))
            .mount(&server)
            .await;

        let result = registry_for(&server)
            .call("ha_service.call", args(json!({"domain": "switch", "service": "turn_on"})))
            .await
            .unwrap();
        assert_eq!(result_json(&result), changed);
    }

    #[tokio::test]
    async fn todo_add_keeps_raw_state() {
        let server = MockServer::start().await;
        let changed = json!([{"entity_id": "todo.shopping", "state": "3", "last_reported": "now"}]);
        Mock::given(method("POST"))
            .and(path("/api/services/todo/add_item"))
            .and(body_json(json!({"entity_id": "todo.shopping", "item": "eggs"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(changed.clone()))
            .expect(1)
            .mount(&server)
            .await;

        let result = registry_for(&server)
            .call("ha_todo.add_item", args(json!({"entity_id": "todo.shopping", "item": "eggs"})))
            .await
            .unwrap();
        assert_eq!(
            result_json(&result),
            json!({"added": "eggs", "list": "todo.shopping", "state": changed})
        );
    }

    #[tokio::test]
    async fn empty_optional_filters_are_ignored() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/states"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                state("light.porch", "on", json!({"friendly_name": "Porch"})),
            ])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/template"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .mount(&server)
            .await;

        let result = registry_for(&server)
            .call(
                "ha_entity.list",
                args(json!({"domain": "light", "device_class": "", "state": ""})),
            )
            .await
            .unwrap();
        assert_eq!(result_json(&result).as_array().unwrap().len(), 1);

        let result = registry_for(&server)
            .call("ha_entity.search", args(json!({"query": "porch", "domain": ""})))
            .await
            .unwrap();
        assert_eq!(result_json(&result)[0]["entity_id"], json!("light.porch"));
    }

    #[tokio::test]
    async fn todo_update_drops_empty_rename() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/services/todo/update_item"))
            .and(body_json(json!({"entity_id": "todo.shopping", "item": "milk"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        registry_for(&server)
            .call(
                "ha_todo.update_item",
                args(json!({"entity_id": "todo.shopping", "item": "milk", "rename": ""})),
            )
            .await
            .unwrap();
    }
}
