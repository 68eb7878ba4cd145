use std::collections::HashMap;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::config::HomeAssistantConfig;
use crate::error::{HaError, Result};
use crate::template;

// =============================================================================
// Home Assistant REST Types
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateContext {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// A state object as returned by `/api/states`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub last_changed: Option<String>,
    #[serde(default)]
    pub last_updated: Option<String>,
    #[serde(default)]
    pub context: StateContext,
}

impl EntityState {
    pub fn matches_domain(&self, domain: &str) -> bool {
        self.entity_id
            .strip_prefix(domain)
            .is_some_and(|rest| rest.starts_with('.'))
    }

    pub fn friendly_name(&self) -> Option<&str> {
        self.attributes.get("friendly_name").and_then(|v| v.as_str())
    }
}

/// Where an entity lives, resolved through template rendering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMeta {
    #[serde(default)]
    pub area: Option<String>,
    #[serde(default)]
    pub device: Option<String>,
}

// =============================================================================
// REST Client
// =============================================================================

#[derive(Debug, Clone)]
pub struct HomeAssistantClient {
    base_url: String,
    http_client: Client,
}

impl HomeAssistantClient {
    pub fn new(config: &HomeAssistantConfig) -> Result<Self> {
        let mut bearer = HeaderValue::from_str(&format!("Bearer {}", config.token))
            .map_err(|_| HaError::InvalidConfig("HA_TOKEN contains invalid header characters".into()))?;
        bearer.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http_client = Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()
            .map_err(|e| HaError::InvalidConfig(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: config.url.clone(),
            http_client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, endpoint: &str) -> RequestBuilder {
        self.http_client
            .request(method, format!("{}{}", self.base_url, endpoint))
    }

    async fn send(&self, builder: RequestBuilder, endpoint: &str) -> Result<reqwest::Response> {
        tracing::debug!(endpoint, "home assistant request");
        let response = builder
            .send()
            .await
            .map_err(|e| HaError::from_reqwest(e, &self.base_url, endpoint))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(endpoint, %status, "home assistant returned an error");
            return Err(HaError::Status {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or_default().to_string(),
                body,
            });
        }

        Ok(response)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
        endpoint: &str,
    ) -> Result<T> {
        self.send(builder, endpoint)
            .await?
            .json()
            .await
            .map_err(|e| HaError::from_reqwest(e, &self.base_url, endpoint))
    }

    async fn send_text(&self, builder: RequestBuilder, endpoint: &str) -> Result<String> {
        self.send(builder, endpoint)
            .await?
            .text()
            .await
            .map_err(|e| HaError::from_reqwest(e, &self.base_url, endpoint))
    }

    // -------------------------------------------------------------------------
    // States
    // -------------------------------------------------------------------------

    pub async fn get_states(&self) -> Result<Vec<EntityState>> {
        let endpoint = "/api/states";
        self.send_json(self.request(Method::GET, endpoint), endpoint).await
    }

    pub async fn get_states_by_domain(&self, domain: &str) -> Result<Vec<EntityState>> {
        let mut states = self.get_states().await?;
        states.retain(|s| s.matches_domain(domain));
        Ok(states)
    }

    pub async fn get_state(&self, entity_id: &str) -> Result<EntityState> {
        let endpoint = format!("/api/states/{entity_id}");
        self.send_json(self.request(Method::GET, &endpoint), &endpoint)
            .await
    }

    // -------------------------------------------------------------------------
    // Services
    // -------------------------------------------------------------------------

    /// Call a service and return Home Assistant's answer untouched, normally
    /// the list of states it changed.
    pub async fn call_service(
        &self,
        domain: &str,
        service: &str,
        data: Option<Value>,
    ) -> Result<Value> {
        let endpoint = format!("/api/services/{domain}/{service}");
        let body = data.unwrap_or_else(|| json!({}));
        tracing::info!(domain, service, "calling service");
        self.send_json(self.request(Method::POST, &endpoint).json(&body), &endpoint)
            .await
    }

    /// Like [`call_service`](Self::call_service), decoding the changed states.
    pub async fn call_service_for_states(
        &self,
        domain: &str,
        service: &str,
        data: Option<Value>,
    ) -> Result<Vec<EntityState>> {
        let changed = self.call_service(domain, service, data).await?;
        serde_json::from_value(changed).map_err(|source| HaError::Shape {
            endpoint: format!("/api/services/{domain}/{service}"),
            source,
        })
    }

    /// Call a service that returns data (e.g. `todo.get_items`) rather than state changes.
    pub async fn call_service_with_response(
        &self,
        domain: &str,
        service: &str,
        data: Option<Value>,
    ) -> Result<Value> {
        let endpoint = format!("/api/services/{domain}/{service}?return_response");
        let body = data.unwrap_or_else(|| json!({}));
        tracing::info!(domain, service, "calling service with response");
        self.send_json(self.request(Method::POST, &endpoint).json(&body), &endpoint)
            .await
    }

    // -------------------------------------------------------------------------
    // Template Rendering
    // -------------------------------------------------------------------------

    /// Render a Jinja template. The body is returned verbatim; Home Assistant
    /// prints Python reprs here, so it is never decoded as JSON.
    pub async fn render_template(&self, template: &str) -> Result<String> {
        let endpoint = "/api/template";
        let builder = self
            .request(Method::POST, endpoint)
            .json(&json!({ "template": template }));
        self.send_text(builder, endpoint).await
    }

    pub async fn get_areas(&self) -> Result<Vec<String>> {
        let raw = self.render_template("{{ areas() | list }}").await?;
        Ok(template::parse_list(&raw))
    }

    pub async fn get_area_name(&self, area_id: &str) -> Result<String> {
        let raw = self
            .render_template(&format!("{{{{ area_name({}) }}}}", template::quote(area_id)))
            .await?;
        Ok(raw.trim().to_string())
    }

    pub async fn get_entities_in_area(&self, area_id: &str) -> Result<Vec<String>> {
        let raw = self
            .render_template(&format!(
                "{{{{ area_entities({}) | list }}}}",
                template::quote(area_id)
            ))
            .await?;
        Ok(template::parse_list(&raw))
    }

    /// Resolve area and device names for a batch of entities in one render.
    ///
    /// The entity's own area wins over its device's area. Unparseable output
    /// yields an empty map rather than an error.
    pub async fn get_entity_meta_map(
        &self,
        entity_ids: &[String],
    ) -> Result<HashMap<String, EntityMeta>> {
        if entity_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let raw = self.render_template(&entity_meta_template(entity_ids)).await?;
        Ok(parse_entity_meta(&raw))
    }
}

fn entity_meta_template(entity_ids: &[String]) -> String {
    let id_list = entity_ids
        .iter()
        .map(|id| template::quote(id))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        r#"{{%- set ns = namespace(d={{}}) -%}}
{{%- for eid in [{id_list}] -%}}
  {{%- set ea = area_name(eid) -%}}
  {{%- set da = device_attr(eid, 'area_id') -%}}
  {{%- set dn = device_attr(eid, 'name_by_user') or device_attr(eid, 'name') -%}}
  {{%- set area = ea if ea else (area_name(da) if da else None) -%}}
  {{%- set ns.d = dict(ns.d, **{{eid: {{'area': area, 'device': dn}}}}) -%}}
{{%- endfor -%}}
{{{{ ns.d | tojson }}}}"#
    )
}

fn parse_entity_meta(raw: &str) -> HashMap<String, EntityMeta> {
    let value = serde_json::from_str::<Value>(raw.trim())
        .ok()
        .or_else(|| template::parse_literal(raw).ok());

    match value.map(serde_json::from_value::<HashMap<String, EntityMeta>>) {
        Some(Ok(map)) => map,
        _ => {
            tracing::warn!("could not parse entity metadata template output");
            HashMap::new()
        }
    }
}
