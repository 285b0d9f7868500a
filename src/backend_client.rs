#![cfg_attr(feature = "mock", allow(dead_code, unused_imports))]

use crate::{config::AppConfig, http_client::handle_http_response};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use log::debug;
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::{fmt::Debug, time::Duration};

pub type FacilityId = i64;
pub type DeviceId = i64;
pub type DeviceManagerId = i64;
pub type DeviceTemplateId = i64;

/// Device type reported by the backend for sensor devices.
pub const SENSOR_DEVICE_TYPE: &str = "sensor";

/// Template category of photovoltaic systems.
pub const PV_TEMPLATE_CATEGORY: &str = "PV";

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ConnectionState {
    #[serde(rename = "Not Connected")]
    NotConnected,
    #[serde(rename = "Connected")]
    Connected,
    #[serde(rename = "Configured")]
    Configured,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Facility {
    pub id: FacilityId,
    pub name: String,
    pub connection_state: ConnectionState,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceTemplate {
    pub id: DeviceTemplateId,
    pub category: String,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub make: String,
    pub model: String,
    pub protocol: Option<String>,
    pub address: Option<String>,
    pub port: Option<u16>,
    pub settings: Option<serde_json::Value>,
    pub polling_interval: Option<u32>,
    pub verbosity: Option<u32>,
}

impl DeviceTemplate {
    /// A device was created from this template if type, make and model agree.
    pub fn matches(&self, device: &Device) -> bool {
        self.device_type == device.device_type
            && self.make == device.make
            && self.model == device.model
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: DeviceId,
    pub facility_id: FacilityId,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub make: String,
    pub model: String,
    pub protocol: Option<String>,
    pub address: Option<String>,
    pub port: Option<u16>,
    pub settings: Option<serde_json::Value>,
    pub polling_interval: Option<u32>,
    pub parent_id: Option<DeviceId>,
    pub verbosity: Option<u32>,
}

impl Device {
    pub fn is_sensor(&self) -> bool {
        self.device_type == SENSOR_DEVICE_TYPE
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDeviceRequest {
    pub facility_id: FacilityId,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub make: String,
    pub model: String,
    pub protocol: Option<String>,
    pub address: Option<String>,
    pub port: Option<u16>,
    pub settings: Option<serde_json::Value>,
    pub polling_interval: Option<u32>,
    pub verbosity: Option<u32>,
}

impl CreateDeviceRequest {
    pub fn from_template(facility_id: FacilityId, template: &DeviceTemplate) -> Self {
        Self {
            facility_id,
            name: template.name.clone(),
            device_type: template.device_type.clone(),
            make: template.make.clone(),
            model: template.model.clone(),
            protocol: template.protocol.clone(),
            address: template.address.clone(),
            port: template.port,
            settings: template.settings.clone(),
            polling_interval: template.polling_interval,
            verbosity: template.verbosity,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDeviceRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub make: String,
    pub model: String,
    pub protocol: Option<String>,
    pub address: Option<String>,
    pub port: Option<u16>,
    pub settings: Option<serde_json::Value>,
    pub polling_interval: Option<u32>,
    pub parent_id: Option<DeviceId>,
    pub verbosity: Option<u32>,
}

impl UpdateDeviceRequest {
    /// Keep every field of `device` but give it a new name.
    pub fn rename(device: &Device, name: &str) -> Self {
        Self {
            name: name.to_string(),
            device_type: device.device_type.clone(),
            make: device.make.clone(),
            model: device.model.clone(),
            protocol: device.protocol.clone(),
            address: device.address.clone(),
            port: device.port,
            settings: device.settings.clone(),
            polling_interval: device.polling_interval,
            parent_id: device.parent_id,
            verbosity: device.verbosity,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceManager {
    pub id: DeviceManagerId,
    pub short_code: String,
    pub facility_id: Option<FacilityId>,
    #[serde(default)]
    pub is_online: bool,
    pub update_progress: Option<u8>,
}

impl DeviceManager {
    /// The install has finished when no progress is reported or it reached 100.
    pub fn update_finished(&self) -> bool {
        self.update_progress.is_none_or(|progress| progress >= 100)
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectDeviceManager {
    facility_id: FacilityId,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum ResponseStatus {
    Ok,
    Error,
}

#[derive(Debug, Deserialize)]
struct ResponseError {
    message: String,
}

/// Every backend payload is wrapped into `{ "status": .., "error": {..}, ..payload }`
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: ResponseStatus,
    error: Option<ResponseError>,
    #[serde(flatten)]
    payload: Option<T>,
}

#[derive(Debug, Deserialize)]
struct FacilityPayload {
    facility: Facility,
}

#[derive(Debug, Deserialize)]
struct TemplatesPayload {
    templates: Vec<DeviceTemplate>,
}

#[derive(Debug, Deserialize)]
struct DevicesPayload {
    devices: Vec<Device>,
}

#[derive(Debug, Deserialize)]
struct CreatedPayload {
    id: DeviceId,
}

#[derive(Debug, Deserialize)]
struct ManagersPayload {
    managers: Vec<DeviceManager>,
}

#[derive(Debug, Deserialize)]
struct ManagerPayload {
    manager: DeviceManager,
}

#[derive(Debug, Deserialize)]
struct Empty {}

/// Parse an enveloped backend body and return its payload
fn parse_envelope<T: DeserializeOwned>(body: &str, context_msg: &str) -> Result<T> {
    let envelope: Envelope<T> =
        serde_json::from_str(body).context(format!("failed to parse {context_msg} response"))?;

    if envelope.status == ResponseStatus::Error {
        let message = envelope
            .error
            .map(|e| e.message)
            .unwrap_or_else(|| "unknown error".to_string());
        bail!("{context_msg} failed: {message}");
    }

    envelope
        .payload
        .context(format!("{context_msg} response has no payload"))
}

#[cfg_attr(any(test, feature = "mock"), automock)]
#[async_trait]
pub trait SetupBackend: Send + Sync {
    async fn facility(&self, facility_id: FacilityId) -> Result<Facility>;
    async fn device_templates(&self, category: &str) -> Result<Vec<DeviceTemplate>>;
    async fn facility_devices(&self, facility_id: FacilityId) -> Result<Vec<Device>>;
    async fn create_device(&self, request: CreateDeviceRequest) -> Result<DeviceId>;
    async fn update_device(&self, device_id: DeviceId, request: UpdateDeviceRequest)
    -> Result<()>;
    async fn device_manager_by_short_code(&self, short_code: &str)
    -> Result<Option<DeviceManager>>;
    async fn device_manager_for_facility(
        &self,
        facility_id: FacilityId,
    ) -> Result<Option<DeviceManager>>;
    async fn device_manager(&self, manager_id: DeviceManagerId) -> Result<DeviceManager>;
    async fn connect_device_manager(
        &self,
        manager_id: DeviceManagerId,
        facility_id: FacilityId,
    ) -> Result<()>;
    async fn mark_configured(&self, facility_id: FacilityId) -> Result<()>;
}

#[derive(Clone)]
pub struct BackendClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl BackendClient {
    const DEVICES_ENDPOINT: &str = "/api/v1/devices";
    const TEMPLATES_ENDPOINT: &str = "/api/v1/devices/templates";
    const MANAGERS_ENDPOINT: &str = "/api/v1/devices/managers";
    const FACILITIES_ENDPOINT: &str = "/api/v1/facilities";

    pub fn new() -> Result<Self> {
        let config = &AppConfig::get().backend;
        Self::with_base_url(&config.url, config.token.clone(), config.request_timeout)
    }

    pub fn with_base_url(
        base_url: &str,
        token: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .timeout(request_timeout)
            .build()
            .context("failed to create backend HTTP client")?;

        Ok(BackendClient {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn build_url(&self, path: &str) -> String {
        // Normalize path to always start with a single "/"
        let normalized_path = path.trim_start_matches('/');
        format!("{}/{normalized_path}", self.base_url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// GET request to the backend API
    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.build_url(path);
        debug!("GET {url}");

        let res = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .context(format!("failed to send GET request to {url}"))?;

        let body = handle_http_response(res, &format!("GET {url}")).await?;
        parse_envelope(&body, &format!("GET {url}"))
    }

    /// POST or PUT request to the backend API with JSON body
    async fn send_json<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: impl Debug + Serialize,
    ) -> Result<T> {
        let url = self.build_url(path);
        debug!("{method} {url} with body: {body:?}");

        let res = self
            .authorize(self.client.request(method.clone(), &url))
            .json(&body)
            .send()
            .await
            .context(format!("failed to send {method} request to {url}"))?;

        let body = handle_http_response(res, &format!("{method} {url}")).await?;
        parse_envelope(&body, &format!("{method} {url}"))
    }
}

#[async_trait]
impl SetupBackend for BackendClient {
    async fn facility(&self, facility_id: FacilityId) -> Result<Facility> {
        let payload: FacilityPayload = self
            .get(&format!("{}/{facility_id}", Self::FACILITIES_ENDPOINT))
            .await?;
        Ok(payload.facility)
    }

    async fn device_templates(&self, category: &str) -> Result<Vec<DeviceTemplate>> {
        let payload: TemplatesPayload = self
            .get(&format!("{}?category={category}", Self::TEMPLATES_ENDPOINT))
            .await?;
        Ok(payload.templates)
    }

    async fn facility_devices(&self, facility_id: FacilityId) -> Result<Vec<Device>> {
        let payload: DevicesPayload = self
            .get(&format!("{}/{facility_id}/devices", Self::FACILITIES_ENDPOINT))
            .await?;
        Ok(payload.devices)
    }

    async fn create_device(&self, request: CreateDeviceRequest) -> Result<DeviceId> {
        let payload: CreatedPayload = self
            .send_json(reqwest::Method::POST, Self::DEVICES_ENDPOINT, request)
            .await?;
        Ok(payload.id)
    }

    async fn update_device(
        &self,
        device_id: DeviceId,
        request: UpdateDeviceRequest,
    ) -> Result<()> {
        let _: Empty = self
            .send_json(
                reqwest::Method::PUT,
                &format!("{}/{device_id}", Self::DEVICES_ENDPOINT),
                request,
            )
            .await?;
        Ok(())
    }

    async fn device_manager_by_short_code(
        &self,
        short_code: &str,
    ) -> Result<Option<DeviceManager>> {
        let payload: ManagersPayload = self
            .get(&format!("{}?shortCode={short_code}", Self::MANAGERS_ENDPOINT))
            .await?;
        Ok(payload.managers.into_iter().next())
    }

    async fn device_manager_for_facility(
        &self,
        facility_id: FacilityId,
    ) -> Result<Option<DeviceManager>> {
        let payload: ManagersPayload = self
            .get(&format!("{}?facilityId={facility_id}", Self::MANAGERS_ENDPOINT))
            .await?;
        Ok(payload.managers.into_iter().next())
    }

    async fn device_manager(&self, manager_id: DeviceManagerId) -> Result<DeviceManager> {
        let payload: ManagerPayload = self
            .get(&format!("{}/{manager_id}", Self::MANAGERS_ENDPOINT))
            .await?;
        Ok(payload.manager)
    }

    async fn connect_device_manager(
        &self,
        manager_id: DeviceManagerId,
        facility_id: FacilityId,
    ) -> Result<()> {
        let _: Empty = self
            .send_json(
                reqwest::Method::POST,
                &format!("{}/{manager_id}/connect", Self::MANAGERS_ENDPOINT),
                ConnectDeviceManager { facility_id },
            )
            .await?;
        Ok(())
    }

    async fn mark_configured(&self, facility_id: FacilityId) -> Result<()> {
        let _: Empty = self
            .send_json(
                reqwest::Method::POST,
                &format!("{}/{facility_id}/configured", Self::FACILITIES_ENDPOINT),
                serde_json::json!({}),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_client() -> BackendClient {
        BackendClient::with_base_url("http://backend.local/", None, Duration::from_secs(30))
            .unwrap()
    }

    mod build_url {
        use super::*;

        #[test]
        fn normalizes_path_with_leading_slash() {
            let client = create_test_client();
            let url = client.build_url("/api/v1/devices");
            assert_eq!(url, "http://backend.local/api/v1/devices");
        }

        #[test]
        fn normalizes_path_without_leading_slash() {
            let client = create_test_client();
            let url = client.build_url("api/v1/devices");
            assert_eq!(url, "http://backend.local/api/v1/devices");
        }

        #[test]
        fn normalizes_path_with_multiple_leading_slashes() {
            let client = create_test_client();
            let url = client.build_url("///api/v1/devices");
            assert_eq!(url, "http://backend.local/api/v1/devices");
        }
    }

    mod envelope {
        use super::*;

        #[test]
        fn ok_status_returns_payload() {
            let body = r#"{"status":"ok","facility":{"id":42,"name":"Seed Bank","connectionState":"Not Connected"}}"#;
            let payload: FacilityPayload = parse_envelope(body, "facility").unwrap();
            assert_eq!(payload.facility.id, 42);
            assert_eq!(
                payload.facility.connection_state,
                ConnectionState::NotConnected
            );
        }

        #[test]
        fn error_status_is_reported_with_message() {
            let body = r#"{"status":"error","error":{"message":"no such facility"}}"#;
            let result: Result<FacilityPayload> = parse_envelope(body, "facility");
            let err = result.unwrap_err().to_string();
            assert!(err.contains("no such facility"));
        }

        #[test]
        fn missing_payload_is_an_error() {
            let body = r#"{"status":"ok"}"#;
            let result: Result<FacilityPayload> = parse_envelope(body, "facility");
            assert!(result.is_err());
        }

        #[test]
        fn empty_payload_accepts_bare_ok() {
            let body = r#"{"status":"ok"}"#;
            let result: Result<Empty> = parse_envelope(body, "configure");
            assert!(result.is_ok());
        }

        #[test]
        fn managers_list_may_be_empty() {
            let body = r#"{"status":"ok","managers":[]}"#;
            let payload: ManagersPayload = parse_envelope(body, "managers").unwrap();
            assert!(payload.managers.is_empty());
        }
    }

    mod domain {
        use super::*;

        fn template() -> DeviceTemplate {
            DeviceTemplate {
                id: 1,
                category: PV_TEMPLATE_CATEGORY.to_string(),
                name: "Blue Ion LX".to_string(),
                device_type: "BMU".to_string(),
                make: "Blue Ion".to_string(),
                model: "LX".to_string(),
                protocol: Some("modbus".to_string()),
                address: Some("192.168.2.50".to_string()),
                port: Some(502),
                settings: None,
                polling_interval: Some(60),
                verbosity: None,
            }
        }

        #[test]
        fn create_request_copies_template_fields() {
            let request = CreateDeviceRequest::from_template(42, &template());
            assert_eq!(request.facility_id, 42);
            assert_eq!(request.device_type, "BMU");
            assert_eq!(request.make, "Blue Ion");
            assert_eq!(request.model, "LX");
            assert_eq!(request.port, Some(502));
        }

        #[test]
        fn update_progress_semantics() {
            let mut manager = DeviceManager {
                id: 1,
                short_code: "123456".to_string(),
                facility_id: None,
                is_online: true,
                update_progress: Some(40),
            };
            assert!(!manager.update_finished());
            manager.update_progress = Some(100);
            assert!(manager.update_finished());
            manager.update_progress = None;
            assert!(manager.update_finished());
        }

        #[test]
        fn connection_state_uses_backend_spelling() {
            let json = serde_json::to_string(&ConnectionState::NotConnected).unwrap();
            assert_eq!(json, r#""Not Connected""#);
        }
    }
}
