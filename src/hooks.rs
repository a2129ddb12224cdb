use std::fmt;
use std::path::PathBuf;

use crate::bridge::{BridgeHandle, Origin};
use crate::config::Config;

const UPDATE_FILE: &str = "update.json";

/// The slice of an intercepted HTTP request the hooks need. The TLS
/// terminating proxy in front of us owns the actual connection; it calls
/// `on_request` / `on_response` with these views.
pub struct HttpRequest {
    pub host: String,
    /// Path without the query string.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Vec<u8>,
}

pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        match self
            .headers
            .iter_mut()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
        {
            Some((_, existing)) => *existing = value.to_owned(),
            None => self.headers.push((name.to_owned(), value.to_owned())),
        }
    }

    /// Replace the body and keep Content-Length consistent.
    pub fn set_body(&mut self, body: Vec<u8>) {
        self.set_header("Content-Length", &body.len().to_string());
        self.body = body;
    }
}

#[derive(Debug)]
pub enum HookError {
    MissingField(&'static str),
    InvalidValue { field: &'static str, raw: String },
    Json(String),
    Io(std::io::Error),
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookError::MissingField(name) => write!(f, "Missing field: {name}"),
            HookError::InvalidValue { field, raw } => {
                write!(f, "Invalid value for {field}: {raw:?}")
            }
            HookError::Json(msg) => write!(f, "Unparseable body: {msg}"),
            HookError::Io(e) => write!(f, "File I/O failed: {e}"),
        }
    }
}

impl std::error::Error for HookError {}

impl From<std::io::Error> for HookError {
    fn from(e: std::io::Error) -> Self {
        HookError::Io(e)
    }
}

/// Request-side interception. Returns `Some(response)` to short-circuit
/// the upstream request (cached static asset).
pub fn on_request(
    bridge: &BridgeHandle,
    config: &Config,
    request: &HttpRequest,
) -> Option<HttpResponse> {
    match request.path.as_str() {
        "/clean/dev/event" | "/clean/cmd/response" => {
            if let Err(e) = handle_event_request(bridge, request) {
                tracing::warn!(path = %request.path, "Event hook failed: {e}");
            }
            None
        }
        "/clean/dev/reportMaterialStatus" => {
            if let Err(e) = handle_material_status(bridge, request) {
                tracing::warn!("Material status hook failed: {e}");
            }
            None
        }
        path if path.starts_with("/list/get") => {
            if let Err(e) = handle_ip_request(bridge, request) {
                tracing::warn!("Push server list hook failed: {e}");
            }
            None
        }
        _ if config.cache_static && is_static_path(&request.path) => {
            serve_cached_static(config, request)
        }
        _ => None,
    }
}

/// Response-side interception. Mutates the response the robot will see.
pub fn on_response(
    bridge: &BridgeHandle,
    config: &Config,
    request: &HttpRequest,
    response: &mut HttpResponse,
) {
    match request.path.as_str() {
        "/clean/dev/register" => {
            if let Err(e) = handle_register_response(bridge, response) {
                tracing::warn!("Register hook failed: {e}");
            }
        }
        path if path.starts_with("/list/get") => {
            if let Err(e) = handle_ip_response(bridge, config, response) {
                tracing::warn!("Push server list rewrite failed: {e}");
            }
        }
        "/upgrade/getNewVersion" => handle_update_response(config, response),
        "/clean/dev/sync" => {
            if let Err(e) = handle_sync_response(config, response) {
                tracing::warn!("Sync rewrite failed: {e}");
            }
        }
        _ if config.cache_static && is_static_path(&request.path) => {
            if let Err(e) = save_static_response(config, request, response) {
                tracing::warn!(path = %request.path, "Static cache write failed: {e}");
            }
        }
        _ => {}
    }
}

fn is_static_path(path: &str) -> bool {
    path.rsplit('/').next().is_some_and(|name| name.contains('.'))
}

// -- Request handlers --

fn handle_event_request(bridge: &BridgeHandle, request: &HttpRequest) -> Result<(), HookError> {
    let params = form_params(&request.body);
    if let Some(sn) = first(&params, "sn") {
        bridge.set_sn(sn);
    }

    let raw = first(&params, "data").ok_or(HookError::MissingField("data"))?;
    let data: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| HookError::Json(e.to_string()))?;

    tracing::debug!("Forwarding robot event to local control");
    bridge.push_update(Origin::Robot, data);
    Ok(())
}

fn handle_material_status(bridge: &BridgeHandle, request: &HttpRequest) -> Result<(), HookError> {
    let params = form_params(&request.body);

    let filter_total = form_u64(&params, "filterTotal")?;
    let filter_consume = form_u64(&params, "filterConsume")?;
    let main_brush_total = form_u64(&params, "mainBrushTotal")?;
    let main_brush_consume = form_u64(&params, "mainBrushConsume")?;
    let side_brush_total = form_u64(&params, "sideBrushTotal")?;
    let side_brush_consume = form_u64(&params, "sideBrushConsume")?;
    let sensor_total = form_u64(&params, "sensorTotal")?;
    let sensor_consume = form_u64(&params, "sensorConsume")?;

    let data = serde_json::json!({
        "materialStatus": {
            "filterTotal": filter_total,
            "filterConsume": filter_consume,
            "mainBrushTotal": main_brush_total,
            "mainBrushConsume": main_brush_consume,
            "sideBrushTotal": side_brush_total,
            "sideBrushConsume": side_brush_consume,
            "sensorTotal": sensor_total,
            "sensorConsume": sensor_consume,
            "percent": {
                "filter": ratio(filter_consume, filter_total, "filterTotal")?,
                "mainBrush": ratio(main_brush_consume, main_brush_total, "mainBrushTotal")?,
                "sideBrush": ratio(side_brush_consume, side_brush_total, "sideBrushTotal")?,
                "sensor": ratio(sensor_consume, sensor_total, "sensorTotal")?,
            },
        },
    });
    bridge.push_update(Origin::Robot, data);
    Ok(())
}

fn handle_ip_request(bridge: &BridgeHandle, request: &HttpRequest) -> Result<(), HookError> {
    let product = request
        .query
        .iter()
        .find(|(key, _)| key == "product")
        .map(|(_, value)| value.as_str())
        .ok_or(HookError::MissingField("product"))?;
    let product_id = product.parse().map_err(|_| HookError::InvalidValue {
        field: "product",
        raw: product.to_owned(),
    })?;

    tracing::info!(product_id, "Robot requesting push server list");
    bridge.set_product_id(product_id);
    Ok(())
}

fn serve_cached_static(config: &Config, request: &HttpRequest) -> Option<HttpResponse> {
    let path = static_file_path(config, request);
    match std::fs::read(&path) {
        Ok(body) => {
            tracing::debug!(path = %path.display(), "Serving cached static file");
            Some(HttpResponse {
                status: 200,
                headers: vec![("cached".to_owned(), "true".to_owned())],
                body,
            })
        }
        Err(_) => None,
    }
}

// -- Response handlers --

fn handle_register_response(
    bridge: &BridgeHandle,
    response: &HttpResponse,
) -> Result<(), HookError> {
    let json: serde_json::Value =
        serde_json::from_slice(&response.body).map_err(|e| HookError::Json(e.to_string()))?;

    if json.get("errno").and_then(serde_json::Value::as_i64) != Some(0) {
        tracing::error!(
            "Failed to register with server: {}",
            json.get("msg")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("Unknown error")
        );
        return Ok(());
    }

    if let Some(push_key) = json["data"]["pushKey"].as_str() {
        bridge.set_push_key(push_key);
    }
    if let Some(sid) = json["data"]["sid"].as_str() {
        bridge.set_session_id(sid);
    }
    Ok(())
}

/// The rewrite that pulls the push channel through the local bridge: learn
/// the real push server from the body, then hand the robot our own
/// address instead.
fn handle_ip_response(
    bridge: &BridgeHandle,
    config: &Config,
    response: &mut HttpResponse,
) -> Result<(), HookError> {
    let text = String::from_utf8_lossy(&response.body);
    let remote = text.split('\n').next().unwrap_or("");
    tracing::info!(%remote, "Connecting proxy to push server");

    let mut parts = remote.split(':');
    if let (Some(host), Some(port_raw), None) = (parts.next(), parts.next(), parts.next()) {
        let port = port_raw.parse().map_err(|_| HookError::InvalidValue {
            field: "port",
            raw: port_raw.to_owned(),
        })?;
        bridge.set_remote_server(host, port);
    }

    let advertised = format!(
        "{ip}:{port}\n{ip}:{port}",
        ip = config.advertised_ip,
        port = config.robot_port
    );
    tracing::info!(body = %advertised, "Overriding push server list");
    response.set_body(advertised.into_bytes());
    Ok(())
}

fn handle_update_response(config: &Config, response: &mut HttpResponse) {
    if !config.block_update {
        tracing::warn!(
            "Update response has not been blocked! The robot may update itself \
             and stop working with this proxy"
        );
        return;
    }

    let path = config.state_dir.join(UPDATE_FILE);
    if let Err(e) = std::fs::write(&path, &response.body) {
        tracing::error!(path = %path.display(), "Error saving update response: {e}");
    }

    tracing::warn!("Blocking update response");
    let body = serde_json::json!({
        "errorCode": 0,
        "errorMsg": "成功",
        "result": {"hasNew": 0},
    });
    response.set_body(
        serde_json::to_vec(&body).expect("JSON serialization cannot fail for a Value"),
    );
}

fn handle_sync_response(config: &Config, response: &mut HttpResponse) -> Result<(), HookError> {
    let json: serde_json::Value =
        serde_json::from_slice(&response.body).map_err(|e| HookError::Json(e.to_string()))?;

    if json.get("errno").and_then(serde_json::Value::as_i64) != Some(0) {
        tracing::error!(
            "Failed to sync with server: {}",
            json.get("errmsg")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("Unknown error")
        );
        return Ok(());
    }

    let mut data = json.get("data").cloned().unwrap_or_else(|| serde_json::json!({}));
    match data.get("setting").and_then(serde_json::Value::as_str) {
        Some(raw) => match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(mut settings) if settings.is_object() => {
                // Shorten the robot's reporting intervals so the local
                // observer sees map, path and status updates promptly.
                settings["mapIntv"] = config.map_intv.into();
                settings["pathIntv"] = config.path_intv.into();
                settings["statusIntv"] = config.status_intv.into();
                data["setting"] = serde_json::to_string(&settings)
                    .expect("JSON serialization cannot fail for a Value")
                    .into();
            }
            Ok(_) => tracing::error!("Settings in sync response are not a JSON object"),
            Err(e) => tracing::error!("Failed to decode JSON settings: {e}"),
        },
        None => tracing::error!("No settings found in sync response"),
    }

    response.set_body(
        serde_json::to_vec(&data).expect("JSON serialization cannot fail for a Value"),
    );
    Ok(())
}

fn save_static_response(
    config: &Config,
    request: &HttpRequest,
    response: &HttpResponse,
) -> Result<(), HookError> {
    if response.header("cached") == Some("true") {
        return Ok(());
    }

    let path = static_file_path(config, request);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, &response.body)?;
    tracing::warn!(path = %path.display(), "Saved static file");
    Ok(())
}

fn static_file_path(config: &Config, request: &HttpRequest) -> PathBuf {
    config
        .data_path
        .join(&request.host)
        .join(request.path.trim_start_matches('/'))
}

// -- Form body helpers --

fn form_params(body: &[u8]) -> Vec<(String, String)> {
    form_urlencoded::parse(body).into_owned().collect()
}

fn first<'a>(params: &'a [(String, String)], key: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, value)| value.as_str())
}

fn form_u64(params: &[(String, String)], field: &'static str) -> Result<u64, HookError> {
    let raw = first(params, field).ok_or(HookError::MissingField(field))?;
    raw.parse().map_err(|_| HookError::InvalidValue {
        field,
        raw: raw.to_owned(),
    })
}

fn ratio(consume: u64, total: u64, field: &'static str) -> Result<f64, HookError> {
    if total == 0 {
        return Err(HookError::InvalidValue {
            field,
            raw: "0".to_owned(),
        });
    }
    Ok(consume as f64 / total as f64)
}
