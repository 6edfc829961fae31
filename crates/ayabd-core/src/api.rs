//! Control API
//!
//! Clients connect over TCP and send one JSON request
//! `{"method": "GET"|"POST", "uri": "/queue", "data": {...}}`. The daemon
//! answers with `{"result": ...}` or `{"error": "..."}` followed by a newline
//! and closes the connection. The request does not need a terminating newline;
//! the web front end writes the bare JSON and reads until EOF.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, info, warn};

use crate::pattern::QueueError;
use crate::protocol::ProtocolError;
use crate::service::ServiceHandle;

/// Requests larger than this are rejected
pub const MAX_REQUEST_LEN: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Unknown request: {method} {uri}")]
    UnknownEndpoint { method: String, uri: String },

    #[error("Missing parameter '{0}'")]
    MissingParameter(&'static str),

    #[error("Invalid value for '{name}': {value}")]
    InvalidParameter { name: &'static str, value: String },

    #[error("Request too large")]
    RequestTooLarge,

    #[error("Not in simulation mode")]
    NotSimulated,

    #[error("Knitting service is not running")]
    ServiceUnavailable,

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A request as sent by the web front end
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiRequest {
    pub method: String,
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Query parameters, used when there is no JSON body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri_params: Option<Value>,
}

impl ApiRequest {
    pub fn new(method: &str, uri: &str, data: Option<Value>) -> Self {
        Self {
            method: method.to_string(),
            uri: uri.to_string(),
            data,
            uri_params: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ApiResponse {
    pub fn ok(result: Value) -> Self {
        Self {
            result: Some(result),
            error: None,
        }
    }

    pub fn error(error: &ApiError) -> Self {
        Self {
            result: None,
            error: Some(error.to_string()),
        }
    }
}

impl From<Result<Value, ApiError>> for ApiResponse {
    fn from(result: Result<Value, ApiError>) -> Self {
        match result {
            Ok(value) => ApiResponse::ok(value),
            Err(e) => ApiResponse::error(&e),
        }
    }
}

/// Queue configuration changes, all optional
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachineSettings {
    pub width: Option<usize>,
    pub shift: Option<i32>,
    pub ribber: Option<bool>,
    pub colors: Option<u8>,
}

impl MachineSettings {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Everything the control API can ask the knitting service to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCommand {
    GetQueue,
    AddFile { path: PathBuf, web_url: String },
    AddSpacer { length: usize },
    RemoveEntry { index: usize, delete_file: bool },
    GetCursor,
    MoveCursor {
        position: i64,
        relative: bool,
        boundary: bool,
    },
    GetMachine,
    Restart,
    Configure(MachineSettings),
    Simulate { row: bool, full_speed: Option<bool> },
}

impl ApiCommand {
    pub fn parse(request: &ApiRequest) -> Result<Self, ApiError> {
        let empty = Value::Null;
        let data = request
            .data
            .as_ref()
            .or(request.uri_params.as_ref())
            .unwrap_or(&empty);
        let uri = request.uri.trim_matches('/');
        let method = request.method.to_ascii_uppercase();

        match (method.as_str(), uri) {
            ("GET", "queue") => Ok(ApiCommand::GetQueue),
            ("GET", "cursor") => Ok(ApiCommand::GetCursor),
            ("GET", "machine") => Ok(ApiCommand::GetMachine),
            ("POST" | "PUT", "queue") => Self::parse_queue(data),
            ("POST" | "PUT", "cursor") => Ok(ApiCommand::MoveCursor {
                position: int_param(data, "setPosition")?
                    .ok_or(ApiError::MissingParameter("setPosition"))?,
                relative: bool_param(data, "relative")?.unwrap_or(false),
                boundary: bool_param(data, "boundary")?.unwrap_or(false),
            }),
            ("POST" | "PUT", "machine") => Self::parse_machine(data),
            _ => Err(ApiError::UnknownEndpoint {
                method: request.method.clone(),
                uri: request.uri.clone(),
            }),
        }
    }

    fn parse_queue(data: &Value) -> Result<Self, ApiError> {
        if let Some(path) = data.get("addFile") {
            let path = path.as_str().ok_or_else(|| ApiError::InvalidParameter {
                name: "addFile",
                value: path.to_string(),
            })?;
            let web_url = data
                .get("webURL")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            return Ok(ApiCommand::AddFile {
                path: PathBuf::from(path),
                web_url,
            });
        }
        if let Some(length) = int_param(data, "addSpacer")? {
            return Ok(ApiCommand::AddSpacer {
                length: to_unsigned("addSpacer", length)?,
            });
        }
        if let Some(index) = int_param(data, "removeFile")? {
            return Ok(ApiCommand::RemoveEntry {
                index: to_unsigned("removeFile", index)?,
                delete_file: bool_param(data, "delete")?.unwrap_or(false),
            });
        }
        Err(ApiError::MissingParameter("addFile"))
    }

    fn parse_machine(data: &Value) -> Result<Self, ApiError> {
        if bool_param(data, "restart")?.unwrap_or(false) {
            return Ok(ApiCommand::Restart);
        }
        let row = bool_param(data, "simulateRow")?.unwrap_or(false);
        let full_speed = bool_param(data, "fullSpeed")?;
        if row || full_speed.is_some() {
            return Ok(ApiCommand::Simulate { row, full_speed });
        }

        let settings = MachineSettings {
            width: int_param(data, "setWidth")?
                .map(|w| to_unsigned("setWidth", w))
                .transpose()?,
            shift: int_param(data, "setShift")?
                .map(|s| {
                    i32::try_from(s).map_err(|_| ApiError::InvalidParameter {
                        name: "setShift",
                        value: s.to_string(),
                    })
                })
                .transpose()?,
            ribber: bool_param(data, "setRibber")?,
            colors: int_param(data, "setColors")?
                .map(|c| {
                    u8::try_from(c).map_err(|_| ApiError::InvalidParameter {
                        name: "setColors",
                        value: c.to_string(),
                    })
                })
                .transpose()?,
        };
        if settings.is_empty() {
            return Err(ApiError::MissingParameter("setWidth"));
        }
        Ok(ApiCommand::Configure(settings))
    }
}

/// Integer parameter given as JSON number or numeric string (form values arrive as strings)
fn int_param(data: &Value, name: &'static str) -> Result<Option<i64>, ApiError> {
    let invalid = |value: &Value| ApiError::InvalidParameter {
        name,
        value: value.to_string(),
    };
    match data.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .map(Some)
            .ok_or_else(|| invalid(&Value::Number(n.clone()))),
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| invalid(&Value::String(s.clone()))),
        Some(other) => Err(invalid(other)),
    }
}

/// Boolean parameter given as JSON bool, number or string
fn bool_param(data: &Value, name: &'static str) -> Result<Option<bool>, ApiError> {
    match data.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(Value::Number(n)) => Ok(Some(n.as_f64().is_some_and(|f| f != 0.0))),
        Some(Value::String(s)) => match s.trim() {
            "true" | "1" | "on" | "yes" => Ok(Some(true)),
            "false" | "0" | "off" | "no" | "" => Ok(Some(false)),
            other => Err(ApiError::InvalidParameter {
                name,
                value: other.to_string(),
            }),
        },
        Some(other) => Err(ApiError::InvalidParameter {
            name,
            value: other.to_string(),
        }),
    }
}

fn to_unsigned(name: &'static str, value: i64) -> Result<usize, ApiError> {
    usize::try_from(value).map_err(|_| ApiError::InvalidParameter {
        name,
        value: value.to_string(),
    })
}

/// Splits the byte stream into JSON requests and writes newline terminated responses
#[derive(Debug, Default)]
pub struct JsonCodec;

impl Decoder for JsonCodec {
    type Item = ApiRequest;
    type Error = ApiError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ApiRequest>, ApiError> {
        let start = src
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .unwrap_or(src.len());
        src.advance(start);
        if src.is_empty() {
            return Ok(None);
        }

        let mut stream = serde_json::Deserializer::from_slice(&src[..]).into_iter::<ApiRequest>();
        let next = stream.next();
        let consumed = stream.byte_offset();
        match next {
            None => Ok(None),
            Some(Ok(request)) => {
                src.advance(consumed);
                Ok(Some(request))
            }
            Some(Err(e)) if e.is_eof() => {
                if src.len() > MAX_REQUEST_LEN {
                    src.clear();
                    return Err(ApiError::RequestTooLarge);
                }
                Ok(None)
            }
            Some(Err(e)) => {
                src.clear();
                Err(e.into())
            }
        }
    }
}

impl Encoder<ApiResponse> for JsonCodec {
    type Error = ApiError;

    fn encode(&mut self, response: ApiResponse, dst: &mut BytesMut) -> Result<(), ApiError> {
        let json = serde_json::to_vec(&response)?;
        dst.reserve(json.len() + 1);
        dst.extend_from_slice(&json);
        dst.extend_from_slice(b"\n");
        Ok(())
    }
}

/// Address the API listens on
pub fn listen_addr(port: u16, non_local: bool) -> SocketAddr {
    let ip = if non_local {
        Ipv4Addr::UNSPECIFIED
    } else {
        Ipv4Addr::LOCALHOST
    };
    SocketAddr::from((ip, port))
}

/// Run a request through the service
pub async fn respond(handle: &ServiceHandle, request: ApiRequest) -> ApiResponse {
    debug!("API request: {} {}", request.method, request.uri);
    let result = match ApiCommand::parse(&request) {
        Ok(command) => handle.call(command).await,
        Err(e) => Err(e),
    };
    if let Err(e) = &result {
        warn!("API {} {} failed: {}", request.method, request.uri, e);
    }
    result.into()
}

/// Accept API connections until the listener fails
pub async fn serve(listener: TcpListener, handle: ServiceHandle) -> Result<(), ApiError> {
    info!("Control API listening on {}", listener.local_addr()?);
    loop {
        let (stream, peer) = listener.accept().await?;
        let handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, &handle).await {
                debug!("API connection from {} ended: {}", peer, e);
            }
        });
    }
}

/// Answer one request, then close the connection
async fn handle_connection(mut stream: TcpStream, handle: &ServiceHandle) -> Result<(), ApiError> {
    let mut codec = JsonCodec;
    let mut buffer = BytesMut::with_capacity(1024);
    let response = loop {
        match codec.decode(&mut buffer) {
            Ok(Some(request)) => break respond(handle, request).await,
            Ok(None) => {
                if stream.read_buf(&mut buffer).await? == 0 {
                    // closed without a complete request
                    return Ok(());
                }
            }
            Err(e) => break ApiResponse::error(&e),
        }
    };
    let mut out = BytesMut::new();
    codec.encode(response, &mut out)?;
    stream.write_all(&out).await?;
    stream.shutdown().await?;
    Ok(())
}
