// agent/src/server.rs

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::{error, info, warn};
use zeroize::Zeroizing;

use crate::provider::{CreateParams, JoinOutcome, JoinResult, RealmProvider};

/// One newline-delimited JSON request on the agent socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum AgentRequest {
    Create {
        realm: String,
        hostfqdn: String,
        #[serde(default)]
        params: Map<String, Value>,
    },
    Delete {
        realm: String,
        hostfqdn: String,
    },
    Find {
        hostfqdn: String,
    },
}

#[derive(Debug, Default, Serialize)]
pub struct AgentResponse<'a> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub randompassword: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<&'a JoinOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub found: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// 🛡️ Responses may carry the one-time password, so the encoded buffer is
/// zeroized once it has been written to the socket.
fn render(response: &AgentResponse<'_>) -> Zeroizing<String> {
    match serde_json::to_string(response) {
        Ok(body) => Zeroizing::new(body),
        Err(e) => {
            error!("Failed to encode response: {}", e);
            Zeroizing::new(r#"{"success":false,"error_message":"Failed to encode response"}"#.to_string())
        }
    }
}

fn construct_error_response(err_msg: &str) -> Zeroizing<String> {
    render(&AgentResponse {
        success: false,
        error_message: Some(err_msg.to_string()),
        ..AgentResponse::default()
    })
}

fn construct_create_response(result: &JoinResult) -> Zeroizing<String> {
    result.password.use_secret(|password| {
        render(&AgentResponse {
            success: true,
            randompassword: Some(password),
            outcome: Some(&result.outcome),
            ..AgentResponse::default()
        })
    })
}

/// Only the literal `"true"` (or a JSON `true`) requests a rebuild.
fn create_params(params: &Map<String, Value>) -> CreateParams {
    let rebuild = match params.get("rebuild") {
        Some(Value::String(s)) => s == "true",
        Some(Value::Bool(b)) => *b,
        _ => false,
    };
    CreateParams { rebuild }
}

pub struct RealmAgentService {
    provider: RealmProvider,
    expected_api_uid: u32,
}

impl RealmAgentService {
    pub fn new(provider: RealmProvider, expected_api_uid: u32) -> Self {
        Self {
            provider,
            expected_api_uid,
        }
    }

    /// 🛡️ SO_PEERCRED gate: root and the configured API user only.
    pub fn is_authorized(&self, uid: u32) -> bool {
        uid == 0 || uid == self.expected_api_uid
    }

    /// Serves one client until it closes the connection.
    pub async fn serve_connection(&self, stream: UnixStream) {
        let uid = match stream.peer_cred() {
            Ok(cred) => cred.uid(),
            Err(e) => {
                warn!("Dropping connection without peer credentials: {}", e);
                return;
            }
        };
        if !self.is_authorized(uid) {
            warn!("🚫 Rejected connection from unauthorized uid {}", uid);
            return;
        }

        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read request: {}", e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let mut response = self.handle_line(&line).await;
            response.push('\n');
            if let Err(e) = writer.write_all(response.as_bytes()).await {
                warn!("Failed to write response: {}", e);
                break;
            }
        }
    }

    pub async fn handle_line(&self, line: &str) -> Zeroizing<String> {
        match serde_json::from_str::<AgentRequest>(line) {
            Ok(request) => self.dispatch(request).await,
            Err(e) => construct_error_response(&format!("Malformed request: {}", e)),
        }
    }

    async fn dispatch(&self, request: AgentRequest) -> Zeroizing<String> {
        match request {
            AgentRequest::Create {
                realm,
                hostfqdn,
                params,
            } => match self.provider.create(&realm, &hostfqdn, &create_params(&params)).await {
                Ok(result) => construct_create_response(&result),
                Err(e) => {
                    warn!("Create for {} failed: {}", hostfqdn, e);
                    construct_error_response(&e.to_string())
                }
            },
            AgentRequest::Delete { realm, hostfqdn } => {
                match self.provider.delete(&realm, &hostfqdn).await {
                    Ok(()) => render(&AgentResponse {
                        success: true,
                        ..AgentResponse::default()
                    }),
                    Err(e) => {
                        warn!("Delete for {} failed: {}", hostfqdn, e);
                        construct_error_response(&e.to_string())
                    }
                }
            }
            AgentRequest::Find { hostfqdn } => {
                let found = self.provider.find(&hostfqdn);
                info!("Find for {}: {}", hostfqdn, found);
                render(&AgentResponse {
                    success: true,
                    found: Some(found),
                    ..AgentResponse::default()
                })
            }
        }
    }
}
