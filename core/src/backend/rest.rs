/// HTTP implementation of the backend over hyper.
///
/// Routes:
///   GET    /user/auth
///   GET    /company/auth
///   POST   /user/login                    body: {"email":"...","password":"..."}
///   POST   /user/logout | /company/logout
///   GET    /connection/connections
///   GET    /message/conversation/:peer_id
///   POST   /message/send/:peer_id         body: {"content":"..."}
///   DELETE /message/delete/:message_id
///
/// Every response is wrapped as {"data": ..., "message": "..."}. The session
/// lives in cookies, which are captured from Set-Cookie and replayed.
use crate::backend::Backend;
use crate::config::Config;
use crate::error::{ClientError, Result};
use crate::model::{ApiEnvelope, ConnectionSummary, Conversation, Identity, Message};
use bytes::Bytes;
use http::{header, HeaderMap, Method, Request, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, warn};

pub struct HttpBackend {
    base_url: String,
    client: Client<HttpConnector, Full<Bytes>>,
    request_timeout: Duration,
    cookies: RwLock<BTreeMap<String, String>>,
}

impl HttpBackend {
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;
        let base_url = config.backend_url.trim_end_matches('/').to_string();
        // Fail early on a URL hyper cannot use
        base_url
            .parse::<Uri>()
            .map_err(|e| ClientError::Config(format!("Invalid backend URL {}: {}", base_url, e)))?;

        let client = Client::builder(TokioExecutor::new()).build_http();
        let mut cookies = BTreeMap::new();
        if let Some(raw) = &config.session_cookie {
            for pair in raw.split(';') {
                if let Some((name, value)) = pair.trim().split_once('=') {
                    cookies.insert(name.to_string(), value.to_string());
                }
            }
        }

        Ok(Self {
            base_url,
            client,
            request_timeout: config.request_timeout,
            cookies: RwLock::new(cookies),
        })
    }

    /// Cookie header for the current session, if any
    pub async fn session_cookie(&self) -> Option<String> {
        let cookies = self.cookies.read().await;
        if cookies.is_empty() {
            return None;
        }
        Some(
            cookies
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    async fn store_cookies(&self, headers: &HeaderMap) {
        let mut cookies = self.cookies.write().await;
        for value in headers.get_all(header::SET_COOKIE) {
            let Ok(raw) = value.to_str() else {
                continue;
            };
            let pair = raw.split(';').next().unwrap_or("");
            if let Some((name, value)) = pair.trim().split_once('=') {
                if value.is_empty() {
                    cookies.remove(name);
                } else {
                    cookies.insert(name.to_string(), value.to_string());
                }
            }
        }
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<(StatusCode, Bytes)> {
        let uri: Uri = format!("{}{}", self.base_url, path)
            .parse()
            .map_err(|e| ClientError::Config(format!("Invalid request URI {}: {}", path, e)))?;

        let mut builder = Request::builder()
            .method(method.clone())
            .uri(uri)
            .header(header::ACCEPT, "application/json");
        if let Some(cookie) = self.session_cookie().await {
            builder = builder.header(header::COOKIE, cookie);
        }
        let payload = match body {
            Some(value) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Bytes::from(serde_json::to_vec(&value)?)
            }
            None => Bytes::new(),
        };
        let req = builder
            .body(Full::new(payload))
            .map_err(|e| ClientError::Transport(format!("Failed to build request: {}", e)))?;

        let exchange = async {
            let resp = self
                .client
                .request(req)
                .await
                .map_err(|e| ClientError::Transport(format!("{} {}: {}", method, path, e)))?;
            let status = resp.status();
            self.store_cookies(resp.headers()).await;
            let body = resp
                .into_body()
                .collect()
                .await
                .map_err(|e| ClientError::Transport(format!("body read error: {}", e)))?
                .to_bytes();
            Ok::<_, ClientError>((status, body))
        };

        let (status, body) = timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| {
                ClientError::Timeout(format!(
                    "{} {} took longer than {:?}",
                    method, path, self.request_timeout
                ))
            })??;

        debug!("{} {} -> {}", method, path, status);
        if status.is_success() {
            Ok((status, body))
        } else {
            Err(status_error(status, &body))
        }
    }

    async fn data<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Option<T>> {
        let (_, bytes) = self.request(method, path, body).await?;
        if bytes.is_empty() {
            return Ok(None);
        }
        let envelope: ApiEnvelope<T> = serde_json::from_slice(&bytes)?;
        Ok(envelope.data)
    }

    async fn auth_probe(&self, path: &str) -> Result<Option<Identity>> {
        match self.data::<Identity>(Method::GET, path, None).await {
            Ok(identity) => Ok(identity),
            Err(ClientError::Unauthorized(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Map a non-2xx response to the error taxonomy, using the body's `message` when present
fn status_error(status: StatusCode, body: &[u8]) -> ClientError {
    let message = serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("Something went wrong")
                .to_string()
        });

    match status {
        StatusCode::UNAUTHORIZED => ClientError::Unauthorized(message),
        StatusCode::FORBIDDEN => ClientError::Forbidden(message),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => ClientError::Validation(message),
        StatusCode::NOT_FOUND => ClientError::NotFound(message),
        other => {
            if other.is_server_error() {
                warn!("Backend returned {}: {}", other, message);
            }
            ClientError::Server {
                status: other.as_u16(),
                message,
            }
        }
    }
}

fn segment(id: &str) -> String {
    urlencoding::encode(id).into_owned()
}

impl Backend for HttpBackend {
    async fn authenticated_user(&self) -> Result<Option<Identity>> {
        self.auth_probe("/user/auth").await
    }

    async fn authenticated_company(&self) -> Result<Option<Identity>> {
        self.auth_probe("/company/auth").await
    }

    async fn login_user(&self, email: &str, password: &str) -> Result<()> {
        let body = serde_json::json!({ "email": email, "password": password });
        self.request(Method::POST, "/user/login", Some(body)).await?;
        Ok(())
    }

    async fn logout(&self, company: bool) -> Result<()> {
        let path = if company { "/company/logout" } else { "/user/logout" };
        let outcome = self.request(Method::POST, path, None).await;
        // The session is gone locally either way
        self.cookies.write().await.clear();
        outcome.map(|_| ())
    }

    async fn connections(&self) -> Result<Vec<ConnectionSummary>> {
        Ok(self
            .data::<Vec<ConnectionSummary>>(Method::GET, "/connection/connections", None)
            .await?
            .unwrap_or_default())
    }

    async fn conversation(&self, peer_id: &str) -> Result<Conversation> {
        let path = format!("/message/conversation/{}", segment(peer_id));
        let conversation = self
            .data::<Conversation>(Method::GET, &path, None)
            .await?
            .unwrap_or_default();
        conversation.validate()?;
        Ok(conversation)
    }

    async fn send_message(&self, peer_id: &str, content: &str) -> Result<Message> {
        let path = format!("/message/send/{}", segment(peer_id));
        let body = serde_json::json!({ "content": content });
        self.data::<Message>(Method::POST, &path, Some(body))
            .await?
            .ok_or_else(|| ClientError::Protocol("send response carried no message".to_string()))
    }

    async fn delete_message(&self, message_id: &str) -> Result<()> {
        let path = format!("/message/delete/{}", segment(message_id));
        self.request(Method::DELETE, &path, None).await?;
        Ok(())
    }
}
