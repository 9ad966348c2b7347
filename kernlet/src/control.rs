//! Kernel control plane: the server's REST API for kernel lifecycle.
//!
//! The engine only needs `kernel_info` (as a liveness probe after an early
//! unclean close); the client uses the rest for start/interrupt/restart/shutdown.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::urls::{self, UrlError};
use crate::version::user_agent;

/// Identity of a running kernel as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelId {
    pub id: String,
    pub name: String,
}

impl KernelId {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// Validate a server kernel model: `id` and `name` must be strings.
    pub fn from_value(value: &Value) -> Result<Self, ControlError> {
        let field = |key: &str| {
            value
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| ControlError::InvalidModel(format!("kernel model missing string `{key}`")))
        };
        Ok(Self {
            id: field("id")?,
            name: field("name")?,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{operation}: unexpected status {status}")]
    UnexpectedStatus {
        operation: &'static str,
        status: u16,
    },

    #[error("invalid model: {0}")]
    InvalidModel(String),

    #[error(transparent)]
    Url(#[from] UrlError),
}

impl ControlError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::UnexpectedStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Kernel lifecycle operations. Object-safe so it can be injected for testing.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn list_kernels(&self) -> Result<Vec<KernelId>, ControlError>;

    async fn create_kernel(&self, name: Option<&str>) -> Result<KernelId, ControlError>;

    async fn kernel_info(&self, id: &str) -> Result<KernelId, ControlError>;

    async fn interrupt_kernel(&self, id: &str) -> Result<(), ControlError>;

    async fn restart_kernel(&self, id: &str) -> Result<KernelId, ControlError>;

    async fn shutdown_kernel(&self, id: &str) -> Result<(), ControlError>;
}

/// Build the HTTP client shared by the control plane and sessions.
pub(crate) fn http_client(
    token: Option<&str>,
    timeout: Duration,
) -> Result<reqwest::Client, ControlError> {
    let mut headers = reqwest::header::HeaderMap::new();

    if let Some(token) = token
        && let Ok(value) = reqwest::header::HeaderValue::from_str(&format!("token {}", token))
    {
        headers.insert(reqwest::header::AUTHORIZATION, value);
    }

    if let Ok(value) = reqwest::header::HeaderValue::from_str(&user_agent()) {
        headers.insert(reqwest::header::USER_AGENT, value);
    }

    Ok(reqwest::Client::builder()
        .default_headers(headers)
        .timeout(timeout)
        .build()?)
}

/// Send a request and require one of `expected` as the response status.
pub(crate) async fn send_expecting(
    request: reqwest::RequestBuilder,
    operation: &'static str,
    expected: &[StatusCode],
) -> Result<reqwest::Response, ControlError> {
    let response = request.send().await?;
    let status = response.status();
    if !expected.contains(&status) {
        tracing::debug!(operation, status = status.as_u16(), "Unexpected control-plane status");
        return Err(ControlError::UnexpectedStatus {
            operation,
            status: status.as_u16(),
        });
    }
    Ok(response)
}

/// [`ControlPlane`] over the server's REST API.
pub struct RestControlPlane {
    base: Url,
    client: reqwest::Client,
}

impl RestControlPlane {
    pub fn new(base_url: &str, token: Option<&str>, timeout: Duration) -> Result<Self, ControlError> {
        Ok(Self {
            base: urls::parse(base_url)?,
            client: http_client(token, timeout)?,
        })
    }

    async fn kernel_model(
        &self,
        method: Method,
        url: Url,
        operation: &'static str,
        expected: &[StatusCode],
        body: Option<Value>,
    ) -> Result<KernelId, ControlError> {
        let mut request = self.client.request(method, url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = send_expecting(request, operation, expected).await?;
        let value: Value = response.json().await?;
        KernelId::from_value(&value)
    }
}

#[async_trait]
impl ControlPlane for RestControlPlane {
    async fn list_kernels(&self) -> Result<Vec<KernelId>, ControlError> {
        let url = urls::kernels_url(&self.base)?;
        let request = self.client.get(url);
        let response = send_expecting(request, "list kernels", &[StatusCode::OK]).await?;
        let value: Value = response.json().await?;
        let Value::Array(models) = value else {
            return Err(ControlError::InvalidModel("kernel list is not an array".to_string()));
        };
        models.iter().map(KernelId::from_value).collect()
    }

    async fn create_kernel(&self, name: Option<&str>) -> Result<KernelId, ControlError> {
        let url = urls::kernels_url(&self.base)?;
        let body = match name {
            Some(name) => json!({ "name": name }),
            None => json!({}),
        };
        let kernel = self
            .kernel_model(
                Method::POST,
                url,
                "start kernel",
                &[StatusCode::OK, StatusCode::CREATED],
                Some(body),
            )
            .await?;
        tracing::info!(kernel_id = %kernel.id, kernel_name = %kernel.name, "Kernel started");
        Ok(kernel)
    }

    async fn kernel_info(&self, id: &str) -> Result<KernelId, ControlError> {
        let url = urls::kernel_url(&self.base, id)?;
        self.kernel_model(Method::GET, url, "get kernel info", &[StatusCode::OK], None)
            .await
    }

    async fn interrupt_kernel(&self, id: &str) -> Result<(), ControlError> {
        let url = urls::kernel_action_url(&self.base, id, "interrupt")?;
        let request = self.client.post(url);
        send_expecting(request, "interrupt kernel", &[StatusCode::NO_CONTENT]).await?;
        Ok(())
    }

    async fn restart_kernel(&self, id: &str) -> Result<KernelId, ControlError> {
        let url = urls::kernel_action_url(&self.base, id, "restart")?;
        self.kernel_model(Method::POST, url, "restart kernel", &[StatusCode::OK], None)
            .await
    }

    async fn shutdown_kernel(&self, id: &str) -> Result<(), ControlError> {
        let url = urls::kernel_url(&self.base, id)?;
        let request = self.client.delete(url);
        send_expecting(request, "shutdown kernel", &[StatusCode::NO_CONTENT]).await?;
        tracing::info!(kernel_id = %id, "Kernel shut down");
        Ok(())
    }
}
