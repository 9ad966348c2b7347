//! Notebook sessions: the server's session REST API, bound to one kernel.
//!
//! A session is started and shut down through `api/sessions`; everything
//! else goes through [`NotebookSession::kernel`].

use std::sync::{PoisonError, RwLock};

use reqwest::{Method, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::Level;

use crate::client::KernelClient;
use crate::config::KernelConfig;
use crate::control::{self, ControlError, KernelId};
use crate::error::KernelError;
use crate::log::KernelLog;
use crate::urls::{self, UrlError};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Control(#[from] ControlError),

    #[error(transparent)]
    Kernel(#[from] KernelError),

    #[error(transparent)]
    Url(#[from] UrlError),

    #[error("invalid session model: {0}")]
    InvalidModel(String),

    #[error("The kernel was deleted but the session was not")]
    SessionNotDeleted,
}

impl From<reqwest::Error> for SessionError {
    fn from(error: reqwest::Error) -> Self {
        Self::Control(ControlError::Http(error))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotebookId {
    pub path: String,
}

/// Session model as the server reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionModel {
    pub id: String,
    pub notebook: NotebookId,
    pub kernel: KernelId,
}

impl SessionModel {
    /// Validate a server session model.
    pub fn from_value(value: Value) -> Result<Self, SessionError> {
        serde_json::from_value(value).map_err(|e| SessionError::InvalidModel(e.to_string()))
    }
}

/// Session lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    KernelCreated,
    KernelKilled,
    KernelDead,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KernelCreated => "kernelCreated",
            Self::KernelKilled => "kernelKilled",
            Self::KernelDead => "kernelDead",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub notebook_path: String,
    /// Empty lets the server pick its default kernel.
    pub kernel_name: String,
    pub base_url: String,
    pub ws_url: Option<String>,
}

impl SessionOptions {
    pub fn new(notebook_path: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            notebook_path: notebook_path.into(),
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn with_kernel_name(mut self, name: impl Into<String>) -> Self {
        self.kernel_name = name.into();
        self
    }

    pub fn with_ws_url(mut self, ws_url: impl Into<String>) -> Self {
        self.ws_url = Some(ws_url.into());
        self
    }
}

pub struct NotebookSession {
    id: String,
    notebook_path: RwLock<String>,
    kernel: KernelClient,
    http: reqwest::Client,
    base: Url,
    session_url: Url,
    status: watch::Sender<Option<SessionStatus>>,
    log: std::sync::Arc<dyn KernelLog>,
}

impl NotebookSession {
    /// `GET api/sessions`
    pub async fn list(config: &KernelConfig) -> Result<Vec<SessionModel>, SessionError> {
        let base = urls::parse(&config.base_url)?;
        let http = control::http_client(config.token.as_deref(), config.http_timeout)?;
        let request = http.get(urls::sessions_url(&base)?);
        let response = control::send_expecting(request, "list sessions", &[StatusCode::OK]).await?;
        let value: Value = response.json().await?;
        let Value::Array(models) = value else {
            return Err(SessionError::InvalidModel("session list is not an array".to_string()));
        };
        models.into_iter().map(SessionModel::from_value).collect()
    }

    /// Session with default kernel settings. Must be called within a tokio runtime.
    pub fn new(options: SessionOptions) -> Result<Self, SessionError> {
        let config = KernelConfig::new(options.base_url.clone());
        Self::with_config(config, options)
    }

    /// Session whose kernel uses `config` (token, timeouts, log, control);
    /// the urls in `options` take precedence.
    pub fn with_config(
        mut config: KernelConfig,
        options: SessionOptions,
    ) -> Result<Self, SessionError> {
        config.base_url = options.base_url.clone();
        if let Some(ws_url) = options.ws_url {
            config.ws_url = Some(ws_url);
        }

        let id = uuid::Uuid::new_v4().to_string();
        let base = urls::parse(&config.base_url)?;
        let session_url = urls::session_url(&base, &id)?;
        let http = control::http_client(config.token.as_deref(), config.http_timeout)?;
        let log = std::sync::Arc::clone(&config.log);
        let kernel = KernelClient::new(config)?;
        kernel.set_name(&options.kernel_name);
        let (status, _) = watch::channel(None);

        Ok(Self {
            id,
            notebook_path: RwLock::new(options.notebook_path),
            kernel,
            http,
            base,
            session_url,
            status,
            log,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kernel(&self) -> &KernelClient {
        &self.kernel
    }

    pub fn notebook_path(&self) -> String {
        self.notebook_path
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Latest session event, if any.
    pub fn status(&self) -> Option<SessionStatus> {
        *self.status.borrow()
    }

    pub fn status_watch(&self) -> watch::Receiver<Option<SessionStatus>> {
        self.status.subscribe()
    }

    fn set_status(&self, status: SessionStatus) {
        self.status.send_replace(Some(status));
        self.log
            .log(Level::INFO, &format!("Session: {status} ({})", self.id));
    }

    fn model(&self) -> Value {
        json!({
            "id": self.id,
            "notebook": { "path": self.notebook_path() },
            "kernel": { "name": self.kernel.name(), "id": self.kernel.id() },
        })
    }

    async fn request_model(
        &self,
        method: Method,
        url: Url,
        operation: &'static str,
        expected: StatusCode,
        body: Option<Value>,
    ) -> Result<SessionModel, SessionError> {
        let mut request = self.http.request(method, url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = control::send_expecting(request, operation, &[expected]).await?;
        SessionModel::from_value(response.json().await?)
    }

    /// `POST api/sessions`, then connect to the session's kernel.
    pub async fn start(&self) -> Result<SessionModel, SessionError> {
        let url = urls::sessions_url(&self.base)?;
        let result = self
            .request_model(
                Method::POST,
                url,
                "start session",
                StatusCode::CREATED,
                Some(self.model()),
            )
            .await;

        let model = match result {
            Ok(model) => model,
            Err(e) => {
                if rejected(&e) {
                    self.set_status(SessionStatus::KernelDead);
                }
                return Err(e);
            }
        };
        self.kernel.connect(Some(model.kernel.clone())).await?;
        self.set_status(SessionStatus::KernelCreated);
        Ok(model)
    }

    /// `GET api/sessions/{id}`
    pub async fn get_info(&self) -> Result<SessionModel, SessionError> {
        self.request_model(
            Method::GET,
            self.session_url.clone(),
            "get session info",
            StatusCode::OK,
            None,
        )
        .await
    }

    /// Disconnect the kernel and `DELETE api/sessions/{id}`.
    pub async fn delete(&self) -> Result<(), SessionError> {
        self.set_status(SessionStatus::KernelKilled);
        self.kernel.disconnect()?;

        let request = self.http.delete(self.session_url.clone());
        match control::send_expecting(request, "delete session", &[StatusCode::NO_CONTENT]).await {
            Ok(_) => Ok(()),
            Err(ControlError::UnexpectedStatus { status: 410, .. }) => {
                Err(SessionError::SessionNotDeleted)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the session and start it again, then apply the notebook path
    /// and kernel name from `options` when they are non-empty. A failed
    /// delete fails the restart.
    pub async fn restart(
        &self,
        options: Option<SessionOptions>,
    ) -> Result<SessionModel, SessionError> {
        self.delete().await?;
        let model = self.start().await?;

        if let Some(options) = options {
            if !options.notebook_path.is_empty() {
                *self
                    .notebook_path
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = options.notebook_path;
            }
            if !options.kernel_name.is_empty() {
                self.kernel.set_name(&options.kernel_name);
            }
        }
        Ok(model)
    }

    /// `PATCH api/sessions/{id}` with the new notebook path.
    pub async fn rename_notebook(&self, path: &str) -> Result<SessionModel, SessionError> {
        *self
            .notebook_path
            .write()
            .unwrap_or_else(PoisonError::into_inner) = path.to_string();
        self.request_model(
            Method::PATCH,
            self.session_url.clone(),
            "rename notebook",
            StatusCode::OK,
            Some(self.model()),
        )
        .await
    }
}

/// True when the server refused the request or could not be reached.
fn rejected(error: &SessionError) -> bool {
    match error {
        SessionError::Control(ControlError::Http(_)) => true,
        SessionError::Control(ControlError::UnexpectedStatus { status, .. }) => *status >= 400,
        _ => false,
    }
}

impl std::fmt::Debug for NotebookSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotebookSession")
            .field("id", &self.id)
            .field("notebook_path", &self.notebook_path())
            .field("kernel", &self.kernel)
            .finish_non_exhaustive()
    }
}
