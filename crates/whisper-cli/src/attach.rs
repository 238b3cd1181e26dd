//! Talk to a backend started by another `repowhisper start`

use anyhow::{bail, Context, Result};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use whisper_core::{AuthToken, HealthReport, IndexRequest, SearchRequest, SupervisorConfig, AUTH_HEADER};
use whisper_ipc::{HttpResponse, IpcClient};
use whisper_sandbox::{AllowlistSource, CapabilityStore};

pub struct Attached {
    client: IpcClient,
    token: SecretString,
}

impl Attached {
    pub fn connect(config: &SupervisorConfig) -> Result<Self> {
        if !config.socket_path.exists() {
            bail!("Backend is not running (run `repowhisper start`)");
        }
        let token = AuthToken::new(&config.token_path)
            .load()
            .context("Could not read auth token")?
            .context("No auth token; the backend was never started")?;
        Ok(Self {
            client: IpcClient::new(&config.socket_path).with_timeout(config.request_timeout),
            token,
        })
    }

    fn headers(&self) -> Vec<(String, String)> {
        vec![(AUTH_HEADER.to_string(), self.token.expose_secret().clone())]
    }

    pub fn health(&self) -> Result<HealthReport> {
        let response = self.client.get("/health", &self.headers())?;
        Ok(checked(response)?.json()?)
    }

    pub fn search(&self, request: &SearchRequest) -> Result<Value> {
        self.post("/search", serde_json::to_vec(request)?)
    }

    /// Refused locally when any path is outside the approved folders
    pub fn index(&self, store: &CapabilityStore, request: &IndexRequest) -> Result<Value> {
        if let Some(path) = store.first_disallowed(&request.paths()) {
            bail!("{} is outside the approved folders", path.display());
        }
        self.post("/index", serde_json::to_vec(request)?)
    }

    fn post(&self, path: &str, body: Vec<u8>) -> Result<Value> {
        let mut headers = self.headers();
        headers.push(("Content-Type".to_string(), "application/json".to_string()));
        let response = self.client.post(path, &headers, &body)?;
        Ok(checked(response)?.json()?)
    }
}

fn checked(response: HttpResponse) -> Result<HttpResponse> {
    if !response.is_success() {
        bail!(
            "Backend answered HTTP {}: {}",
            response.status_code,
            response.text().unwrap_or_default()
        );
    }
    Ok(response)
}
