//! Template retrieval and rendering for outbound email.
//!
//! Fetches HTML templates from the template service over HTTP and renders
//! them with handlebars, using the job's params as context. The producer
//! contract tolerates responses without an `html` field by substituting a
//! minimal `{{message}}` wrapper, so a half-provisioned template service
//! degrades to plain notifications instead of blocking delivery.

use std::time::Duration;

use courier_core::EmailJob;
use handlebars::Handlebars;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DeliveryError, Result};

/// Body used when the template service response carries no `html` field.
pub const FALLBACK_TEMPLATE: &str = "<p>{{message}}</p>";

/// Configuration for the template client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateConfig {
    /// Base URL of the template service.
    pub base_url: String,
    /// Timeout for template fetches.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self::new("http://localhost:8000")
    }
}

impl TemplateConfig {
    /// Creates a configuration for the given service URL with default
    /// timeout and user agent.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(10),
            user_agent: "Courier-Email-Delivery/1.0".to_string(),
        }
    }

    /// Loads configuration from `TEMPLATE_SERVICE_URL` and
    /// `TEMPLATE_TIMEOUT_SECONDS`.
    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var("TEMPLATE_SERVICE_URL").map_err(|_| {
            DeliveryError::configuration("TEMPLATE_SERVICE_URL environment variable not set")
        })?;

        let mut config = Self::new(base_url);
        if let Ok(raw) = std::env::var("TEMPLATE_TIMEOUT_SECONDS") {
            let secs: u64 = raw.parse().map_err(|_| {
                DeliveryError::configuration(format!(
                    "TEMPLATE_TIMEOUT_SECONDS is not a valid duration: {raw:?}"
                ))
            })?;
            config.timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }
}

/// Fully rendered message ready for the mail transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    /// Subject line.
    pub subject: String,
    /// Rendered HTML body.
    pub html: String,
}

/// HTTP client for the template service.
///
/// Fetch and render failures carry no SMTP code, so the classifier treats
/// them as transient and the job retries on its normal backoff schedule.
#[derive(Debug, Clone)]
pub struct TemplateClient {
    client: reqwest::Client,
    base_url: String,
}

impl TemplateClient {
    /// Creates a new template client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the HTTP client cannot be
    /// built with the provided settings.
    pub fn new(config: TemplateConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build template client: {e}"))
            })?;

        Ok(Self { client, base_url: config.base_url })
    }

    /// Creates a template client from environment configuration.
    pub fn from_env() -> Result<Self> {
        Self::new(TemplateConfig::from_env()?)
    }

    /// Fetches the HTML template for `template_ref`.
    ///
    /// Expects `GET {base_url}/templates/{template_ref}` to return a JSON
    /// body with an `html` string field. A 2xx response without that field
    /// (or with a non-JSON body) yields [`FALLBACK_TEMPLATE`].
    pub async fn fetch(&self, template_ref: &str) -> Result<String> {
        let url = format!("{}/templates/{template_ref}", self.base_url.trim_end_matches('/'));
        debug!(template_ref, url = %url, "fetching template");

        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                DeliveryError::template(template_ref, "fetch timed out")
            } else if e.is_connect() {
                DeliveryError::template(template_ref, format!("connection failed: {e}"))
            } else {
                DeliveryError::template(template_ref, e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::template(
                template_ref,
                format!("template service returned {status}"),
            ));
        }

        let body: serde_json::Value = match response.json().await {
            Ok(value) => value,
            Err(_) => return Ok(FALLBACK_TEMPLATE.to_string()),
        };

        Ok(body
            .get("html")
            .and_then(serde_json::Value::as_str)
            .map_or_else(|| FALLBACK_TEMPLATE.to_string(), str::to_owned))
    }

    /// Renders `template` with `params` as the handlebars context.
    ///
    /// Missing keys render as empty strings, matching how the producer
    /// authors templates.
    pub fn render(
        &self,
        template_ref: &str,
        template: &str,
        params: &serde_json::Value,
    ) -> Result<String> {
        Handlebars::new()
            .render_template(template, params)
            .map_err(|e| DeliveryError::template(template_ref, format!("render failed: {e}")))
    }

    /// Fetches and renders the template for a claimed job.
    pub async fn render_for_job(&self, job: &EmailJob) -> Result<RenderedEmail> {
        let template = self.fetch(&job.template_ref).await?;
        let html = self.render(&job.template_ref, &template, job.params())?;
        Ok(RenderedEmail { subject: job.subject(), html })
    }
}
