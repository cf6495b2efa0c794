//! Channel adapters: one per channel kind

use super::payload::AlertPayload;
use crate::error::ChannelError;
use crate::models::ChannelKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default timeout for a single delivery request
pub const DEFAULT_CHANNEL_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait ChannelAdapter: Send + Sync + 'static {
    fn kind(&self) -> ChannelKind;

    async fn send(&self, target: &str, payload: &AlertPayload) -> Result<(), ChannelError>;
}

fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

fn parse_url(target: &str) -> Result<url::Url, ChannelError> {
    let url = url::Url::parse(target)
        .map_err(|e| ChannelError::InvalidTarget(format!("{target}: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ChannelError::InvalidTarget(format!(
            "unsupported scheme {other}"
        ))),
    }
}

async fn post_json<T: Serialize + ?Sized>(
    request: reqwest::RequestBuilder,
    body: &T,
) -> Result<(), ChannelError> {
    let response = request
        .json(body)
        .send()
        .await
        .map_err(|e| ChannelError::Transport(e.to_string()))?;

    if !response.status().is_success() {
        return Err(ChannelError::Status(response.status().as_u16()));
    }
    Ok(())
}

/// Posts the structured payload as JSON
#[derive(Debug, Clone)]
pub struct WebhookAdapter {
    client: reqwest::Client,
}

impl Default for WebhookAdapter {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_TIMEOUT)
    }
}

impl WebhookAdapter {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: http_client(timeout),
        }
    }
}

#[async_trait]
impl ChannelAdapter for WebhookAdapter {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Webhook
    }

    async fn send(&self, target: &str, payload: &AlertPayload) -> Result<(), ChannelError> {
        let url = parse_url(target)?;
        post_json(self.client.post(url), payload).await
    }
}

/// Posts plain text to a Slack incoming webhook
#[derive(Debug, Clone)]
pub struct SlackAdapter {
    client: reqwest::Client,
}

impl Default for SlackAdapter {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_TIMEOUT)
    }
}

impl SlackAdapter {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: http_client(timeout),
        }
    }
}

#[derive(Serialize)]
struct SlackMessage {
    text: String,
}

#[async_trait]
impl ChannelAdapter for SlackAdapter {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Slack
    }

    async fn send(&self, target: &str, payload: &AlertPayload) -> Result<(), ChannelError> {
        let url = parse_url(target)?;
        let message = SlackMessage {
            text: format!("*{}*\n{}", payload.subject(), payload.text()),
        };
        post_json(self.client.post(url), &message).await
    }
}

/// Email delivery API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmailProvider {
    /// JSON body with a bearer key, posted to `api_url`
    Resend,
    /// Form body with basic auth, posted to
    /// `{mailgun_base_url}/v3/{mailgun_domain}/messages`
    Mailgun,
}

/// HTTP email provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailSettings {
    pub provider: EmailProvider,
    pub api_url: String,
    pub api_key: Option<String>,
    pub from: String,
    pub mailgun_base_url: String,
    pub mailgun_domain: Option<String>,
}

impl Default for EmailSettings {
    fn default() -> Self {
        Self {
            provider: EmailProvider::Resend,
            api_url: "https://api.resend.com/emails".to_string(),
            api_key: None,
            from: "API Sentinel <alerts@apisentinel.local>".to_string(),
            mailgun_base_url: "https://api.mailgun.net".to_string(),
            mailgun_domain: None,
        }
    }
}

/// Sends a subject and plain-text body through an HTTP email API
#[derive(Debug, Clone)]
pub struct EmailAdapter {
    client: reqwest::Client,
    settings: EmailSettings,
}

#[derive(Serialize)]
struct EmailMessage<'a> {
    from: &'a str,
    to: Vec<&'a str>,
    subject: String,
    text: String,
}

#[derive(Serialize)]
struct MailgunForm<'a> {
    from: &'a str,
    to: &'a str,
    subject: String,
    text: String,
}

impl EmailAdapter {
    pub fn new(settings: EmailSettings, timeout: Duration) -> Self {
        Self {
            client: http_client(timeout),
            settings,
        }
    }

    async fn send_resend(
        &self,
        api_key: &str,
        address: &str,
        payload: &AlertPayload,
    ) -> Result<(), ChannelError> {
        let message = EmailMessage {
            from: &self.settings.from,
            to: vec![address],
            subject: payload.subject(),
            text: payload.text(),
        };
        let request = self
            .client
            .post(&self.settings.api_url)
            .bearer_auth(api_key);
        post_json(request, &message).await
    }

    async fn send_mailgun(
        &self,
        api_key: &str,
        address: &str,
        payload: &AlertPayload,
    ) -> Result<(), ChannelError> {
        let Some(domain) = self.settings.mailgun_domain.as_deref() else {
            return Err(ChannelError::NotConfigured(
                "mailgun domain is not set".to_string(),
            ));
        };
        let url = format!(
            "{}/v3/{}/messages",
            self.settings.mailgun_base_url.trim_end_matches('/'),
            domain
        );
        let form = MailgunForm {
            from: &self.settings.from,
            to: address,
            subject: payload.subject(),
            text: payload.text(),
        };
        let response = self
            .client
            .post(url)
            .basic_auth("api", Some(api_key))
            .form(&form)
            .send()
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ChannelError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChannelAdapter for EmailAdapter {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Email
    }

    async fn send(&self, target: &str, payload: &AlertPayload) -> Result<(), ChannelError> {
        let Some(api_key) = self.settings.api_key.as_deref() else {
            return Err(ChannelError::NotConfigured(
                "email provider api key is not set".to_string(),
            ));
        };
        let address = target.trim();
        let valid = address
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
        if !valid {
            return Err(ChannelError::InvalidTarget(format!(
                "invalid email address {address}"
            )));
        }

        match self.settings.provider {
            EmailProvider::Resend => self.send_resend(api_key, address, payload).await,
            EmailProvider::Mailgun => self.send_mailgun(api_key, address, payload).await,
        }
    }
}
