use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::{json, Value};
use std::fmt;
use tracing::info;

use crate::config::Config;

/// Invitation transport. A failure is local to one recipient; the dispatch
/// driver logs it and moves on.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_email(&self, to: &str, name: &str, token: &str, survey_title: &str)
        -> Result<()>;

    async fn send_whatsapp(
        &self,
        phone: &str,
        name: &str,
        token: &str,
        survey_title: &str,
    ) -> Result<()>;
}

#[derive(Clone)]
pub struct HttpNotifier {
    http: Client,
    email_url: Url,
    email_key: String,
    sender: String,
    whatsapp: Option<(Url, String)>,
}

impl fmt::Debug for HttpNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpNotifier")
            .field("email_url", &self.email_url)
            .field("whatsapp_configured", &self.whatsapp.is_some())
            .finish_non_exhaustive()
    }
}

impl HttpNotifier {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let email_url = Url::parse(&cfg.email.api_url).context("invalid email.api_url")?;
        let whatsapp = match &cfg.whatsapp {
            Some(wa) => Some((
                Url::parse(&wa.api_url).context("invalid whatsapp.api_url")?,
                wa.api_key.clone(),
            )),
            None => None,
        };
        let http = Client::builder()
            .user_agent("survey-courier/0.1")
            .build()
            .context("reqwest client")?;
        Ok(Self {
            http,
            email_url,
            email_key: cfg.email.api_key.clone(),
            sender: cfg.email.sender.clone(),
            whatsapp,
        })
    }

    async fn post(&self, url: &Url, key: &str, body: &Value) -> Result<()> {
        let res = self
            .http
            .post(url.clone())
            .header("Authorization", format!("Bearer {}", key))
            .json(body)
            .send()
            .await
            .context("failed to reach notification transport")?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("transport error {}: {}", status, body));
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn send_email(
        &self,
        to: &str,
        name: &str,
        token: &str,
        survey_title: &str,
    ) -> Result<()> {
        let body = build_email_body(&self.sender, to, name, token, survey_title);
        self.post(&self.email_url, &self.email_key, &body).await?;
        info!(to, survey_title, "invitation email sent");
        Ok(())
    }

    async fn send_whatsapp(
        &self,
        phone: &str,
        name: &str,
        token: &str,
        survey_title: &str,
    ) -> Result<()> {
        // A selected but unconfigured channel is an error, never a silent
        // success.
        let Some((url, key)) = &self.whatsapp else {
            bail!("whatsapp transport not configured");
        };
        let body = build_whatsapp_body(phone, name, token, survey_title);
        self.post(url, key, &body).await?;
        info!(phone, survey_title, "invitation whatsapp sent");
        Ok(())
    }
}

pub fn build_email_body(
    sender: &str,
    to: &str,
    name: &str,
    token: &str,
    survey_title: &str,
) -> Value {
    json!({
        "from": sender,
        "to": to,
        "subject": format!("Survey invitation: {}", survey_title),
        "template": "survey-invitation",
        "variables": {
            "name": name,
            "survey_title": survey_title,
            "access_token": token,
        },
    })
}

pub fn build_whatsapp_body(phone: &str, name: &str, token: &str, survey_title: &str) -> Value {
    json!({
        "to": phone,
        "template": "survey_invitation",
        "variables": {
            "name": name,
            "survey_title": survey_title,
            "access_token": token,
        },
    })
}
