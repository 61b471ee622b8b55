//! Outbound email. Delivery is best effort: callers dispatch on a spawned task
//! and failures are only logged.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use html_escape::{encode_double_quoted_attribute as attr, encode_text as text};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{AppConfig, MailConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmailKind {
    Verification,
    PasswordReset,
    RegistrationConfirmation,
}

#[derive(Debug, Clone)]
pub struct OutgoingEmail {
    pub kind: EmailKind,
    pub to: String,
    pub subject: String,
    pub html: String,
    /// Primary link in the message, logged when delivery is skipped.
    pub action_url: Option<String>,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: OutgoingEmail) -> anyhow::Result<()>;
}

/// Fire-and-forget delivery.
pub fn dispatch(mailer: Arc<dyn Mailer>, email: OutgoingEmail) {
    tokio::spawn(async move {
        let kind = email.kind.clone();
        if let Err(e) = mailer.send(email).await {
            warn!(error = %e, kind = ?kind, "failed to send email");
        }
    });
}

pub fn from_config(cfg: &MailConfig) -> anyhow::Result<Arc<dyn Mailer>> {
    Ok(match &cfg.resend_api_key {
        Some(key) => Arc::new(ResendMailer::new(key.clone(), cfg.from_email.clone())?),
        None => Arc::new(LogMailer),
    })
}

/// Used when no API key is configured.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: OutgoingEmail) -> anyhow::Result<()> {
        info!(
            to = %email.to,
            subject = %email.subject,
            action_url = email.action_url.as_deref().unwrap_or("-"),
            "email delivery skipped (no RESEND_API_KEY)"
        );
        Ok(())
    }
}

const RESEND_ENDPOINT: &str = "https://api.resend.com/emails";

pub struct ResendMailer {
    http: reqwest::Client,
    api_key: String,
    from: String,
}

#[derive(Serialize)]
struct ResendPayload<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
}

impl ResendMailer {
    pub fn new(api_key: String, from: String) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("build mail http client")?;
        Ok(Self { http, api_key, from })
    }
}

#[async_trait]
impl Mailer for ResendMailer {
    async fn send(&self, email: OutgoingEmail) -> anyhow::Result<()> {
        self.http
            .post(RESEND_ENDPOINT)
            .bearer_auth(&self.api_key)
            .json(&ResendPayload {
                from: &self.from,
                to: [&email.to],
                subject: &email.subject,
                html: &email.html,
            })
            .send()
            .await
            .context("send email")?
            .error_for_status()
            .context("email provider rejected message")?;
        info!(to = %email.to, kind = ?email.kind, "email sent");
        Ok(())
    }
}

// --- messages ---

pub fn verification_email(cfg: &AppConfig, to: &str, name: &str, token: &str) -> OutgoingEmail {
    let url = format!("{}/verify-email?token={}", cfg.client_url, token);
    let (name, href) = (text(name), attr(&url));
    OutgoingEmail {
        kind: EmailKind::Verification,
        to: to.to_owned(),
        subject: "Verify your email | Guidance Zone".into(),
        html: format!(
            "<p>Welcome, {name}!</p><p>Please verify your email address to get started.</p>\
             <p><a href=\"{href}\">Verify Email</a></p>"
        ),
        action_url: Some(url),
    }
}

pub fn password_reset_email(cfg: &AppConfig, to: &str, name: &str, token: &str) -> OutgoingEmail {
    let url = format!("{}/reset-password?token={}", cfg.client_url, token);
    let (name, href) = (text(name), attr(&url));
    OutgoingEmail {
        kind: EmailKind::PasswordReset,
        to: to.to_owned(),
        subject: "Reset your password | Guidance Zone".into(),
        html: format!(
            "<p>Hi {name}, use the link below to reset your password.</p>\
             <p><a href=\"{href}\">Reset Password</a></p>"
        ),
        action_url: Some(url),
    }
}

pub struct ConfirmationLinks<'a> {
    pub join_link: Option<&'a str>,
    pub google_calendar_url: &'a str,
    pub ics_url: &'a str,
}

pub fn registration_confirmation(
    cfg: &AppConfig,
    to: &str,
    name: &str,
    course_title: &str,
    links: ConfirmationLinks<'_>,
) -> OutgoingEmail {
    let mut html = format!(
        "<p>Hi {}, you've been registered for:</p><p><strong>{}</strong></p>",
        text(name),
        text(course_title)
    );
    if let Some(join) = links.join_link {
        html.push_str(&format!("<p><a href=\"{}\">Join Session</a></p>", attr(join)));
    }
    html.push_str(&format!(
        "<p><a href=\"{}\">Add to Google Calendar</a> · <a href=\"{}\">Download .ics</a></p>\
         <p>Visit your <a href=\"{}/dashboard\">dashboard</a> for course materials.</p>",
        attr(links.google_calendar_url),
        attr(links.ics_url),
        attr(&cfg.client_url)
    ));
    OutgoingEmail {
        kind: EmailKind::RegistrationConfirmation,
        to: to.to_owned(),
        subject: format!("You're registered: {course_title} | Guidance Zone"),
        html,
        action_url: links.join_link.map(str::to_owned),
    }
}
