//! Telegram delivery for release notes.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};

use crate::core::profile::RemoteLayout;
use crate::io::remote::home_path;

/// Bot API limit for a single message, in characters.
pub const MESSAGE_LIMIT: usize = 4096;
pub const ALLOWLIST_FILE: &str = "telegram_allowlist_chat_ids.txt";

const API_BASE: &str = "https://api.telegram.org";

pub trait MessageSender {
    fn send(&self, chat_id: &str, text: &str) -> Result<()>;
}

/// `sendMessage` over the Bot HTTP API.
pub struct TelegramSender {
    client: reqwest::blocking::Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

impl TelegramSender {
    pub fn new(token: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("build HTTP client")?;
        Ok(Self {
            client,
            base_url: API_BASE.to_string(),
            token: token.into(),
        })
    }
}

impl MessageSender for TelegramSender {
    #[instrument(skip_all, fields(chat_id = %chat_id))]
    fn send(&self, chat_id: &str, text: &str) -> Result<()> {
        let url = format!("{}/bot{}/sendMessage", self.base_url, self.token);
        let response = self
            .client
            .post(url)
            .json(&json!({
                "chat_id": chat_id,
                "text": text,
                "disable_web_page_preview": true,
            }))
            .send()
            // The URL carries the bot token.
            .map_err(|err| anyhow!("telegram request failed: {}", err.without_url()))?;
        let status = response.status();
        let body: ApiResponse = response
            .json()
            .map_err(|err| anyhow!("telegram response unreadable ({status}): {}", err.without_url()))?;
        if !body.ok {
            return Err(anyhow!(
                "telegram rejected the message ({status}): {}",
                body.description.unwrap_or_else(|| "no description".to_string())
            ));
        }
        debug!(%status, "message delivered");
        Ok(())
    }
}

/// Message body from release notes, or `None` if there is nothing to say.
///
/// Over-long notes are cut at a character boundary and marked with `…`.
pub fn compose_message(notes: &str) -> Option<String> {
    let notes = notes.trim();
    if notes.is_empty() {
        return None;
    }
    if notes.chars().count() <= MESSAGE_LIMIT {
        return Some(notes.to_string());
    }
    let mut cut: String = notes.chars().take(MESSAGE_LIMIT - 1).collect();
    cut.push('…');
    Some(cut)
}

/// First chat id in an allowlist file (comma, space or newline separated,
/// `#` starts a comment).
pub fn first_chat_id(allowlist: &str) -> Option<String> {
    allowlist
        .lines()
        .map(|line| line.split('#').next().unwrap_or_default())
        .flat_map(|line| line.split([',', ' ', '\t']))
        .map(str::trim)
        .find(|token| token.parse::<i64>().is_ok())
        .map(str::to_string)
}

pub fn allowlist_script(layout: &RemoteLayout) -> String {
    format!(
        "cat {} 2>/dev/null || true",
        home_path(&format!("{}/{ALLOWLIST_FILE}", layout.secrets_dir))
    )
}
