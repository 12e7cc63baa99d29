//! Message delivery through the Telegram Bot API.

use std::{fmt, time::Duration};

use clap::Parser;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use super::{DeliveryPolicy, MessageSender};
use crate::{
    Error, Result,
    error::{ResultExt, ensure},
    types::common::RecipientId,
};

/// Configuration for delivering alerts through a Telegram bot.
#[derive(Clone, Parser)]
pub struct TelegramOptions {
    /// Bot token issued by BotFather.
    #[clap(long = "telegram-token", env = "VALIDATOR_WATCH_TELEGRAM_TOKEN")]
    pub token: String,

    /// Base URL of the Bot API.
    #[clap(
        long = "telegram-api-url",
        env = "VALIDATOR_WATCH_TELEGRAM_API_URL",
        default_value = "https://api.telegram.org"
    )]
    pub api_url: Url,

    /// Timeout for a single Bot API request.
    #[clap(
        long = "telegram-timeout",
        env = "VALIDATOR_WATCH_TELEGRAM_TIMEOUT",
        default_value = "10s",
        value_parser = humantime::parse_duration,
    )]
    pub timeout: Duration,

    /// Attempts to deliver one message to one subscriber before counting it as failed.
    #[clap(long, env = "VALIDATOR_WATCH_DELIVERY_ATTEMPTS", default_value = "3")]
    pub delivery_attempts: u32,

    /// Pause between delivery attempts.
    #[clap(
        long,
        env = "VALIDATOR_WATCH_DELIVERY_RETRY_DELAY",
        default_value = "5s",
        value_parser = humantime::parse_duration,
    )]
    pub delivery_retry_delay: Duration,
}

impl TelegramOptions {
    pub fn delivery_policy(&self) -> DeliveryPolicy {
        DeliveryPolicy {
            attempts: self.delivery_attempts,
            retry_delay: self.delivery_retry_delay,
        }
    }
}

// Keep the token out of logs.
impl fmt::Debug for TelegramOptions {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TelegramOptions")
            .field("api_url", &self.api_url)
            .field("timeout", &self.timeout)
            .field("delivery_attempts", &self.delivery_attempts)
            .field("delivery_retry_delay", &self.delivery_retry_delay)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'static str,
    disable_web_page_preview: bool,
}

#[derive(Deserialize)]
struct BotResponse {
    ok: bool,
    #[serde(default)]
    error_code: Option<u16>,
    #[serde(default)]
    description: Option<String>,
}

/// Sends HTML-formatted messages to Telegram chats.
#[derive(Clone)]
pub struct TelegramSender {
    client: reqwest::Client,
    endpoint: Url,
}

impl fmt::Debug for TelegramSender {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TelegramSender").finish_non_exhaustive()
    }
}

impl TelegramSender {
    pub fn new(opt: &TelegramOptions) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(opt.timeout).build()?;

        let mut endpoint = opt.api_url.clone();
        endpoint
            .path_segments_mut()
            .map_err(|_| {
                Error::internal().context(format!("{} cannot be a base URL", opt.api_url))
            })?
            .pop_if_empty()
            .push(&format!("bot{}", opt.token))
            .push("sendMessage");

        Ok(Self { client, endpoint })
    }
}

impl MessageSender for TelegramSender {
    async fn send(&self, recipient: &RecipientId, text: &str) -> Result<()> {
        let body = SendMessage {
            chat_id: recipient,
            text,
            parse_mode: "HTML",
            disable_web_page_preview: true,
        };
        let res = self
            .client
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .await
            .map_err(|err| err.without_url())
            .context(|| Error::delivery_failure().context(format!("sending to {recipient}")))?;
        let status = res.status();
        let reply: BotResponse = res
            .json()
            .await
            .map_err(|err| err.without_url())
            .context(|| {
                Error::delivery_failure().context(format!("reading reply for {recipient} ({status})"))
            })?;
        ensure!(
            reply.ok,
            Error::delivery_failure().context(format!(
                "Telegram rejected message to {recipient} ({}): {}",
                reply.error_code.unwrap_or(status.as_u16()),
                reply.description.unwrap_or_default()
            ))
        );
        Ok(())
    }
}
