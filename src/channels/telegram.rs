//! Telegram Bot API client: sends messages with keyboards, answers
//! membership queries and registers the webhook.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::channels::MessageSink;
use crate::error::ChannelError;
use crate::flow::messages::{Button, ButtonKind, OutboundMessage};

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

/// Update kinds the webhook subscribes to.
const ALLOWED_UPDATES: [&str; 5] = [
    "message",
    "callback_query",
    "chat_member",
    "my_chat_member",
    "channel_post",
];

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMember {
    status: String,
}

pub struct TelegramClient {
    bot_token: SecretString,
    api_base: String,
    client: reqwest::Client,
}

impl TelegramClient {
    pub fn new(bot_token: SecretString, api_base: impl Into<String>) -> Self {
        Self {
            bot_token,
            api_base: api_base.into(),
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.api_base.trim_end_matches('/'),
            self.bot_token.expose_secret()
        )
    }

    /// POST a Bot API method and unwrap its `{ok, result}` envelope.
    async fn call<T: DeserializeOwned>(&self, method: &str, body: &Value) -> Result<T, ChannelError> {
        // Errors are stripped of their URL: it carries the bot token.
        let resp = self
            .client
            .post(self.api_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| ChannelError::Http(format!("{method}: {}", e.without_url())))?;

        let status = resp.status();
        let parsed: ApiResponse<T> = resp.json().await.map_err(|e| {
            ChannelError::Http(format!("{method}: unreadable response ({status}): {}", e.without_url()))
        })?;

        if !parsed.ok {
            let reason = parsed.description.unwrap_or_else(|| status.to_string());
            if status == reqwest::StatusCode::UNAUTHORIZED {
                return Err(ChannelError::AuthFailed {
                    name: "telegram".into(),
                    reason,
                });
            }
            return Err(ChannelError::SendFailed {
                name: "telegram".into(),
                reason: format!("{method} failed: {reason}"),
            });
        }
        parsed
            .result
            .ok_or_else(|| ChannelError::InvalidMessage(format!("{method}: response without result")))
    }

    /// Send a text message. Long texts are split; buttons go on the last
    /// chunk.
    pub async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        buttons: &[Button],
    ) -> Result<(), ChannelError> {
        let chunks = split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH);
        let last = chunks.len().saturating_sub(1);

        for (i, chunk) in chunks.iter().enumerate() {
            let mut body = json!({
                "chat_id": chat_id,
                "text": chunk,
            });
            if i == last {
                if let Some(markup) = reply_markup(buttons) {
                    body["reply_markup"] = markup;
                }
            }
            let _: Value = self.call("sendMessage", &body).await?;
        }
        Ok(())
    }

    /// `ChatMember.status` of `user_id` in `chat_id` (a numeric id or
    /// `@handle`).
    pub async fn get_chat_member(&self, chat_id: &str, user_id: i64) -> Result<String, ChannelError> {
        let member: ChatMember = self
            .call(
                "getChatMember",
                &json!({
                    "chat_id": chat_id,
                    "user_id": user_id,
                }),
            )
            .await?;
        Ok(member.status)
    }

    /// Stop the loading indicator on a pressed inline button.
    pub async fn answer_callback_query(&self, callback_query_id: &str) -> Result<(), ChannelError> {
        let _: bool = self
            .call(
                "answerCallbackQuery",
                &json!({ "callback_query_id": callback_query_id }),
            )
            .await?;
        Ok(())
    }

    /// Point Telegram at `url`, optionally with a secret echoed back in the
    /// `X-Telegram-Bot-Api-Secret-Token` header.
    pub async fn set_webhook(&self, url: &str, secret: Option<&SecretString>) -> Result<(), ChannelError> {
        let mut body = json!({
            "url": url,
            "allowed_updates": ALLOWED_UPDATES,
        });
        if let Some(secret) = secret {
            body["secret_token"] = Value::String(secret.expose_secret().to_string());
        }
        let _: bool = self.call("setWebhook", &body).await?;
        tracing::info!("Telegram webhook registered at {url}");
        Ok(())
    }
}

#[async_trait]
impl MessageSink for TelegramClient {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn deliver(&self, message: &OutboundMessage) -> Result<(), ChannelError> {
        self.send_message(message.recipient_id, &message.text, &message.buttons)
            .await
    }
}

/// Telegram keyboard for `buttons`.
///
/// Callback and URL buttons become an inline keyboard, one button per row.
/// A contact request needs a one-time reply keyboard instead.
pub fn reply_markup(buttons: &[Button]) -> Option<Value> {
    if buttons.is_empty() {
        return None;
    }

    if buttons.iter().any(|b| b.kind == ButtonKind::RequestContact) {
        let rows: Vec<Vec<Value>> = buttons
            .iter()
            .filter(|b| b.kind == ButtonKind::RequestContact)
            .map(|b| vec![json!({ "text": b.label, "request_contact": true })])
            .collect();
        return Some(json!({
            "keyboard": rows,
            "one_time_keyboard": true,
            "resize_keyboard": true,
        }));
    }

    let rows: Vec<Vec<Value>> = buttons
        .iter()
        .filter_map(|b| match &b.kind {
            ButtonKind::Callback { token } => {
                Some(vec![json!({ "text": b.label, "callback_data": token })])
            }
            ButtonKind::Url { href } => Some(vec![json!({ "text": b.label, "url": href })]),
            ButtonKind::RequestContact => None,
        })
        .collect();
    Some(json!({ "inline_keyboard": rows }))
}

/// Split `text` into chunks of at most `max_len` bytes, preferring newline
/// then space boundaries.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let mut limit = max_len;
        while !remaining.is_char_boundary(limit) {
            limit -= 1;
        }
        let window = &remaining[..limit];
        let split_at = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .filter(|at| *at > 0)
            .unwrap_or(limit);

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> TelegramClient {
        TelegramClient::new(SecretString::from("123:ABC"), "https://api.telegram.org/")
    }

    #[test]
    fn api_url_includes_token_and_method() {
        assert_eq!(
            client().api_url("getChatMember"),
            "https://api.telegram.org/bot123:ABC/getChatMember"
        );
    }

    #[test]
    fn envelope_parses_with_and_without_result() {
        let ok: ApiResponse<ChatMember> =
            serde_json::from_str(r#"{"ok":true,"result":{"status":"member"}}"#).unwrap();
        assert_eq!(ok.result.unwrap().status, "member");

        let failed: ApiResponse<ChatMember> =
            serde_json::from_str(r#"{"ok":false,"description":"Bad Request: chat not found"}"#)
                .unwrap();
        assert!(!failed.ok);
        assert!(failed.result.is_none());
        assert_eq!(failed.description.as_deref(), Some("Bad Request: chat not found"));
    }

    #[test]
    fn inline_keyboard_one_button_per_row() {
        let markup = reply_markup(&[
            Button::url("Channel", "https://t.me/c"),
            Button::callback("I've subscribed", "normal:school_recheck"),
        ])
        .unwrap();
        let rows = markup["inline_keyboard"].as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][0]["url"], "https://t.me/c");
        assert_eq!(rows[1][0]["callback_data"], "normal:school_recheck");
    }

    #[test]
    fn contact_request_uses_reply_keyboard() {
        let markup = reply_markup(&[Button::request_contact("Send number")]).unwrap();
        assert_eq!(markup["keyboard"][0][0]["request_contact"], true);
        assert_eq!(markup["one_time_keyboard"], true);
        assert!(markup.get("inline_keyboard").is_none());
    }

    #[test]
    fn no_buttons_no_markup() {
        assert!(reply_markup(&[]).is_none());
    }

    #[test]
    fn split_message_short() {
        assert_eq!(split_message("Hello", 4096), vec!["Hello"]);
    }

    #[test]
    fn split_message_prefers_newline() {
        let text = format!("{}\n{}", "a".repeat(10), "b".repeat(10));
        let chunks = split_message(&text, 15);
        assert_eq!(chunks, vec!["a".repeat(10), "b".repeat(10)]);
    }

    #[test]
    fn split_message_respects_char_boundaries() {
        let text = "ё".repeat(10);
        let chunks = split_message(&text, 5);
        assert!(chunks.iter().all(|c| c.len() <= 5));
        assert_eq!(chunks.concat(), text);
    }

    #[tokio::test]
    async fn unreachable_api_is_an_http_error() {
        let client = TelegramClient::new(SecretString::from("0:test"), "http://127.0.0.1:9");
        let err = client.send_message(1, "hi", &[]).await.unwrap_err();
        assert!(matches!(err, ChannelError::Http(_)));
        assert!(!err.to_string().contains("0:test"), "token must not leak");
    }
}
