//! Telegram Bot API client

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, trace};

use crate::config::TelegramConfig;
use crate::error::{BanwatchError, Result};
use crate::notify::{ChatTarget, InlineKeyboard, RenderedImage, Transport, TransportError};

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub first_name: String,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
    #[serde(rename = "type", default)]
    pub kind: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub from: Option<User>,
    pub chat: Chat,
    pub message_thread_id: Option<i64>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    pub message: Option<Message>,
    pub data: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

/// Hide everything after the bot id
pub fn mask_token(token: &str) -> String {
    match token.split_once(':') {
        Some((id, _)) => format!("{}:***", id),
        None if token.is_empty() => String::new(),
        None => "***".to_string(),
    }
}

pub struct TelegramClient {
    client: Client,
    base_url: String,
    poll_timeout: Duration,
}

impl TelegramClient {
    pub fn new(config: &TelegramConfig) -> Result<Self> {
        if config.bot_token.is_empty() {
            return Err(BanwatchError::ConfigurationMissing("BOT_TOKEN".into()));
        }

        let poll_timeout = Duration::from_secs(config.poll_timeout_secs);
        let client = Client::builder()
            // Long polls must outlive the server-side wait
            .timeout(poll_timeout + Duration::from_secs(15))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| BanwatchError::TransportDelivery(e.without_url().to_string()))?;

        Ok(Self {
            client,
            base_url: format!(
                "{}/bot{}",
                config.api_url.trim_end_matches('/'),
                config.bot_token
            ),
            poll_timeout,
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/{}", self.base_url, method)
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: &Value) -> std::result::Result<T, TransportError> {
        trace!("Telegram {}", method);
        let response = self
            .client
            .post(self.method_url(method))
            .json(body)
            .send()
            .await
            .map_err(request_error)?;
        read_response(method, response).await
    }

    async fn call_multipart<T: DeserializeOwned>(
        &self,
        method: &str,
        form: Form,
    ) -> std::result::Result<T, TransportError> {
        trace!("Telegram {} (multipart)", method);
        let response = self
            .client
            .post(self.method_url(method))
            .multipart(form)
            .send()
            .await
            .map_err(request_error)?;
        read_response(method, response).await
    }

    /// Identity of the bot; used as a startup credential check
    pub async fn get_me(&self) -> std::result::Result<User, TransportError> {
        self.call("getMe", &json!({})).await
    }

    /// Long-poll for updates after `offset`
    pub async fn get_updates(&self, offset: Option<i64>) -> std::result::Result<Vec<Update>, TransportError> {
        let mut body = json!({
            "timeout": self.poll_timeout.as_secs(),
            "allowed_updates": ["message", "callback_query"],
        });
        if let Some(offset) = offset {
            body["offset"] = json!(offset);
        }
        self.call("getUpdates", &body).await
    }
}

#[async_trait]
impl Transport for TelegramClient {
    async fn send_text(
        &self,
        target: &ChatTarget,
        text: &str,
        keyboard: Option<&InlineKeyboard>,
    ) -> std::result::Result<(), TransportError> {
        let mut body = json!({
            "chat_id": target.chat_id,
            "text": text,
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });
        if let Some(thread) = target.thread_id {
            body["message_thread_id"] = json!(thread);
        }
        if let Some(kb) = keyboard {
            body["reply_markup"] = json!(kb);
        }

        let _: Value = self.call("sendMessage", &body).await?;
        Ok(())
    }

    async fn send_image(
        &self,
        target: &ChatTarget,
        image: &RenderedImage,
        caption: Option<&str>,
        keyboard: Option<&InlineKeyboard>,
    ) -> std::result::Result<(), TransportError> {
        let document = Part::bytes(image.bytes.clone())
            .file_name(image.file_name.clone())
            .mime_str(image.mime)
            .map_err(|e| TransportError::permanent(e.without_url().to_string()))?;

        let mut form = Form::new()
            .text("chat_id", target.chat_id.to_string())
            .part("document", document);
        if let Some(thread) = target.thread_id {
            form = form.text("message_thread_id", thread.to_string());
        }
        if let Some(caption) = caption {
            form = form
                .text("caption", caption.to_string())
                .text("parse_mode", "HTML");
        }
        if let Some(kb) = keyboard {
            let markup = serde_json::to_string(kb).map_err(|e| TransportError::permanent(e.to_string()))?;
            form = form.text("reply_markup", markup);
        }

        let _: Value = self.call_multipart("sendDocument", form).await?;
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> std::result::Result<(), TransportError> {
        let mut body = json!({ "callback_query_id": callback_id });
        if let Some(text) = text {
            body["text"] = json!(text);
        }
        let _: bool = self.call("answerCallbackQuery", &body).await?;
        Ok(())
    }
}

// reqwest errors carry the URL, and the URL carries the token
fn request_error(e: reqwest::Error) -> TransportError {
    let retryable = e.is_timeout() || e.is_connect() || e.is_request();
    let message = e.without_url().to_string();
    if retryable {
        TransportError::retryable(message)
    } else {
        TransportError::permanent(message)
    }
}

async fn read_response<T: DeserializeOwned>(
    method: &str,
    response: reqwest::Response,
) -> std::result::Result<T, TransportError> {
    let status = response.status();
    let body = response.text().await.map_err(request_error)?;
    parse_response(method, status, &body)
}

/// Decode an API reply and classify failures for the retry loop
fn parse_response<T: DeserializeOwned>(
    method: &str,
    status: StatusCode,
    body: &str,
) -> std::result::Result<T, TransportError> {
    let parsed: ApiResponse<T> = match serde_json::from_str(body) {
        Ok(parsed) => parsed,
        Err(e) => {
            let message = format!("{}: HTTP {} with unreadable body ({})", method, status, e);
            return Err(if status.is_server_error() {
                TransportError::retryable(message)
            } else {
                TransportError::permanent(message)
            });
        }
    };

    if parsed.ok {
        if let Some(result) = parsed.result {
            return Ok(result);
        }
    }

    let description = parsed
        .description
        .unwrap_or_else(|| format!("HTTP {}", status));
    let message = format!("{}: {}", method, description);
    debug!("Telegram API error: {}", message);

    if let Some(secs) = parsed.parameters.and_then(|p| p.retry_after) {
        return Err(TransportError::rate_limited(message, Duration::from_secs(secs)));
    }
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return Err(TransportError::retryable(message));
    }
    Err(TransportError::permanent(message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_token() {
        assert_eq!(mask_token("123456:ABC-def_ghi"), "123456:***");
        assert_eq!(mask_token("garbage"), "***");
        assert_eq!(mask_token(""), "");
    }

    #[test]
    fn test_parse_ok() {
        let user: User = parse_response(
            "getMe",
            StatusCode::OK,
            r#"{"ok":true,"result":{"id":42,"is_bot":true,"first_name":"banwatch","username":"banwatch_bot"}}"#,
        )
        .unwrap();
        assert_eq!(user.id, 42);
        assert_eq!(user.username.as_deref(), Some("banwatch_bot"));
    }

    #[test]
    fn test_parse_rate_limited() {
        let err = parse_response::<Value>(
            "sendMessage",
            StatusCode::TOO_MANY_REQUESTS,
            r#"{"ok":false,"error_code":429,"description":"Too Many Requests: retry after 5","parameters":{"retry_after":5}}"#,
        )
        .unwrap_err();
        assert!(err.retryable);
        assert_eq!(err.retry_after, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_parse_permanent_and_server_errors() {
        let err = parse_response::<Value>(
            "sendMessage",
            StatusCode::BAD_REQUEST,
            r#"{"ok":false,"error_code":400,"description":"Bad Request: chat not found"}"#,
        )
        .unwrap_err();
        assert!(!err.retryable);
        assert!(err.message.contains("chat not found"));

        let err = parse_response::<Value>("sendMessage", StatusCode::BAD_GATEWAY, "<html>").unwrap_err();
        assert!(err.retryable);
    }

    #[test]
    fn test_parse_updates() {
        let updates: Vec<Update> = parse_response(
            "getUpdates",
            StatusCode::OK,
            r#"{"ok":true,"result":[
                {"update_id":10,"message":{"message_id":1,"from":{"id":7,"first_name":"a"},
                 "chat":{"id":7,"type":"private"},"text":"/stats"}},
                {"update_id":11,"callback_query":{"id":"cb","from":{"id":7,"first_name":"a"},
                 "data":"period:show:day","message":{"message_id":2,"chat":{"id":-100,"type":"supergroup"},
                 "message_thread_id":3}}}
            ]}"#,
        )
        .unwrap();

        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].message.as_ref().unwrap().text.as_deref(), Some("/stats"));
        let cb = updates[1].callback_query.as_ref().unwrap();
        assert_eq!(cb.data.as_deref(), Some("period:show:day"));
        assert_eq!(cb.message.as_ref().unwrap().message_thread_id, Some(3));
    }

    #[test]
    fn test_client_requires_token() {
        let config = TelegramConfig::default();
        assert!(matches!(
            TelegramClient::new(&config),
            Err(BanwatchError::ConfigurationMissing(_))
        ));
    }
}
