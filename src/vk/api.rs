use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::config::VkConfig;
use crate::vk::longpoll::{LongPollTransport, PollError, PollServer, RawPollResponse};

const API_BASE: &str = "https://api.vk.com/method";

#[derive(Debug, Error)]
pub enum VkApiError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("vk api error {code}: {message}")]
    Api { code: i64, message: String },
    #[error("malformed vk api response: {0}")]
    Malformed(String),
}

/// An outbound chat message. The peer id of a chat is its chat id plus
/// [`crate::vk::update::CHAT_PEER_OFFSET`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub peer_id: i64,
    pub message: String,
    pub attachment: Option<String>,
    pub forward_messages: Option<i64>,
}

impl OutgoingMessage {
    pub fn text(peer_id: i64, message: impl Into<String>) -> Self {
        Self {
            peer_id,
            message: message.into(),
            ..Default::default()
        }
    }
}

/// Capability to push one message out to the platform. The dispatcher and
/// the features depend on this seam rather than on the concrete client.
#[async_trait]
pub trait OutboundSender: Send + Sync {
    async fn send(&self, message: OutgoingMessage) -> Result<(), VkApiError>;
}

/// Thin reqwest client for the handful of VK API methods the bot needs.
#[derive(Clone)]
pub struct VkApi {
    client: reqwest::Client,
    access_token: String,
    api_version: String,
}

impl VkApi {
    pub fn new(config: &VkConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            access_token: config.access_token.clone(),
            api_version: config.api_version.clone(),
        }
    }

    /// Call one API method and unwrap the `response` envelope.
    async fn call(&self, method: &str, params: &[(&str, String)]) -> Result<Value, VkApiError> {
        debug!("calling vk api method {}", method);

        let url = format!("{}/{}", API_BASE, method);
        let body: Value = self
            .client
            .get(&url)
            .query(params)
            .query(&[
                ("access_token", self.access_token.as_str()),
                ("v", self.api_version.as_str()),
            ])
            .send()
            .await?
            .json()
            .await?;

        if let Some(error) = body.get("error") {
            return Err(VkApiError::Api {
                code: error.get("error_code").and_then(Value::as_i64).unwrap_or(-1),
                message: error
                    .get("error_msg")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            });
        }

        body.get("response")
            .cloned()
            .ok_or_else(|| VkApiError::Malformed(format!("{} returned no response field", method)))
    }
}

#[async_trait]
impl LongPollTransport for VkApi {
    async fn acquire(&self) -> Result<PollServer, PollError> {
        let response = self
            .call(
                "messages.getLongPollServer",
                &[
                    ("need_pts", "0".to_string()),
                    ("lp_version", "3".to_string()),
                ],
            )
            .await?;

        serde_json::from_value(response)
            .map_err(|e| VkApiError::Malformed(format!("long poll server triple: {}", e)).into())
    }

    async fn poll(&self, server: &PollServer, wait: u64) -> Result<RawPollResponse, PollError> {
        let url = format!("https://{}", server.server);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("act", "a_check".to_string()),
                ("key", server.key.clone()),
                ("ts", server.ts.to_string()),
                ("wait", wait.to_string()),
                ("mode", "2".to_string()),
                ("version", "3".to_string()),
            ])
            .send()
            .await
            .map_err(VkApiError::from)?
            .json()
            .await
            .map_err(VkApiError::from)?;

        Ok(response)
    }
}

#[async_trait]
impl OutboundSender for VkApi {
    async fn send(&self, message: OutgoingMessage) -> Result<(), VkApiError> {
        let mut params = vec![
            ("peer_id", message.peer_id.to_string()),
            ("message", message.message),
        ];
        if let Some(attachment) = message.attachment {
            params.push(("attachment", attachment));
        }
        if let Some(forwarded) = message.forward_messages {
            params.push(("forward_messages", forwarded.to_string()));
        }

        self.call("messages.send", &params).await?;
        Ok(())
    }
}
