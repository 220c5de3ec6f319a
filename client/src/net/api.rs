//! REST adapter for the message log.
//!
//! ERROR HANDLING
//! ==============
//! Non-2xx responses become [`ClientError::Status`] carrying the body text so
//! callers can log what the server said.

use async_trait::async_trait;
use events::{Chat, Message};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{MessageLog, NewChat};
use crate::error::ClientError;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReadBody<'a> {
    user_id: &'a str,
}

/// [`MessageLog`] over the server's `/api` routes.
#[derive(Debug, Clone)]
pub struct HttpMessageLog {
    base_url: String,
    client: reqwest::Client,
}

impl HttpMessageLog {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, reqwest::Client::new())
    }

    #[must_use]
    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_owned();
        Self { base_url, client }
    }

    /// Append `segments` to the base URL. Each segment is percent-encoded, so
    /// ids containing `/`, `?` or `#` stay one path segment.
    fn endpoint(&self, segments: &[&str]) -> Result<reqwest::Url, ClientError> {
        let invalid = || ClientError::InvalidBaseUrl(self.base_url.clone());
        let mut url = reqwest::Url::parse(&self.base_url).map_err(|_| invalid())?;
        url.path_segments_mut()
            .map_err(|()| invalid())?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        segments: &[&str],
        body: Option<&(impl Serialize + Sync)>,
    ) -> Result<T, ClientError> {
        let request = self.client.request(method, self.endpoint(segments)?);
        let request = if let Some(body) = body { request.json(body) } else { request };

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status { status: status.as_u16(), body });
        }
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl MessageLog for HttpMessageLog {
    async fn list_chats(&self, user_id: &str) -> Result<Vec<Chat>, ClientError> {
        self.request(reqwest::Method::GET, &chats_path(user_id), None::<&()>)
            .await
    }

    async fn create_chat(&self, chat: &NewChat) -> Result<Chat, ClientError> {
        self.request(reqwest::Method::POST, &["api", "chats"], Some(chat)).await
    }

    async fn load_messages(&self, chat_id: &str) -> Result<Vec<Message>, ClientError> {
        self.request(reqwest::Method::GET, &messages_path(chat_id), None::<&()>)
            .await
    }

    async fn mark_read(&self, message_id: &str, user_id: &str) -> Result<Message, ClientError> {
        self.request(reqwest::Method::POST, &read_path(message_id), Some(&ReadBody { user_id }))
            .await
    }
}

fn chats_path(user_id: &str) -> [&str; 4] {
    ["api", "users", user_id, "chats"]
}

fn messages_path(chat_id: &str) -> [&str; 4] {
    ["api", "chats", chat_id, "messages"]
}

fn read_path(message_id: &str) -> [&str; 4] {
    ["api", "messages", message_id, "read"]
}

#[cfg(test)]
#[path = "api_test.rs"]
mod tests;
