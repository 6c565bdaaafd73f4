//! HTTP client for the chat REST endpoints.
//!
//! The coordinator only talks to [`ChatApi`]; [`ApiClient`] is the reqwest
//! implementation used in production.

use async_trait::async_trait;
use reqwest::{multipart, Client, RequestBuilder};
use scholaris_shared::{
    ApiError, Conversation, CreateConversationRequest, EditMessageRequest, Message, MessageType,
    PagedMessages, Recipient, SendMessageRequest,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A media attachment to send as a multipart message.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaUpload {
    pub kind: MessageType,
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub body: Option<String>,
    pub client_message_id: String,
}

impl MediaUpload {
    pub fn new(kind: MessageType, file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            kind,
            file_name: file_name.into(),
            bytes,
            body: None,
            client_message_id: crate::coordinator::new_client_message_id(),
        }
    }

    /// Caption sent alongside the file.
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// List endpoints answer either a bare array or a paginated envelope.
#[derive(Deserialize)]
#[serde(untagged)]
enum ListResponse<T> {
    Plain(Vec<T>),
    Paged { results: Vec<T> },
}

impl<T> ListResponse<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            ListResponse::Plain(items) | ListResponse::Paged { results: items } => items,
        }
    }
}

/// REST surface consumed by the coordinator and the pagination controller.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn list_recipients(&self) -> Result<Vec<Recipient>, ApiError>;

    async fn list_conversations(&self) -> Result<Vec<Conversation>, ApiError>;

    /// Create the conversation with `recipient_user_id`, or return the existing one.
    async fn create_conversation(&self, recipient_user_id: i64) -> Result<Conversation, ApiError>;

    async fn list_messages(
        &self,
        conversation_id: i64,
        limit: usize,
        cursor: Option<i64>,
    ) -> Result<PagedMessages, ApiError>;

    async fn send_message(
        &self,
        conversation_id: i64,
        body: &str,
        client_message_id: &str,
    ) -> Result<Message, ApiError>;

    async fn send_media(
        &self,
        conversation_id: i64,
        upload: MediaUpload,
    ) -> Result<Message, ApiError>;

    async fn edit_message(&self, message_id: i64, body: &str) -> Result<Message, ApiError>;

    async fn delete_message(&self, message_id: i64) -> Result<(), ApiError>;

    async fn delete_conversation(&self, conversation_id: i64) -> Result<(), ApiError>;
}

/// Path of the message listing endpoint, with the optional cursor.
pub fn messages_path(conversation_id: i64, limit: usize, cursor: Option<i64>) -> String {
    match cursor {
        Some(cursor) => format!(
            "/chat/conversations/{}/messages/?limit={}&cursor={}",
            conversation_id, limit, cursor
        ),
        None => format!(
            "/chat/conversations/{}/messages/?limit={}",
            conversation_id, limit
        ),
    }
}

/// HTTP client for the chat API of one tenant.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    /// Create a new API client
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            base_url: String::new(),
            token: None,
        }
    }

    /// Set the base URL for API requests
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Set the auth token sent as `Authorization: Token …`
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        let base = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{base}/{path}")
    }

    fn authorize(&self, rb: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => rb.header("Authorization", format!("Token {}", token)),
            None => rb,
        }
    }

    /// Send the request and return the body of a successful response.
    async fn execute(&self, rb: RequestBuilder) -> Result<String, ApiError> {
        let resp = self
            .authorize(rb)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        let status = resp.status().as_u16();
        let is_success = resp.status().is_success();
        let text = resp
            .text()
            .await
            .map_err(|e| ApiError::Network(format!("failed to read body: {e}")))?;

        if !is_success {
            crate::log_error!("HTTP {} from chat API: {}", status, text);
            return Err(ApiError::Http { status, body: text });
        }
        Ok(text)
    }

    fn decode<TRes: DeserializeOwned>(text: &str) -> Result<TRes, ApiError> {
        let text = if text.is_empty() { "null" } else { text };
        serde_json::from_str(text).map_err(|e| ApiError::Deserialize(e.to_string()))
    }

    pub async fn get_json<TRes: DeserializeOwned>(&self, path: &str) -> Result<TRes, ApiError> {
        let text = self.execute(self.client.get(self.url(path))).await?;
        Self::decode(&text)
    }

    pub async fn post_json<TReq: Serialize, TRes: DeserializeOwned>(
        &self,
        path: &str,
        body: &TReq,
    ) -> Result<TRes, ApiError> {
        let text = self
            .execute(self.client.post(self.url(path)).json(body))
            .await?;
        Self::decode(&text)
    }

    pub async fn patch_json<TReq: Serialize, TRes: DeserializeOwned>(
        &self,
        path: &str,
        body: &TReq,
    ) -> Result<TRes, ApiError> {
        let text = self
            .execute(self.client.patch(self.url(path)).json(body))
            .await?;
        Self::decode(&text)
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.execute(self.client.delete(self.url(path))).await?;
        Ok(())
    }

    pub async fn post_multipart<TRes: DeserializeOwned>(
        &self,
        path: &str,
        form: multipart::Form,
    ) -> Result<TRes, ApiError> {
        let text = self
            .execute(self.client.post(self.url(path)).multipart(form))
            .await?;
        Self::decode(&text)
    }
}

impl Default for ApiClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatApi for ApiClient {
    async fn list_recipients(&self) -> Result<Vec<Recipient>, ApiError> {
        let list: ListResponse<Recipient> = self.get_json("/chat/recipients/").await?;
        Ok(list.into_vec())
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>, ApiError> {
        let list: ListResponse<Conversation> = self.get_json("/chat/conversations/list/").await?;
        Ok(list.into_vec())
    }

    async fn create_conversation(&self, recipient_user_id: i64) -> Result<Conversation, ApiError> {
        self.post_json(
            "/chat/conversations/",
            &CreateConversationRequest { recipient_user_id },
        )
        .await
    }

    async fn list_messages(
        &self,
        conversation_id: i64,
        limit: usize,
        cursor: Option<i64>,
    ) -> Result<PagedMessages, ApiError> {
        let mut page: PagedMessages = self
            .get_json(&messages_path(conversation_id, limit, cursor))
            .await?;
        for message in &mut page.results {
            if message.conversation_id == 0 {
                message.conversation_id = conversation_id;
            }
        }
        Ok(page)
    }

    async fn send_message(
        &self,
        conversation_id: i64,
        body: &str,
        client_message_id: &str,
    ) -> Result<Message, ApiError> {
        let mut message: Message = self
            .post_json(
                &format!("/chat/conversations/{}/send/", conversation_id),
                &SendMessageRequest {
                    body: body.to_string(),
                    client_message_id: client_message_id.to_string(),
                },
            )
            .await?;
        message.conversation_id = conversation_id;
        Ok(message)
    }

    async fn send_media(
        &self,
        conversation_id: i64,
        upload: MediaUpload,
    ) -> Result<Message, ApiError> {
        let file = multipart::Part::bytes(upload.bytes).file_name(upload.file_name);
        let mut form = multipart::Form::new()
            .text("type", upload.kind.as_str())
            .text("client_message_id", upload.client_message_id)
            .part("file", file);
        if let Some(body) = upload.body {
            form = form.text("body", body);
        }
        let mut message: Message = self
            .post_multipart(
                &format!("/chat/conversations/{}/send/", conversation_id),
                form,
            )
            .await?;
        message.conversation_id = conversation_id;
        Ok(message)
    }

    async fn edit_message(&self, message_id: i64, body: &str) -> Result<Message, ApiError> {
        self.patch_json(
            &format!("/chat/messages/{}/", message_id),
            &EditMessageRequest {
                body: body.to_string(),
            },
        )
        .await
    }

    async fn delete_message(&self, message_id: i64) -> Result<(), ApiError> {
        self.delete(&format!("/chat/messages/{}/", message_id)).await
    }

    async fn delete_conversation(&self, conversation_id: i64) -> Result<(), ApiError> {
        self.delete(&format!("/chat/conversations/{}/", conversation_id))
            .await
    }
}
