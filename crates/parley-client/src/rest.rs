use reqwest::{Client, Response};
use serde::de::DeserializeOwned;

use parley_types::api::{
    ConversationResponse, DeleteResponse, ErrorBody, LoginRequest, LoginResponse, MessageResponse, RegisterRequest,
    UserSummary,
};
use parley_types::models::{ConversationId, UserId};

use crate::error::ClientError;

/// Thin client for the REST surface. Cheap to clone; clones share the
/// connection pool.
#[derive(Debug, Clone)]
pub struct RestClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    pub async fn register(&self, username: &str, password: &str) -> Result<UserSummary, ClientError> {
        let body = RegisterRequest {
            username: username.to_string(),
            password: password.to_string(),
        };
        let resp = self.client.post(self.url("/auth/register")).json(&body).send().await?;
        decode(resp).await
    }

    /// Log in and keep the issued token for subsequent calls.
    pub async fn login(&mut self, username: &str, password: &str) -> Result<LoginResponse, ClientError> {
        let body = LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        };
        let resp = self.client.post(self.url("/auth/login")).json(&body).send().await?;
        let login: LoginResponse = decode(resp).await?;
        self.token = Some(login.access_token.clone());
        Ok(login)
    }

    pub async fn list_conversations(&self, user: UserId) -> Result<Vec<ConversationResponse>, ClientError> {
        let request = self.client.get(self.url(&format!("/conversations/{user}")));
        decode(self.authorized(request).send().await?).await
    }

    pub async fn list_messages(&self, conversation: ConversationId) -> Result<Vec<MessageResponse>, ClientError> {
        let request = self.client.get(self.url(&format!("/messages/{conversation}")));
        decode(self.authorized(request).send().await?).await
    }

    pub async fn search_users(&self, query: &str) -> Result<Vec<UserSummary>, ClientError> {
        let request = self.client.get(self.url("/search-users")).query(&[("q", query)]);
        decode(self.authorized(request).send().await?).await
    }

    pub async fn delete_conversation(&self, conversation: ConversationId) -> Result<(), ClientError> {
        let request = self.client.delete(self.url(&format!("/conversation/{conversation}")));
        let _: DeleteResponse = decode(self.authorized(request).send().await?).await?;
        Ok(())
    }
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, ClientError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json().await?);
    }

    let text = resp.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<ErrorBody>(&text)
        .map(|body| body.detail)
        .unwrap_or_else(|_| status.canonical_reason().unwrap_or("request failed").to_string());
    Err(ClientError::Api {
        status: status.as_u16(),
        detail,
    })
}
