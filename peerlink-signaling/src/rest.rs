use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use peerlink_core::config::SignalingConfig;

use crate::error::{Error, Result};
use crate::mailbox::Mailbox;
use crate::message::{MessageKind, SignalBody, SignalingMessage};
use crate::types::{RoomId, Sequence, UserId};

/// Row shape sent on insert; the store fills in `id` and `created_at`
#[derive(Serialize)]
struct NewMessage<'a> {
    room_id: &'a RoomId,
    from_user_id: &'a UserId,
    message_type: MessageKind,
    payload: serde_json::Value,
}

/// Mailbox backed by a PostgREST-style HTTP table
///
/// Inserts use `Prefer: return=representation` so the assigned row id comes
/// back as the sequence number. Reads filter with PostgREST operators
/// (`eq.`, `neq.`, `gt.`) and order by id ascending.
#[derive(Debug, Clone)]
pub struct RestMailbox {
    client: Client,
    endpoint: Url,
    api_key: String,
}

impl RestMailbox {
    pub fn new(
        base_url: &str,
        table: &str,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let mut base = Url::parse(base_url)
            .map_err(|e| Error::Configuration(format!("invalid base url {base_url}: {e}")))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let endpoint = base
            .join(&format!("rest/v1/{table}"))
            .map_err(|e| Error::Configuration(format!("invalid table {table}: {e}")))?;

        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            endpoint,
            api_key: api_key.into(),
        })
    }

    pub fn from_config(config: &SignalingConfig) -> Result<Self> {
        Self::new(
            &config.base_url,
            &config.table,
            config.api_key.clone(),
            config.request_timeout(),
        )
    }

    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(Error::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl Mailbox for RestMailbox {
    async fn append(&self, room: &RoomId, sender: &UserId, body: &SignalBody) -> Result<Sequence> {
        let row = NewMessage {
            room_id: room,
            from_user_id: sender,
            message_type: body.kind(),
            payload: body.payload()?,
        };

        let response = self
            .authorized(self.client.post(self.endpoint.clone()))
            .header("Prefer", "return=representation")
            .json(&row)
            .send()
            .await?;
        let stored: Vec<SignalingMessage> = Self::check(response).await?.json().await?;

        let sequence = stored
            .first()
            .map(|m| m.sequence)
            .ok_or_else(|| Error::InvalidMessage("insert returned no row".to_string()))?;

        debug!(
            room_id = %room,
            kind = %body.kind(),
            sequence,
            "Appended signaling message"
        );
        Ok(sequence)
    }

    async fn list_since(
        &self,
        room: &RoomId,
        exclude_sender: &UserId,
        cursor: Sequence,
    ) -> Result<Vec<SignalingMessage>> {
        let response = self
            .authorized(self.client.get(self.endpoint.clone()))
            .query(&[
                ("room_id", format!("eq.{room}")),
                ("from_user_id", format!("neq.{exclude_sender}")),
                ("id", format!("gt.{cursor}")),
                ("order", "id.asc".to_string()),
            ])
            .send()
            .await?;
        let rows: Vec<serde_json::Value> = Self::check(response).await?.json().await?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            match serde_json::from_value::<SignalingMessage>(row) {
                Ok(message) => messages.push(message),
                Err(e) => warn!(room_id = %room, error = %e, "Skipping unreadable signaling row"),
            }
        }
        Ok(messages)
    }

    async fn clear(&self, room: &RoomId) -> Result<()> {
        let response = self
            .authorized(self.client.delete(self.endpoint.clone()))
            .query(&[("room_id", format!("eq.{room}"))])
            .send()
            .await?;
        Self::check(response).await?;
        debug!(room_id = %room, "Cleared signaling room");
        Ok(())
    }
}
