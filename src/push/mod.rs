pub mod messages;

use crate::error::ReportError;
use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{error, warn};

pub const MAX_BATCH: usize = 100;
const TOKEN_PREFIXES: [&str; 2] = ["ExponentPushToken[", "ExpoPushToken["];

pub fn is_valid_token(token: &str) -> bool {
    TOKEN_PREFIXES.iter().any(|prefix| token.starts_with(prefix))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    pub to: String,
    pub sound: String,
    pub title: String,
    pub body: String,
    pub data: Value,
    pub priority: String,
}

impl PushMessage {
    pub fn new(to: impl Into<String>, title: impl Into<String>, body: impl Into<String>, data: Value) -> Self {
        Self {
            to: to.into(),
            sound: "default".to_string(),
            title: title.into(),
            body: body.into(),
            data,
            priority: "high".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushTicket {
    pub status: TicketStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl PushTicket {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: TicketStatus::Error,
            id: None,
            message: Some(message.into()),
            details: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == TicketStatus::Ok
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchSummary {
    pub total: usize,
    pub sent: usize,
    pub failed: usize,
    pub tickets: Vec<PushTicket>,
}

/// Delivers at most `MAX_BATCH` messages per call, one ticket per message.
pub trait PushGateway: Send + Sync {
    fn send_batch(&self, messages: &[PushMessage]) -> Result<Vec<PushTicket>>;
}

#[derive(Debug, Deserialize)]
struct ExpoResponse {
    #[serde(default)]
    data: Vec<PushTicket>,
}

pub struct ExpoPushGateway {
    client: Client,
    endpoint: String,
}

impl ExpoPushGateway {
    pub fn new(endpoint: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .default_headers(headers)
            .build()
            .context("Failed to create push HTTP client")?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }
}

impl PushGateway for ExpoPushGateway {
    fn send_batch(&self, messages: &[PushMessage]) -> Result<Vec<PushTicket>> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(messages)
            .send()
            .map_err(|error| ReportError::ExternalService(format!("Push request failed: {error}")))?;

        let status = response.status();
        let body = response.text().context("Failed to read push response body")?;

        if !status.is_success() {
            let snippet = body.chars().take(200).collect::<String>();
            return Err(ReportError::ExternalService(format!("Push API error {status}: {snippet}")).into());
        }

        let parsed: ExpoResponse = serde_json::from_str(&body)
            .map_err(|error| ReportError::ExternalService(format!("Failed to parse push response: {error}")))?;

        Ok(parsed.data)
    }
}

/// Sends every message, never failing as a whole. Invalid tokens and failed
/// batches become error tickets; tickets stay in input order.
pub fn dispatch(gateway: &dyn PushGateway, messages: &[PushMessage]) -> DispatchSummary {
    let mut tickets: Vec<Option<PushTicket>> = vec![None; messages.len()];
    let mut valid = Vec::new();

    for (index, message) in messages.iter().enumerate() {
        if is_valid_token(&message.to) {
            valid.push(index);
        } else {
            warn!(token = %message.to, "Invalid Expo push token format");
            tickets[index] = Some(PushTicket::error("Invalid Expo push token format"));
        }
    }

    for chunk in valid.chunks(MAX_BATCH) {
        let batch = chunk
            .iter()
            .map(|index| messages[*index].clone())
            .collect::<Vec<_>>();

        match gateway.send_batch(&batch) {
            Ok(batch_tickets) => {
                let mut returned = batch_tickets.into_iter();
                for index in chunk {
                    tickets[*index] = Some(
                        returned
                            .next()
                            .unwrap_or_else(|| PushTicket::error("Push gateway returned no ticket")),
                    );
                }
            }
            Err(batch_error) => {
                error!(size = chunk.len(), "Push batch failed: {batch_error:#}");
                for index in chunk {
                    tickets[*index] = Some(PushTicket::error(format!("{batch_error:#}")));
                }
            }
        }
    }

    let tickets = tickets
        .into_iter()
        .map(|ticket| ticket.unwrap_or_else(|| PushTicket::error("Message was not sent")))
        .collect::<Vec<_>>();
    let sent = tickets.iter().filter(|ticket| ticket.is_ok()).count();

    DispatchSummary {
        total: messages.len(),
        sent,
        failed: messages.len() - sent,
        tickets,
    }
}

/// Single-message convenience used by the nudge jobs.
pub fn send_one(gateway: &dyn PushGateway, message: PushMessage) -> Result<PushTicket, String> {
    let summary = dispatch(gateway, std::slice::from_ref(&message));
    match summary.tickets.into_iter().next() {
        Some(ticket) if ticket.is_ok() => Ok(ticket),
        Some(ticket) => Err(ticket.message.unwrap_or_else(|| "Push failed".to_string())),
        None => Err("Push failed".to_string()),
    }
}
