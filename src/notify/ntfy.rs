use super::{NotificationChannel, NotifyError, ensure_success};
use crate::models::NotificationEvent;
use async_trait::async_trait;
use base64::Engine as _;
use reqwest::Client;

pub struct Ntfy {
    http: Client,
    topic_url: String,
}

impl Ntfy {
    pub fn new(http: Client, topic_url: String) -> Self {
        Self { http, topic_url }
    }
}

/// Header values must be ASCII; anything else goes out as an RFC 2047 encoded word.
fn header_text(text: &str) -> String {
    if text.is_ascii() {
        return text.to_string();
    }
    format!(
        "=?UTF-8?B?{}?=",
        base64::engine::general_purpose::STANDARD.encode(text.as_bytes())
    )
}

#[async_trait]
impl NotificationChannel for Ntfy {
    fn name(&self) -> &'static str {
        "ntfy"
    }

    async fn deliver(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        let response = self
            .http
            .post(&self.topic_url)
            .header("Title", header_text(&event.headline()))
            .header("Priority", "urgent")
            .header("Tags", "bell,vibration")
            .body(event.message())
            .send()
            .await?;
        ensure_success(response).map(|_| ())
    }
}
