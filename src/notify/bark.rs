use super::{NotificationChannel, NotifyError, ensure_success};
use crate::models::NotificationEvent;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

const GROUP: &str = "argus";

pub struct Bark {
    http: Client,
    url: String,
}

impl Bark {
    pub fn new(http: Client, url: String) -> Self {
        Self { http, url }
    }
}

#[derive(Debug, Serialize)]
struct BarkPayload<'a> {
    title: String,
    body: String,
    level: &'static str,
    group: &'static str,
    url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    icon: Option<&'a str>,
}

#[async_trait]
impl NotificationChannel for Bark {
    fn name(&self) -> &'static str {
        "bark"
    }

    async fn deliver(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        let payload = BarkPayload {
            title: event.headline(),
            body: format!("Price: {}\nReason: {}", event.price, event.reason),
            level: "timeSensitive",
            group: GROUP,
            url: event.preferred_link(),
            icon: event.icon.as_deref(),
        };
        let response = self.http.post(&self.url).json(&payload).send().await?;
        ensure_success(response).map(|_| ())
    }
}
