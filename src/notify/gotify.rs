use super::{NotificationChannel, NotifyError, ensure_success};
use crate::models::NotificationEvent;
use async_trait::async_trait;
use reqwest::{Client, multipart::Form};

pub struct Gotify {
    http: Client,
    base_url: String,
    token: String,
}

impl Gotify {
    pub fn new(http: Client, base_url: String, token: String) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }
}

#[async_trait]
impl NotificationChannel for Gotify {
    fn name(&self) -> &'static str {
        "gotify"
    }

    async fn deliver(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        let form = Form::new()
            .text("title", event.headline())
            .text("message", event.message())
            .text("priority", "5");
        let response = self
            .http
            .post(format!("{}/message", self.base_url))
            .query(&[("token", self.token.as_str())])
            .multipart(form)
            .send()
            .await?;
        ensure_success(response).map(|_| ())
    }
}
