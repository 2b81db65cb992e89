use super::{NotificationChannel, NotifyError, ensure_success};
use crate::models::NotificationEvent;
use async_trait::async_trait;
use html_escape::{encode_double_quoted_attribute, encode_text};
use reqwest::Client;
use serde_json::{Value, json};

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

pub struct Telegram {
    http: Client,
    api_base: String,
    bot_token: String,
    chat_id: String,
}

impl Telegram {
    pub fn new(http: Client, api_base: Option<String>, bot_token: String, chat_id: String) -> Self {
        Self {
            http,
            api_base: api_base
                .unwrap_or_else(|| DEFAULT_API_BASE.into())
                .trim_end_matches('/')
                .to_string(),
            bot_token,
            chat_id,
        }
    }
}

fn anchor(label: &str, href: &str) -> String {
    format!(
        "<a href=\"{}\">{}</a>",
        encode_double_quoted_attribute(href),
        encode_text(label)
    )
}

fn html(event: &NotificationEvent) -> String {
    let mut text = format!(
        "<b>{}</b>\n\nPrice: {}\nReason: {}\n",
        encode_text(&event.headline()),
        encode_text(&event.price),
        encode_text(&event.reason)
    );
    match &event.mobile_link {
        Some(mobile) => {
            text.push_str(&format!("Mobile link: {}\n", anchor("open in app", mobile)));
            text.push_str(&format!("Desktop link: {}", anchor("open on web", &event.link)));
        }
        None => text.push_str(&format!("Link: {}", anchor("view listing", &event.link))),
    }
    text
}

#[async_trait]
impl NotificationChannel for Telegram {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn deliver(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.bot_token);
        let payload = json!({
            "chat_id": self.chat_id,
            "text": html(event),
            "parse_mode": "HTML",
            "disable_web_page_preview": false
        });
        let response = ensure_success(self.http.post(url).json(&payload).send().await?)?;
        let reply: Value = response
            .json()
            .await
            .map_err(|err| NotifyError::Http(err.to_string()))?;
        if reply.get("ok").and_then(Value::as_bool) == Some(true) {
            Ok(())
        } else {
            Err(NotifyError::Rejected(
                reply
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or("ok=false")
                    .to_string(),
            ))
        }
    }
}
