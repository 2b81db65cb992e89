use super::{NotificationChannel, NotifyError, ensure_success};
use crate::models::NotificationEvent;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};

/// WeCom group robot, markdown message type.
pub struct WecomBot {
    http: Client,
    url: String,
}

impl WecomBot {
    pub fn new(http: Client, url: String) -> Self {
        Self { http, url }
    }
}

fn escape_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '\\' | '`' | '*' | '_' | '[' | ']' | '(' | ')' | '#' | '>') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn markdown(event: &NotificationEvent) -> String {
    let mut lines = vec![
        format!("## {}", escape_markdown(&event.headline())),
        format!("> Price: {}", escape_markdown(&event.price)),
        format!("> Reason: {}", escape_markdown(&event.reason)),
    ];
    match &event.mobile_link {
        Some(mobile) => {
            lines.push(format!("> Mobile link: [{mobile}]({mobile})"));
            lines.push(format!("> Desktop link: [{0}]({0})", event.link));
        }
        None => lines.push(format!("> Link: [{0}]({0})", event.link)),
    }
    lines.join("\n")
}

#[async_trait]
impl NotificationChannel for WecomBot {
    fn name(&self) -> &'static str {
        "wecom"
    }

    async fn deliver(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        let payload = json!({
            "msgtype": "markdown",
            "markdown": { "content": markdown(event) }
        });
        let response = ensure_success(self.http.post(&self.url).json(&payload).send().await?)?;
        // The robot reports failures in-band with HTTP 200.
        let reply: Value = response.json().await.unwrap_or(Value::Null);
        match reply.get("errcode").and_then(Value::as_i64) {
            Some(code) if code != 0 => Err(NotifyError::Rejected(
                reply
                    .get("errmsg")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            )),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::fixtures;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_partial_json, method},
    };

    #[test]
    fn markdown_escapes_and_links() {
        let text = markdown(&fixtures::event());
        assert!(text.starts_with("## 🚨 New recommendation!"));
        assert!(text.contains("[https://www.goofish.com/item?id=42](https://www.goofish.com/item?id=42)"));
        assert_eq!(escape_markdown("a*b_[c]"), "a\\*b\\_\\[c\\]");
    }

    #[tokio::test]
    async fn in_band_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"msgtype": "markdown"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"errcode": 93000, "errmsg": "invalid webhook url"})),
            )
            .mount(&server)
            .await;
        let channel = WecomBot::new(Client::new(), server.uri());
        let err = channel.deliver(&fixtures::event()).await.err().expect("error");
        assert!(matches!(err, NotifyError::Rejected(msg) if msg == "invalid webhook url"));
    }
}
