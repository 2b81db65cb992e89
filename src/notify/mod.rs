//! Alert delivery. Every configured channel gets the event independently; a
//! failing channel is logged and never affects its siblings or the caller.

pub mod bark;
pub mod gotify;
pub mod ntfy;
pub mod telegram;
pub mod webhook;
pub mod wecom;

use crate::{config::NotifyConfig, models::NotificationEvent};
use async_trait::async_trait;
use futures::future::join_all;
use reqwest::{Client, Response};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("request failed: {0}")]
    Http(String),
    #[error("channel answered HTTP {0}")]
    Status(u16),
    #[error("channel rejected the message: {0}")]
    Rejected(String),
    #[error("channel misconfigured: {0}")]
    Config(String),
}

impl From<reqwest::Error> for NotifyError {
    fn from(err: reqwest::Error) -> Self {
        NotifyError::Http(err.to_string())
    }
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &'static str;

    async fn deliver(&self, event: &NotificationEvent) -> Result<(), NotifyError>;
}

pub(crate) fn ensure_success(response: Response) -> Result<Response, NotifyError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(NotifyError::Status(status.as_u16()))
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct FanoutReport {
    pub delivered: Vec<&'static str>,
    pub failed: Vec<&'static str>,
}

pub struct NotificationFanout {
    channels: Vec<Box<dyn NotificationChannel>>,
}

impl NotificationFanout {
    pub fn new(channels: Vec<Box<dyn NotificationChannel>>) -> Self {
        Self { channels }
    }

    /// Builds one channel per configured destination.
    pub fn from_config(http: Client, config: &NotifyConfig) -> Self {
        let mut channels: Vec<Box<dyn NotificationChannel>> = Vec::new();
        if let Some(url) = &config.ntfy_topic_url {
            channels.push(Box::new(ntfy::Ntfy::new(http.clone(), url.clone())));
        }
        if let (Some(url), Some(token)) = (&config.gotify_url, &config.gotify_token) {
            channels.push(Box::new(gotify::Gotify::new(http.clone(), url.clone(), token.clone())));
        }
        if let Some(url) = &config.bark_url {
            channels.push(Box::new(bark::Bark::new(http.clone(), url.clone())));
        }
        if let Some(url) = &config.wecom_bot_url {
            channels.push(Box::new(wecom::WecomBot::new(http.clone(), url.clone())));
        }
        if let (Some(token), Some(chat_id)) = (&config.telegram_bot_token, &config.telegram_chat_id) {
            channels.push(Box::new(telegram::Telegram::new(
                http.clone(),
                config.telegram_api_base.clone(),
                token.clone(),
                chat_id.clone(),
            )));
        }
        if let Some(settings) = &config.webhook {
            channels.push(Box::new(webhook::Webhook::new(http, settings.clone())));
        }
        Self::new(channels)
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn channel_names(&self) -> Vec<&'static str> {
        self.channels.iter().map(|c| c.name()).collect()
    }

    pub async fn notify(&self, event: &NotificationEvent) -> FanoutReport {
        if self.channels.is_empty() {
            warn!(target = "argus.notify", title = %event.title, "no_channels_configured");
            return FanoutReport::default();
        }
        let attempts = self
            .channels
            .iter()
            .map(|channel| async move { (channel.name(), channel.deliver(event).await) });

        let mut report = FanoutReport::default();
        for (name, result) in join_all(attempts).await {
            match result {
                Ok(()) => {
                    info!(target = "argus.notify", channel = name, link = %event.link, "notification_delivered");
                    report.delivered.push(name);
                }
                Err(err) => {
                    warn!(target = "argus.notify", channel = name, error = %err, "notification_failed");
                    report.failed.push(name);
                }
            }
        }
        report
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    struct Counting {
        name: &'static str,
        fail: bool,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl NotificationChannel for Counting {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn deliver(&self, _event: &NotificationEvent) -> Result<(), NotifyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(NotifyError::Status(500))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn failing_channel_does_not_block_siblings() {
        let calls = Arc::new(AtomicUsize::new(0));
        let channel = |name, fail| -> Box<dyn NotificationChannel> {
            Box::new(Counting {
                name,
                fail,
                calls: calls.clone(),
            })
        };
        let fanout = NotificationFanout::new(vec![
            channel("a", false),
            channel("b", true),
            channel("c", false),
        ]);
        let report = fanout.notify(&fixtures::event()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.delivered, vec!["a", "c"]);
        assert_eq!(report.failed, vec!["b"]);
    }

    #[test]
    fn only_complete_destinations_become_channels() {
        let config = NotifyConfig {
            ntfy_topic_url: Some("https://ntfy.sh/argus".into()),
            gotify_url: Some("https://gotify.local".into()),
            telegram_bot_token: Some("123:abc".into()),
            ..NotifyConfig::default()
        };
        let fanout = NotificationFanout::from_config(Client::new(), &config);
        assert_eq!(fanout.channel_names(), vec!["ntfy"]);
    }
}
