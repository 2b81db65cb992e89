use crate::config::HttpConfig;
use reqwest::Client;
use tracing::warn;

pub fn build_client(config: &HttpConfig) -> Client {
    let mut builder = Client::builder()
        .timeout(config.timeout)
        .connect_timeout(config.connect_timeout)
        .user_agent(config.user_agent.clone());
    if let Some(proxy) = &config.proxy_url {
        match reqwest::Proxy::all(proxy) {
            Ok(proxy) => builder = builder.proxy(proxy),
            Err(err) => warn!(target = "argus.http", error = %err, "proxy_config_ignored"),
        }
    }
    builder.build().unwrap_or_else(|_| Client::new())
}
