use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

pub const TOKEN_COOKIE: &str = "_m_h5_tk";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session file unreadable: {0}")]
    Io(String),
    #[error("session file malformed: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: Option<String>,
}

/// Authenticated cookie bundle captured by the login flow.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Session {
    #[serde(default)]
    pub cookies: Vec<Cookie>,
}

impl Session {
    pub async fn load(path: &Path) -> Result<Self, SessionError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|err| SessionError::Io(format!("{}: {err}", path.display())))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, SessionError> {
        serde_json::from_str(raw).map_err(|err| SessionError::Malformed(err.to_string()))
    }

    #[cfg(test)]
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self {
            cookies: pairs
                .iter()
                .map(|(name, value)| Cookie {
                    name: name.to_string(),
                    value: value.to_string(),
                    domain: None,
                })
                .collect(),
        }
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .rev()
            .find(|c| c.name == name)
            .map(|c| c.value.as_str())
    }

    pub fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// The signing token: `_m_h5_tk` up to its first `_`. Empty when the cookie is absent.
    pub fn token_prefix(&self) -> &str {
        self.cookie(TOKEN_COOKIE)
            .map(|tk| tk.split('_').next().unwrap_or(tk))
            .unwrap_or("")
    }
}

/// `md5(token & t & appKey & data)` as the search and detail gateways expect.
pub fn sign(token: &str, timestamp_ms: i64, app_key: &str, data: &str) -> String {
    let digest = md5::compute(format!("{token}&{timestamp_ms}&{app_key}&{data}"));
    format!("{digest:x}")
}
