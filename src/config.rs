use std::{env, path::PathBuf, time::Duration};

/// Everything a monitoring process needs, read once at startup and handed to
/// each component constructor. Nothing below is global; tests build their own.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub http: HttpConfig,
    pub source: SourceConfig,
    pub guard: GuardConfig,
    pub llm: LlmConfig,
    pub judge: JudgeConfig,
    pub notify: NotifyConfig,
    pub storage: StorageConfig,
    pub scheduler: SchedulerConfig,
}

impl MonitorConfig {
    pub fn from_env() -> Self {
        Self {
            http: HttpConfig::from_env(),
            source: SourceConfig::from_env(),
            guard: GuardConfig::from_env(),
            llm: LlmConfig::from_env(),
            judge: JudgeConfig::from_env(),
            notify: NotifyConfig::from_env(),
            storage: StorageConfig::from_env(),
            scheduler: SchedulerConfig::from_env(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: String,
    pub proxy_url: Option<String>,
}

impl HttpConfig {
    pub fn from_env() -> Self {
        Self {
            timeout: Duration::from_secs(env_u64("HTTP_TIMEOUT_SECS", 30)),
            connect_timeout: Duration::from_secs(env_u64("HTTP_CONNECT_TIMEOUT_SECS", 5)),
            user_agent: env::var("HTTP_USER_AGENT").unwrap_or_else(|_| DEFAULT_USER_AGENT.into()),
            proxy_url: env_opt("PROXY_URL"),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            user_agent: DEFAULT_USER_AGENT.into(),
            proxy_url: None,
        }
    }
}

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/140.0.0.0 Safari/537.36";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStrategy {
    Api,
    Browser,
    Auto,
}

impl SourceStrategy {
    pub fn from_str(input: &str) -> Option<Self> {
        match input.trim().to_lowercase().as_str() {
            "api" => Some(Self::Api),
            "browser" => Some(Self::Browser),
            "auto" => Some(Self::Auto),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub strategy: SourceStrategy,
    pub api_base: String,
    pub web_base: String,
    pub app_key: String,
    pub page_size: u32,
    pub session_file: PathBuf,
    pub pc_url_to_mobile: bool,
}

impl SourceConfig {
    pub fn from_env() -> Self {
        Self {
            strategy: env_opt("SOURCE_STRATEGY")
                .and_then(|v| SourceStrategy::from_str(&v))
                .unwrap_or(SourceStrategy::Auto),
            api_base: env::var("SEARCH_API_BASE")
                .unwrap_or_else(|_| "https://h5api.m.goofish.com/h5".into())
                .trim_end_matches('/')
                .to_string(),
            web_base: env::var("WEB_BASE")
                .unwrap_or_else(|_| "https://www.goofish.com".into())
                .trim_end_matches('/')
                .to_string(),
            app_key: env::var("SEARCH_APP_KEY").unwrap_or_else(|_| "34839810".into()),
            page_size: env_u64("SEARCH_PAGE_SIZE", 30).clamp(1, 100) as u32,
            session_file: PathBuf::from(
                env::var("SESSION_STATE_FILE").unwrap_or_else(|_| "xianyu_state.json".into()),
            ),
            pc_url_to_mobile: env_bool("PCURL_TO_MOBILE"),
        }
    }
}

/// Inclusive range of seconds for one kind of randomized pause.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DelayRange {
    pub min_secs: f64,
    pub max_secs: f64,
}

impl DelayRange {
    pub const fn new(min_secs: f64, max_secs: f64) -> Self {
        Self { min_secs, max_secs }
    }

    pub const ZERO: DelayRange = DelayRange::new(0.0, 0.0);
}

#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub headless: bool,
    pub dom_selectors: Vec<String>,
    pub challenge_texts: Vec<String>,
    pub page_keywords: Vec<String>,
    pub script_error_keywords: Vec<String>,
    pub normal_marker: String,
    pub max_remediation_attempts: u32,
    pub intervention_max_wait: Duration,
    pub intervention_check_interval: Duration,
    pub stabilization_delay: Duration,
    pub cooldown_min: Duration,
    pub cooldown_max: Duration,
    pub solver: SolverKind,
    pub page_load_delay: DelayRange,
    pub item_delay: DelayRange,
    pub post_item_delay: DelayRange,
    pub page_turn_delay: DelayRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverKind {
    None,
    Grid,
}

impl GuardConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            headless: env::var("RUN_HEADLESS")
                .map(|v| v.trim().to_lowercase() != "false")
                .unwrap_or(true),
            max_remediation_attempts: env_u64("GUARD_REMEDIATION_ATTEMPTS", 1) as u32,
            intervention_max_wait: Duration::from_secs(env_u64("GUARD_MAX_WAIT_SECS", 300)),
            intervention_check_interval: Duration::from_secs(
                env_u64("GUARD_CHECK_INTERVAL_SECS", 10).max(1),
            ),
            stabilization_delay: Duration::from_secs(env_u64("GUARD_STABILIZATION_SECS", 5)),
            cooldown_min: Duration::from_secs(env_u64("GUARD_COOLDOWN_MIN_SECS", 300)),
            cooldown_max: Duration::from_secs(env_u64("GUARD_COOLDOWN_MAX_SECS", 600)),
            solver: match env_opt("CAPTCHA_SOLVER").as_deref() {
                Some("grid") => SolverKind::Grid,
                _ => SolverKind::None,
            },
            ..defaults
        }
    }

    #[cfg(test)]
    /// Same markers as production, no pauses, tight intervention budget.
    pub fn for_tests() -> Self {
        Self {
            intervention_max_wait: Duration::from_millis(30),
            intervention_check_interval: Duration::from_millis(10),
            stabilization_delay: Duration::ZERO,
            cooldown_min: Duration::ZERO,
            cooldown_max: Duration::ZERO,
            page_load_delay: DelayRange::ZERO,
            item_delay: DelayRange::ZERO,
            post_item_delay: DelayRange::ZERO,
            page_turn_delay: DelayRange::ZERO,
            ..Self::default()
        }
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        let owned = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            headless: true,
            dom_selectors: owned(&[
                "div.baxia-dialog-mask",
                "div.J_MIDDLEWARE_FRAME_WIDGET",
                "div[class*='baxia-dialog']",
                "div[class*='verify-dialog']",
                "div[class*='captcha-dialog']",
                "div[class*='anti-robot']",
                "div[class*='slider-verify']",
                "div[class*='human-verify']",
                "iframe[src*='captcha']",
                "iframe[src*='verify']",
            ]),
            challenge_texts: owned(&[
                "异常流量",
                "请完成验证",
                "安全验证",
                "人机验证",
                "滑动验证",
                "访问过于频繁",
            ]),
            page_keywords: owned(&["captcha", "verify", "challenge", "robot", "验证", "异常"]),
            script_error_keywords: owned(&[
                "captcha", "verify", "robot", "block", "ban", "anti", "crawler",
            ]),
            normal_marker: "新发布".into(),
            max_remediation_attempts: 1,
            intervention_max_wait: Duration::from_secs(300),
            intervention_check_interval: Duration::from_secs(10),
            stabilization_delay: Duration::from_secs(5),
            cooldown_min: Duration::from_secs(300),
            cooldown_max: Duration::from_secs(600),
            solver: SolverKind::None,
            page_load_delay: DelayRange::new(2.0, 4.0),
            item_delay: DelayRange::new(3.0, 6.0),
            post_item_delay: DelayRange::new(2.0, 4.0),
            page_turn_delay: DelayRange::new(25.0, 50.0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub max_tokens: u32,
    pub enable_thinking_switch: bool,
}

impl LlmConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: env::var("OPENAI_BASE_URL")
                .unwrap_or_default()
                .trim_end_matches('/')
                .to_string(),
            api_key: env_opt("OPENAI_API_KEY"),
            model: env_opt("OPENAI_MODEL_NAME"),
            max_tokens: env_u64("AI_MAX_TOKENS", 4000) as u32,
            enable_thinking_switch: env_bool("ENABLE_THINKING"),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.base_url.is_empty() && self.model.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct JudgeConfig {
    pub max_attempts: u32,
    pub initial_temperature: f32,
    pub skip_analysis: bool,
    pub debug: bool,
}

impl JudgeConfig {
    pub fn from_env() -> Self {
        Self {
            max_attempts: env_u64("AI_MAX_ATTEMPTS", 3).clamp(1, 10) as u32,
            initial_temperature: 0.1,
            skip_analysis: env_bool("SKIP_AI_ANALYSIS"),
            debug: env_bool("AI_DEBUG_MODE"),
        }
    }
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_temperature: 0.1,
            skip_analysis: false,
            debug: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NotifyConfig {
    pub ntfy_topic_url: Option<String>,
    pub gotify_url: Option<String>,
    pub gotify_token: Option<String>,
    pub bark_url: Option<String>,
    pub wecom_bot_url: Option<String>,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub telegram_api_base: Option<String>,
    pub webhook: Option<WebhookSettings>,
    pub pc_url_to_mobile: bool,
}

#[derive(Debug, Clone, Default)]
pub struct WebhookSettings {
    pub url: String,
    pub method: String,
    pub headers: Option<String>,
    pub content_type: String,
    pub query_parameters: Option<String>,
    pub body: Option<String>,
}

impl NotifyConfig {
    pub fn from_env() -> Self {
        Self {
            ntfy_topic_url: env_opt("NTFY_TOPIC_URL"),
            gotify_url: env_opt("GOTIFY_URL"),
            gotify_token: env_opt("GOTIFY_TOKEN"),
            bark_url: env_opt("BARK_URL"),
            wecom_bot_url: env_opt("WX_BOT_URL"),
            telegram_bot_token: env_opt("TELEGRAM_BOT_TOKEN"),
            telegram_chat_id: env_opt("TELEGRAM_CHAT_ID"),
            telegram_api_base: env_opt("TELEGRAM_API_BASE"),
            webhook: env_opt("WEBHOOK_URL").map(|url| WebhookSettings {
                url,
                method: env::var("WEBHOOK_METHOD")
                    .unwrap_or_else(|_| "POST".into())
                    .to_uppercase(),
                headers: env_opt("WEBHOOK_HEADERS"),
                content_type: env::var("WEBHOOK_CONTENT_TYPE")
                    .unwrap_or_else(|_| "JSON".into())
                    .to_uppercase(),
                query_parameters: env_opt("WEBHOOK_QUERY_PARAMETERS"),
                body: env_opt("WEBHOOK_BODY"),
            }),
            pc_url_to_mobile: env_bool("PCURL_TO_MOBILE"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub ledger_dir: PathBuf,
    pub image_dir: PathBuf,
    pub tasks_file: PathBuf,
}

impl StorageConfig {
    pub fn from_env() -> Self {
        Self {
            ledger_dir: PathBuf::from(env::var("LEDGER_DIR").unwrap_or_else(|_| "jsonl".into())),
            image_dir: PathBuf::from(env::var("IMAGE_DIR").unwrap_or_else(|_| "images".into())),
            tasks_file: PathBuf::from(
                env::var("TASKS_FILE").unwrap_or_else(|_| "config.json".into()),
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub run_interval: Duration,
    pub task_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub rate_limit_backoff_min: Duration,
    pub rate_limit_backoff_max: Duration,
    pub run_once: bool,
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        Self {
            run_interval: Duration::from_secs(env_u64("RUN_INTERVAL_SECS", 900).max(1)),
            task_timeout: Duration::from_secs(env_u64("TASK_TIMEOUT_SECS", 3600).max(1)),
            backoff_base: Duration::from_secs(env_u64("BACKOFF_BASE_SECS", 60)),
            backoff_max: Duration::from_secs(env_u64("BACKOFF_MAX_SECS", 300)),
            rate_limit_backoff_min: Duration::from_secs(env_u64("RATE_LIMIT_BACKOFF_MIN_SECS", 1800)),
            rate_limit_backoff_max: Duration::from_secs(env_u64("RATE_LIMIT_BACKOFF_MAX_SECS", 3600)),
            run_once: env_bool("RUN_ONCE"),
        }
    }
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

pub fn env_bool(key: &str) -> bool {
    match env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_parsing() {
        assert_eq!(SourceStrategy::from_str(" API "), Some(SourceStrategy::Api));
        assert_eq!(SourceStrategy::from_str("browser"), Some(SourceStrategy::Browser));
        assert_eq!(SourceStrategy::from_str("bogus"), None);
    }

    #[test]
    fn test_guard_config_has_no_pauses() {
        let cfg = GuardConfig::for_tests();
        assert_eq!(cfg.item_delay, DelayRange::ZERO);
        assert!(!cfg.dom_selectors.is_empty());
        assert_eq!(cfg.normal_marker, "新发布");
    }
}
