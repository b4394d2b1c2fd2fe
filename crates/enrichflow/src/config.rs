use std::time::Duration;

// Config is the one place runtime settings are read from the environment.
// Everything downstream gets typed values instead of raw strings.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub instance_id: String,
    pub admin_addr: Option<String>,
    pub migrate_on_startup: bool,
    pub api_token: Option<String>,
    pub processing_horizon_days: i64,
    pub db: DbSettings,
    pub llm: LlmSettings,
    pub translation: TaskSettings,
    pub classification: TaskSettings,
    pub language_detection: TaskSettings,
}

/// Pool sizing. Each running task holds one connection for its lock
/// transaction while the item upserts take others.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DbSettings {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub disable_jit: bool,
}

impl DbSettings {
    fn from_env() -> Self {
        Self {
            max_connections: env_nonempty("ENRICHFLOW_DB_MAX_CONNECTIONS")
                .and_then(|s| s.parse::<u32>().ok())
                .unwrap_or(10)
                .clamp(2, 64),
            acquire_timeout: Duration::from_secs(
                env_nonempty("ENRICHFLOW_DB_ACQUIRE_TIMEOUT_SECS")
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(10)
                    .clamp(1, 60),
            ),
            disable_jit: env_bool("ENRICHFLOW_DISABLE_JIT").unwrap_or(true),
        }
    }
}

#[derive(Clone, Debug)]
pub struct LlmSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout: Duration,
}

/// Per-task schedule and sizing. Fixed for the life of the process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskSettings {
    pub schedule: String,
    pub batch_size: i64,
    pub concurrency: usize,
    pub auto_start: bool,
}

impl TaskSettings {
    fn from_env(
        prefix: &str,
        enable_key: &str,
        default_batch_size: i64,
        default_concurrency: usize,
    ) -> Self {
        let schedule = env_nonempty(&format!("{prefix}_CRON_SCHEDULE"))
            .unwrap_or_else(|| "*/1 * * * *".to_string());

        let batch_size = env_nonempty(&format!("{prefix}_BATCH_SIZE"))
            .and_then(|s| s.parse::<i64>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(default_batch_size);

        let concurrency = env_nonempty(&format!("{prefix}_CONCURRENCY"))
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(default_concurrency);

        let auto_start = env_bool(enable_key).unwrap_or(false);

        Self {
            schedule,
            batch_size,
            concurrency,
            auto_start,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL is missing"))?;

        let instance_id = env_nonempty("ENRICHFLOW_INSTANCE_ID")
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "enrichflow-1".to_string());

        let admin_addr = env_or_fallback("ENRICHFLOW_ADMIN_ADDR", "ADMIN_ADDR")
            .and_then(|s| normalize_optional_addr(&s));

        let migrate_on_startup = env_bool("ENRICHFLOW_MIGRATE_ON_STARTUP").unwrap_or(false);

        let api_token = env_or_fallback("ENRICHFLOW_API_TOKEN", "TRANSLATE_SECRET");

        let processing_horizon_days = env_nonempty("PROCESSING_HORIZON_DAYS")
            .and_then(|s| s.parse::<i64>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(30);

        let llm = LlmSettings {
            base_url: env_nonempty("LLM_API_BASE_URL")
                .unwrap_or_else(|| "https://api.deepseek.com/v1".to_string()),
            api_key: env_or_fallback("LLM_API_KEY", "VAPI_API_KEY"),
            model: env_nonempty("LLM_MODEL").unwrap_or_else(|| "glm-4-flash".to_string()),
            timeout: Duration::from_secs(
                env_nonempty("LLM_TIMEOUT_SECS")
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(60)
                    .clamp(1, 600),
            ),
        };

        Ok(Self {
            database_url,
            instance_id,
            admin_addr,
            migrate_on_startup,
            api_token,
            processing_horizon_days,
            db: DbSettings::from_env(),
            llm,
            translation: TaskSettings::from_env("TRANSLATE", "ENABLE_AUTO_TRANSLATE", 100, 50),
            classification: TaskSettings::from_env("CLASSIFY", "ENABLE_AUTO_CLASSIFY", 200, 100),
            language_detection: TaskSettings::from_env(
                "LANGUAGE_DETECT",
                "ENABLE_AUTO_LANGUAGE_DETECT",
                200,
                100,
            ),
        })
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    env_nonempty(primary).or_else(|| env_nonempty(fallback))
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key).ok().map(|v| parse_bool(&v))
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_values_accept_common_spellings() {
        for v in ["1", "true", "TRUE", "yes", "On"] {
            assert!(parse_bool(v), "{v} should be true");
        }
        for v in ["0", "false", "no", "", "enabled"] {
            assert!(!parse_bool(v), "{v} should be false");
        }
    }

    #[test]
    fn admin_addr_can_be_switched_off() {
        assert_eq!(normalize_optional_addr("  "), None);
        assert_eq!(normalize_optional_addr("off"), None);
        assert_eq!(normalize_optional_addr("None"), None);
        assert_eq!(
            normalize_optional_addr(" 0.0.0.0:8080 "),
            Some("0.0.0.0:8080".to_string())
        );
    }

    #[test]
    fn task_settings_fall_back_to_defaults() {
        // Prefix nobody sets, so every lookup misses.
        let s = TaskSettings::from_env("ENRICHFLOW_TEST_UNSET", "ENRICHFLOW_TEST_UNSET_ENABLE", 7, 3);
        assert_eq!(
            s,
            TaskSettings {
                schedule: "*/1 * * * *".to_string(),
                batch_size: 7,
                concurrency: 3,
                auto_start: false,
            }
        );
    }
}
