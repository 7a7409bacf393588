use crate::error::ConfigError;
use crate::hitl::DEFAULT_REJECT_REASON;
use crate::llm::{DEFAULT_MODEL, OpenRouterModelConfig};
use crate::sql::{AccessGate, AccessMode, PromptPolicy, PromptTemplate, Role, TableAllowList};
use crate::sql::executor::DEFAULT_MAX_STRING_LENGTH;
use crate::sql::prompt::DEFAULT_ALLOWED_TABLES;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub openrouter_api_key: String,
    pub openrouter_base_url: Option<String>,
    pub openrouter_model: String,
    pub openrouter_temperature: f32,

    /// Store the SQL agent queries; only the SQL demo needs it.
    pub database_url: Option<String>,
    /// When set, threads and pending approvals are kept in Postgres.
    pub checkpoint_database_url: Option<String>,

    pub role: Role,
    /// System prompt for the SQL agent; must hold one `{table_restrictions}`.
    pub prompt_template: PromptTemplate,
    pub access_mode: AccessMode,
    pub allowed_tables: TableAllowList,
    pub max_string_length: usize,
    pub reject_reason: String,
}

impl AppConfig {
    /// Reads the process environment. Call `dotenvy::dotenv()` first to pick
    /// up a `.env` file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let openrouter_api_key =
            var("OPENROUTER_API_KEY").ok_or(ConfigError::Missing("OPENROUTER_API_KEY"))?;

        let openrouter_temperature = match var("OPENROUTER_TEMPERATURE") {
            Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
                key: "OPENROUTER_TEMPERATURE",
                message: format!("expected a number, got '{raw}'"),
            })?,
            None => 0.0,
        };

        let role = match var("SQL_AGENT_ROLE") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                key: "SQL_AGENT_ROLE",
                message: format!("expected privileged or restricted, got '{raw}'"),
            })?,
            None => Role::default(),
        };

        let prompt_template = match var("SQL_PROMPT_TEMPLATE") {
            Some(raw) => PromptTemplate::new(raw)?,
            None => PromptTemplate::default(),
        };

        let access_mode = match var("SQL_ACCESS_MODE") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                key: "SQL_ACCESS_MODE",
                message: format!("expected advisory or enforced, got '{raw}'"),
            })?,
            None => AccessMode::default(),
        };

        let allowed_tables = var("SQL_ALLOWED_TABLES")
            .map(|raw| TableAllowList::parse(&raw))
            .unwrap_or_else(|| TableAllowList::new(DEFAULT_ALLOWED_TABLES.iter().copied()));

        let max_string_length = match var("SQL_MAX_STRING_LENGTH") {
            Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
                key: "SQL_MAX_STRING_LENGTH",
                message: format!("expected a positive integer, got '{raw}'"),
            })?,
            None => DEFAULT_MAX_STRING_LENGTH,
        };

        Ok(Self {
            openrouter_api_key,
            openrouter_base_url: var("OPENROUTER_BASE_URL"),
            openrouter_model: var("OPENROUTER_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            openrouter_temperature,
            database_url: var("DATABASE_URL"),
            checkpoint_database_url: var("CHECKPOINT_DATABASE_URL"),
            role,
            prompt_template,
            access_mode,
            allowed_tables,
            max_string_length,
            reject_reason: var("SQL_REJECT_REASON")
                .unwrap_or_else(|| DEFAULT_REJECT_REASON.to_string()),
        })
    }

    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::Missing("DATABASE_URL"))
    }

    pub fn model_config(&self) -> OpenRouterModelConfig {
        let mut config =
            OpenRouterModelConfig::new(&self.openrouter_api_key, &self.openrouter_model);
        if let Some(base_url) = &self.openrouter_base_url {
            config.base_url = base_url.clone();
        }
        config.temperature = self.openrouter_temperature;
        config.title = Some(env!("CARGO_PKG_NAME").to_string());
        config
    }

    pub fn prompt_policy(&self) -> PromptPolicy {
        PromptPolicy::new(self.prompt_template.clone(), self.allowed_tables.clone())
    }

    pub fn access_gate(&self) -> AccessGate {
        AccessGate::new(self.access_mode, self.allowed_tables.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::error::PromptError;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect::<HashMap<_, _>>();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn api_key_is_required() {
        let err = AppConfig::from_lookup(lookup(&[])).expect_err("missing key");
        assert!(matches!(err, ConfigError::Missing("OPENROUTER_API_KEY")));

        let err = AppConfig::from_lookup(lookup(&[("OPENROUTER_API_KEY", "  ")]))
            .expect_err("blank key");
        assert!(matches!(err, ConfigError::Missing("OPENROUTER_API_KEY")));
    }

    #[test]
    fn defaults_match_the_demo() {
        let config = AppConfig::from_lookup(lookup(&[("OPENROUTER_API_KEY", "sk-test")]))
            .expect("config");

        assert_eq!(config.openrouter_model, DEFAULT_MODEL);
        assert_eq!(config.openrouter_temperature, 0.0);
        assert_eq!(config.role, Role::Privileged);
        assert_eq!(config.access_mode, AccessMode::Advisory);
        assert_eq!(config.reject_reason, "the database is offline.");
        assert_eq!(config.max_string_length, 300);
        assert_eq!(
            config.allowed_tables.iter().collect::<Vec<_>>(),
            DEFAULT_ALLOWED_TABLES.to_vec()
        );
        assert!(matches!(
            config.require_database_url(),
            Err(ConfigError::Missing("DATABASE_URL"))
        ));
    }

    #[test]
    fn parses_sql_settings() {
        let config = AppConfig::from_lookup(lookup(&[
            ("OPENROUTER_API_KEY", "sk-test"),
            ("DATABASE_URL", "postgres://localhost/chinook"),
            ("SQL_AGENT_ROLE", "restricted"),
            ("SQL_ACCESS_MODE", "enforced"),
            ("SQL_ALLOWED_TABLES", "Album, Track"),
            ("SQL_MAX_STRING_LENGTH", "40"),
        ]))
        .expect("config");

        assert_eq!(config.role, Role::Restricted);
        assert_eq!(config.access_gate().mode(), AccessMode::Enforced);
        assert_eq!(config.max_string_length, 40);
        assert_eq!(config.require_database_url().expect("url"), "postgres://localhost/chinook");
        assert!(
            config
                .prompt_policy()
                .build_instructions(Role::Restricted)
                .contains("Limit access to these tables: Album, Track.")
        );
    }

    #[test]
    fn custom_prompt_template_is_validated() {
        let config = AppConfig::from_lookup(lookup(&[
            ("OPENROUTER_API_KEY", "sk-test"),
            ("SQL_AGENT_ROLE", "restricted"),
            ("SQL_PROMPT_TEMPLATE", "Answer in SQL.\n{table_restrictions}"),
        ]))
        .expect("config");
        assert_eq!(
            config.prompt_policy().build_instructions(Role::Restricted),
            "Answer in SQL.\nLimit access to these tables: Album, Artists, Genre, Playlist, \
             PlaylistTrack, Track."
        );

        let err = AppConfig::from_lookup(lookup(&[
            ("OPENROUTER_API_KEY", "sk-test"),
            ("SQL_PROMPT_TEMPLATE", "Answer in SQL for {user}."),
        ]))
        .expect_err("unknown placeholder");
        assert!(matches!(
            err,
            ConfigError::Prompt(PromptError::UnknownPlaceholder(ref name)) if name == "user"
        ));
    }

    #[test]
    fn model_config_follows_overrides() {
        let config = AppConfig::from_lookup(lookup(&[
            ("OPENROUTER_API_KEY", "sk-test"),
            ("OPENROUTER_BASE_URL", "http://localhost:4000/v1"),
            ("OPENROUTER_TEMPERATURE", "0.3"),
        ]))
        .expect("config");

        let model = config.model_config();
        assert_eq!(model.base_url, "http://localhost:4000/v1");
        assert_eq!(model.temperature, 0.3);
        assert_eq!(model.title.as_deref(), Some("sql-agent-rs"));
    }

    #[test]
    fn rejects_malformed_values() {
        let err = AppConfig::from_lookup(lookup(&[
            ("OPENROUTER_API_KEY", "sk-test"),
            ("OPENROUTER_TEMPERATURE", "warm"),
        ]))
        .expect_err("bad temperature");

        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "OPENROUTER_TEMPERATURE",
                ..
            }
        ));
    }
}
