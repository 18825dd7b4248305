use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::routing::Domain;
use crate::models::{ModelRole, StaticModelResolver};
use crate::policy::approval::DEFAULT_APPROVAL_TTL_SECS;
use crate::trace::DEFAULT_TOKEN_ALERT_THRESHOLD;

pub const DEFAULT_CONFIG_FILE: &str = "stagewise.toml";
pub const FALLBACK_CONFIG_FILE: &str = "config/stagewise.toml";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub models: ModelsConfig,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    /// Global default model; `None` leaves the choice to the provider.
    pub model: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModelsConfig {
    pub roles: BTreeMap<ModelRole, String>,
    pub domains: BTreeMap<Domain, BTreeMap<ModelRole, String>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineConfig {
    pub max_stage_attempts: u32,
    pub max_output_tokens: u32,
    pub token_alert_threshold: u32,
    pub direct_path_enabled: bool,
    pub approval_ttl_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_stage_attempts: 2,
            max_output_tokens: 900,
            token_alert_threshold: DEFAULT_TOKEN_ALERT_THRESHOLD,
            direct_path_enabled: true,
            approval_ttl_secs: DEFAULT_APPROVAL_TTL_SECS,
        }
    }
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    #[serde(alias = "openai")]
    OpenAi,
    Anthropic,
    Ollama,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub max_stage_attempts: Option<u32>,
    pub direct_path_enabled: Option<bool>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: Some("http://localhost:11434".to_string()),
                model: None,
                timeout_secs: 30,
            },
            models: ModelsConfig::default(),
            pipeline: PipelineConfig::default(),
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected openai|anthropic|ollama)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected =
                options.config_path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    /// Resolver seeded from the global default plus every role and
    /// domain+role override.
    pub fn to_resolver(&self) -> StaticModelResolver {
        let mut resolver = StaticModelResolver::new(self.llm.model.clone());
        for (role, model) in &self.models.roles {
            resolver = resolver.with_role(*role, model.clone());
        }
        for (domain, roles) in &self.models.domains {
            for (role, model) in roles {
                resolver = resolver.with_domain_role(*domain, *role, model.clone());
            }
        }
        resolver
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = Some(model);
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
        }

        if let Some(models) = patch.models {
            self.models.roles.extend(models.roles);
            for (domain, roles) in models.domains {
                self.models.domains.entry(domain).or_default().extend(roles);
            }
        }

        if let Some(pipeline) = patch.pipeline {
            if let Some(max_stage_attempts) = pipeline.max_stage_attempts {
                self.pipeline.max_stage_attempts = max_stage_attempts;
            }
            if let Some(max_output_tokens) = pipeline.max_output_tokens {
                self.pipeline.max_output_tokens = max_output_tokens;
            }
            if let Some(token_alert_threshold) = pipeline.token_alert_threshold {
                self.pipeline.token_alert_threshold = token_alert_threshold;
            }
            if let Some(direct_path_enabled) = pipeline.direct_path_enabled {
                self.pipeline.direct_path_enabled = direct_path_enabled;
            }
            if let Some(approval_ttl_secs) = pipeline.approval_ttl_secs {
                self.pipeline.approval_ttl_secs = approval_ttl_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("STAGEWISE_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("STAGEWISE_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("STAGEWISE_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("STAGEWISE_LLM_MODEL") {
            self.llm.model = Some(value);
        }
        if let Some(value) = read_env("STAGEWISE_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("STAGEWISE_LLM_TIMEOUT_SECS", &value)?;
        }

        for role in ModelRole::ALL {
            if let Some(value) = read_env(&role_env_key(role)) {
                self.models.roles.insert(role, value);
            }
            for domain in Domain::ALL {
                if let Some(value) = read_env(&domain_role_env_key(domain, role)) {
                    self.models.domains.entry(domain).or_default().insert(role, value);
                }
            }
        }

        if let Some(value) = read_env("STAGEWISE_PIPELINE_MAX_STAGE_ATTEMPTS") {
            self.pipeline.max_stage_attempts =
                parse_u32("STAGEWISE_PIPELINE_MAX_STAGE_ATTEMPTS", &value)?;
        }
        if let Some(value) = read_env("STAGEWISE_PIPELINE_MAX_OUTPUT_TOKENS") {
            self.pipeline.max_output_tokens =
                parse_u32("STAGEWISE_PIPELINE_MAX_OUTPUT_TOKENS", &value)?;
        }
        if let Some(value) = read_env("STAGEWISE_PIPELINE_TOKEN_ALERT_THRESHOLD") {
            self.pipeline.token_alert_threshold =
                parse_u32("STAGEWISE_PIPELINE_TOKEN_ALERT_THRESHOLD", &value)?;
        }
        if let Some(value) = read_env("STAGEWISE_PIPELINE_DIRECT_PATH_ENABLED") {
            self.pipeline.direct_path_enabled =
                parse_bool("STAGEWISE_PIPELINE_DIRECT_PATH_ENABLED", &value)?;
        }
        if let Some(value) = read_env("STAGEWISE_PIPELINE_APPROVAL_TTL_SECS") {
            self.pipeline.approval_ttl_secs =
                parse_u64("STAGEWISE_PIPELINE_APPROVAL_TTL_SECS", &value)?;
        }

        let log_level =
            read_env("STAGEWISE_LOGGING_LEVEL").or_else(|| read_env("STAGEWISE_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("STAGEWISE_LOGGING_FORMAT").or_else(|| read_env("STAGEWISE_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(log_format) = overrides.log_format {
            self.logging.format = log_format;
        }
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = Some(llm_model);
        }
        if let Some(max_stage_attempts) = overrides.max_stage_attempts {
            self.pipeline.max_stage_attempts = max_stage_attempts;
        }
        if let Some(direct_path_enabled) = overrides.direct_path_enabled {
            self.pipeline.direct_path_enabled = direct_path_enabled;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_llm(&self.llm)?;
        validate_models(&self.models)?;
        validate_pipeline(&self.pipeline)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

pub fn role_env_key(role: ModelRole) -> String {
    format!("STAGEWISE_MODEL_{}", role.env_suffix())
}

pub fn domain_role_env_key(domain: Domain, role: ModelRole) -> String {
    format!("STAGEWISE_MODEL_{}_{}", domain.env_suffix(), role.env_suffix())
}

pub fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from(DEFAULT_CONFIG_FILE), PathBuf::from(FALLBACK_CONFIG_FILE)]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    match llm.provider {
        LlmProvider::OpenAi | LlmProvider::Anthropic => {
            let missing = llm
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.api_key is required for openai/anthropic providers".to_string(),
                ));
            }
        }
        LlmProvider::Ollama => {
            let missing =
                llm.base_url.as_ref().map(|value| value.trim().is_empty()).unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.base_url is required for ollama provider".to_string(),
                ));
            }
        }
    }

    Ok(())
}

fn validate_models(models: &ModelsConfig) -> Result<(), ConfigError> {
    let blank_role = models.roles.iter().find(|(_, model)| model.trim().is_empty());
    if let Some((role, _)) = blank_role {
        return Err(ConfigError::Validation(format!("models.roles.{role} must not be empty")));
    }

    for (domain, roles) in &models.domains {
        if let Some((role, _)) = roles.iter().find(|(_, model)| model.trim().is_empty()) {
            return Err(ConfigError::Validation(format!(
                "models.domains.{domain}.{role} must not be empty"
            )));
        }
    }

    Ok(())
}

fn validate_pipeline(pipeline: &PipelineConfig) -> Result<(), ConfigError> {
    if pipeline.max_stage_attempts == 0 {
        return Err(ConfigError::Validation(
            "pipeline.max_stage_attempts must be at least 1".to_string(),
        ));
    }

    if pipeline.max_output_tokens == 0 {
        return Err(ConfigError::Validation(
            "pipeline.max_output_tokens must be greater than zero".to_string(),
        ));
    }

    if pipeline.token_alert_threshold == 0 {
        return Err(ConfigError::Validation(
            "pipeline.token_alert_threshold must be greater than zero".to_string(),
        ));
    }

    if pipeline.approval_ttl_secs == 0 || pipeline.approval_ttl_secs > 86_400 {
        return Err(ConfigError::Validation(
            "pipeline.approval_ttl_secs must be in range 1..=86400".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    llm: Option<LlmPatch>,
    models: Option<ModelsPatch>,
    pipeline: Option<PipelinePatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ModelsPatch {
    #[serde(default)]
    roles: BTreeMap<ModelRole, String>,
    #[serde(default)]
    domains: BTreeMap<Domain, BTreeMap<ModelRole, String>>,
}

#[derive(Debug, Default, Deserialize)]
struct PipelinePatch {
    max_stage_attempts: Option<u32>,
    max_output_tokens: Option<u32>,
    token_alert_threshold: Option<u32>,
    direct_path_enabled: Option<bool>,
    approval_ttl_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
