use std::env;
use std::fs;
use std::path::Path;

use secrecy::ExposeSecret;
use stagewise_core::config::{
    domain_role_env_key, resolve_config_path, role_env_key, AppConfig, LoadOptions,
};
use toml::Value;

struct Sources<'a> {
    file_doc: Option<Value>,
    file_path: Option<&'a Path>,
}

impl Sources<'_> {
    fn line(&self, key_path: &str, value: &str, env_key: &str) -> String {
        render_line(key_path, value, self.field_source(key_path, &[env_key]))
    }

    fn field_source(&self, key_path: &str, env_keys: &[&str]) -> String {
        if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
            return format!("env ({env_key})");
        }

        if let Some(doc) = &self.file_doc {
            if contains_path(doc, key_path) {
                let file_path = self
                    .file_path
                    .map(|path| path.display().to_string())
                    .unwrap_or_else(|| "config file".to_string());
                return format!("file ({file_path})");
            }
        }

        "default".to_string()
    }
}

pub fn run(config_path: Option<&Path>) -> String {
    let options =
        LoadOptions { config_path: config_path.map(Path::to_path_buf), ..LoadOptions::default() };
    let config = match AppConfig::load(options) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let file_path = resolve_config_path(config_path);
    let sources = Sources {
        file_doc: load_config_file_doc(file_path.as_deref()),
        file_path: file_path.as_deref(),
    };

    let mut lines =
        vec!["effective config (source precedence: overrides > env > file > default):".to_string()];

    lines.push(sources.line(
        "llm.provider",
        &format!("{:?}", config.llm.provider),
        "STAGEWISE_LLM_PROVIDER",
    ));
    lines.push(sources.line(
        "llm.model",
        config.llm.model.as_deref().unwrap_or("<provider default>"),
        "STAGEWISE_LLM_MODEL",
    ));
    lines.push(sources.line(
        "llm.base_url",
        config.llm.base_url.as_deref().unwrap_or("<unset>"),
        "STAGEWISE_LLM_BASE_URL",
    ));
    let api_key = match &config.llm.api_key {
        Some(secret) => redact_token(secret.expose_secret()),
        None => "<unset>".to_string(),
    };
    lines.push(sources.line("llm.api_key", &api_key, "STAGEWISE_LLM_API_KEY"));
    lines.push(sources.line(
        "llm.timeout_secs",
        &config.llm.timeout_secs.to_string(),
        "STAGEWISE_LLM_TIMEOUT_SECS",
    ));

    lines.push(sources.line(
        "pipeline.max_stage_attempts",
        &config.pipeline.max_stage_attempts.to_string(),
        "STAGEWISE_PIPELINE_MAX_STAGE_ATTEMPTS",
    ));
    lines.push(sources.line(
        "pipeline.max_output_tokens",
        &config.pipeline.max_output_tokens.to_string(),
        "STAGEWISE_PIPELINE_MAX_OUTPUT_TOKENS",
    ));
    lines.push(sources.line(
        "pipeline.token_alert_threshold",
        &config.pipeline.token_alert_threshold.to_string(),
        "STAGEWISE_PIPELINE_TOKEN_ALERT_THRESHOLD",
    ));
    lines.push(sources.line(
        "pipeline.direct_path_enabled",
        &config.pipeline.direct_path_enabled.to_string(),
        "STAGEWISE_PIPELINE_DIRECT_PATH_ENABLED",
    ));
    lines.push(sources.line(
        "pipeline.approval_ttl_secs",
        &config.pipeline.approval_ttl_secs.to_string(),
        "STAGEWISE_PIPELINE_APPROVAL_TTL_SECS",
    ));

    for (role, model) in &config.models.roles {
        let key_path = format!("models.roles.{}", role.as_str());
        let env_key = role_env_key(*role);
        lines.push(render_line(
            &key_path,
            model,
            sources.field_source(&key_path, &[env_key.as_str()]),
        ));
    }
    for (domain, roles) in &config.models.domains {
        for (role, model) in roles {
            let key_path = format!("models.domains.{}.{}", domain.as_str(), role.as_str());
            let env_key = domain_role_env_key(*domain, *role);
            lines.push(render_line(
                &key_path,
                model,
                sources.field_source(&key_path, &[env_key.as_str()]),
            ));
        }
    }

    lines.push(render_line(
        "logging.level",
        &config.logging.level,
        sources.field_source("logging.level", &["STAGEWISE_LOGGING_LEVEL", "STAGEWISE_LOG_LEVEL"]),
    ));
    lines.push(render_line(
        "logging.format",
        &format!("{:?}", config.logging.format),
        sources
            .field_source("logging.format", &["STAGEWISE_LOGGING_FORMAT", "STAGEWISE_LOG_FORMAT"]),
    ));

    lines.join("\n")
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

fn redact_token(token: &str) -> String {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    if let Some((prefix, _)) = trimmed.split_once('-') {
        return format!("{prefix}-***");
    }

    "<redacted>".to_string()
}

#[cfg(test)]
mod tests {
    use super::redact_token;

    #[test]
    fn redaction_keeps_only_the_key_prefix() {
        assert_eq!(redact_token("sk-live-abcdef"), "sk-***");
        assert_eq!(redact_token("abcdef"), "<redacted>");
        assert_eq!(redact_token("   "), "<empty>");
    }
}
