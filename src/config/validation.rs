use crate::config::types::{
    ApiConfig, BudgetConfig, Config, CrawlConfig, StorageConfig, SynthesisConfig,
    MAX_STALE_AFTER_HOURS,
};
use crate::ConfigError;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_api_config(&config.api)?;
    validate_budget_config(&config.budget)?;
    validate_crawl_config(&config.crawl)?;
    validate_synthesis_config(&config.synthesis)?;
    validate_storage_config(&config.storage)?;
    Ok(())
}

/// Validates API access configuration
fn validate_api_config(config: &ApiConfig) -> Result<(), ConfigError> {
    let url = Url::parse(&config.base_url)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid base-url: {}", e)))?;

    if url.scheme() != "https" && url.scheme() != "http" {
        return Err(ConfigError::InvalidUrl(format!(
            "base-url must use http or https, got '{}'",
            url.scheme()
        )));
    }

    if config.requests_per_minute < 1 {
        return Err(ConfigError::Validation(
            "requests-per-minute must be >= 1".to_string(),
        ));
    }

    if config.max_attempts < 1 || config.max_attempts > 20 {
        return Err(ConfigError::Validation(format!(
            "max-attempts must be between 1 and 20, got {}",
            config.max_attempts
        )));
    }

    if config.max_backoff_secs < 1 {
        return Err(ConfigError::Validation(
            "max-backoff-secs must be >= 1".to_string(),
        ));
    }

    if config.initial_backoff_ms > config.max_backoff_secs * 1000 {
        return Err(ConfigError::Validation(format!(
            "initial-backoff-ms ({}) exceeds max-backoff-secs ({})",
            config.initial_backoff_ms, config.max_backoff_secs
        )));
    }

    if config.similar_page_size < 1 || config.similar_page_size > 150 {
        return Err(ConfigError::Validation(format!(
            "similar-page-size must be between 1 and 150, got {}",
            config.similar_page_size
        )));
    }

    Ok(())
}

/// Validates session budgets
fn validate_budget_config(config: &BudgetConfig) -> Result<(), ConfigError> {
    if config.max_requests < 1 {
        return Err(ConfigError::Validation(
            "budget max-requests must be >= 1".to_string(),
        ));
    }

    if config.max_duration_secs < 1 {
        return Err(ConfigError::Validation(
            "budget max-duration-secs must be >= 1".to_string(),
        ));
    }

    Ok(())
}

/// Validates crawl loop configuration
fn validate_crawl_config(config: &CrawlConfig) -> Result<(), ConfigError> {
    if config.checkpoint_interval < 1 {
        return Err(ConfigError::Validation(
            "checkpoint-interval must be >= 1".to_string(),
        ));
    }

    if config.seed_page_size < 1 || config.seed_page_size > 150 {
        return Err(ConfigError::Validation(format!(
            "seed-page-size must be between 1 and 150, got {}",
            config.seed_page_size
        )));
    }

    if config.stale_after_hours > MAX_STALE_AFTER_HOURS {
        return Err(ConfigError::Validation(format!(
            "stale-after-hours must be <= {}, got {}",
            MAX_STALE_AFTER_HOURS, config.stale_after_hours
        )));
    }

    if config.seed_filter.is_some() && config.seed_query.is_none() {
        return Err(ConfigError::Validation(
            "seed-filter requires seed-query".to_string(),
        ));
    }

    Ok(())
}

/// Validates synthesis configuration
fn validate_synthesis_config(config: &SynthesisConfig) -> Result<(), ConfigError> {
    if !(config.tag_threshold > 0.0 && config.tag_threshold <= 1.0) {
        return Err(ConfigError::Validation(format!(
            "tag-threshold must be in (0, 1], got {}",
            config.tag_threshold
        )));
    }

    if config.max_group_size < 2 {
        return Err(ConfigError::Validation(format!(
            "max-group-size must be >= 2, got {}",
            config.max_group_size
        )));
    }

    if config.resolve_batch_size < 1 || config.resolve_batch_size > 150 {
        return Err(ConfigError::Validation(format!(
            "resolve-batch-size must be between 1 and 150, got {}",
            config.resolve_batch_size
        )));
    }

    Ok(())
}

/// Validates storage configuration
fn validate_storage_config(config: &StorageConfig) -> Result<(), ConfigError> {
    if config.data_dir.is_empty() {
        return Err(ConfigError::Validation(
            "data-dir cannot be empty".to_string(),
        ));
    }

    Ok(())
}
