//! Configuração do cliente carregada a partir de `taskq.toml`.
//!
//! A struct [`ClientConfig`] reúne a URL do serviço, a política de retentativa
//! e as opções de conexão. Valores ausentes no arquivo usam defaults sensíveis.
//! A variável de ambiente `TASKQ_BASE_URL` tem precedência sobre o arquivo.
//!
//! ```toml
//! base_url = "https://queue.internal/api/"
//!
//! [retry]
//! maxRetries = 5
//! statusCodes = [502, 503, 504]
//! errorCodes = ["ECONNRESET", "timeout"]
//! initialBaseRetryDelayMs = 250
//! disableJitter = false
//! maxJitterFactor = 0.5
//!
//! [connection]
//! connect_timeout_ms = 5000
//! ```
//!
//! Com `metrics = true` as medições vão para a fachada `metrics`.

use std::path::Path;

use anyhow::{Context, Result};
use reqwest::Url;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::events::DEFAULT_EVENTS_CAPACITY;
use crate::transport::{ConnectionOptions, RetryPolicy};

pub const DEFAULT_CONFIG_FILE: &str = "taskq.toml";
pub const BASE_URL_ENV: &str = "TASKQ_BASE_URL";

/// Configuração de nível superior carregada de `taskq.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// URL base do serviço de filas. Obrigatória.
    #[serde(default, alias = "baseUrl")]
    pub base_url: Option<String>,

    /// Política de retentativa do despachante.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Opções de conexão do transporte HTTP.
    #[serde(default)]
    pub connection: ConnectionOptions,

    /// Capacidade do canal de eventos de tarefas.
    #[serde(default = "default_events_capacity", alias = "eventsCapacity")]
    pub events_capacity: usize,

    /// Envia medições para a fachada `metrics` (desligado por padrão).
    #[serde(default)]
    pub metrics: bool,
}

// Valor padrão para a capacidade do canal de eventos: 64.
fn default_events_capacity() -> usize {
    DEFAULT_EVENTS_CAPACITY
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            retry: RetryPolicy::default(),
            connection: ConnectionOptions::default(),
            events_capacity: default_events_capacity(),
            metrics: false,
        }
    }
}

impl ClientConfig {
    /// Carrega a configuração de `taskq.toml` no diretório atual.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(DEFAULT_CONFIG_FILE))
    }

    /// Carrega a configuração de um caminho explícito.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str::<ClientConfig>(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            Self::default()
        };

        // Variável de ambiente tem precedência sobre o arquivo de configuração.
        if let Ok(url) = std::env::var(BASE_URL_ENV)
            && !url.is_empty()
        {
            config.base_url = Some(url);
        }

        config.retry = config.retry.sanitized();
        Ok(config)
    }

    /// Valida e devolve a URL base.
    pub fn base_url(&self) -> Result<Url, ConfigError> {
        let raw = self
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::MissingField("base_url"))?;

        let url = Url::parse(raw).map_err(|e| ConfigError::InvalidUrl {
            value: raw.to_string(),
            reason: e.to_string(),
        })?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidUrl {
                value: raw.to_string(),
                reason: format!("unsupported scheme '{}'", url.scheme()),
            });
        }
        if !url.has_host() {
            return Err(ConfigError::InvalidUrl {
                value: raw.to_string(),
                reason: "missing host".to_string(),
            });
        }
        Ok(url)
    }
}
