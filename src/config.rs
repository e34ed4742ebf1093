//! Configuração do fsjobd carregada a partir de `fsjobd.toml`.
//!
//! A struct [`SchedulerConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! A variável de ambiente `FSJOBD_AGENT_URL` tem precedência sobre o arquivo.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Nome do arquivo procurado no diretório atual quando `--config` não é usado.
pub const DEFAULT_CONFIG_FILE: &str = "fsjobd.toml";

/// Configuração de nível superior carregada de `fsjobd.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Número máximo de jobs executando ao mesmo tempo.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Prazo padrão de cada passo em milissegundos.
    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: u64,

    /// Arquivo JSON do armazenamento. Sem ele o estado fica só em memória.
    #[serde(default)]
    pub store_path: Option<PathBuf>,

    /// URL base dos agentes. Sem ela usa-se o agente simulado.
    #[serde(default)]
    pub agent_url: Option<String>,

    /// Filtro de log no formato do `EnvFilter`.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

// Valor padrão para o número de workers: 8.
fn default_worker_count() -> usize {
    8
}

// Valor padrão para o prazo de passo: 5 minutos.
fn default_step_timeout_ms() -> u64 {
    300_000
}

// Valor padrão para o filtro de log: "info".
fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            step_timeout_ms: default_step_timeout_ms(),
            store_path: None,
            agent_url: None,
            log_filter: default_log_filter(),
        }
    }
}

impl SchedulerConfig {
    /// Carrega a configuração de `path`, ou de `fsjobd.toml` no diretório
    /// atual. Usa valores padrão se o arquivo não existir.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str::<SchedulerConfig>(&contents)
                .with_context(|| format!("parsing {}", path.display()))?
        } else {
            Self::default()
        };

        // Variável de ambiente tem precedência sobre o arquivo de configuração.
        if let Ok(url) = std::env::var("FSJOBD_AGENT_URL")
            && !url.is_empty()
        {
            config.agent_url = Some(url);
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = SchedulerConfig::default();
        assert_eq!(config.worker_count, 8);
        assert_eq!(config.step_timeout_ms, 300_000);
        assert_eq!(config.log_filter, "info");
        assert!(config.store_path.is_none());
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            worker_count = 2
            store_path = "/var/lib/fsjobd/state.json"
        "#;
        let config: SchedulerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.worker_count, 2);
        assert_eq!(
            config.store_path.as_deref(),
            Some(Path::new("/var/lib/fsjobd/state.json"))
        );
        assert_eq!(config.step_timeout_ms, 300_000);
    }

    #[test]
    fn load_reads_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fsjobd.toml");
        std::fs::write(&path, "step_timeout_ms = 1500\n").unwrap();
        let config = SchedulerConfig::load(Some(&path)).unwrap();
        assert_eq!(config.step_timeout_ms, 1500);
        assert_eq!(config.worker_count, 8);
    }

    #[test]
    fn load_falls_back_to_defaults() {
        // Arquivo inexistente: todos os valores padrão.
        let dir = tempfile::tempdir().unwrap();
        let config = SchedulerConfig::load(Some(&dir.path().join("ausente.toml"))).unwrap();
        assert_eq!(config.worker_count, 8);
    }
}
