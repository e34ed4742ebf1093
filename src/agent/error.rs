//! Tipos de erro para as chamadas aos agentes.
//!
//! Define [`AgentError`] com variantes para falhas da operação remota, erros
//! HTTP, timeouts e erros de rede. Usa `thiserror` para derivar `Display` e
//! `Error` a partir dos atributos `#[error(...)]`.

use thiserror::Error;

use crate::error::FailureKind;

/// Erros que podem ocorrer ao invocar uma operação num agente.
#[derive(Debug, Error)]
pub enum AgentError {
    /// O agente respondeu com erro (HTTP 4xx/5xx).
    /// Carrega a saída de console e o backtrace do lado remoto, quando houver.
    #[error("{operation} failed on {host}: {message}")]
    Remote {
        host: String,
        operation: String,
        status: u16,
        message: String,
        console: String,
        backtrace: String,
    },

    /// A operação não respondeu dentro do prazo do passo.
    #[error("timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    /// Falha de rede subjacente (DNS, conexão recusada).
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Resposta do agente não pôde ser interpretada.
    #[error("could not decode agent response: {0}")]
    Decode(String),
}

impl AgentError {
    /// Classificação usada nos resultados de passo e nos logs.
    pub fn kind(&self) -> FailureKind {
        match self {
            AgentError::Remote { .. } => FailureKind::Agent,
            AgentError::Timeout { .. } => FailureKind::Timeout,
            AgentError::Network(_) | AgentError::Decode(_) => FailureKind::Transport,
        }
    }

    pub fn console(&self) -> &str {
        match self {
            AgentError::Remote { console, .. } => console,
            _ => "",
        }
    }

    pub fn backtrace(&self) -> &str {
        match self {
            AgentError::Remote { backtrace, .. } => backtrace,
            _ => "",
        }
    }
}
