//! Tipos de dados trocados com os agentes dos servidores.
//!
//! Todas as structs derivam `Serialize` e `Deserialize` para o formato JSON
//! esperado pelo endpoint `agents/{host}/{operation}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state_machine::StepArgs;

/// Corpo de uma chamada a uma operação do agente.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    /// FQDN do servidor onde o agente executa a operação.
    pub host: String,
    /// Nome da operação (ex.: "load_lnet", "mount_target").
    pub operation: String,
    /// Argumentos da operação.
    #[serde(default)]
    pub args: StepArgs,
    /// Registro persistido da entidade, quando o passo exige estado local.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_state: Option<Value>,
}

impl AgentRequest {
    pub fn new(host: impl Into<String>, operation: impl Into<String>, args: StepArgs) -> Self {
        Self {
            host: host.into(),
            operation: operation.into(),
            args,
            local_state: None,
        }
    }
}

/// Resposta de uma operação concluída com sucesso.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    /// Valor de retorno da operação, se houver.
    #[serde(default)]
    pub result: Option<Value>,
    /// Saída de console capturada pelo agente.
    #[serde(default)]
    pub console: String,
}

/// Corpo de erro devolvido pelo agente quando a operação falha.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentFault {
    /// Mensagem de erro legível.
    pub message: String,
    /// Saída de console até o ponto da falha.
    #[serde(default)]
    pub console: String,
    /// Backtrace do lado do agente.
    #[serde(default)]
    pub backtrace: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_omits_missing_local_state() {
        let mut args = StepArgs::new();
        args.insert("target_name".into(), json!("testfs-OST0000"));
        let req = AgentRequest::new("oss1.local", "mount_target", args);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["operation"], "mount_target");
        assert_eq!(json["args"]["target_name"], "testfs-OST0000");
        assert!(json.get("local_state").is_none());
    }

    #[test]
    fn response_fields_default_when_absent() {
        let resp: AgentResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(resp.result, None);
        assert!(resp.console.is_empty());
    }

    #[test]
    fn fault_deserializes_from_agent_format() {
        let fault: AgentFault = serde_json::from_str(
            r#"{"message": "mount failed", "backtrace": "Traceback..."}"#,
        )
        .unwrap();
        assert_eq!(fault.message, "mount failed");
        assert_eq!(fault.backtrace, "Traceback...");
        assert!(fault.console.is_empty());
    }
}
