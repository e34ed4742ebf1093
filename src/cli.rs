//! Interface de linha de comando do fsjobd baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (plan, run, job,
//! states, entities, demo) e flags globais (--config, --workers, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// fsjobd: agendador de jobs para sistemas de arquivos Lustre em cluster.
#[derive(Debug, Parser)]
#[command(name = "fsjobd", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho para o arquivo de configuração (padrão: ./fsjobd.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Arquivo TOML com as entidades do cluster (padrão: cluster de demonstração).
    #[arg(long, global = true)]
    pub cluster: Option<PathBuf>,

    /// Número máximo de jobs executando em paralelo.
    #[arg(long, global = true)]
    pub workers: Option<usize>,

    /// Prazo padrão de cada passo, em milissegundos.
    #[arg(long, global = true)]
    pub step_timeout_ms: Option<u64>,

    /// Confirma jobs que exigem confirmação.
    #[arg(long, short = 'y', global = true, default_value_t = false)]
    pub yes: bool,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Mostra os jobs necessários para levar uma entidade a um estado, sem executá-los.
    Plan {
        /// Entidade no formato `tipo:id` (ex.: `lnet:3`, `target:1`).
        entity: String,
        /// Estado desejado.
        state: String,
    },

    /// Leva uma entidade ao estado desejado e aguarda o comando terminar.
    Run {
        entity: String,
        state: String,

        /// Mensagem do comando.
        #[arg(long)]
        message: Option<String>,
    },

    /// Executa um job anunciado (ex.: `configure_lnet`) contra uma entidade.
    Job {
        /// Nome do job anunciado.
        name: String,
        entity: String,

        /// Argumentos do job como objeto JSON.
        #[arg(long, default_value = "{}")]
        args: String,
    },

    /// Lista os estados disponíveis a partir do estado atual de uma entidade.
    States { entity: String },

    /// Lista as entidades conhecidas e seus estados.
    Entities,

    /// Executa a demonstração embutida com o agente simulado.
    Demo,
}
