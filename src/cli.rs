//! Interface de linha de comando do taskq baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (dequeue, show,
//! complete, fail) e flags globais (--config, --base-url, --max-retries,
//! --verbose, --json-logs).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// taskq: cliente de trabalhador para o serviço de processamento de jobs.
#[derive(Debug, Parser)]
#[command(name = "taskq", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração (padrão: ./taskq.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// URL base do serviço; sobrepõe o arquivo e a variável de ambiente.
    #[arg(long, global = true)]
    pub base_url: Option<String>,

    /// Número máximo de retentativas por requisição.
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,

    /// Emite logs em JSON.
    #[arg(long, global = true, default_value_t = false)]
    pub json_logs: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Retira a próxima tarefa de um tipo de estágio.
    Dequeue {
        /// Tipo de estágio (fila) a consumir.
        stage_type: String,
    },

    /// Mostra a cópia atual de uma tarefa.
    Show {
        task_id: String,
    },

    /// Marca uma tarefa IN_PROGRESS como COMPLETED.
    Complete {
        task_id: String,
    },

    /// Marca uma tarefa IN_PROGRESS como FAILED.
    Fail {
        task_id: String,
    },
}
