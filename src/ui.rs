//! Interface de terminal do taskq: spinner e saída colorida.
//!
//! Usa `indicatif` para o spinner enquanto uma requisição (com retentativas)
//! está pendente e `console` para estilizar o resultado.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::error::Error;
use crate::state_machine::{Task, TaskStatus};

/// Indicador visual de uma operação em andamento no terminal.
pub struct RequestProgress {
    // Spinner do indicatif.
    pb: ProgressBar,
    // Verde para sucesso.
    green: Style,
    // Vermelho para falha.
    red: Style,
    // Amarelo para fila vazia e avisos.
    yellow: Style,
}

impl RequestProgress {
    /// Inicia o spinner com a descrição da operação.
    pub fn start(message: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(message.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Encerra o spinner e mostra a tarefa recebida.
    pub fn finish_task(&self, task: &Task) {
        self.pb.finish_and_clear();
        let status_style = match task.status {
            TaskStatus::Completed => &self.green,
            TaskStatus::Failed => &self.red,
            TaskStatus::Pending | TaskStatus::InProgress => &self.yellow,
        };
        println!(
            "  {} Task {} [{}] attempts={}",
            self.green.apply_to("✓"),
            task.id,
            status_style.apply_to(task.status),
            task.attempts
        );
        if let Ok(json) = serde_json::to_string_pretty(task) {
            println!("{json}");
        }
    }

    /// Encerra o spinner informando que a fila está vazia.
    pub fn finish_empty(&self, stage_type: &str) {
        self.pb.finish_and_clear();
        println!(
            "  {} Queue '{stage_type}' is empty",
            self.yellow.apply_to("∅")
        );
    }

    /// Encerra o spinner com o erro e seu tipo.
    pub fn finish_error(&self, err: &Error) {
        self.pb.finish_and_clear();
        eprintln!(
            "  {} [{}] {err}",
            self.red.apply_to("✗"),
            err.cause_kind()
        );
    }
}
