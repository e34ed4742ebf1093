//! Interface de terminal do fsjobd: spinners e saída colorida.
//!
//! Usa as crates `indicatif` para spinners de progresso e `console` para
//! estilização com cores. O [`CommandProgress`] acompanha visualmente
//! a execução de um comando no terminal.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::commands::Command;
use crate::model::Entity;
use crate::resolver::{JobGraph, Upstream};
use crate::state_machine::{JobOutcome, JobReport};

/// Indicador visual de progresso para um comando no terminal.
///
/// Exibe um spinner animado enquanto os jobs executam e uma linha
/// colorida por job concluído: sucesso (verde), erro (vermelho) e
/// cancelamento (amarelo).
pub struct CommandProgress {
    // Barra de progresso/spinner do indicatif.
    pb: ProgressBar,
    // Estilo verde para mensagens de sucesso.
    green: Style,
    // Estilo vermelho para mensagens de falha.
    red: Style,
    // Estilo amarelo para jobs cancelados.
    yellow: Style,
}

impl CommandProgress {
    /// Inicia o spinner com a mensagem do comando.
    pub fn start(command: &Command) -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(format!("#{} {}", command.id, command.message));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Imprime uma linha por job concluído, acima do spinner.
    pub fn job_finished(&self, report: &JobReport) {
        let line = match report.outcome {
            Some(JobOutcome::Succeeded) => format!(
                "  {} {} ({}ms)",
                self.green.apply_to("✓"),
                report.description,
                report.duration_ms
            ),
            Some(JobOutcome::Errored) => format!(
                "  {} {}: {}",
                self.red.apply_to("✗"),
                report.description,
                report.failure.as_deref().unwrap_or("failed")
            ),
            Some(JobOutcome::Cancelled) => format!(
                "  {} {} (cancelled)",
                self.yellow.apply_to("↷"),
                report.description
            ),
            None => return,
        };
        self.pb.println(line);
    }

    /// Finaliza o spinner e exibe o resultado do comando.
    pub fn complete(&self, command: &Command) {
        self.pb.finish_and_clear();
        if command.errored {
            println!("  {} Command #{} failed", self.red.apply_to("✗"), command.id);
        } else if command.cancelled {
            println!("  {} Command #{} cancelled", self.yellow.apply_to("↷"), command.id);
        } else {
            println!("  {} Command #{} complete", self.green.apply_to("✓"), command.id);
        }
    }
}

/// Imprime os jobs de um plano em ordem, com suas dependências.
pub fn print_plan(graph: &JobGraph) {
    let bold = Style::new().bold();
    let dim = Style::new().dim();
    if graph.jobs.is_empty() {
        if graph.shared.is_empty() {
            println!("Nothing to do.");
        } else {
            println!("Already in progress in jobs {:?}.", graph.shared);
        }
        return;
    }
    for (index, job) in graph.jobs.iter().enumerate() {
        let confirm = if job.requires_confirmation { " [confirm]" } else { "" };
        println!(
            "{:>3}. {}{} {}",
            index + 1,
            bold.apply_to(&job.description),
            confirm,
            dim.apply_to(format!("({} -> {})", job.from_state, job.to_state))
        );
        let waits: Vec<String> = job
            .wait_for
            .iter()
            .map(|u| match u {
                Upstream::Planned(i) => format!("{}", i + 1),
                Upstream::Existing(id) => format!("job {id}"),
            })
            .collect();
        if !waits.is_empty() {
            println!("     {}", dim.apply_to(format!("after {}", waits.join(", "))));
        }
    }
}

/// Imprime entidades em uma tabela simples.
pub fn print_entities(entities: &[Entity]) {
    let dim = Style::new().dim();
    for entity in entities.iter().filter(|e| e.not_deleted) {
        println!(
            "{:<24} {:<28} {}",
            entity.id.to_string(),
            entity.label,
            dim.apply_to(&entity.state)
        );
    }
}
