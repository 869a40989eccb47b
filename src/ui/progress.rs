use crate::ui::icons::{CHECK, CLOCK, CROSS, PACKAGE, PAUSE, SAVE};
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::time::Duration;

/// Format a duration in human units: `12s`, `4m 05s`, `2h 03m 10s`.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}h {:02}m {:02}s", h, m, s)
    } else if m > 0 {
        format!("{}m {:02}s", m, s)
    } else {
        format!("{}s", s)
    }
}

/// Terminal UI for one invocation, rendered via `indicatif`.
///
/// Two bars are stacked vertically:
/// - Stage bar: how many of the three stages are behind us
/// - Step spinner: the command currently running, with elapsed/remaining time
///
/// `indicatif` draws nothing when stderr is not a terminal, so on CI runners the
/// `tracing` output is the only progress record.
pub struct RunUI {
    multi: MultiProgress,
    stage_bar: ProgressBar,
    step_bar: ProgressBar,
}

impl RunUI {
    pub fn new(total_stages: u64) -> Self {
        let multi = MultiProgress::new();

        let stage_style = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
            .expect("progress bar template is a valid static string")
            .progress_chars("█▓▒░");
        let stage_bar = multi.add(ProgressBar::new(total_stages));
        stage_bar.set_style(stage_style);
        stage_bar.set_prefix("Stages");

        let step_style = ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg}")
            .expect("progress bar template is a valid static string");
        let step_bar = multi.add(ProgressBar::new_spinner());
        step_bar.set_style(step_style);
        step_bar.set_prefix("  Step");

        Self {
            multi,
            stage_bar,
            step_bar,
        }
    }

    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    /// Position the stage bar at `completed` and show the stage about to run.
    pub fn start_stage(&self, completed: u64, stage: &str) {
        self.stage_bar.set_position(completed);
        self.stage_bar
            .set_message(format!("{}", style(stage).yellow()));
    }

    pub fn stage_complete(&self, stage: &str) {
        self.stage_bar.inc(1);
        self.print_line(format!("{} Stage {} complete", CHECK, style(stage).green()));
    }

    pub fn stage_stopped(&self, stage: &str, reason: &str) {
        self.print_line(format!(
            "{} Stage {} stopped: {}",
            PAUSE,
            style(stage).yellow(),
            reason
        ));
    }

    pub fn start_step(&self, label: &str) {
        self.step_bar.set_message(label.to_string());
        self.step_bar.enable_steady_tick(Duration::from_millis(200));
    }

    /// Refresh the spinner with elapsed and (when bounded) remaining time.
    pub fn update_step(&self, label: &str, elapsed: Duration, remaining: Option<Duration>) {
        let timing = match remaining {
            Some(left) => format!(
                "{} elapsed, {} left",
                format_duration(elapsed),
                format_duration(left)
            ),
            None => format!("{} elapsed", format_duration(elapsed)),
        };
        self.step_bar
            .set_message(format!("{} {}", label, style(format!("({})", timing)).dim()));
    }

    pub fn finish_step(&self, label: &str, ok: bool) {
        let icon = if ok { CHECK } else { CROSS };
        self.clear_step();
        self.print_line(format!("{} {}", icon, label));
    }

    pub fn step_timed_out(&self, label: &str, budget: Duration) {
        self.clear_step();
        self.print_line(format!(
            "{} {} hit its {} budget",
            CLOCK,
            label,
            format_duration(budget)
        ));
    }

    /// The spinner is reused for every command of the invocation.
    fn clear_step(&self) {
        self.step_bar.disable_steady_tick();
        self.step_bar.set_message("");
    }

    pub fn checkpoint_published(&self, name: &str) {
        self.print_line(format!("{} Checkpoint '{}' published", SAVE, name));
    }

    pub fn artifact_published(&self, name: &str) {
        self.stage_bar.finish();
        self.print_line(format!(
            "{} Final artifact '{}' published",
            PACKAGE,
            style(name).green().bold()
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_seconds_only() {
        assert_eq!(format_duration(Duration::from_secs(12)), "12s");
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }

    #[test]
    fn format_minutes_pads_seconds() {
        assert_eq!(format_duration(Duration::from_secs(245)), "4m 05s");
    }

    #[test]
    fn format_hours_pads_minutes_and_seconds() {
        assert_eq!(format_duration(Duration::from_secs(2 * 3600 + 3 * 60 + 10)), "2h 03m 10s");
    }

    #[test]
    fn format_drops_subsecond_part() {
        assert_eq!(format_duration(Duration::from_millis(59_999)), "59s");
    }

    #[test]
    fn ui_methods_do_not_panic_without_terminal() {
        let ui = RunUI::new(3);
        ui.start_stage(0, "Init");
        ui.start_step("npm run init");
        ui.update_step("npm run init", Duration::from_secs(5), Some(Duration::from_secs(60)));
        ui.finish_step("npm run init", true);
        ui.stage_complete("Init");
        ui.stage_stopped("Build", "timeout");
        ui.step_timed_out("npm run build", Duration::from_secs(600));
        ui.checkpoint_published("checkpoint");
        ui.artifact_published("1.85.74");
    }
}
