use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

impl UiMode {
    /// Unknown values fall back to `Auto`.
    pub fn parse(flag: &str) -> Self {
        match flag.trim().to_ascii_lowercase().as_str() {
            "plain" => UiMode::Plain,
            "pretty" => UiMode::Pretty,
            _ => UiMode::Auto,
        }
    }
}

/// Stage and progress output on stderr.
///
/// Spinners and bars are drawn only when stderr is a terminal. In `auto` mode
/// they are also suppressed when stdout is redirected, so piped summaries stay
/// next to plain `==>` stage lines in logs.
#[derive(Clone, Debug)]
pub struct Ui {
    pretty: bool,
}

impl Ui {
    pub fn new(mode: UiMode, stderr_tty: bool, stdout_tty: bool) -> Self {
        let pretty = stderr_tty
            && match mode {
                UiMode::Pretty => true,
                UiMode::Auto => stdout_tty,
                UiMode::Plain => false,
            };
        Self { pretty }
    }

    /// Build from the `--ui` flag and the process's own terminals.
    pub fn for_terminal(flag: &str) -> Self {
        Self::new(
            UiMode::parse(flag),
            std::io::stderr().is_terminal(),
            std::io::stdout().is_terminal(),
        )
    }

    pub fn stage(&self, name: &str) -> StageGuard {
        let spinner = if self.pretty {
            let spinner = ProgressBar::with_draw_target(None, ProgressDrawTarget::stderr());
            spinner.set_style(
                ProgressStyle::with_template("{spinner} {msg} {elapsed}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            spinner.set_message(name.to_string());
            spinner.enable_steady_tick(Duration::from_millis(100));
            Some(spinner)
        } else {
            eprintln!("==> {name}");
            None
        };
        StageGuard {
            name: name.to_string(),
            started: Instant::now(),
            spinner,
        }
    }

    /// Bar over `total` sampled frames. Hidden unless pretty output is on;
    /// plain mode relies on the periodic progress log lines.
    pub fn frames(&self, total: u64) -> ProgressBar {
        if !self.pretty {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::with_draw_target(Some(total), ProgressDrawTarget::stderr());
        bar.set_style(
            ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} frames ({per_sec}, eta {eta})")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar
    }
}

pub struct StageGuard {
    name: String,
    started: Instant,
    spinner: Option<ProgressBar>,
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        let line = format!("✔ {} ({})", self.name, elapsed_label(self.started.elapsed()));
        match self.spinner.take() {
            Some(spinner) => spinner.finish_with_message(line),
            None => eprintln!("{line}"),
        }
    }
}

fn elapsed_label(elapsed: Duration) -> String {
    match elapsed.as_millis() {
        ms if ms < 1_000 => format!("{ms}ms"),
        _ if elapsed.as_secs() < 120 => format!("{:.2}s", elapsed.as_secs_f64()),
        _ => format!("{}m{:02}s", elapsed.as_secs() / 60, elapsed.as_secs() % 60),
    }
}
