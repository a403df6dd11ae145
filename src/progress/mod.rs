use indicatif::{HumanBytes, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::Duration;

use crate::download::{DownloadEvent, ProgressState};

const BAR_TEMPLATE: &str = concat!(
    "{spinner:.green} {msg} [{bar:40.cyan/blue}] ",
    "{bytes}/{total_bytes} ({binary_bytes_per_sec}, {eta})"
);

/// Terminal rendering of one download's progress events.
pub struct DownloadBar {
    bar: ProgressBar,
    model_id: String,
}

impl DownloadBar {
    pub fn new(model_id: &str, total: u64) -> Self {
        Self::with_bar(model_id, ProgressBar::new(total))
    }

    /// Draws nowhere.
    pub fn hidden(model_id: &str, total: u64) -> Self {
        Self::with_bar(
            model_id,
            ProgressBar::with_draw_target(Some(total), ProgressDrawTarget::hidden()),
        )
    }

    fn with_bar(model_id: &str, bar: ProgressBar) -> Self {
        let style = ProgressStyle::default_bar()
            .template(BAR_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        bar.set_style(style);
        bar.set_message(format!("pulling {}", model_id));
        bar.enable_steady_tick(Duration::from_millis(120));
        Self {
            bar,
            model_id: model_id.to_string(),
        }
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    /// Apply one event. Returns true once the event is terminal.
    pub fn update(&self, event: &DownloadEvent) -> bool {
        if event.total_bytes > 0 {
            self.bar.set_length(event.total_bytes);
        }
        self.bar.set_position(event.received_bytes);
        if event.is_unzipping {
            self.bar.set_message(format!("unpacking {}", self.model_id));
        }

        match event.state {
            ProgressState::Downloading => false,
            ProgressState::Completed => {
                self.bar.finish_with_message(format!(
                    "{} ready ({})",
                    self.model_id,
                    HumanBytes(event.received_bytes)
                ));
                true
            }
            ProgressState::Failed => {
                self.bar.abandon_with_message(format!(
                    "{} failed: {}",
                    self.model_id,
                    event.error_message.as_deref().unwrap_or("unknown error")
                ));
                true
            }
            ProgressState::Cancelled => {
                self.bar
                    .abandon_with_message(format!("{} cancelled", self.model_id));
                true
            }
        }
    }
}
