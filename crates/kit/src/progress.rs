//! Terminal progress display for long transfers.

use std::io::IsTerminal;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use tracing::info;

/// Create a byte-counting progress bar on stderr.
///
/// The bar is hidden when stderr is not a terminal so logs stay clean.
pub fn create_download_progress_bar(message: &str) -> ProgressBar {
    let target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr()
    } else {
        ProgressDrawTarget::hidden()
    };
    let style = ProgressStyle::with_template(
        "{msg} [{elapsed_precise}] [{bar:50}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("=> ");
    let pb = ProgressBar::with_draw_target(None, target).with_style(style);
    pb.set_message(message.to_owned());
    pb
}

/// Reports each new multiple of 10% reached by a transfer.
#[derive(Debug, Default)]
struct TenPercentSteps {
    last: u64,
}

impl TenPercentSteps {
    /// The percentage to report for this update, if a new step was crossed.
    fn advance(&mut self, written: u64, total: u64) -> Option<u64> {
        if total == 0 {
            return None;
        }
        let step = (u128::from(written) * 10 / u128::from(total)).min(10) as u64;
        (step > self.last).then(|| {
            self.last = step;
            step * 10
        })
    }
}

/// Adapt a progress bar to the `(written, total)` callback used by transfers.
///
/// A hidden bar draws nothing, so progress is logged every 10% instead.
pub fn bar_callback(pb: &ProgressBar) -> impl FnMut(u64, u64) + '_ {
    let log_steps = pb.is_hidden();
    let mut steps = TenPercentSteps::default();
    move |written, total| {
        if pb.length() != Some(total) {
            pb.set_length(total);
        }
        pb.set_position(written);
        if log_steps {
            if let Some(pct) = steps.advance(written, total) {
                info!("Downloaded {written}/{total} bytes ({pct}%)");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_steps_report_each_decile_once() {
        let mut steps = TenPercentSteps::default();
        let total = 1000;
        let reported: Vec<u64> = [50, 99, 100, 150, 420, 430, 999, 1000]
            .into_iter()
            .filter_map(|w| steps.advance(w, total))
            .collect();
        assert_eq!(reported, [10, 40, 90, 100]);
        assert_eq!(steps.advance(1000, total), None);
    }

    #[test]
    fn test_steps_ignore_unknown_total() {
        let mut steps = TenPercentSteps::default();
        assert_eq!(steps.advance(500, 0), None);
    }

    #[test]
    fn test_hidden_bar_tracks_position() {
        let pb = ProgressBar::hidden();
        assert!(pb.is_hidden());
        {
            let mut cb = bar_callback(&pb);
            cb(400, 1000);
            cb(1000, 1000);
        }
        assert_eq!(pb.length(), Some(1000));
        assert_eq!(pb.position(), 1000);
    }
}
