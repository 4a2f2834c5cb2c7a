use std::io::{self, Write};

/// Progress display for long-running stages, redrawn only when the
/// percentage changes so tight loops stay cheap.
pub struct ProgressBar {
    total: usize,
    current: usize,
    description: String,
    last_percentage: usize,
}

impl ProgressBar {
    /// Create a new progress bar for `total` work items
    pub fn new(total: usize, description: &str) -> Self {
        Self {
            total,
            current: 0,
            description: description.to_string(),
            last_percentage: usize::MAX,
        }
    }

    /// Update progress to `current` items done
    pub fn update(&mut self, current: usize) -> io::Result<()> {
        self.current = current;
        let percentage = if self.total > 0 {
            (current * 100) / self.total
        } else {
            100
        };

        // Only redraw when the percentage changes
        if percentage != self.last_percentage {
            print!(
                "\r{}: {}/{} ({}%)",
                self.description, self.current, self.total, percentage
            );
            io::stdout().flush()?;
            self.last_percentage = percentage;
        }

        Ok(())
    }

    /// Finish progress display
    pub fn finish(&mut self) -> io::Result<()> {
        self.current = self.total;
        print!(
            "\r{}: {}/{} (100%)",
            self.description, self.total, self.total
        );
        println!();
        Ok(())
    }
}

/// Format elapsed time as "xx h xx m xx.xxx s"
pub fn format_time_used(elapsed: std::time::Duration) -> String {
    let total_secs = elapsed.as_secs_f64();
    let hours = (total_secs / 3600.0) as u64;
    let minutes = ((total_secs % 3600.0) / 60.0) as u64;
    let seconds = total_secs % 60.0;

    if hours > 0 {
        format!("[Time used] {:02} h {:02} m {:05.3} s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("[Time used] {:02} m {:05.3} s", minutes, seconds)
    } else {
        format!("[Time used] {:05.3} s", seconds)
    }
}
