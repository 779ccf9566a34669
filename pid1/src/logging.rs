use std::fmt;
use std::io::IsTerminal;
use std::time::Instant;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::time::FormatTime;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

/// 0 errors, 1 warnings, 2 info, 3 debug, 4+ trace.
pub fn level_for(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::ERROR,
        1 => LevelFilter::WARN,
        2 => LevelFilter::INFO,
        3 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Log to stderr. Stdout belongs to the supervised program.
pub fn init(verbosity: u8) {
    let stderr = std::io::stderr();
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_max_level(level_for(verbosity))
        .with_ansi(stderr.is_terminal())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_levels() {
        assert_eq!(level_for(0), LevelFilter::ERROR);
        assert_eq!(level_for(1), LevelFilter::WARN);
        assert_eq!(level_for(2), LevelFilter::INFO);
        assert_eq!(level_for(3), LevelFilter::DEBUG);
        assert_eq!(level_for(4), LevelFilter::TRACE);
        assert_eq!(level_for(u8::MAX), LevelFilter::TRACE);
    }
}
