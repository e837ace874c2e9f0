use colored::{Color, Colorize};
use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;

/// Severity-to-color table for the CLI's user-facing output
const LEVEL_COLORS: [(Level, Color); 5] = [
    (Level::ERROR, Color::Red),
    (Level::WARN, Color::Yellow),
    (Level::INFO, Color::White),
    (Level::DEBUG, Color::Blue),
    (Level::TRACE, Color::Magenta),
];

fn color_for(level: &Level) -> Color {
    LEVEL_COLORS
        .iter()
        .find(|(candidate, _)| candidate == level)
        .map(|(_, color)| *color)
        .unwrap_or(Color::White)
}

/// A tracing event formatter that renders each event as one line colored by
/// its severity, with no timestamp or level tag. Meant for console output;
/// the detailed log layer keeps the full metadata.
pub struct LevelColorFormatter;

impl<S, N> FormatEvent<S, N> for LevelColorFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        // render the fields into an owned line first; coloring wraps the
        // whole string in ANSI codes, which can't be done mid-stream
        let mut line = String::new();
        ctx.format_fields(Writer::new(&mut line), event)?;

        let color = color_for(event.metadata().level());
        writeln!(writer, "{}", line.color(color))
    }
}
