//! Diagnostic callbacks for the terminal and for log files.

use std::{
    io::{self, Write},
    sync::{Arc, Mutex},
};

use owo_colors::OwoColorize;
use scriptpool::{DiagnosticCallbacks, ProgressRecord};

/// Width of the progress bar in characters.
const BAR_WIDTH: usize = 50;

/// Colored, prefixed output on stderr, with progress drawn as a bar that is
/// rewritten in place.
pub fn console_callbacks() -> DiagnosticCallbacks {
    DiagnosticCallbacks::new()
        .with_verbose(|r| eprintln!("{}", format!("VRB: {r}").cyan()))
        .with_debug(|r| eprintln!("{}", format!("DBG: {r}").bright_cyan()))
        .with_information(|r| eprintln!("INF: {r}"))
        .with_warning(|r| eprintln!("{}", format!("WRN: {r}").yellow()))
        .with_error(|r| eprintln!("{}", format!("ERR: {r}").red()))
        .with_progress(|r| {
            let mut stderr = io::stderr().lock();
            let _ = write!(stderr, "{}", progress_line(r).green());
            let _ = stderr.flush();
        })
}

/// One line per record, written to `writer`.
pub fn writer_callbacks(writer: impl Write + Send + 'static) -> DiagnosticCallbacks {
    let writer: Arc<Mutex<dyn Write + Send>> = Arc::new(Mutex::new(writer));
    let line = move |prefix: &'static str| {
        let writer = writer.clone();
        move |text: String| {
            let mut writer = writer.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = writeln!(writer, "{prefix}: {text}") {
                tracing::warn!("failed to write diagnostic: {}", e);
            }
        }
    };
    let verbose = line("VRB");
    let debug = line("DBG");
    let information = line("INF");
    let warning = line("WRN");
    let error = line("ERR");
    let progress = line("PGS");
    DiagnosticCallbacks::new()
        .with_verbose(move |r| verbose(r.to_string()))
        .with_debug(move |r| debug(r.to_string()))
        .with_information(move |r| information(r.to_string()))
        .with_warning(move |r| warning(r.to_string()))
        .with_error(move |r| error(r.to_string()))
        .with_progress(move |r| progress(r.to_string()))
}

/// The in-place progress line for `record`, ending the line once the activity
/// is finished.
pub fn progress_line(record: &ProgressRecord) -> String {
    let filled = usize::from(record.percent_complete) / 2;
    let ending = if record.is_final() { "\n" } else { "" };
    format!(
        "\rPGS: {:>3}% {} [{:<width$}] {:>15}{ending}",
        record.percent_complete,
        record.activity,
        "#".repeat(filled),
        record.record_type.to_string(),
        width = BAR_WIDTH,
    )
}
