//! Structured logging helpers bridging popup and page output to host tracing.

use serde_json::Value;
use tracing::{debug, error, info};

/// Target for lines relayed through `LOGGER_REQUEST`.
pub const CONSOLE_TARGET: &str = "dimmer::console";

/// Join console arguments the way `console.log` prints them: strings raw,
/// everything else as JSON, separated by spaces.
pub fn format_console_args(payload: &Value) -> String {
    let render = |value: &Value| match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    match payload {
        Value::Array(args) => args.iter().map(render).collect::<Vec<_>>().join(" "),
        other => render(other),
    }
}

/// Print relayed console arguments from `source` (`"popup"`, `"content"`).
pub fn relay_console(source: &str, payload: &Value) {
    info!(target: CONSOLE_TARGET, source, "{}", format_console_args(payload));
}

/// Log a non-fatal runtime or storage failure together with a backtrace.
pub fn report_runtime_error(context: &str, err: &dyn std::error::Error) {
    error!(context, error = %err, "runtime error");
    debug!("Backtrace:\n{:?}", backtrace::Backtrace::new());
}
