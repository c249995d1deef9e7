pub use slog::{debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::{Config, LoggerConfig};

/// Builds the stderr logger worker binaries start with. Library code never
/// calls this; every constructor takes an optional parent `Logger` and
/// falls back to `Discard`.
pub fn term_logger() -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "info"
destination = "stderr"
"#,
    )
    .expect("builtin logger config must parse");

    config.build_logger().expect("terminal logger must build")
}
