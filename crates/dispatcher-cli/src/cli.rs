use std::path::PathBuf;

use clap::{ArgGroup, Parser};

/// `codetracer-rr-dispatcher <trace-path> [flags]`
#[derive(Debug, Clone, Parser)]
#[command(
    name = "codetracer-rr-dispatcher",
    version,
    about = "Process-pool scheduler for rr replay workers"
)]
#[command(group(
    ArgGroup::new("transport")
        .args(["socket", "stdio"])
        .required(false)
))]
pub struct Cli {
    /// Filesystem directory containing an `rr` recording plus metadata.
    pub trace_path: PathBuf,

    /// Maximum concurrent `rr` workers.
    #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u32).range(2..))]
    pub pool_max: u32,

    /// Number of `close-tracking` reserve workers to maintain.
    #[arg(long = "close-tracking", default_value_t = 1)]
    pub close_tracking: u32,

    /// Attempt an interrupt before cancel-and-replace on a busy jump.
    #[arg(long)]
    pub interrupt_supported: bool,

    /// Listen on a Unix domain socket at PATH instead of stdio.
    #[arg(long, value_name = "PATH")]
    pub socket: Option<PathBuf>,

    /// Speak the client protocol over stdin/stdout (the default transport).
    #[arg(long)]
    pub stdio: bool,
}

impl Cli {
    /// Builds the dispatcher-scoped config this invocation asked for,
    /// validating it the same way an in-flight `configure` task would.
    pub fn router_config(&self) -> Result<codetracer_rr_dispatcher_core::RouterConfig, codetracer_rr_dispatcher_core::ConfigError> {
        let config = codetracer_rr_dispatcher_core::RouterConfig {
            pool_max: self.pool_max,
            close_tracking_count: self.close_tracking,
            interrupt_supported: self.interrupt_supported,
            ..codetracer_rr_dispatcher_core::RouterConfig::default()
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_a_valid_router_config() {
        let cli = Cli::parse_from(["codetracer-rr-dispatcher", "/tmp/trace"]);
        assert!(cli.router_config().is_ok());
    }

    #[test]
    fn pool_max_below_two_is_rejected_by_clap() {
        let result = Cli::try_parse_from(["codetracer-rr-dispatcher", "/tmp/trace", "--pool-max=1"]);
        assert!(result.is_err());
    }

    #[test]
    fn socket_and_stdio_are_mutually_exclusive() {
        let result = Cli::try_parse_from([
            "codetracer-rr-dispatcher",
            "/tmp/trace",
            "--socket=/tmp/sock",
            "--stdio",
        ]);
        assert!(result.is_err());
    }
}
