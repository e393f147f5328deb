//! Helper process entry point.
//!
//! Launched by the bridge as `modlink-helper <parent_pid> [--debug]`
//! with stdin/stdout as the command pipe and stderr captured to the
//! helper log. Argument errors are reported through the handshake so
//! the parent's bridge initialization fails with the reason.

use std::process::ExitCode;

use modlink::helper::{
    CommandRegistry, parse_args, run_helper, spawn_parent_monitor, write_startup_failure,
};
use tracing_subscriber::EnvFilter;

fn registry() -> CommandRegistry {
    let mut registry = CommandRegistry::new();
    // Diagnostic commands; the mod-scanning command set registers here.
    registry.register("echo", |args| {
        args.into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("echo takes one argument"))
    });
    registry.register("version", |_| {
        Ok(serde_json::Value::String(
            env!("CARGO_PKG_VERSION").to_string(),
        ))
    });
    registry
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(message) => {
            tracing::error!(%message, "Helper startup failed");
            let _ = write_startup_failure(tokio::io::stdout(), &message).await;
            return ExitCode::from(2);
        }
    };

    spawn_parent_monitor(args.parent_pid);

    match run_helper(tokio::io::stdin(), tokio::io::stdout(), registry(), args.debug).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Helper command loop failed");
            ExitCode::FAILURE
        }
    }
}
