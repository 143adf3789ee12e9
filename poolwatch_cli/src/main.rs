mod cli;
mod error_fmt;
mod logging;
mod run;
mod sim;

use clap::Parser;
use cli::{Cli, Commands, JSON_MODE};
use error_fmt::{exit_code_for_error, format_error_json, humanize};
use std::time::Duration;

fn main() {
    let cli = Cli::parse();
    let _ = JSON_MODE.set(cli.json);
    let _ = color_eyre::install();

    if let Err(err) = try_main(cli) {
        if JSON_MODE.get().copied().unwrap_or(false) {
            eprintln!("{}", format_error_json(&err));
        } else {
            eprintln!("{}", humanize(&err));
        }
        tracing::error!(error = %err, "exiting with error");
        std::process::exit(exit_code_for_error(&err));
    }
}

fn try_main(cli: Cli) -> eyre::Result<()> {
    let cfg = run::load_config(cli.config.as_deref())?;
    logging::init_tracing(&cli.log_level, cli.json, &cfg.logging)?;

    match cli.cmd {
        Commands::Simulate {
            devices,
            seconds,
            test,
            silent,
            fail_every,
            tick_ms,
            session_ms,
            connect_ms,
        } => {
            let params = run::SimParams {
                devices,
                seconds,
                test,
                silent,
                fail_every,
                tick: Duration::from_millis(tick_ms.max(1)),
                session_ms,
                connect_ms,
            };
            run::simulate(&cfg, &params, cli.json)
        }
        Commands::CheckConfig => run::check_config(&cfg, cli.config.as_deref(), cli.json),
    }
}
