/// `main.rs` — command-line front-end
///
/// Boots the engine: with a data path it runs `scripts/init.lua` from that
/// directory inside a memory- and time-bounded sandbox and reports the
/// outcome. The heavy lifting lives in the library crate.
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Serialize;

use peon::scripting::{LuaRuntime, Preset, PrintEntry, Sandbox};

const BOOT_MEMORY_LIMIT: usize = 64 * 1024 * 1024;
const BOOT_TIME_LIMIT: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(
    name = "peon",
    version,
    about = "A moddable engine core for classic 2D real-time strategy games"
)]
struct Cli {
    /// Path to game data
    #[arg(short = 'd', long = "data", value_name = "PATH")]
    data: Option<PathBuf>,

    /// Emit the boot report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct BootReport {
    success: bool,
    error: Option<String>,
    output: Vec<PrintEntry>,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let Some(data) = cli.data else {
        log::info!("no data path given, nothing to do (see --help)");
        return;
    };
    log::info!("using given data path: \"{}\"", data.display());

    let report = match boot(&data) {
        Ok(report) => report,
        Err(err) => {
            log::error!("engine boot failed: {err}");
            std::process::exit(1);
        }
    };

    if cli.json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(err) => log::error!("cannot serialize the boot report: {err}"),
        }
    } else {
        for entry in &report.output {
            println!("{}", entry.message);
        }
        if let Some(error) = &report.error {
            eprintln!("init script failed: {error}");
        }
    }

    if !report.success {
        std::process::exit(1);
    }
}

/// Runs `<data>/scripts/init.lua` in a fresh sandbox under the boot
/// budgets. Script failures land in the report, not in the exit path.
fn boot(data: &Path) -> mlua::Result<BootReport> {
    let scripts_root = data.join("scripts");

    let runtime = LuaRuntime::with_memory_limit(BOOT_MEMORY_LIMIT)?;
    let sandbox = Sandbox::with_root(&runtime, Preset::Complete, &scripts_root)?;

    let result = {
        let _scope = runtime.guarded_scope(BOOT_TIME_LIMIT);
        sandbox.run_file(scripts_root.join("init.lua"))
    };

    let output = sandbox.print_sink().lock().unwrap().clone();
    let report = match result {
        Ok(_) => BootReport {
            success: true,
            error: None,
            output,
        },
        Err(err) => BootReport {
            success: false,
            error: Some(err.to_string()),
            output,
        },
    };
    Ok(report)
}
