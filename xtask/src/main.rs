use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process::Command;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Tasks for the project", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the project
    Build,
    /// Run the test suite
    Test,
    /// Flash a firmware file onto the simulated device
    Demo {
        /// Firmware file path
        #[arg(long)]
        file: String,
    },
}

fn cargo(args: &[&str], what: &str) -> Result<()> {
    let status = Command::new("cargo").args(args).status()?;
    if !status.success() {
        anyhow::bail!("{what} failed");
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Build => {
            println!("Building project...");
            cargo(&["build"], "Build")?;
        }
        Commands::Test => {
            println!("Running tests...");
            cargo(&["test", "--workspace"], "Test")?;
        }
        Commands::Demo { file } => {
            println!("Flashing {file} onto the simulated device...");
            cargo(
                &[
                    "run",
                    "-p",
                    "samflash-cli",
                    "--",
                    "flash",
                    "--simulate",
                    "--file",
                    file,
                ],
                "Demo",
            )?;
        }
    }

    Ok(())
}
