mod commands;
mod logging;
mod settings;

use clap::Parser;
use settings::Settings;

fn main() -> anyhow::Result<()> {
    let settings = Settings::parse();
    logging::setup_logging(settings.verbose);
    commands::run(&settings)
}
