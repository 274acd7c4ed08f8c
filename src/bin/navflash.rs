use clap::{CommandFactory, Parser, Subcommand};
use log::{debug, LevelFilter};
use miette::Result;
use navflash::{
    cli::{check, config::Config, image_info, update, CheckArgs, ImageInfoArgs, UpdateArgs},
    logging::initialize_logger,
};

#[derive(Debug, Parser)]
#[command(about, max_term_width = 100, propagate_version = true, version)]
struct Cli {
    #[command(subcommand)]
    subcommand: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Update firmware on one or both of the device's processors
    Update(UpdateArgs),
    /// Compare installed firmware versions against a firmware index
    Check(CheckArgs),
    /// Inspect and validate a firmware image without a device attached
    ImageInfo(ImageInfoArgs),
    /// Generate completions for the given shell
    Completions(CompletionsArgs),
}

#[derive(Debug, clap::Args)]
struct CompletionsArgs {
    /// Shell to generate completions for
    shell: clap_complete::Shell,
}

fn main() -> Result<()> {
    miette::set_panic_hook();
    initialize_logger(LevelFilter::Info);

    // Attempt to parse any provided command-line arguments, or print the
    // help message and terminate if the invocation is not correct.
    let cli = Cli::parse();
    let args = cli.subcommand;
    debug!("{args:#?}");

    // Load any user configuration, if present.
    let config = Config::load()?;

    // Execute the correct action based on the provided subcommand and its
    // associated arguments.
    match args {
        Commands::Update(args) => update(args, &config),
        Commands::Check(args) => check(args, &config),
        Commands::ImageInfo(args) => image_info(args),
        Commands::Completions(args) => completions(args),
    }
}

fn completions(args: CompletionsArgs) -> Result<()> {
    clap_complete::generate(
        args.shell,
        &mut Cli::command(),
        "navflash",
        &mut std::io::stdout(),
    );

    Ok(())
}
