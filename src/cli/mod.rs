//! Types and functions for the command-line interface
//!
//! The contents of this module are intended for use with the [navflash]
//! binary; no stability guaranties apply.

use std::{path::PathBuf, time::Duration};

use clap::Args;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Attribute, Cell, Table};
use dialoguer::{theme::ColorfulTheme, Confirm, Select};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use miette::{IntoDiagnostic, Result, WrapErr};

use crate::{
    error::Error,
    flasher,
    image_format::FirmwareImage,
    link::serial::SerialLink,
    progress::{display_state, DisplayState},
    targets::Target,
    update_index::FirmwareIndex,
    updater::{
        UpdateEvent, UpdateHandle, UpdateImages, UpdateOptions, UpdateOutcome, UpdatePlan, Updater,
    },
    version::{VersionCmp, VersionSnapshot},
};

pub mod config;

use config::Config;

const DEFAULT_BAUD: u32 = 115_200;

/// Common connection arguments
#[derive(Debug, Args)]
pub struct ConnectArgs {
    /// Serial port connected to the device
    #[arg(short = 'p', long, env = "NAVFLASH_PORT")]
    pub port: Option<String>,
    /// Baud rate for the serial port
    #[arg(short = 'b', long, env = "NAVFLASH_BAUD")]
    pub baud: Option<u32>,
}

/// Arguments for resolving installed and available firmware versions
#[derive(Debug, Args)]
pub struct VersionArgs {
    /// Local copy of the vendor's firmware index (JSON)
    #[arg(long)]
    pub index: Option<PathBuf>,
    /// Device name used to look up index entries
    #[arg(long)]
    pub device: Option<String>,
    /// Firmware version currently installed on the application processor
    #[arg(long, value_name = "VERSION")]
    pub installed_application: Option<String>,
    /// Firmware version currently installed on the coprocessor
    #[arg(long, value_name = "VERSION")]
    pub installed_coprocessor: Option<String>,
}

/// Update firmware on one or both processors
#[derive(Debug, Args)]
pub struct UpdateArgs {
    #[clap(flatten)]
    pub connect_args: ConnectArgs,
    #[clap(flatten)]
    pub version_args: VersionArgs,

    /// Which target(s) to update
    #[arg(short, long, value_enum, default_value_t = UpdatePlan::Both)]
    pub target: UpdatePlan,
    /// Intel HEX image for the application processor
    #[arg(long, value_name = "FILE")]
    pub application_image: Option<PathBuf>,
    /// Intel HEX image for the coprocessor
    #[arg(long, value_name = "FILE")]
    pub coprocessor_image: Option<PathBuf>,
    /// Skip the bulk-erase pass of the application flash
    #[arg(long)]
    pub no_erase: bool,
    /// Flash the coprocessor even when its version is already current
    #[arg(long)]
    pub no_check_versions: bool,
    /// Do not ask for confirmation before erasing
    #[arg(short = 'y', long)]
    pub assume_yes: bool,
}

/// Compare installed firmware versions against the index
#[derive(Debug, Args)]
pub struct CheckArgs {
    #[clap(flatten)]
    pub version_args: VersionArgs,
}

/// Inspect a firmware image without touching a device
#[derive(Debug, Args)]
pub struct ImageInfoArgs {
    /// Intel HEX image to inspect
    pub image: PathBuf,
    /// Target to validate the image against
    #[arg(short, long, value_enum)]
    pub target: Target,
}

/// Open the configured serial port.
pub fn connect(args: &ConnectArgs, config: &Config) -> Result<SerialLink> {
    let port = match args.port.clone().or_else(|| config.connection.port.clone()) {
        Some(port) => port,
        None => {
            let port = select_port()?;
            // Remember the choice for the next invocation.
            config.save_with(|config| config.connection.port = Some(port.clone()))?;
            port
        }
    };
    let baud = args
        .baud
        .or(config.connection.baud)
        .unwrap_or(DEFAULT_BAUD);

    info!("Serial port: '{port}'");
    SerialLink::open(&port, baud).map_err(Into::into)
}

/// Offer a choice of detected serial ports when none was configured.
fn select_port() -> Result<String> {
    let ports = serialport::available_ports().map_err(Error::from)?;
    let names: Vec<String> = ports.into_iter().map(|port| port.port_name).collect();

    match names.as_slice() {
        [] => Err(Error::NoSerial.into()),
        [only] => Ok(only.clone()),
        _ => {
            let index = Select::with_theme(&ColorfulTheme::default())
                .with_prompt("Select a serial port")
                .items(&names)
                .default(0)
                .interact()
                .into_diagnostic()?;

            Ok(names[index].clone())
        }
    }
}

/// `update` subcommand
pub fn update(args: UpdateArgs, config: &Config) -> Result<()> {
    let options = UpdateOptions {
        erase_application: !args.no_erase && config.flash.erase_application,
        check_versions: !args.no_check_versions && config.flash.check_versions,
    };

    let wants_application = matches!(args.target, UpdatePlan::Application | UpdatePlan::Both);
    let wants_coprocessor = matches!(args.target, UpdatePlan::Coprocessor | UpdatePlan::Both);

    let images = UpdateImages {
        application: load_image(
            wants_application,
            args.application_image.as_deref(),
            Target::Application,
        )?,
        coprocessor: load_image(
            wants_coprocessor,
            args.coprocessor_image.as_deref(),
            Target::Coprocessor,
        )?,
    };

    let snapshot = resolve_versions(&args.version_args, config)?;

    if wants_application && options.erase_application && !args.assume_yes {
        let confirmed = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(
                "This erases the entire application flash (except the bootloader) before writing. Continue?",
            )
            .default(true)
            .interact()
            .into_diagnostic()?;
        if !confirmed {
            return Err(Error::Cancelled.into());
        }
    }

    let link = std::sync::Arc::new(connect(&args.connect_args, config)?);
    let updater = Updater::new(link, options);
    let handle = updater.request_update(args.target, images, snapshot)?;

    // Ctrl-C aborts the session while it is still handshaking; later it
    // is ignored and the session runs to completion.
    let cancel = handle.cancel_token();
    ctrlc::set_handler(move || cancel.cancel()).into_diagnostic()?;

    render_events(&handle)
}

/// Drive the terminal progress display from session events.
fn render_events(handle: &UpdateHandle) -> Result<()> {
    let mut bar: Option<ProgressBar> = None;
    let mut determinate = false;
    let mut outcome = None;

    for event in handle.events().iter() {
        match event {
            UpdateEvent::Phase(phase) => {
                if let Some(bar) = bar.take() {
                    bar.finish_and_clear();
                }
                determinate = false;
                info!("{phase}");
            }
            UpdateEvent::Progress {
                completed,
                total,
                pulsed,
            } => match display_state(completed, total, pulsed) {
                DisplayState::Indeterminate => {
                    let spinner = bar.get_or_insert_with(|| {
                        let spinner = ProgressBar::new_spinner();
                        spinner.enable_steady_tick(Duration::from_millis(100));
                        spinner
                    });
                    spinner.set_message(format!("{completed} operations"));
                }
                DisplayState::Percent(percent) => {
                    if !determinate {
                        if let Some(bar) = bar.take() {
                            bar.finish_and_clear();
                        }
                        let progress = ProgressBar::new(100);
                        progress.set_style(
                            ProgressStyle::default_bar()
                                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>3}% {msg}")
                                .unwrap()
                                .progress_chars("#>-"),
                        );
                        bar = Some(progress);
                        determinate = true;
                    }
                    if let Some(bar) = &bar {
                        bar.set_position(percent as u64);
                        bar.set_message(format!("{completed}/{total}"));
                    }
                }
            },
            UpdateEvent::Notice(notice) => {
                if let Some(bar) = &bar {
                    bar.println(&notice);
                } else {
                    warn!("{notice}");
                }
            }
            UpdateEvent::Outcome(result) => {
                if let Some(bar) = bar.take() {
                    bar.finish_and_clear();
                }
                outcome = Some(result);
            }
        }
    }

    match outcome {
        Some(UpdateOutcome::Completed { summary }) => {
            println!("{summary}");
            Ok(())
        }
        Some(UpdateOutcome::Failed { summary }) => Err(miette::miette!("{summary}")),
        Some(UpdateOutcome::Cancelled) | None => Err(Error::Cancelled.into()),
    }
}

/// `check` subcommand
pub fn check(args: CheckArgs, config: &Config) -> Result<()> {
    let snapshot = resolve_versions(&args.version_args, config)?;

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Component").add_attribute(Attribute::Bold),
            Cell::new("Installed").add_attribute(Attribute::Bold),
            Cell::new("Available").add_attribute(Attribute::Bold),
            Cell::new("Status").add_attribute(Attribute::Bold),
        ]);

    let rows = [
        ("Application", &snapshot.application),
        ("Coprocessor", &snapshot.coprocessor),
        ("navflash (this tool)", &snapshot.tool),
    ];

    for (name, pair) in rows {
        let status = match pair.comparison() {
            VersionCmp::Less => "update available",
            VersionCmp::Equal => "up to date",
            VersionCmp::Greater => "newer than release",
            VersionCmp::Unknown => "unknown",
        };

        table.add_row(vec![
            name,
            pair.installed.as_deref().unwrap_or("-"),
            pair.available.as_deref().unwrap_or("-"),
            status,
        ]);
    }

    println!("{table}");
    Ok(())
}

/// `image-info` subcommand
pub fn image_info(args: ImageInfoArgs) -> Result<()> {
    let image = FirmwareImage::load(&args.image, args.target)
        .wrap_err_with(|| format!("Failed to load {}", args.image.display()))?;

    let span = image
        .address_span()
        .map(|span| format!("{:#010x}..{:#010x}", span.start, span.end))
        .unwrap_or_else(|| "empty".into());

    let sectors = flasher::touched_sectors(args.target, &image);
    let with_erase = flasher::operation_count(args.target, &image, true);
    let without_erase = flasher::operation_count(args.target, &image, false);

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS);
    table.add_row(vec!["Target", &args.target.to_string()]);
    table.add_row(vec!["Data bytes", &image.len().to_string()]);
    table.add_row(vec!["Records", &image.records().len().to_string()]);
    table.add_row(vec!["Address span", &span]);
    table.add_row(vec![
        "Sectors touched",
        &sectors
            .iter()
            .map(|sector| sector.to_string())
            .collect::<Vec<_>>()
            .join(", "),
    ]);
    table.add_row(vec!["Operations (with erase)", &with_erase.to_string()]);
    table.add_row(vec![
        "Operations (without erase)",
        &without_erase.to_string(),
    ]);

    println!("{table}");
    Ok(())
}

fn load_image(
    wanted: bool,
    path: Option<&std::path::Path>,
    target: Target,
) -> Result<Option<FirmwareImage>> {
    if !wanted {
        return Ok(None);
    }

    let path = path.ok_or(Error::MissingImage(target))?;
    let image = FirmwareImage::load(path, target)
        .wrap_err_with(|| format!("Failed to load {}", path.display()))?;

    Ok(Some(image))
}

/// Build the per-session version snapshot from the index file and the
/// installed-version overrides. Index problems degrade with a warning.
fn resolve_versions(args: &VersionArgs, config: &Config) -> Result<VersionSnapshot> {
    let index = match &args.index {
        Some(path) => match FirmwareIndex::load(path) {
            Ok(index) => Some(index),
            Err(err) => {
                warn!("{err}; continuing without version information");
                None
            }
        },
        None => None,
    };

    let device = args
        .device
        .clone()
        .or_else(|| config.device.clone())
        .unwrap_or_default();

    Ok(VersionSnapshot::resolve(
        index.as_ref(),
        &device,
        args.installed_application.clone(),
        args.installed_coprocessor.clone(),
        env!("CARGO_PKG_VERSION"),
    ))
}
