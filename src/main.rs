use anyhow::{bail, Context, Result};
use std::path::PathBuf;

use objdex::catalog::ImageView;
use objdex::search::SearchOutcome;
use objdex::sync::SyncReport;
use objdex::{logging, Catalog, Config};

#[derive(Debug, PartialEq)]
enum Command {
    Ingest(Vec<PathBuf>),
    Process(i64),
    ProcessAll,
    Search {
        detection_id: i64,
        top_k: Option<usize>,
    },
    Resize {
        image_id: i64,
        width: Option<u32>,
        height: Option<u32>,
    },
    Crop {
        image_id: i64,
        detection_id: Option<i64>,
    },
    List,
    Show(i64),
    Export {
        image_id: i64,
        dest: PathBuf,
    },
    Delete(i64),
    Health,
}

#[derive(Debug, PartialEq)]
struct Cli {
    config_path: Option<PathBuf>,
    verbose: bool,
    command: Command,
}

/// Outcome of argument parsing that is not a command to run.
#[derive(Debug, PartialEq)]
enum Early {
    Help,
    Version,
}

fn parse_number<T: std::str::FromStr>(what: &str, value: Option<&String>) -> Result<T> {
    let value = value.with_context(|| format!("{} requires a value", what))?;
    value
        .parse()
        .map_err(|_| anyhow::anyhow!("{} must be a number, got {:?}", what, value))
}

fn parse_args(args: &[String]) -> Result<std::result::Result<Cli, Early>> {
    let mut config_path = None;
    let mut verbose = false;
    let mut positional: Vec<String> = Vec::new();
    let mut top_k: Option<usize> = None;
    let mut width: Option<u32> = None;
    let mut height: Option<u32> = None;
    let mut detection: Option<i64> = None;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => return Ok(Err(Early::Help)),
            "--version" | "-V" => return Ok(Err(Early::Version)),
            "--verbose" | "-v" => verbose = true,
            "--config" | "-c" => {
                let path = args.get(i + 1).context("--config requires a path argument")?;
                config_path = Some(PathBuf::from(path));
                i += 1;
            }
            "--top-k" | "-k" => {
                top_k = Some(parse_number("--top-k", args.get(i + 1))?);
                i += 1;
            }
            "--width" => {
                width = Some(parse_number("--width", args.get(i + 1))?);
                i += 1;
            }
            "--height" => {
                height = Some(parse_number("--height", args.get(i + 1))?);
                i += 1;
            }
            "--detection" | "-d" => {
                detection = Some(parse_number("--detection", args.get(i + 1))?);
                i += 1;
            }
            arg if arg.starts_with('-') => bail!("Unknown argument: {}", arg),
            arg => positional.push(arg.to_string()),
        }
        i += 1;
    }

    let Some((name, rest)) = positional.split_first() else {
        bail!("No command given");
    };
    let id = |what: &str| parse_number::<i64>(what, rest.first());

    let command = match name.as_str() {
        "ingest" => {
            if rest.is_empty() {
                bail!("ingest requires at least one path");
            }
            Command::Ingest(rest.iter().map(PathBuf::from).collect())
        }
        "process" => Command::Process(id("IMAGE_ID")?),
        "process-all" => Command::ProcessAll,
        "search" => Command::Search {
            detection_id: id("DETECTION_ID")?,
            top_k,
        },
        "resize" => Command::Resize {
            image_id: id("IMAGE_ID")?,
            width,
            height,
        },
        "crop" => Command::Crop {
            image_id: id("IMAGE_ID")?,
            detection_id: detection,
        },
        "list" => Command::List,
        "show" => Command::Show(id("IMAGE_ID")?),
        "export" => Command::Export {
            image_id: id("IMAGE_ID")?,
            dest: rest
                .get(1)
                .map(PathBuf::from)
                .context("export requires a destination path")?,
        },
        "delete" => Command::Delete(id("IMAGE_ID")?),
        "health" => Command::Health,
        other => bail!("Unknown command: {}", other),
    };

    Ok(Ok(Cli {
        config_path,
        verbose,
        command,
    }))
}

fn print_help() {
    println!(
        r#"objdex - object detection catalog with similarity search

USAGE:
    objdex [OPTIONS] <COMMAND>

COMMANDS:
    ingest <PATH>...                     Detect objects in images or directories
    process <IMAGE_ID>                   Describe and index an image's detections
    process-all                          Process every image with unindexed detections
    search <DETECTION_ID> [--top-k N]    Find similar objects of the same class
    resize <IMAGE_ID> [--width W] [--height H]
                                         Derive a resized copy
    crop <IMAGE_ID> --detection <ID>     Derive a crop of one detection
    list                                 List images, newest first
    show <IMAGE_ID>                      Show an image with its detections
    export <IMAGE_ID> <DEST>             Copy the stored raster to DEST
    delete <IMAGE_ID>                    Delete an image and its detections
    health                               Check the CV service

OPTIONS:
    --config, -c PATH   Path to config file
    --verbose, -v       Log to stderr
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    OBJDEX_CONFIG       Path to config file (overrides default location)
    OBJDEX_LOG          Log level (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/objdex/config.toml"#
    );
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = match parse_args(&args) {
        Ok(Ok(cli)) => cli,
        Ok(Err(Early::Help)) => {
            print_help();
            return Ok(());
        }
        Ok(Err(Early::Version)) => {
            println!("objdex {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };

    if cli.verbose {
        logging::init_stderr()?;
    } else {
        // Logging is best effort; the command still runs without it.
        let _ = logging::init(Some(Config::config_dir().join("logs")));
    }

    let config = match &cli.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let catalog = Catalog::open(config).context("Failed to open catalog")?;
    let result = run(&catalog, cli.command);
    if let Err(e) = &result {
        if e.downcast_ref::<objdex::Error>().is_some_and(|e| e.is_transient()) {
            eprintln!("The CV service may be temporarily unavailable; rerunning the command is safe.");
        }
    }
    result
}

fn run(catalog: &Catalog, command: Command) -> Result<()> {
    match command {
        Command::Ingest(paths) => {
            let report = catalog.ingest(&paths);
            for id in &report.ingested {
                println!("ingested image {}", id);
            }
            for (path, reason) in &report.failed {
                eprintln!("failed {}: {}", path.display(), reason);
            }
            println!("{} ingested, {} failed", report.count(), report.failed.len());
        }
        Command::Process(image_id) => {
            let report = catalog.process(image_id)?;
            print_sync_report(image_id, &report);
        }
        Command::ProcessAll => {
            let reports = catalog.process_all()?;
            for (image_id, report) in &reports {
                print_sync_report(*image_id, report);
            }
            let total: usize = reports.iter().map(|(_, r)| r.newly_indexed).sum();
            println!("{} images processed, {} detections newly indexed", reports.len(), total);
        }
        Command::Search {
            detection_id,
            top_k,
        } => print_search(&catalog.search(detection_id, top_k)?),
        Command::Resize {
            image_id,
            width,
            height,
        } => {
            let image = catalog.resize(image_id, width, height)?;
            println!("created image {} ({}x{})", image.id, image.width, image.height);
        }
        Command::Crop {
            image_id,
            detection_id,
        } => {
            let image = catalog.crop(image_id, detection_id)?;
            println!("created image {} ({}x{})", image.id, image.width, image.height);
        }
        Command::List => {
            for image in catalog.list()? {
                println!(
                    "{:>6}  {:>5}x{:<5}  {}  {}{}",
                    image.id,
                    image.width,
                    image.height,
                    image.created_at,
                    image.original_name,
                    if image.is_generated { "  (generated)" } else { "" }
                );
            }
        }
        Command::Show(image_id) => print_view(&catalog.show(image_id)?),
        Command::Export { image_id, dest } => {
            let target = catalog.export(image_id, &dest)?;
            println!("exported to {}", target.display());
        }
        Command::Delete(image_id) => {
            catalog.delete(image_id)?;
            println!("deleted image {}", image_id);
        }
        Command::Health => {
            catalog.health()?;
            println!("CV service at {} is healthy", catalog.config().services.base_url);
        }
    }
    Ok(())
}

fn print_sync_report(image_id: i64, report: &SyncReport) {
    println!(
        "image {}: {} newly indexed, {} already done, {} describe failures, {} failed batches{}",
        image_id,
        report.newly_indexed,
        report.skipped,
        report.describe_failures,
        report.batches_failed,
        if report.cancelled { " (cancelled)" } else { "" }
    );
}

fn print_search(outcome: &SearchOutcome) {
    println!(
        "neighbors of detection {} ({}):",
        outcome.query.id, outcome.query.class_name
    );
    for hit in &outcome.hits {
        let detection = hit
            .detection_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:.4}  image {:>6}  detection {:>6}  {}",
            hit.score, hit.image.id, detection, hit.image.original_name
        );
    }
}

fn print_view(view: &ImageView) {
    let image = &view.image;
    println!("image {}: {}", image.id, image.original_name);
    println!("  size:    {}x{}", image.width, image.height);
    println!("  path:    {}", image.path);
    if let Some(parent) = image.parent_image_id {
        println!("  parent:  {}", parent);
    }
    println!("  created: {}", image.created_at);
    for d in &view.detections {
        println!(
            "  #{:<6} {:<16} {:.2}  [{:.1}, {:.1}, {:.1}, {:.1}]  descriptor={} indexed={}",
            d.detection.id,
            d.detection.class_name,
            d.detection.confidence,
            d.detection.bbox.x1,
            d.detection.bbox.y1,
            d.detection.bbox.x2,
            d.detection.bbox.y2,
            d.has_descriptor,
            d.indexed
        );
    }
}
