use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use dicom_dataset::config::{CreateOptions, PatientLayout, ScanOptions};
use dicom_dataset::{
    DefaultSegmentationReader, DicomImageReader, KeepMatchedOnly, OrganDictionary, PatientDataset,
    PromptDecider, RunSummary, SelectionCriteria, SeriesDecider,
};

#[derive(Parser)]
#[command(name = "dicom-dataset")]
#[command(about = "Assemble per-patient DICOM series and segmentations into a dataset archive")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build or update a dataset from a folder of patients
    Build(BuildArgs),
    /// List the patients and images stored in a dataset
    Inspect(InspectArgs),
}

#[derive(Args)]
struct BuildArgs {
    /// Folder with one subdirectory per patient
    #[arg(value_name = "PATIENTS")]
    patients: PathBuf,

    /// Dataset directory to write
    #[arg(short, long)]
    output: PathBuf,

    /// JSON file mapping role names to series descriptions
    #[arg(long)]
    criteria: Option<PathBuf>,

    /// JSON file mapping normalised segmentation labels to organ names
    #[arg(long)]
    organs: Option<PathBuf>,

    /// Name of the images subdirectory of each patient
    #[arg(long, default_value = dicom_dataset::config::DEFAULT_IMAGES_DIR)]
    images_dir: String,

    /// Name of the segmentations subdirectory of each patient
    #[arg(long, default_value = dicom_dataset::config::DEFAULT_SEGMENTATIONS_DIR)]
    segmentations_dir: String,

    /// Replace patients already in the dataset
    #[arg(long)]
    overwrite: bool,

    /// Ask which role to give series that match none
    #[arg(long)]
    interactive: bool,

    /// Write the criteria, including interactive additions, to this file
    #[arg(long)]
    save_criteria: Option<PathBuf>,

    /// Read slice headers in parallel (faster for large series)
    #[arg(long)]
    parallel: bool,

    /// Include private tags in image attributes
    #[arg(long)]
    include_private: bool,

    /// Maximum recursion depth inside images and segmentations directories
    #[arg(long, default_value = "10")]
    max_depth: usize,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Args)]
struct InspectArgs {
    /// Dataset directory
    #[arg(value_name = "DATASET")]
    dataset: PathBuf,

    /// Print the full manifest of one patient
    #[arg(short, long)]
    patient: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let verbose = matches!(&cli.command, Command::Build(args) if args.verbose);
    init_logging(verbose);

    match cli.command {
        Command::Build(args) => build(args),
        Command::Inspect(args) => inspect(args),
    }
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("dicom_dataset=debug")
        } else {
            EnvFilter::new("dicom_dataset=info")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build(args: BuildArgs) -> Result<()> {
    if !args.patients.is_dir() {
        bail!("Patient folder {:?} does not exist", args.patients);
    }

    let mut criteria = args
        .criteria
        .as_deref()
        .map(|path| {
            SelectionCriteria::load(path).with_context(|| format!("Failed to load criteria from {:?}", path))
        })
        .transpose()?;
    let organs = match &args.organs {
        Some(path) => OrganDictionary::load(path)
            .with_context(|| format!("Failed to load organ dictionary from {:?}", path))?,
        None => OrganDictionary::new(),
    };

    if args.verbose {
        println!("🏥 dicom-dataset v{}", env!("CARGO_PKG_VERSION"));
        println!("📁 Patients: {:?}", args.patients);
        println!("📦 Dataset: {:?}", args.output);
        match &criteria {
            Some(c) => println!("🔎 Roles: {}", c.roles().collect::<Vec<_>>().join(", ")),
            None => println!("🔎 No criteria, keeping every series"),
        }
    }

    let options = CreateOptions {
        patients_root: args.patients.clone(),
        dataset_path: args.output.clone(),
        layout: PatientLayout {
            images_dir: args.images_dir.clone(),
            segmentations_dir: args.segmentations_dir.clone(),
        },
        scan: ScanOptions {
            max_depth: args.max_depth,
            parallel: args.parallel,
        },
        overwrite: args.overwrite,
        show_progress: args.verbose && !args.interactive,
    };

    let summary = if args.interactive {
        run_build(&options, &args, criteria.as_mut(), &organs, &mut PromptDecider::stdio())?
    } else {
        run_build(&options, &args, criteria.as_mut(), &organs, &mut KeepMatchedOnly)?
    };

    if let Some(path) = &args.save_criteria {
        match &criteria {
            Some(c) => {
                c.save(path)
                    .with_context(|| format!("Failed to save criteria to {:?}", path))?;
                if args.verbose {
                    println!("📄 Criteria saved to: {:?}", path);
                }
            }
            None => warn!("--save-criteria given without --criteria, nothing to save"),
        }
    }

    print_summary(&summary);
    Ok(())
}

fn run_build<D: SeriesDecider>(
    options: &CreateOptions,
    args: &BuildArgs,
    criteria: Option<&mut SelectionCriteria>,
    organs: &OrganDictionary,
    decider: &mut D,
) -> Result<RunSummary> {
    let image_reader = DicomImageReader {
        include_private: args.include_private,
    };
    let segmentation_reader = DefaultSegmentationReader::new();
    PatientDataset::create_with(options, &image_reader, &segmentation_reader, organs, criteria, decider)
        .with_context(|| format!("Failed to build dataset {:?}", options.dataset_path))
}

fn inspect(args: InspectArgs) -> Result<()> {
    let dataset = PatientDataset::open_read_only(&args.dataset)
        .with_context(|| format!("Failed to open dataset {:?}", args.dataset))?;

    if let Some(patient) = &args.patient {
        let manifest = dataset
            .read_manifest(patient)
            .with_context(|| format!("Failed to read patient {patient}"))?;
        println!("{}", serde_json::to_string_pretty(&manifest)?);
        return Ok(());
    }

    if let Some(manifest) = dataset.read_dataset_manifest()? {
        println!("Dataset {:?}", args.dataset);
        println!("   Version: {}", manifest.version);
        println!("   Updated: {}", manifest.updated_at);
    }

    let keys = dataset.keys()?;
    println!("   Patients: {}", keys.len());
    for key in &keys {
        match dataset.read_manifest(key) {
            Ok(manifest) => {
                println!("     - {} ({} images)", key, manifest.images.len());
                for image in &manifest.images {
                    let organs: Vec<&str> = image.masks.iter().map(|m| m.organ.as_str()).collect();
                    println!(
                        "         {} {:?} {:?} [{}]",
                        image.key,
                        image.shape,
                        image.inclusion,
                        organs.join(", ")
                    );
                }
            }
            Err(e) => println!("     - {} (unreadable: {})", key, e),
        }
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!("\nProcessing Summary:");
    println!("   Patients processed: {}", summary.processed);
    println!("   Written: {}", summary.written);
    println!("   Replaced: {}", summary.replaced);
    println!("   Skipped (already archived): {}", summary.skipped_existing);
    println!("   Skipped (no included series): {}", summary.skipped_empty);
    println!("   Warnings: {}", summary.warnings);
    println!("   Failed: {}", summary.failed.len());

    for (patient, message) in &summary.failed {
        println!("     - {}: {}", patient, message);
    }
}
