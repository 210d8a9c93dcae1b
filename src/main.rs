use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use bimgltf::export::builder::{ExportArtifacts, SceneGraphBuilder};
use bimgltf::export::grouping::GroupingStrategy;
use bimgltf::export::job::{
    DisplayStyle, ExportJob, ExportOptions, JsonFileSink, publish_structure,
};
use bimgltf::export::writer;
use bimgltf::traversal::{ExportContext, LoadedScene, SceneDump, replay};
use clap::{Parser, Subcommand};
use rootcause::prelude::*;
use tracing::{error, info};

/// Compile recorded BIM traversals into glTF assets
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Export a traversal dump as .glb or .gltf
    Convert(ConvertArgs),
    /// Print element counts of an existing .glb or .gltf
    Inspect {
        file: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct ConvertArgs {
    /// Traversal dump (JSON)
    input: PathBuf,

    /// Output file. The extension selects the container.
    #[clap(short, long)]
    output: PathBuf,

    /// Group elements into a level / category / family / type tree
    #[clap(long)]
    structured: bool,

    /// Key materials by name (structured exports only)
    #[clap(long)]
    realistic: bool,

    /// JSON file with export options. Overrides --structured defaults.
    #[clap(long)]
    options: Option<PathBuf>,

    /// Where to write the BOM tree JSON (structured exports only)
    #[clap(long)]
    bom_tree: Option<PathBuf>,

    /// Where to write the scene tree JSON
    #[clap(long)]
    scene_tree: Option<PathBuf>,

    /// Directory that receives `<file-id>.structure.json`
    #[clap(long)]
    structure_dir: Option<PathBuf>,

    #[clap(long, default_value_t = 0)]
    file_id: i64,
}

fn load_options(args: &ConvertArgs) -> Result<ExportOptions, Report> {
    if let Some(path) = &args.options {
        let text = std::fs::read_to_string(path)
            .context_with(|| format!("Failed to read options file {}", path.display()))?;
        let options = serde_json::from_str(&text).context("Failed to parse export options")?;
        return Ok(options);
    }

    Ok(if args.structured {
        let style = if args.realistic {
            DisplayStyle::Realistic
        } else {
            DisplayStyle::Colour
        };
        ExportOptions::structured(style)
    } else {
        ExportOptions::default()
    })
}

fn run<G: GroupingStrategy>(
    mut builder: SceneGraphBuilder<G>,
    scene: &LoadedScene,
) -> Result<ExportArtifacts<G>, Report> {
    let stats = replay(&mut builder, scene)?;
    if stats.canceled {
        bail!("Export canceled");
    }
    info!(
        "replayed {} callbacks ({} skipped)",
        stats.delivered, stats.skipped
    );
    Ok(builder.finish()?)
}

fn write_scene_tree<G>(artifacts: &ExportArtifacts<G>, path: Option<&Path>) -> Result<(), Report> {
    let Some(path) = path else {
        return Ok(());
    };
    let text = artifacts
        .scene_tree
        .to_json_pretty()
        .context("Failed to serialize scene tree")?;
    std::fs::write(path, text)
        .context_with(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

fn convert(args: ConvertArgs) -> Result<(), Report> {
    let file = File::open(&args.input)
        .context_with(|| format!("Failed to open {}", args.input.display()))?;
    let scene = SceneDump::from_reader(BufReader::new(file))?.load()?;
    let options = load_options(&args)?;
    let job = ExportJob::new(args.file_id, &args.output, options);
    let main_document = Arc::clone(&scene.main);

    if args.structured {
        let artifacts = run(SceneGraphBuilder::structured(job, main_document), &scene)?;
        if let Some(path) = &args.bom_tree {
            let text = artifacts
                .grouping
                .to_json_string()
                .context("Failed to serialize BOM tree")?;
            std::fs::write(path, text)
                .context_with(|| format!("Failed to write {}", path.display()))?;
        }
        if let Some(dir) = &args.structure_dir {
            let mut sink = JsonFileSink::new(dir);
            publish_structure(&mut sink, &artifacts.job, artifacts.grouping.records());
        }
        write_scene_tree(&artifacts, args.scene_tree.as_deref())?;
        print_summary(&artifacts.output_path, artifacts.summary());
    } else {
        let artifacts = run(SceneGraphBuilder::flat(job, main_document), &scene)?;
        write_scene_tree(&artifacts, args.scene_tree.as_deref())?;
        print_summary(&artifacts.output_path, artifacts.summary());
    }

    Ok(())
}

fn inspect(path: &Path) -> Result<(), Report> {
    let summary = writer::inspect(path)?;
    print_summary(path, summary);
    Ok(())
}

fn print_summary(path: &Path, summary: writer::AssetSummary) {
    println!("{}", path.display());
    println!("  nodes:        {}", summary.nodes);
    println!("  meshes:       {}", summary.meshes);
    println!("  primitives:   {}", summary.primitives);
    println!("  accessors:    {}", summary.accessors);
    println!("  buffer views: {}", summary.buffer_views);
    println!("  materials:    {}", summary.materials);
    println!("  images:       {}", summary.images);
    println!("  buffer bytes: {}", summary.bin_len);
}

fn main() -> Result<(), Report> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let started = Instant::now();

    let result = match args.command {
        Command::Convert(convert_args) => convert(convert_args),
        Command::Inspect { file } => inspect(&file),
    };

    match &result {
        Ok(()) => info!("done in {:.2?}", started.elapsed()),
        Err(_) => error!("failed after {:.2?}", started.elapsed()),
    }
    result
}
