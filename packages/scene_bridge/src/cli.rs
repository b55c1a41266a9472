use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::layer::Layer;
use crate::session::{run_session, SessionSpec};
use crate::snapshot::SceneSnapshot;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a session file headlessly
    Run {
        /// Session JSON (scene, extensions, actions)
        #[arg(long)]
        session: PathBuf,

        /// Where to write the session report
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Print the ids of the layers visible in a scene
    Inspect {
        /// Scene JSON (root layer)
        #[arg(long)]
        scene: PathBuf,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { session, report } => run_command(session, report),
        Commands::Inspect { scene } => inspect_command(scene),
    }
}

fn run_command(session: PathBuf, report_path: Option<PathBuf>) -> Result<()> {
    let (spec, base_dir) = SessionSpec::load(&session)?;
    log::info!(
        "Running session {} ({} extension(s), {} action(s))",
        session.display(),
        spec.extensions.len(),
        spec.actions.len()
    );

    let report = run_session(spec, &base_dir)?;

    for ext in &report.extensions {
        log::info!(
            "{} [{}] runs={:?} logs={} diagnostics={} sha256={}",
            ext.instance_id,
            ext.kind,
            ext.run_count,
            ext.logs.len(),
            ext.diagnostics.len(),
            &ext.source_sha256[..12]
        );
        for diagnostic in &ext.diagnostics {
            log::warn!("{}: {}", ext.instance_id, diagnostic.message);
        }
    }
    for (name, count) in &report.command_counts {
        log::info!("{name}: {count}");
    }
    println!("Visible layers: {}", report.visible_layers.join(", "));

    if let Some(path) = report_path {
        report.save(&path)?;
        println!("Report written to {}", path.display());
    }
    Ok(())
}

fn inspect_command(scene: PathBuf) -> Result<()> {
    let text = std::fs::read_to_string(&scene)
        .with_context(|| format!("Failed to read scene {}", scene.display()))?;
    let root: Layer = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse scene {}", scene.display()))?;
    if let Some(dup) = root.first_duplicate_id() {
        anyhow::bail!("Duplicate layer id `{dup}` in {}", scene.display());
    }

    let snapshot = SceneSnapshot::build(std::rc::Rc::new(root));
    for id in snapshot.flattened_ids() {
        println!("{id}");
    }
    log::info!("{} visible layer(s)", snapshot.len());
    Ok(())
}
