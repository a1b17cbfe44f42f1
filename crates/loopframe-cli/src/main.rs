use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use loopframe_contracts::assets::AssetLoader;
use loopframe_contracts::events::{EventPayload, EventWriter};
use loopframe_contracts::plan::ScenePlan;
use loopframe_contracts::runs::clips::{build_loop_clips, write_loop_clips, CLIP_INSTRUCTIONS_FILE};
use loopframe_contracts::runs::keyframes::KEYFRAME_MANIFEST_FILE;
use loopframe_contracts::runs::summary::{write_summary, SUMMARY_FILE};
use loopframe_engine::variety::{VarietyBand, MAX_VARIETY};
use loopframe_engine::{
    default_service_registry, EngineSettings, EventLogObserver, GeminiPlanner, ImageService,
    ImageServiceRegistry, KeyframeSynthesizer, ReferencePosePool, ScenePlanner, SizePolicy,
    SynthesisObserver, SynthesisOptions, SynthesisOutcome,
};
use serde_json::{json, Map, Value};

mod report;

pub(crate) const PLAN_FILE: &str = "plan.json";
const EVENTS_FILE: &str = "events.jsonl";

#[derive(Debug, Parser)]
#[command(name = "loopframe", version, about = "Looping dance keyframe generator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Ask the planner for a four-scene plan and write it as JSON.
    Plan(PlanArgs),
    /// Generate keyframes for an existing plan file.
    Keyframes(KeyframesArgs),
    /// Plan and generate keyframes in one go.
    Run(RunArgs),
    /// Generate keyframes for several plan files, cycling reference poses.
    Batch(BatchArgs),
    /// Render an HTML contact sheet for a finished run directory.
    Export(ExportArgs),
}

#[derive(Debug, Args)]
struct InputArgs {
    #[arg(long, conflicts_with = "prompt_file")]
    prompt: Option<String>,
    #[arg(long)]
    prompt_file: Option<PathBuf>,
    #[arg(long)]
    text_model: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct SynthArgs {
    #[arg(long, default_value = "gemini")]
    provider: String,
    #[arg(long)]
    image_model: Option<String>,
    #[arg(long)]
    variety: Option<u8>,
    #[arg(long)]
    pose_index: Option<usize>,
    #[arg(long)]
    no_reference: bool,
    #[arg(long)]
    prompts_dir: Option<PathBuf>,
    #[arg(long)]
    aspect_ratio: Option<String>,
    #[arg(long, value_enum, default_value_t = SizePolicyArg::Warn)]
    size_policy: SizePolicyArg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SizePolicyArg {
    Warn,
    Reject,
}

impl From<SizePolicyArg> for SizePolicy {
    fn from(value: SizePolicyArg) -> Self {
        match value {
            SizePolicyArg::Warn => SizePolicy::Warn,
            SizePolicyArg::Reject => SizePolicy::Reject,
        }
    }
}

#[derive(Debug, Parser)]
struct PlanArgs {
    #[command(flatten)]
    input: InputArgs,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    prompts_dir: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct KeyframesArgs {
    #[arg(long)]
    plan: PathBuf,
    #[arg(long)]
    out: Option<PathBuf>,
    #[command(flatten)]
    synth: SynthArgs,
}

#[derive(Debug, Parser)]
struct RunArgs {
    #[command(flatten)]
    input: InputArgs,
    #[arg(long)]
    out_root: Option<PathBuf>,
    #[command(flatten)]
    synth: SynthArgs,
}

#[derive(Debug, Parser)]
struct BatchArgs {
    #[arg(long = "plan", required = true, num_args = 1..)]
    plans: Vec<PathBuf>,
    #[arg(long)]
    out_root: Option<PathBuf>,
    /// Reference pose index used by the first plan; later plans count up.
    #[arg(long, default_value_t = 0)]
    start_index: usize,
    #[command(flatten)]
    synth: SynthArgs,
}

#[derive(Debug, Parser)]
struct ExportArgs {
    #[arg(long)]
    run: PathBuf,
    #[arg(long)]
    out: Option<PathBuf>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("loopframe error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let settings = EngineSettings::from_env();
    match cli.command {
        Command::Plan(args) => run_plan(&settings, args),
        Command::Keyframes(args) => run_keyframes(&settings, args),
        Command::Run(args) => run_full(&settings, args),
        Command::Batch(args) => run_batch(&settings, args),
        Command::Export(args) => run_export(args),
    }
}

fn run_plan(settings: &EngineSettings, args: PlanArgs) -> Result<i32> {
    let loader = AssetLoader::new(
        args.prompts_dir
            .clone()
            .unwrap_or_else(|| settings.prompts_dir.clone()),
    );
    let plan = request_plan(settings, &loader, &args.input)?;
    plan.write(&args.out)?;
    println!(
        "Plan '{}' with {} scenes written to {}",
        plan.title,
        plan.scene_count(),
        args.out.display()
    );
    Ok(0)
}

fn run_keyframes(settings: &EngineSettings, args: KeyframesArgs) -> Result<i32> {
    let plan = ScenePlan::load(&args.plan)?;
    let context = SynthContext::new(settings, &args.synth)?;
    let run_dir = match args.out {
        Some(dir) => dir,
        None => new_run_dir(&settings.output_dir, &plan)?,
    };
    let outcome = context.synthesize(&plan, &run_dir, None)?;
    print_outcome(&run_dir, &outcome);
    Ok(exit_code(&outcome))
}

fn run_full(settings: &EngineSettings, args: RunArgs) -> Result<i32> {
    let context = SynthContext::new(settings, &args.synth)?;
    println!("Planning scenes with {}...", text_model(settings, &args.input));
    let plan = request_plan(settings, &context.loader, &args.input)?;
    println!("Plan '{}' ({} scenes)", plan.title, plan.scene_count());

    let out_root = args
        .out_root
        .clone()
        .unwrap_or_else(|| settings.output_dir.clone());
    let run_dir = new_run_dir(&out_root, &plan)?;
    let outcome = context.synthesize(&plan, &run_dir, None)?;
    print_outcome(&run_dir, &outcome);
    Ok(exit_code(&outcome))
}

fn run_batch(settings: &EngineSettings, args: BatchArgs) -> Result<i32> {
    let context = SynthContext::new(settings, &args.synth)?;
    let out_root = args
        .out_root
        .clone()
        .unwrap_or_else(|| settings.output_dir.clone());

    let mut failures = 0usize;
    for (idx, plan_path) in args.plans.iter().enumerate() {
        println!(
            "[{}/{}] {}",
            idx + 1,
            args.plans.len(),
            plan_path.display()
        );
        let plan = match ScenePlan::load(plan_path) {
            Ok(plan) => plan,
            Err(err) => {
                eprintln!("  skipped: {err:#}");
                failures += 1;
                continue;
            }
        };
        let result = new_run_dir(&out_root, &plan)
            .and_then(|run_dir| {
                context
                    .synthesize(&plan, &run_dir, Some(args.start_index + idx))
                    .map(|outcome| (run_dir, outcome))
            });
        match result {
            Ok((run_dir, outcome)) => {
                print_outcome(&run_dir, &outcome);
                if !outcome.is_complete() {
                    failures += 1;
                }
            }
            Err(err) => {
                eprintln!("  failed: {err:#}");
                failures += 1;
            }
        }
    }

    println!(
        "Batch finished: {} succeeded, {failures} failed",
        args.plans.len() - failures
    );
    Ok(if failures == 0 { 0 } else { 1 })
}

fn run_export(args: ExportArgs) -> Result<i32> {
    let out = args
        .out
        .clone()
        .unwrap_or_else(|| args.run.join(report::CONTACT_SHEET_FILE));
    let cards = report::export_html(&args.run, &out)?;
    println!("Exported {cards} keyframes to {}", out.display());
    Ok(0)
}

/// Everything a synthesis run needs that does not change between plans.
struct SynthContext {
    loader: AssetLoader,
    poses: ReferencePosePool,
    options: SynthesisOptions,
    registry: ImageServiceRegistry,
    provider: String,
}

impl SynthContext {
    fn new(settings: &EngineSettings, args: &SynthArgs) -> Result<Self> {
        let registry = default_service_registry(settings);
        if registry.get(&args.provider).is_none() {
            bail!(
                "unknown provider '{}' (available: {})",
                args.provider,
                registry.names().join(", ")
            );
        }
        if args.provider == "gemini" && settings.api_key.is_none() {
            bail!("GEMINI_API_KEY or GOOGLE_API_KEY not set (use --provider dryrun to run offline)");
        }

        let loader = AssetLoader::new(
            args.prompts_dir
                .clone()
                .unwrap_or_else(|| settings.prompts_dir.clone()),
        );
        let poses = if args.no_reference {
            ReferencePosePool::empty()
        } else {
            ReferencePosePool::new(loader.load_reference_poses()?)
        };

        let mut options = SynthesisOptions::from_settings(settings);
        if let Some(model) = args.image_model.as_ref() {
            options.model = model.clone();
        }
        if let Some(variety) = args.variety {
            options.variety = variety.min(MAX_VARIETY);
        }
        if let Some(ratio) = args.aspect_ratio.as_ref() {
            options.aspect_ratio = Some(ratio.clone());
        }
        options.reference_pose_index = if args.no_reference {
            None
        } else {
            Some(args.pose_index.unwrap_or(0))
        };
        options.size_policy = args.size_policy.into();

        Ok(Self {
            loader,
            poses,
            options,
            registry,
            provider: args.provider.clone(),
        })
    }

    fn service(&self) -> Result<&dyn ImageService> {
        self.registry
            .get(&self.provider)
            .with_context(|| format!("provider '{}' is not registered", self.provider))
    }

    /// Runs one plan into `run_dir` and writes the run artifacts. A failed
    /// synthesis is still `Ok`; only artifact I/O errors are returned.
    fn synthesize(
        &self,
        plan: &ScenePlan,
        run_dir: &Path,
        pose_index: Option<usize>,
    ) -> Result<SynthesisOutcome> {
        let service = self.service()?;
        fs::create_dir_all(run_dir)
            .with_context(|| format!("failed to create {}", run_dir.display()))?;
        plan.write(&run_dir.join(PLAN_FILE))?;

        let mut options = self.options.clone();
        if let (Some(index), Some(_)) = (pose_index, options.reference_pose_index) {
            options.reference_pose_index = Some(index);
        }

        let run_id = uuid::Uuid::new_v4().to_string();
        let writer = EventWriter::new(run_dir.join(EVENTS_FILE), run_id.as_str());
        writer.emit(
            "run_started",
            map_object(json!({
                "provider": service.name(),
                "model": options.model,
                "plan_title": plan.title,
                "scenes": plan.scene_count(),
                "variety": options.variety,
                "variety_band": VarietyBand::for_level(options.variety).as_str(),
                "reference_pose_slot": options
                    .reference_pose_index
                    .and_then(|index| self.poses.slot(index)),
            })),
        )?;

        let observer = EventLogObserver::new(writer);
        let mut outcome = KeyframeSynthesizer::new(service, &self.loader, options.clone())
            .with_poses(self.poses.clone())
            .with_observer(&observer)
            .run(plan, run_dir);
        // The closing journal event is written after the outcome is built.
        if let Some(message) = observer.journal_error() {
            if !outcome.warnings.contains(&message) {
                outcome.warnings.push(message);
            }
        }

        write_run_artifacts(run_dir, &run_id, plan, &outcome, service.name(), &options.model)?;
        Ok(outcome)
    }
}

fn write_run_artifacts(
    run_dir: &Path,
    run_id: &str,
    plan: &ScenePlan,
    outcome: &SynthesisOutcome,
    provider: &str,
    model: &str,
) -> Result<()> {
    outcome
        .assets
        .write_manifest(&run_dir.join(KEYFRAME_MANIFEST_FILE))?;
    if outcome.is_complete() {
        let clips = build_loop_clips(plan, &outcome.assets)?;
        write_loop_clips(&run_dir.join(CLIP_INSTRUCTIONS_FILE), &clips)?;
    }
    let extra = map_object(json!({
        "provider": provider,
        "model": model,
        "plan_title": plan.title,
        "service_calls": outcome.service_calls,
    }));
    write_summary(
        &run_dir.join(SUMMARY_FILE),
        &outcome.to_summary(run_id, plan.scene_count()),
        Some(&extra),
    )?;
    Ok(())
}

fn request_plan(settings: &EngineSettings, loader: &AssetLoader, input: &InputArgs) -> Result<ScenePlan> {
    let text = read_input(input)?;
    let mut settings = settings.clone();
    settings.text_model = text_model(&settings, input);
    let planner = GeminiPlanner::from_settings(&settings, loader)?;
    planner.plan(&text)
}

fn text_model(settings: &EngineSettings, input: &InputArgs) -> String {
    input
        .text_model
        .clone()
        .unwrap_or_else(|| settings.text_model.clone())
}

fn read_input(input: &InputArgs) -> Result<String> {
    let text = match (input.prompt.as_ref(), input.prompt_file.as_ref()) {
        (Some(prompt), _) => prompt.clone(),
        (None, Some(path)) => fs::read_to_string(path)
            .with_context(|| format!("failed reading {}", path.display()))?,
        (None, None) => bail!("either --prompt or --prompt-file is required"),
    };
    let trimmed = text.trim();
    if trimmed.is_empty() {
        bail!("plan prompt is empty");
    }
    Ok(trimmed.to_string())
}

/// `<root>/<title-slug>_<UTC timestamp>`, suffixed when the name is taken.
fn new_run_dir(root: &Path, plan: &ScenePlan) -> Result<PathBuf> {
    fs::create_dir_all(root).with_context(|| format!("failed to create {}", root.display()))?;
    let stamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
    let base = format!("{}_{stamp}", plan.title_slug());
    let mut candidate = root.join(&base);
    let mut suffix = 2;
    loop {
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                candidate = root.join(format!("{base}_{suffix}"));
                suffix += 1;
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to create {}", candidate.display()))
            }
        }
    }
}

fn print_outcome(run_dir: &Path, outcome: &SynthesisOutcome) {
    for (label, path) in outcome.assets.iter() {
        println!("  keyframe {label}: {}", path.display());
    }
    for warning in &outcome.warnings {
        println!("  warning: {warning}");
    }
    match outcome.error.as_ref() {
        Some(err) => eprintln!(
            "  {} after {} keyframes: {err}",
            outcome.status(),
            outcome.assets.len()
        ),
        None => println!("  complete: {}", run_dir.display()),
    }
}

fn exit_code(outcome: &SynthesisOutcome) -> i32 {
    if outcome.is_complete() {
        0
    } else {
        1
    }
}

fn map_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => EventPayload::new(),
    }
}
