use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use sticker_contracts::credentials::JsonFileStore;
use sticker_contracts::errors::StickerError;
use sticker_contracts::events::EventWriter;
use sticker_contracts::stickers::InputImage;
use sticker_engine::matting::matte_png;
use sticker_engine::{DryrunModel, EngineConfig, GeminiClient, GenerativeModel, StickerEngine};
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Exit code when the command needs an API key from the user.
const EXIT_CREDENTIAL: i32 = 2;

#[derive(Debug, Parser)]
#[command(name = "sticker-rs", version, about = "Turn prompts and photos into stickers")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct GlobalArgs {
    /// Settings file holding the user key and the device quota.
    #[arg(long, global = true)]
    state: Option<PathBuf>,
    /// Append run events to this JSONL file.
    #[arg(long, global = true)]
    events: Option<PathBuf>,
    /// Use the offline model instead of the Gemini API.
    #[arg(long, global = true)]
    dryrun: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a sticker from a prompt and/or a photo.
    Generate(GenerateArgs),
    /// Apply an instruction to an existing sticker.
    Edit(EditArgs),
    /// Name the main subject of an image.
    Detect(ImageArgs),
    Analyze(AnalyzeArgs),
    /// Strip the black background from an image (offline).
    Matte(ConvertArgs),
    /// Re-encode a sticker as a 512x512 WebP for chat apps.
    Export(ConvertArgs),
    Preprocess(ConvertArgs),
    /// Validate and store your own API key.
    SetKey(SetKeyArgs),
    ClearKey,
    /// Show free generations left and key state.
    Status,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long, default_value = "")]
    prompt: String,
    #[arg(long)]
    photo: Option<PathBuf>,
    #[arg(long)]
    caption: Option<String>,
    #[arg(long)]
    style: Option<String>,
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Parser)]
struct EditArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    instruction: String,
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Parser)]
struct ImageArgs {
    #[arg(long)]
    image: PathBuf,
}

#[derive(Debug, Parser)]
struct AnalyzeArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    prompt: String,
}

#[derive(Debug, Parser)]
struct ConvertArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Parser)]
struct SetKeyArgs {
    secret: String,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("sticker-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    init_tracing();
    let cli = Cli::parse();

    // Purely local commands never touch credentials or the network.
    if let Command::Matte(args) = &cli.command {
        return run_matte(args);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    let store = JsonFileStore::new(resolve_state_path(cli.global.state.as_deref())?);
    let mut config = EngineConfig::from_env();
    let events = cli.global.events.clone().map(EventWriter::for_new_run);

    if cli.global.dryrun {
        if config.device_key.is_none() {
            config.device_key = Some("dryrun".to_string());
        }
        let engine = build_engine(DryrunModel::default(), store, config, events);
        runtime.block_on(dispatch(&engine, cli.command))
    } else {
        let engine = build_engine(GeminiClient::from_env(), store, config, events);
        runtime.block_on(dispatch(&engine, cli.command))
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("STICKER_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn resolve_state_path(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    let base = dirs::data_dir().context("cannot resolve a data directory; pass --state")?;
    Ok(base.join("sticker-rs").join("state.json"))
}

fn build_engine<M: GenerativeModel>(
    model: M,
    store: JsonFileStore,
    config: EngineConfig,
    events: Option<EventWriter>,
) -> StickerEngine<M, JsonFileStore> {
    let engine = StickerEngine::new(model, store, config);
    match events {
        Some(events) => engine.with_events(events),
        None => engine,
    }
}

async fn dispatch<M: GenerativeModel>(
    engine: &StickerEngine<M, JsonFileStore>,
    command: Command,
) -> Result<i32> {
    debug!(model = engine.orchestrator().model().name(), "dispatching command");
    let outcome = match command {
        Command::Generate(args) => run_generate(engine, args).await,
        Command::Edit(args) => run_edit(engine, args).await,
        Command::Detect(args) => run_describe(engine, &args.image, None).await,
        Command::Analyze(args) => run_describe(engine, &args.image, Some(&args.prompt)).await,
        Command::Export(args) => run_export(engine, &args).await,
        Command::Preprocess(args) => run_preprocess(engine, &args).await,
        Command::SetKey(args) => {
            if engine.set_user_key(&args.secret).await? {
                println!("API key saved.");
                return Ok(0);
            }
            eprintln!("API key was rejected by the service; nothing saved.");
            return Ok(EXIT_CREDENTIAL);
        }
        Command::ClearKey => {
            engine.clear_user_key()?;
            println!("API key cleared.");
            Ok(())
        }
        Command::Status => {
            let status = engine.quota_status()?;
            println!("Free generations used: {}/{}", status.used, status.limit);
            println!("Free generations left: {}", status.remaining());
            println!("User key: {}", if status.has_user_key { "set" } else { "not set" });
            println!(
                "Device key: {}",
                if status.has_device_key { "configured" } else { "not configured" }
            );
            Ok(())
        }
        Command::Matte(args) => return run_matte(&args),
    };

    match outcome {
        Ok(()) => Ok(0),
        Err(err)
            if err
                .downcast_ref::<StickerError>()
                .is_some_and(StickerError::needs_credential) =>
        {
            eprintln!("{err}");
            eprintln!("Run `sticker-rs set-key <API_KEY>` to continue.");
            Ok(EXIT_CREDENTIAL)
        }
        Err(err) => Err(err),
    }
}

async fn run_generate<M: GenerativeModel>(
    engine: &StickerEngine<M, JsonFileStore>,
    args: GenerateArgs,
) -> Result<()> {
    let photo = match args.photo.as_deref() {
        Some(path) => Some(read_bytes(path)?),
        None => None,
    };
    let sticker = engine
        .generate_sticker(
            photo,
            &args.prompt,
            args.caption.as_deref(),
            args.style.as_deref(),
        )
        .await?;
    write_bytes(&args.out, &sticker.image)?;
    println!("Sticker {} written to {}", sticker.id, args.out.display());
    Ok(())
}

async fn run_edit<M: GenerativeModel>(
    engine: &StickerEngine<M, JsonFileStore>,
    args: EditArgs,
) -> Result<()> {
    let current = read_image(&args.image)?;
    let sticker = engine.edit_sticker(&current, &args.instruction).await?;
    write_bytes(&args.out, &sticker.image)?;
    println!("Sticker {} written to {}", sticker.id, args.out.display());
    Ok(())
}

/// Subject detection without a prompt, free-form analysis with one.
async fn run_describe<M: GenerativeModel>(
    engine: &StickerEngine<M, JsonFileStore>,
    path: &Path,
    prompt: Option<&str>,
) -> Result<()> {
    let image = read_image(path)?;
    let text = match prompt {
        Some(prompt) => engine.analyze_image(&image, prompt).await?,
        None => engine.detect_subject(&image).await?,
    };
    println!("{text}");
    Ok(())
}

async fn run_export<M: GenerativeModel>(
    engine: &StickerEngine<M, JsonFileStore>,
    args: &ConvertArgs,
) -> Result<()> {
    let blob = engine.export_for_sharing(read_bytes(&args.image)?).await?;
    write_bytes(&args.out, &blob.bytes)?;
    println!(
        "Exported {} ({} bytes, quality {:.1})",
        args.out.display(),
        blob.len(),
        blob.quality
    );
    Ok(())
}

async fn run_preprocess<M: GenerativeModel>(
    engine: &StickerEngine<M, JsonFileStore>,
    args: &ConvertArgs,
) -> Result<()> {
    let image = engine.preprocess_image(read_bytes(&args.image)?).await?;
    write_bytes(&args.out, &image.bytes)?;
    println!("Preprocessed {} ({})", args.out.display(), image.mime_type);
    Ok(())
}

fn run_matte(args: &ConvertArgs) -> Result<i32> {
    let bytes = read_bytes(&args.image)?;
    let matted = matte_png(&bytes);
    write_bytes(&args.out, &matted)?;
    println!("Matted {}", args.out.display());
    Ok(0)
}

fn read_bytes(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("failed reading {}", path.display()))
}

fn read_image(path: &Path) -> Result<InputImage> {
    let Some(mime_type) = mime_for_path(path) else {
        bail!("unsupported image type: {}", path.display());
    };
    Ok(InputImage::new(read_bytes(path)?, mime_type))
}

fn write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed creating {}", parent.display()))?;
    }
    fs::write(path, bytes).with_context(|| format!("failed writing {}", path.display()))
}

fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "heic" => Some("image/heic"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use clap::Parser;

    use super::{mime_for_path, resolve_state_path, Cli, Command};

    #[test]
    fn parses_generate_with_global_flags_after_subcommand() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "sticker-rs",
            "generate",
            "--prompt",
            "a cat",
            "--style",
            "anime",
            "--out",
            "cat.png",
            "--dryrun",
            "--state",
            "/tmp/state.json",
        ])?;
        assert!(cli.global.dryrun);
        assert_eq!(cli.global.state.as_deref(), Some(Path::new("/tmp/state.json")));
        match cli.command {
            Command::Generate(args) => {
                assert_eq!(args.prompt, "a cat");
                assert_eq!(args.style.as_deref(), Some("anime"));
                assert!(args.photo.is_none());
            }
            other => anyhow::bail!("unexpected command: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn set_key_takes_positional_secret() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from(["sticker-rs", "set-key", "abc123"])?;
        assert!(matches!(cli.command, Command::SetKey(args) if args.secret == "abc123"));
        Ok(())
    }

    #[test]
    fn explicit_state_path_wins() -> anyhow::Result<()> {
        let path = resolve_state_path(Some(Path::new("custom.json")))?;
        assert_eq!(path, Path::new("custom.json"));
        Ok(())
    }

    #[test]
    fn mime_is_derived_from_extension() {
        assert_eq!(mime_for_path(Path::new("a/B.JPG")), Some("image/jpeg"));
        assert_eq!(mime_for_path(Path::new("sticker.png")), Some("image/png"));
        assert_eq!(mime_for_path(Path::new("notes.txt")), None);
        assert_eq!(mime_for_path(Path::new("noext")), None);
    }
}
