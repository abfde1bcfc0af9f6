use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use injector_agent::{EngineConfig, Patch, PatchSet, StaticContext};
use protocol::{Command, EntryPoint, ErrorKind, PatchConfig, PatchError, PatchResult};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_TARGET_MODULE: &str = "Assembly-CSharp.dll";
const LOADER_MODULE: &str = "ModLoader.dll";

#[derive(Parser, Debug)]
#[command(name = "injector-cli")]
#[command(version)]
/// Injects a call to the mod loader's entry point into a managed game module,
/// or takes it out again.
///
/// Exits with a non-zero code named after the failure kind and writes a JSON
/// error record to stderr.
struct Args {
    #[arg(short)]
    #[arg(long)]
    /// The game's managed directory, or the module to patch inside it
    managed: PathBuf,

    #[arg(short)]
    #[arg(long)]
    /// Directory holding the mod loader and the libraries it depends on
    install: PathBuf,

    #[arg(short)]
    #[arg(long)]
    /// The target method, as Namespace.Type::Method
    entry: String,

    #[arg(short = 'x')]
    #[arg(long)]
    /// Where mods are stored. Defaults to <managed>/Mods
    mods: Option<PathBuf>,

    #[arg(short = 'g')]
    #[arg(long)]
    /// Path of the extension driving the injection
    extension: Option<PathBuf>,

    #[arg(short)]
    #[arg(long)]
    /// Remove the injected call instead of adding it
    remove: bool,

    #[arg(long)]
    #[arg(default_value = "ModLoader.Bootstrap::Start")]
    /// The loader method to call, as Namespace.Type::Method
    loader_entry: String,

    #[arg(long)]
    #[arg(value_enum)]
    /// Print a single Key=Value line and exit without patching
    query: Option<Query>,

    #[arg(short)]
    #[arg(long)]
    /// JSON file with engine settings
    config: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Query {
    Injected,
    Reflection,
}

/// Splits `-m` into the managed directory and the module to patch.
fn target_paths(managed: &Path) -> (PathBuf, PathBuf) {
    if managed.extension().is_some() {
        let dir = managed.parent().map(Path::to_path_buf).unwrap_or_default();
        (dir, managed.to_path_buf())
    } else {
        (managed.to_path_buf(), managed.join(DEFAULT_TARGET_MODULE))
    }
}

fn context(args: &Args) -> StaticContext {
    let (data_path, _) = target_paths(&args.managed);
    let mut ctx = StaticContext::new(&data_path, &args.install);
    if let Some(mods) = &args.mods {
        ctx.mods_path = mods.clone();
    }
    if let Some(extension) = &args.extension {
        ctx.extension_path = extension.clone();
    }
    ctx
}

fn patch_config(args: &Args, ctx: &StaticContext) -> Result<PatchConfig, PatchError> {
    let (_, module) = target_paths(&args.managed);
    let command = if args.remove {
        Command::RemovePatch
    } else {
        Command::ApplyPatch
    };

    let source = EntryPoint::from_descriptor(args.install.join(LOADER_MODULE), &args.loader_entry)?
        .with_dependency_path(&args.install)
        .with_payload(ctx.mods_path.display().to_string());
    let target = EntryPoint::from_descriptor(module, &args.entry)?;

    let mut config = PatchConfig::new(command, source, vec![target]);
    config.extension_path = args.extension.clone();
    Ok(config)
}

/// Runs the requested operation. Query output is returned for stdout.
async fn run(args: &Args) -> Result<Option<String>, PatchError> {
    let engine = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let ctx = context(args);
    let config = patch_config(args, &ctx)?;
    let patches = PatchSet::new(&engine)?;
    debug!(?config, "patch configuration");

    if let Some(query) = args.query {
        let line = match query {
            Query::Injected => {
                let applied = patches.injector.is_applied(&config, &ctx).await;
                format!("Injected={}", applied.result)
            }
            Query::Reflection => {
                format!("ReflectionEnabled={}", patches.reflection.is_enabled(&ctx.data_path))
            }
        };
        return Ok(Some(line));
    }

    let result = if args.remove {
        patches.mod_loader.remove(&config, &ctx).await
    } else {
        patches.mod_loader.apply(&config, &ctx).await
    };
    into_outcome(result)?;
    Ok(None)
}

fn into_outcome(result: PatchResult) -> Result<(), PatchError> {
    if result.result {
        info!("{}", result.message);
        return Ok(());
    }

    let message = result.message.clone();
    Err(match result.error_kind().unwrap_or(ErrorKind::Unknown) {
        ErrorKind::InvalidEntryPoint => PatchError::InvalidEntryPoint(message),
        ErrorKind::MissingFile => PatchError::MissingFile(message),
        ErrorKind::InvalidArgument => PatchError::InvalidArgument(message),
        ErrorKind::FileOperationError => PatchError::FileOperation(message),
        ErrorKind::UnhandledCapabilityVersion => PatchError::UnhandledCapabilityVersion(message),
        ErrorKind::DownloadFailure => PatchError::DownloadFailure(message),
        ErrorKind::UnresolvedDependency => PatchError::UnresolvedDependency(message),
        ErrorKind::Timeout => PatchError::Timeout,
        ErrorKind::Unknown => PatchError::Unknown(message),
    })
}

fn error_record(err: &PatchError) -> serde_json::Value {
    let kind = err.kind();
    serde_json::json!({
        "message": err.to_string(),
        "errorCode": kind.exit_code(),
        "kind": kind.as_str(),
    })
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing();

    match run(&args).await {
        Ok(Some(line)) => {
            println!("{line}");
            ExitCode::SUCCESS
        }
        Ok(None) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", error_record(&err));
            ExitCode::from(err.kind().exit_code())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use injector_agent::module::{store, Instruction, MethodDef, Module, OpCode, TypeDef, Version};

    use super::*;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["injector-cli", "-m", "/game/Managed", "-i", "/loader", "-e", "Game.Boot::Main"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).expect("valid arguments")
    }

    #[test]
    fn parses_short_flags() {
        let args = parse(&["-x", "/mods", "-g", "/ext", "-r"]);
        assert_eq!(args.managed, PathBuf::from("/game/Managed"));
        assert_eq!(args.mods, Some(PathBuf::from("/mods")));
        assert_eq!(args.extension, Some(PathBuf::from("/ext")));
        assert!(args.remove);
        assert_eq!(args.loader_entry, "ModLoader.Bootstrap::Start");
        assert_eq!(args.query, None);
    }

    #[test]
    fn parses_query_mode() {
        assert_eq!(parse(&["--query", "injected"]).query, Some(Query::Injected));
        assert_eq!(parse(&["--query", "reflection"]).query, Some(Query::Reflection));
        assert!(Args::try_parse_from(["injector-cli", "-m", "/a", "-i", "/b", "-e", "A::B", "--query", "other"]).is_err());
    }

    #[test]
    fn managed_path_may_name_the_module() {
        assert_eq!(
            target_paths(Path::new("/game/Managed")),
            (PathBuf::from("/game/Managed"), PathBuf::from("/game/Managed/Assembly-CSharp.dll"))
        );
        assert_eq!(
            target_paths(Path::new("/game/Managed/Game.dll")),
            (PathBuf::from("/game/Managed"), PathBuf::from("/game/Managed/Game.dll"))
        );
    }

    #[test]
    fn builds_patch_config_from_flags() {
        let args = parse(&[]);
        let ctx = context(&args);
        assert_eq!(ctx.mods_path, PathBuf::from("/game/Managed/Mods"));

        let config = patch_config(&args, &ctx).expect("config");
        assert_eq!(config.command, Command::ApplyPatch);
        assert_eq!(config.source.module_path, PathBuf::from("/loader/ModLoader.dll"));
        assert_eq!(config.source.payload(), "/game/Managed/Mods");
        assert_eq!(config.targets[0].to_string(), "Game.Boot::Main");

        let bad = Args {
            entry: "NoSeparator".to_string(),
            ..parse(&[])
        };
        let err = patch_config(&bad, &ctx).expect_err("malformed entry point");
        assert_eq!(err.kind().exit_code(), 1);
    }

    #[test]
    fn failed_results_keep_their_kind() {
        let result = PatchResult::from_error(&PatchError::missing_file(Path::new("/x.dll")));
        let err = into_outcome(result).expect_err("failure");
        assert_eq!(err.kind(), ErrorKind::MissingFile);

        let record = error_record(&err);
        assert_eq!(record["errorCode"], 2);
        assert_eq!(record["kind"], "MissingFile");
        assert!(into_outcome(PatchResult::success("ok")).is_ok());
    }

    #[tokio::test]
    async fn injects_then_removes() {
        let dir = tempfile::tempdir().expect("create tempdir");
        let managed = dir.path().join("Managed");
        let install = dir.path().join("loader");
        fs::create_dir_all(&managed).expect("create managed");
        fs::create_dir_all(&install).expect("create install");

        let loader = Module::new("ModLoader", Version::new(1, 0, 0, 0)).with_type(
            TypeDef::class("ModLoader.Bootstrap")
                .with_method(MethodDef::new("Start").with_body(vec![Instruction::simple(OpCode::Ret)])),
        );
        let game = Module::new("Assembly-CSharp", Version::new(1, 0, 0, 0)).with_type(
            TypeDef::class("Game.Boot")
                .with_method(MethodDef::new("Main").with_body(vec![Instruction::simple(OpCode::Ret)])),
        );
        store::write(&loader, &install.join(LOADER_MODULE)).expect("write loader");
        store::write(&game, &managed.join(DEFAULT_TARGET_MODULE)).expect("write game");

        let argv = |extra: &[&str]| {
            let mut argv = vec![
                "injector-cli".to_string(),
                "-m".to_string(),
                managed.display().to_string(),
                "-i".to_string(),
                install.display().to_string(),
                "-e".to_string(),
                "Game.Boot::Main".to_string(),
            ];
            argv.extend(extra.iter().map(|s| s.to_string()));
            Args::try_parse_from(argv).expect("valid arguments")
        };

        assert_eq!(run(&argv(&[])).await.expect("apply"), None);
        assert!(managed.join(LOADER_MODULE).exists());
        assert_eq!(
            run(&argv(&["--query", "injected"])).await.expect("query"),
            Some("Injected=true".to_string())
        );
        assert_eq!(
            run(&argv(&["--query", "reflection"])).await.expect("query"),
            Some("ReflectionEnabled=true".to_string())
        );

        assert_eq!(run(&argv(&["-r"])).await.expect("remove"), None);
        assert_eq!(
            run(&argv(&["--query", "injected"])).await.expect("query"),
            Some("Injected=false".to_string())
        );
    }
}
