//! ai-ml-core — 缓存键计算、缓存失效、模型制品管理与预热的运维命令行工具
//!
//! Usage:
//!   ai-ml-core key <namespace> <json-args>           Print the cache key for a request
//!   ai-ml-core cache invalidate <pattern>            Delete matching cache entries
//!   ai-ml-core models list                           List stored model versions
//!   ai-ml-core models exists <name> [version]        Check a stored version
//!   ai-ml-core models download <name> [version]      Fetch a version into the local cache
//!   ai-ml-core models upload <name> <version> <dir>  Store a local model directory
//!   ai-ml-core warmup [name:type,...]                Load models and report memory usage
//!   ai-ml-core config                                Print effective settings

use ai_ml_core::cache::{CacheNamespace, KeyDeriver};
use ai_ml_core::config::{parse_warmup_list, Settings};
use ai_ml_core::context::CoreContext;
use ai_ml_core::models::LATEST;
use anyhow::{anyhow, bail, Context};
use std::path::{Path, PathBuf};

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    let (config_path, rest) = split_config_flag(&args[1..]);
    if rest.is_empty() {
        print_usage();
        std::process::exit(1);
    }

    let result = match rest[0].as_str() {
        "key" => cmd_key(config_path.as_deref(), &rest[1..]),
        "cache" => cmd_cache(config_path.as_deref(), &rest[1..]).await,
        "models" => cmd_models(config_path.as_deref(), &rest[1..]).await,
        "warmup" => cmd_warmup(config_path.as_deref(), &rest[1..]).await,
        "config" => cmd_config(config_path.as_deref()),
        "version" | "--version" | "-V" => {
            cmd_version();
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn print_usage() {
    println!(
        r#"ai-ml-core — AI/ML 服务内核运维工具

USAGE:
    ai-ml-core [--config <file>] <COMMAND> [ARGS]

COMMANDS:
    key <namespace> <json-args>          Print the cache key for a request
    cache invalidate <pattern>           Delete cache entries matching a glob pattern
    models list                          List stored model versions
    models exists <name> [version]       Check whether a version is stored
    models download <name> [version]     Fetch a version into the local model cache
    models upload <name> <version> <dir> Store a local model directory
    warmup [name:type,...]               Load models and print memory usage
    config                               Print effective settings (secrets omitted)
    version                              Show version information
    help                                 Show this help message

ENVIRONMENT:
    SERVICE_NAME                Key prefix and event source
    REDIS_URL                   Result cache backend
    MINIO_ENDPOINT              Object store endpoint (host:port or URL)
    MINIO_ACCESS_KEY            Object store access key
    MINIO_SECRET_KEY            Object store secret key
    MINIO_BUCKET                Model bucket
    MODEL_CACHE_DIR             Local model cache directory
    WARMUP_MODELS               Default models for `warmup`
    RUST_LOG                    Log filter (overrides LOG_LEVEL)"#
    );
}

fn cmd_version() {
    println!("ai-ml-core {}", env!("CARGO_PKG_VERSION"));
}

fn split_config_flag(args: &[String]) -> (Option<PathBuf>, Vec<String>) {
    let mut config = None;
    let mut rest = Vec::with_capacity(args.len());
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            config = iter.next().map(PathBuf::from);
        } else {
            rest.push(arg.clone());
        }
    }
    (config, rest)
}

fn load_settings(config: Option<&Path>) -> anyhow::Result<Settings> {
    let settings = Settings::load(config).context("loading settings")?;
    ai_ml_core::logging::init(&settings);
    Ok(settings)
}

async fn start(config: Option<&Path>) -> anyhow::Result<CoreContext> {
    let core = CoreContext::from_settings(load_settings(config)?)?;
    core.start().await?;
    Ok(core)
}

fn cmd_key(config: Option<&Path>, args: &[String]) -> anyhow::Result<()> {
    let [namespace, raw] = args else {
        bail!("usage: key <namespace> <json-args>");
    };
    let settings = load_settings(config)?;
    let value: serde_json::Value =
        serde_json::from_str(raw).with_context(|| format!("invalid JSON arguments: {raw}"))?;
    let deriver = KeyDeriver::new(settings.service_name.clone())
        .with_hash_width(settings.cache.hash_width);
    let key = deriver.derive(CacheNamespace::custom(namespace.as_str()).as_str(), &value)?;
    println!("{key}");
    Ok(())
}

async fn cmd_cache(config: Option<&Path>, args: &[String]) -> anyhow::Result<()> {
    match args {
        [sub, pattern] if sub == "invalidate" => {
            let core = start(config).await?;
            if !core.cache().is_connected() {
                core.shutdown().await;
                bail!("result cache is not reachable");
            }
            let removed = core.cache().invalidate_pattern(pattern).await;
            println!("Invalidated {removed} entries matching {pattern}");
            core.shutdown().await;
            Ok(())
        }
        _ => bail!("usage: cache invalidate <pattern>"),
    }
}

async fn cmd_models(config: Option<&Path>, args: &[String]) -> anyhow::Result<()> {
    let sub = args.first().ok_or_else(|| anyhow!("usage: models <list|exists|download|upload>"))?;
    let version_arg = |i: usize| args.get(i).map(String::as_str).unwrap_or(LATEST);
    let core = start(config).await?;
    let store = core.store().clone();

    let result = match sub.as_str() {
        "list" => {
            let artifacts = store.list().await;
            if artifacts.is_empty() {
                println!("No models in bucket {}", store.bucket());
            }
            for a in &artifacts {
                let modified = a
                    .last_modified
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                println!("{:<48} {:<16} {:>12}  {}", a.name, a.version, a.size_bytes, modified);
            }
            Ok(())
        }
        "exists" => match args.get(1) {
            Some(name) => {
                let version = version_arg(2);
                let found = store.exists(name, version).await;
                println!("{name}@{version}: {}", if found { "present" } else { "absent" });
                Ok(())
            }
            None => Err(anyhow!("usage: models exists <name> [version]")),
        },
        "download" => match args.get(1) {
            Some(name) => {
                let version = version_arg(2);
                match store.download(name, version).await {
                    Some(path) => {
                        println!("Downloaded {name}@{version} to {}", path.display());
                        Ok(())
                    }
                    None => Err(anyhow!("{name}@{version} is not available in the artifact store")),
                }
            }
            None => Err(anyhow!("usage: models download <name> [version]")),
        },
        "upload" => match args {
            [_, name, version, dir] => {
                if store.upload(name, version, Path::new(dir)).await {
                    println!("Uploaded {dir} as {name}@{version}");
                    Ok(())
                } else {
                    Err(anyhow!("upload of {name}@{version} failed"))
                }
            }
            _ => Err(anyhow!("usage: models upload <name> <version> <dir>")),
        },
        other => Err(anyhow!("unknown models subcommand: {other}")),
    };

    core.shutdown().await;
    result
}

async fn cmd_warmup(config: Option<&Path>, args: &[String]) -> anyhow::Result<()> {
    let mut settings = load_settings(config)?;
    if let Some(list) = args.first() {
        settings.models.warmup = parse_warmup_list(list);
    }
    if settings.models.warmup.is_empty() {
        bail!("no models to warm up (pass name:type,... or set WARMUP_MODELS)");
    }
    let requested = settings.models.warmup.len();
    let core = CoreContext::from_settings(settings)?;
    let loaded = core.start().await?;

    println!("Loaded {loaded}/{requested} models");
    let usage = core.models().get_memory_usage();
    println!("{}", serde_json::to_string_pretty(&usage)?);

    core.shutdown().await;
    if loaded < requested {
        bail!("{} models failed to load", requested - loaded);
    }
    Ok(())
}

fn cmd_config(config: Option<&Path>) -> anyhow::Result<()> {
    let settings = load_settings(config)?;
    print!("{}", serde_yaml::to_string(&settings)?);
    Ok(())
}
