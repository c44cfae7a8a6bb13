//! Attacheable RS command line
//!
//! Inspect and maintain an attachment storage tree: compute paths, probe
//! files, generate or purge variants, and resolve encoded lookup paths.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use att_attachments::{
    storage, AttachmentBackends, AttachmentService, AttachmentSpecification, IdentifyProbe,
    ImageProbe, Partitioner, ProbeOutcome, SpecificationDef, VariantKey,
};
use att_core::{AppConfig, Id, LoggingConfig};

mod disk;

use disk::DiskStore;

const DEFAULT_FILTER: &str = "info,att_attachments=debug,att_cli=debug";

#[derive(Debug, Parser)]
#[command(name = "attacheable", version, about = "Attachment storage maintenance")]
struct Cli {
    /// Configuration file layered under ATTACHEABLE__* overrides
    #[arg(long, global = true, env = "ATTACHEABLE_CONFIG")]
    config: Option<PathBuf>,

    /// YAML file mapping type names to attachment specifications
    #[arg(long, global = true, env = "ATTACHEABLE_SPECS")]
    specs: Option<PathBuf>,

    /// Attachment type to operate on
    #[arg(long = "type", global = true, default_value = "attachments")]
    type_name: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the storage and public path of an original or variant
    Path {
        id: Id,
        filename: String,
        #[arg(long)]
        variant: Option<String>,
    },
    /// Report the format and dimensions of a file
    Probe { file: PathBuf },
    /// Generate a variant unless it already exists
    Ensure {
        id: Id,
        filename: String,
        variant: String,
        /// Regenerate even if the variant exists
        #[arg(long)]
        force: bool,
    },
    /// Remove one variant, or the whole partition directory
    Purge {
        id: Id,
        filename: String,
        #[arg(long)]
        variant: Option<String>,
    },
    /// Resolve an encoded `<seg1>/<seg2>/<name>` request
    Lookup {
        first: String,
        second: String,
        name: String,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::load(Some(path.as_path()))
            .with_context(|| format!("loading {}", path.display()))?,
        None => AppConfig::from_env().context("reading configuration from environment")?,
    };
    init_tracing(&config.logging);

    let spec = Arc::new(load_specification(cli.specs.as_deref(), &cli.type_name)?);
    debug!(
        name = spec.name(),
        variants = spec.variants().len(),
        root = %config.storage.root.display(),
        "Configuration loaded"
    );

    run(cli.command, &config, spec).await
}

/// Initialize tracing/logging; output goes to stderr so stdout stays parseable
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        logging
            .filter
            .as_deref()
            .unwrap_or(DEFAULT_FILTER)
            .into()
    });

    let json = logging.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
    });
    let text = (!logging.json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(text)
        .init();
}

fn load_specification(
    specs: Option<&Path>,
    type_name: &str,
) -> anyhow::Result<AttachmentSpecification> {
    let Some(path) = specs else {
        return Ok(AttachmentSpecification::builder(type_name).build()?);
    };

    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let mut defs: BTreeMap<String, SpecificationDef> = serde_yaml::from_str(&text)
        .with_context(|| format!("parsing {}", path.display()))?;

    match defs.remove(type_name) {
        Some(def) => Ok(def.into_specification(type_name)?),
        None => bail!(
            "no specification named {:?} in {} (known: {})",
            type_name,
            path.display(),
            defs.keys().cloned().collect::<Vec<_>>().join(", ")
        ),
    }
}

fn variant_key(
    spec: &AttachmentSpecification,
    variant: Option<String>,
) -> anyhow::Result<Option<VariantKey>> {
    match variant.map(VariantKey::from) {
        Some(key) if !spec.has_variant(&key) => bail!(
            "unknown variant {:?} for {} (known: {})",
            key.as_str(),
            spec.name(),
            spec.variants()
                .keys()
                .map(VariantKey::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        ),
        key => Ok(key),
    }
}

async fn run(
    command: Command,
    config: &AppConfig,
    spec: Arc<AttachmentSpecification>,
) -> anyhow::Result<ExitCode> {
    let backends = AttachmentBackends::from_config(config);
    let partitioner = Partitioner::from_config(&config.storage);
    let store = Arc::new(DiskStore::new(
        partitioner.clone(),
        spec.clone(),
        backends.probe.clone(),
    ));
    let service = AttachmentService::new(store.clone(), spec.clone(), config, backends);

    match command {
        Command::Path {
            id,
            filename,
            variant,
        } => {
            let key = variant_key(&spec, variant)?;
            let attachment = att_attachments::Attachment::new(&filename).with_id(id);
            let path = service.path_for(&attachment, key.as_ref())?;
            println!("{}", path.display());
            if let Some(public) = service.public_path(&attachment, key.as_ref()) {
                println!("{}", public);
            }
        }
        Command::Probe { file } => {
            let probe = IdentifyProbe::from_config(&config.tools);
            match probe.probe(&file).await {
                ProbeOutcome::Image(info) => {
                    println!("{} {}x{}", info.format, info.width, info.height);
                }
                ProbeOutcome::NotAnImage => {
                    println!("not an image");
                    return Ok(ExitCode::FAILURE);
                }
            }
        }
        Command::Ensure {
            id,
            filename,
            variant,
            force,
        } => {
            let key = variant_key(&spec, Some(variant))?
                .context("variant is required")?;
            let attachment = store
                .load(id, &filename)
                .await?
                .with_context(|| format!("no original {} for record {}", filename, id))?;
            let path = if force {
                service.engine().regenerate(&attachment, &spec, &key).await?
            } else {
                service.engine().ensure(&attachment, &spec, &key).await?
            };
            println!("{}", path.display());
        }
        Command::Purge {
            id,
            filename,
            variant,
        } => {
            let attachment = att_attachments::Attachment::new(&filename).with_id(id);
            match variant_key(&spec, variant)? {
                Some(key) => {
                    let path = service.path_for(&attachment, Some(&key))?;
                    storage::remove_file(&path).await?;
                    info!(path = %path.display(), "Variant removed");
                }
                None => service.on_destroy(&attachment).await,
            }
        }
        Command::Lookup {
            first,
            second,
            name,
            json,
        } => match service.lookup_by_encoded_path(&first, &second, &name).await? {
            Some(content) if json => {
                let value = serde_json::json!({
                    "path": content.path,
                    "variant": content.variant,
                    "content_type": content.content_type,
                    "size": content.data.len(),
                    "attachment": content.attachment,
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            }
            Some(content) => {
                println!("{}", content.path.display());
                println!(
                    "{} {} bytes",
                    content.content_type.as_deref().unwrap_or("application/octet-stream"),
                    content.data.len()
                );
            }
            None => {
                println!("not found");
                return Ok(ExitCode::FAILURE);
            }
        },
    }

    Ok(ExitCode::SUCCESS)
}
