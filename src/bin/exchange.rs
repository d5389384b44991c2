//! Exchange CLI
//!
//! Manages a filesystem schema registry and encodes, decodes and migrates
//! messages from the command line.
//!
//! Usage:
//!   exchange register Order 1.1.0 schemas/order.avsc
//!   exchange encode --format avro --schema Order --version 1.1.0 --source orders data.json -o order.bin
//!   exchange decode --format avro --schema Order order.bin
//!   exchange migrate --rules rules/order.json --to 2.0.0 message.json

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use familiar_exchange::codec::JsonCodec;
use familiar_exchange::config::BackendKind;
use familiar_exchange::{
    build_codec, ExchangeConfig, MessageCodec, MessageDraft, SchemaRegistry, SchemaVersion, SerializationFormat,
    VersionTransformer,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "exchange")]
#[command(about = "Schema registry, codecs and migrations for Familiar messages")]
struct Cli {
    /// Configuration file layered over the default locations
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Registry directory (overrides registry.path)
    #[arg(short, long, global = true)]
    registry: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Json,
    Avro,
    Compact,
}

impl From<Format> for SerializationFormat {
    fn from(format: Format) -> Self {
        match format {
            Format::Json => SerializationFormat::Json,
            Format::Avro => SerializationFormat::Avro,
            Format::Compact => SerializationFormat::Compact,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Register a schema file under a version
    Register {
        name: String,
        version: String,
        file: PathBuf,
        /// Tags stored with the registration
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// List versions of a schema, or all schema names
    Versions { name: Option<String> },
    /// Print a registered schema (latest version by default)
    Show {
        name: String,
        version: Option<String>,
        /// Print registration metadata instead of the schema text
        #[arg(long)]
        metadata: bool,
    },
    /// Check compatibility between two registered versions
    Check {
        name: String,
        old_version: String,
        new_version: String,
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Delete one version, or every version of a schema
    Delete {
        name: String,
        #[arg(short = 'v', long)]
        version: Option<String>,
    },
    /// Wrap JSON data in a message and encode it
    Encode {
        input: PathBuf,
        #[arg(short, long, value_enum, default_value = "json")]
        format: Format,
        /// Schema (type) name, required for avro
        #[arg(short, long)]
        schema: Option<String>,
        /// Schema version the data conforms to
        #[arg(short = 'v', long, default_value = "1.0.0")]
        version: String,
        /// Producing service
        #[arg(long, default_value = "exchange-cli")]
        source: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Decode a message and print it as JSON
    Decode {
        input: PathBuf,
        #[arg(short, long, value_enum, default_value = "json")]
        format: Format,
        #[arg(short, long)]
        schema: Option<String>,
    },
    /// Migrate a JSON-encoded message to another schema version
    Migrate {
        input: PathBuf,
        /// Rule file (one rule set or an array of them)
        #[arg(long)]
        rules: Vec<PathBuf>,
        /// Target schema version
        #[arg(long)]
        to: String,
        /// Validate the result against this registered schema
        #[arg(short, long)]
        schema: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match ExchangeConfig::load_from(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ Error: invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli, config).await {
        eprintln!("❌ Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn open_registry(config: &ExchangeConfig, path: Option<PathBuf>) -> Result<Arc<SchemaRegistry>> {
    let mut registry_config = config.registry.clone();
    registry_config.backend = BackendKind::Filesystem;
    registry_config.path = path.unwrap_or_else(|| config.registry_path());

    let registry = SchemaRegistry::from_config(registry_config)?;
    let loaded = registry.hydrate().await?;
    tracing::debug!(loaded, "registry hydrated");
    Ok(Arc::new(registry))
}

fn codec_for(
    format: Format,
    config: &ExchangeConfig,
    registry: &Arc<SchemaRegistry>,
    schema: Option<String>,
) -> Result<Box<dyn MessageCodec>> {
    let schema = schema.map(|name| (registry.clone(), name));
    Ok(build_codec(format.into(), &config.codec, schema)?)
}

async fn run(cli: Cli, config: ExchangeConfig) -> Result<()> {
    let registry = open_registry(&config, cli.registry).await?;

    match cli.command {
        Command::Register {
            name,
            version,
            file,
            tags,
        } => {
            let content = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let outcome = registry.register_tagged(&name, &content, &version, tags).await?;
            if outcome.created {
                println!("✅ Registered {} {}", name, outcome.registration.version());
            } else {
                println!("ℹ️  {} {} already registered with identical content", name, version);
            }
            if let Some(result) = &outcome.compatibility {
                println!("   {}", result.summary);
            }
            if outcome.migration_required {
                println!("⚠️  Consumers of earlier versions need a migration");
            }
        }

        Command::Versions { name: Some(name) } => {
            let versions = registry.get_schema_versions(&name);
            if versions.is_empty() {
                bail!("schema '{}' is not registered", name);
            }
            for version in versions {
                println!("{}", version);
            }
        }

        Command::Versions { name: None } => {
            for name in registry.list_schemas() {
                let latest = registry
                    .get_latest_version(&name)
                    .map(|v| v.to_string())
                    .unwrap_or_default();
                println!("{:<40} {}", name, latest);
            }
        }

        Command::Show {
            name,
            version,
            metadata,
        } => {
            let version = match version {
                Some(version) => version,
                None => registry
                    .get_latest_version(&name)
                    .map(|v| v.to_string())
                    .with_context(|| format!("schema '{}' is not registered", name))?,
            };
            let registration = registry.get_schema(&name, &version)?;
            if metadata {
                println!("{}", serde_json::to_string_pretty(&registration.metadata)?);
            } else {
                println!("{}", registration.content);
            }
        }

        Command::Check {
            name,
            old_version,
            new_version,
            format,
        } => {
            let result = registry.check_compatibility(&name, &old_version, &new_version)?;
            match format.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(&result)?),
                _ => {
                    println!("{} {} -> {} ({})", name, old_version, new_version, result.level);
                    for change in &result.changes {
                        let marker = if change.is_breaking { "❌" } else { "  " };
                        println!("{} {}", marker, change.description);
                    }
                    println!("{}", result.summary);
                }
            }
            if !result.is_compatible {
                std::process::exit(2);
            }
        }

        Command::Delete { name, version } => {
            let removed = registry.delete(&name, version.as_deref()).await?;
            println!("🗑️  Removed {} version(s) of {}", removed, name);
        }

        Command::Encode {
            input,
            format,
            schema,
            version,
            source,
            output,
        } => {
            let raw = std::fs::read_to_string(&input).with_context(|| format!("reading {}", input.display()))?;
            let data: serde_json::Value = serde_json::from_str(&raw)?;
            let message = MessageDraft::new(source, version, data).build_now()?;
            let codec = codec_for(format, &config, &registry, schema)?;
            let encoded = codec.serialize(&message)?;

            match output {
                Some(path) => std::fs::write(&path, &encoded.bytes)?,
                None => {
                    use std::io::Write;
                    std::io::stdout().write_all(&encoded.bytes)?;
                }
            }
            eprintln!(
                "{} message {}: {} bytes ({} bytes before {}, ratio {:.2})",
                encoded.format,
                message.message_id(),
                encoded.compressed_size,
                encoded.original_size,
                encoded.compression,
                encoded.compression_ratio
            );
            if let Some(crc) = encoded.crc32 {
                eprintln!("crc32 {:08x}", crc);
            }
        }

        Command::Decode { input, format, schema } => {
            let bytes = std::fs::read(&input).with_context(|| format!("reading {}", input.display()))?;
            let codec = codec_for(format, &config, &registry, schema)?;
            let message = codec.deserialize(&bytes)?;
            println!("{}", serde_json::to_string_pretty(&message)?);
        }

        Command::Migrate {
            input,
            rules,
            to,
            schema,
        } => {
            let bytes = std::fs::read(&input).with_context(|| format!("reading {}", input.display()))?;
            let message = JsonCodec::new(config.codec.clone()).deserialize(&bytes)?;

            let mut transformer = VersionTransformer::new(config.migration.clone());
            if let Some(name) = schema {
                transformer = transformer.with_registry(registry.clone(), name);
            }
            for path in &rules {
                let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
                transformer.load_rules(&text)?;
            }

            let target = SchemaVersion::parse(&to)?;
            let result = transformer.migrate(&message, &target);
            for warning in &result.warnings {
                eprintln!("⚠️  {}", warning);
            }
            for error in &result.errors {
                eprintln!("❌ {}", error);
            }
            match result.message {
                Some(migrated) if result.success => {
                    println!("{}", serde_json::to_string_pretty(&migrated)?);
                }
                _ => bail!("migration to {} failed", target),
            }
        }
    }

    Ok(())
}
