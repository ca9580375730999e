#![doc = include_str!("../README.md")]

mod config;
mod telemetry;

use anyhow::Context;
use clap::Parser;
use config::{CliArgs, IdentityMode, Settings};
use slotflake::{
    GeneratorConfig, Identifier, IdentityProvider, InstanceSource, LeaseManager, MemoryEnsemble,
    SnowflakeGenerator, SystemClock, ThreadRandom,
};
use std::{
    io::{BufWriter, Write},
    sync::Arc,
};
use telemetry::init_telemetry;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let settings = Settings::try_from(args)?;

    init_telemetry()?;

    let stdout = std::io::stdout();
    let mut out = BufWriter::new(stdout.lock());

    if let Some(raw) = settings.decode {
        print_id(&mut out, &settings, Identifier::from_raw(raw))?;
        return Ok(out.flush()?);
    }

    let (generator, lease) = build_generator(&settings)?;
    tracing::debug!(mode = ?settings.mode, count = settings.count, "minting ids");
    for _ in 0..settings.count {
        let id = generator.next_id().context("failed to mint id")?;
        print_id(&mut out, &settings, id)?;
    }
    out.flush()?;

    if let Some(manager) = lease {
        manager.shutdown().context("failed to release instance slot")?;
    }
    Ok(())
}

fn build_generator(
    settings: &Settings,
) -> anyhow::Result<(SnowflakeGenerator, Option<Arc<LeaseManager>>)> {
    let config = settings.config;
    let source = match &settings.mode {
        IdentityMode::Static {
            worker_id,
            datacenter_id,
        } => InstanceSource::Static {
            worker_id: *worker_id,
            datacenter_id: *datacenter_id,
        },
        IdentityMode::Legacy { packed } => {
            let (worker_id, datacenter_id) = config.split_legacy(*packed);
            InstanceSource::Static {
                worker_id,
                datacenter_id,
            }
        }
        IdentityMode::Lease { ensemble, lease } => {
            tracing::info!(
                ensemble = %ensemble,
                base_path = lease.base_path(),
                "leasing instance slot from in-process ensemble"
            );
            let ensemble = MemoryEnsemble::named(ensemble);
            let manager = LeaseManager::start(Arc::new(ensemble.connect()), lease.clone())
                .context("failed to lease an instance slot")?;
            let generator = SnowflakeGenerator::from_source(
                config,
                InstanceSource::Leased(Arc::clone(&manager)),
                SystemClock,
                ThreadRandom,
            )?;
            return Ok((generator, Some(manager)));
        }
        IdentityMode::Fallback => {
            let generator = SnowflakeGenerator::new(
                config,
                Arc::new(IdentityProvider::new()),
                SystemClock,
                ThreadRandom,
            );
            return Ok((generator, None));
        }
    };

    let generator = SnowflakeGenerator::from_source(config, source, SystemClock, ThreadRandom)?;
    Ok((generator, None))
}

fn print_id(out: &mut impl Write, settings: &Settings, id: Identifier) -> anyhow::Result<()> {
    let config: &GeneratorConfig = &settings.config;
    if settings.json {
        let parts = id.decode(config);
        let value = serde_json::json!({
            "id": id.to_raw(),
            "timestamp": parts.timestamp,
            "unix_ms": id.unix_millis(config),
            "instance": parts.instance,
            "sequence": parts.sequence,
        });
        writeln!(out, "{value}")?;
    } else {
        writeln!(out, "{id}")?;
    }
    if settings.layout {
        writeln!(out, "{}", id.layout(config))?;
    }
    Ok(())
}
