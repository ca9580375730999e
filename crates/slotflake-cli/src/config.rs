use anyhow::{Context, bail};
use clap::{Parser, ValueEnum};
use core::time::Duration;
use slotflake::{DEFAULT_EPOCH, GeneratorConfig, LeaseConfig};

/// Only in-process ensembles ship with this binary.
const MEMORY_SCHEME: &str = "mem://";

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeArg {
    /// Explicit worker and datacenter ids.
    Static,
    /// A single packed worker id (low 5 bits worker, high bits datacenter).
    Legacy,
    /// Lease a slot from a named in-process ensemble. Slots are only
    /// coordinated within this process, so separate runs may share a slot.
    Lease,
    /// Derive the instance from the local IPv4 address.
    Fallback,
}

/// Runtime configuration for the `slotflake` binary.
///
/// Every flag can also be supplied through the environment (or a `.env` file
/// in the working directory).
#[derive(Parser, Debug, Clone)]
#[command(
    name = "slotflake",
    version,
    about = "Mint and decode time-ordered 64-bit Snowflake IDs"
)]
pub struct CliArgs {
    /// How the instance field is filled.
    ///
    /// Environment variable: `SLOTFLAKE_MODE`
    #[arg(long, env = "SLOTFLAKE_MODE", value_enum, default_value_t = ModeArg::Fallback)]
    pub mode: ModeArg,

    /// Worker id for `--mode static`, in `[0, 2^worker_bits)`.
    ///
    /// Environment variable: `WORKER_ID`
    #[arg(long, env = "WORKER_ID", default_value_t = 0)]
    pub worker_id: u64,

    /// Datacenter id for `--mode static`.
    ///
    /// Environment variable: `DATACENTER_ID`
    #[arg(long, env = "DATACENTER_ID", default_value_t = 0)]
    pub datacenter_id: u64,

    /// Packed worker id for `--mode legacy`, in `[0, 1023]` with the default
    /// layout.
    ///
    /// Environment variable: `LEGACY_WORKER_ID`
    #[arg(long, env = "LEGACY_WORKER_ID")]
    pub legacy_worker_id: Option<u64>,

    /// Ensemble address for `--mode lease`. Only `mem://<name>` is supported;
    /// it names an ensemble private to this process.
    ///
    /// Environment variable: `ENSEMBLE_ADDR`
    #[arg(long, env = "ENSEMBLE_ADDR", default_value_t = String::from("mem://local"))]
    pub ensemble_addr: String,

    /// Coordination path under which slots are leased.
    ///
    /// Environment variable: `LEASE_BASE_PATH`
    #[arg(long, env = "LEASE_BASE_PATH", default_value_t = String::from("/slotflake"))]
    pub base_path: String,

    /// Layout epoch in milliseconds since the Unix epoch.
    ///
    /// Environment variable: `EPOCH_MS`
    #[arg(long, env = "EPOCH_MS", default_value_t = DEFAULT_EPOCH.as_millis() as u64)]
    pub epoch_ms: u64,

    /// Width of the timestamp field.
    ///
    /// Environment variable: `TIMESTAMP_BITS`
    #[arg(long, env = "TIMESTAMP_BITS", default_value_t = 41)]
    pub timestamp_bits: u8,

    /// Width of the instance field; also the lease range in `--mode lease`.
    ///
    /// Environment variable: `INSTANCE_BITS`
    #[arg(long, env = "INSTANCE_BITS", default_value_t = 10)]
    pub instance_bits: u8,

    /// Width of the low worker part of the instance field in `static` and
    /// `legacy` modes. Defaults to half the instance field, rounded up.
    ///
    /// Environment variable: `WORKER_BITS`
    #[arg(long, env = "WORKER_BITS")]
    pub worker_bits: Option<u8>,

    /// Width of the sequence field.
    ///
    /// Environment variable: `SEQUENCE_BITS`
    #[arg(long, env = "SEQUENCE_BITS", default_value_t = 12)]
    pub sequence_bits: u8,

    /// Number of IDs to mint.
    #[arg(short = 'n', long, default_value_t = 1)]
    pub count: usize,

    /// Decode this raw ID instead of minting.
    #[arg(long)]
    pub decode: Option<u64>,

    /// Print a bit layout table for each ID.
    #[arg(long, default_value_t = false)]
    pub layout: bool,

    /// Emit one JSON object per line.
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityMode {
    Static {
        worker_id: u64,
        datacenter_id: u64,
    },
    Legacy {
        packed: u64,
    },
    Lease {
        /// Ensemble name, the part of the address after `mem://`.
        ensemble: String,
        lease: LeaseConfig,
    },
    Fallback,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub mode: IdentityMode,
    pub config: GeneratorConfig,
    pub count: usize,
    pub decode: Option<u64>,
    pub layout: bool,
    pub json: bool,
}

impl TryFrom<CliArgs> for Settings {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        let config = GeneratorConfig::new(
            Duration::from_millis(args.epoch_ms),
            args.timestamp_bits,
            args.instance_bits,
            args.sequence_bits,
        )
        .context("invalid ID layout")?;
        let config = match args.worker_bits {
            Some(bits) => config
                .with_worker_bits(bits)
                .context("invalid WORKER_BITS")?,
            None => config,
        };

        if args.count == 0 && args.decode.is_none() {
            bail!("COUNT must be greater than 0");
        }

        let mode = match args.mode {
            ModeArg::Static => {
                config
                    .combine_static(args.worker_id, args.datacenter_id)
                    .context("WORKER_ID/DATACENTER_ID do not fit the layout")?;
                IdentityMode::Static {
                    worker_id: args.worker_id,
                    datacenter_id: args.datacenter_id,
                }
            }
            ModeArg::Legacy => {
                let Some(packed) = args.legacy_worker_id else {
                    bail!("--mode legacy requires LEGACY_WORKER_ID");
                };
                let (worker_id, datacenter_id) = config.split_legacy(packed);
                config
                    .combine_static(worker_id, datacenter_id)
                    .with_context(|| format!("LEGACY_WORKER_ID {packed} out of range"))?;
                IdentityMode::Legacy { packed }
            }
            ModeArg::Lease => {
                let Some(name) = args.ensemble_addr.strip_prefix(MEMORY_SCHEME) else {
                    bail!(
                        "unsupported ENSEMBLE_ADDR `{}`, only `{MEMORY_SCHEME}` ensembles are available",
                        args.ensemble_addr
                    );
                };
                if name.is_empty() {
                    bail!("ENSEMBLE_ADDR `{}` has no ensemble name", args.ensemble_addr);
                }
                let lease = LeaseConfig::new(args.base_path, args.instance_bits)
                    .context("invalid lease configuration")?;
                IdentityMode::Lease {
                    ensemble: name.to_string(),
                    lease,
                }
            }
            ModeArg::Fallback => IdentityMode::Fallback,
        };

        Ok(Self {
            mode,
            config,
            count: args.count,
            decode: args.decode,
            layout: args.layout,
            json: args.json,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(args: &[&str]) -> anyhow::Result<Settings> {
        let args = CliArgs::try_parse_from(core::iter::once("slotflake").chain(args.iter().copied()))?;
        Settings::try_from(args)
    }

    #[test]
    fn defaults_use_classic_layout() {
        let settings = settings(&[]).unwrap();
        assert_eq!(settings.config, GeneratorConfig::default());
        assert_eq!(settings.count, 1);
    }

    #[test]
    fn static_pair_is_validated() {
        let ok = settings(&["--mode", "static", "--worker-id", "31", "--datacenter-id", "2"]).unwrap();
        assert_eq!(
            ok.mode,
            IdentityMode::Static {
                worker_id: 31,
                datacenter_id: 2
            }
        );
        assert!(settings(&["--mode", "static", "--worker-id", "32"]).is_err());
    }

    #[test]
    fn legacy_requires_packed_id() {
        assert!(settings(&["--mode", "legacy"]).is_err());
        assert!(settings(&["--mode", "legacy", "--legacy-worker-id", "1024"]).is_err());
        let ok = settings(&["--mode", "legacy", "--legacy-worker-id", "1023"]).unwrap();
        assert_eq!(ok.mode, IdentityMode::Legacy { packed: 1023 });
    }

    #[test]
    fn lease_accepts_only_memory_ensembles() {
        let ok = settings(&["--mode", "lease", "--base-path", "/ids"]).unwrap();
        assert!(matches!(ok.mode, IdentityMode::Lease { ref ensemble, .. } if ensemble == "local"));

        let remote = settings(&["--mode", "lease", "--ensemble-addr", "zk://10.0.0.1:2181"]);
        assert!(remote.is_err());
        assert!(settings(&["--mode", "lease", "--ensemble-addr", "mem://"]).is_err());
        assert!(settings(&["--mode", "lease", "--base-path", "ids"]).is_err());
    }

    #[test]
    fn rejects_zero_count_and_oversized_layout() {
        assert!(settings(&["-n", "0"]).is_err());
        assert!(settings(&["-n", "0", "--decode", "42"]).is_ok());
        assert!(settings(&["--timestamp-bits", "50"]).is_err());
    }
}
