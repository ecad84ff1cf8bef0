use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use materials_master::config::{default_config_path, find_config_file, load_config, Config};
use materials_master::models::{
    CountRange, CrystalSystem, Material, PropertyRange, QueryError, SearchQuery, SearchResult,
};
use materials_master::search::SearchOrchestrator;
use std::io::IsTerminal;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Materials Master - Federated search across materials data providers
#[derive(Parser, Debug)]
#[command(name = "materials-master")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = "hongkongkiwi")]
#[command(about = "Search materials records across several data providers at once", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(long, short, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(long, short, global = true)]
    quiet: bool,

    /// Output format
    #[arg(long, short, value_enum, global = true, default_value_t = OutputFormat::Auto)]
    output: OutputFormat,

    /// Log line format
    #[arg(long, value_enum, global = true)]
    log_format: Option<LogFormat>,

    /// Configuration file path
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Bypass the result cache for this command
    #[arg(long, global = true, default_value_t = false)]
    no_cache: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Output format for results
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum OutputFormat {
    /// Automatic based on terminal (table if TTY, JSON otherwise)
    Auto,
    /// Table format (human-readable)
    Table,
    /// JSON format (machine-readable)
    Json,
    /// Plain text format
    Plain,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Search all capable providers and print the fused results
    #[command(alias = "s")]
    Search {
        /// Elements that must all be present (comma-separated)
        #[arg(long, short, value_delimiter = ',')]
        elements: Vec<String>,

        /// Elements of which at least one must be present
        #[arg(long, value_delimiter = ',')]
        any: Vec<String>,

        /// Elements that must be absent
        #[arg(long, short = 'x', value_delimiter = ',')]
        exclude: Vec<String>,

        /// Reduced chemical formula
        #[arg(long, short)]
        formula: Option<String>,

        #[arg(long)]
        nelements_min: Option<u32>,

        #[arg(long)]
        nelements_max: Option<u32>,

        /// Minimum band gap in eV
        #[arg(long)]
        band_gap_min: Option<f64>,

        /// Maximum band gap in eV
        #[arg(long)]
        band_gap_max: Option<f64>,

        /// Minimum formation energy in eV/atom
        #[arg(long, allow_negative_numbers = true)]
        formation_energy_min: Option<f64>,

        /// Maximum formation energy in eV/atom
        #[arg(long, allow_negative_numbers = true)]
        formation_energy_max: Option<f64>,

        /// Minimum energy above hull in eV/atom
        #[arg(long)]
        e_hull_min: Option<f64>,

        /// Maximum energy above hull in eV/atom
        #[arg(long)]
        e_hull_max: Option<f64>,

        /// Hermann-Mauguin space group symbol
        #[arg(long)]
        space_group: Option<String>,

        /// Crystal system (cubic, hexagonal, ...)
        #[arg(long)]
        crystal_system: Option<String>,

        /// Only query these provider ids (comma-separated)
        #[arg(long, short, value_delimiter = ',')]
        providers: Vec<String>,

        /// Maximum number of fused results
        #[arg(long, short, default_value_t = materials_master::models::DEFAULT_LIMIT)]
        limit: usize,

        /// Print the full result, including the audit trail, as JSON
        #[arg(long)]
        json: bool,
    },

    /// Look up a material seen in a cached search
    Get {
        /// Material id, e.g. mp-19770
        id: String,
    },

    /// List configured providers and what they can filter on
    Providers {
        /// Probe every provider's liveness endpoint
        #[arg(long)]
        check: bool,
    },

    /// Show or reset provider health
    Health {
        /// Reset the circuit breaker (one provider, or all when no id is given)
        #[arg(long)]
        reset: bool,

        /// Provider id to reset
        provider: Option<String>,
    },

    /// Manage the result cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },

    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum CacheCommands {
    /// Show cache statistics
    Stats,
    /// Drop expired entries
    Evict,
    /// Remove every cached search
    Clear,
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Write a configuration file with the default settings
    Init {
        /// Destination (defaults to the user config directory)
        #[arg(long)]
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().or_else(find_config_file);
    let mut config = load_config(config_path.as_deref()).with_context(|| match &config_path {
        Some(path) => format!("failed to load configuration from {}", path.display()),
        None => "failed to load configuration".to_string(),
    })?;

    init_tracing(&cli, &config);
    if let Some(path) = &config_path {
        tracing::debug!("Using config file: {}", path.display());
    }

    if cli.no_cache {
        config.cache.enabled = false;
    }

    match cli.command {
        Commands::Search {
            elements,
            any,
            exclude,
            formula,
            nelements_min,
            nelements_max,
            band_gap_min,
            band_gap_max,
            formation_energy_min,
            formation_energy_max,
            e_hull_min,
            e_hull_max,
            space_group,
            crystal_system,
            providers,
            limit,
            json,
        } => {
            let mut builder = SearchQuery::builder().limit(limit);
            if !elements.is_empty() {
                builder = builder.elements(elements);
            }
            if !any.is_empty() {
                builder = builder.elements_any(any);
            }
            if !exclude.is_empty() {
                builder = builder.exclude_elements(exclude);
            }
            if let Some(formula) = formula {
                builder = builder.formula(formula);
            }
            if nelements_min.is_some() || nelements_max.is_some() {
                builder = builder.nelements(CountRange::new(nelements_min, nelements_max)?);
            }
            if let Some(range) = property_range(band_gap_min, band_gap_max)? {
                builder = builder.band_gap(range);
            }
            if let Some(range) = property_range(formation_energy_min, formation_energy_max)? {
                builder = builder.formation_energy(range);
            }
            if let Some(range) = property_range(e_hull_min, e_hull_max)? {
                builder = builder.energy_above_hull(range);
            }
            if let Some(space_group) = space_group {
                builder = builder.space_group(space_group);
            }
            if let Some(system) = crystal_system {
                builder = builder.crystal_system(system.parse::<CrystalSystem>()?);
            }
            if !providers.is_empty() {
                builder = builder.providers(providers);
            }
            let query = builder.build()?;

            let orchestrator = SearchOrchestrator::from_config(&config)?;
            let result = orchestrator.search(&query).await;

            if json || resolve_format(cli.output) == OutputFormat::Json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                output_materials(result.materials(), resolve_format(cli.output));
                if !cli.quiet {
                    print_summary(&result);
                }
            }
        }

        Commands::Get { id } => {
            let orchestrator = SearchOrchestrator::from_config(&config)?;
            match orchestrator.get_material(&id) {
                Some(material) => output_materials(&[material], resolve_format(cli.output)),
                None => {
                    eprintln!("Material '{}' not found in any cached search", id);
                    std::process::exit(1);
                }
            }
        }

        Commands::Providers { check } => {
            let orchestrator = SearchOrchestrator::from_config(&config)?;
            let probes = if check {
                orchestrator.check_providers().await
            } else {
                Vec::new()
            };

            if resolve_format(cli.output) == OutputFormat::Json {
                let list: Vec<_> = orchestrator
                    .registry()
                    .all()
                    .map(|p| {
                        serde_json::json!({
                            "id": p.id(),
                            "name": p.name(),
                            "endpoint": p.endpoint(),
                            "filterable": p.capabilities().filterable_names(),
                            "healthy": probes.iter().find(|(id, _)| id == p.id()).map(|(_, ok)| *ok),
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&list)?);
            } else {
                for provider in orchestrator.registry().all() {
                    let status = match probes.iter().find(|(id, _)| id == provider.id()) {
                        Some((_, true)) => " [up]",
                        Some((_, false)) => " [down]",
                        None => "",
                    };
                    println!("{} - {}{}", provider.id(), provider.name(), status);
                    println!("  Endpoint:   {}", provider.endpoint());
                    println!(
                        "  Filterable: {}",
                        provider.capabilities().filterable_names().join(", ")
                    );
                }
            }
        }

        Commands::Health { reset, provider } => {
            let orchestrator = SearchOrchestrator::from_config(&config)?;
            let health = orchestrator.health();

            if reset {
                match &provider {
                    Some(id) => {
                        if !health.reset(id) {
                            eprintln!("No health record for provider '{}'", id);
                        }
                    }
                    None => health.reset_all(),
                }
                if config.health.persist {
                    health.save().await?;
                }
                if !cli.quiet {
                    eprintln!("Circuit breaker reset");
                }
            }

            let status = orchestrator.health_status();
            if resolve_format(cli.output) == OutputFormat::Json {
                let map: std::collections::BTreeMap<_, _> = status.into_iter().collect();
                println!("{}", serde_json::to_string_pretty(&map)?);
            } else if status.is_empty() {
                println!("No provider has been queried yet");
            } else {
                use comfy_table::Table;
                let mut table = Table::new();
                table.load_preset(comfy_table::presets::UTF8_FULL);
                table.set_header(vec![
                    "Provider", "Circuit", "Failures", "Successes", "Avg latency",
                ]);
                for (id, entry) in status {
                    table.add_row(vec![
                        id,
                        entry.circuit_state.to_string(),
                        format!("{} ({} in a row)", entry.failure_count, entry.consecutive_failures),
                        entry.success_count.to_string(),
                        format!("{:.0}ms", entry.avg_latency_ms),
                    ]);
                }
                println!("{table}");
            }
        }

        Commands::Cache { command } => {
            config.cache.enabled = true;
            let orchestrator = SearchOrchestrator::from_config(&config)?;
            let Some(cache) = orchestrator.cache() else {
                anyhow::bail!("cache is unavailable");
            };

            match command {
                CacheCommands::Stats => {
                    let stats = cache.stats();
                    if resolve_format(cli.output) == OutputFormat::Json {
                        println!("{}", serde_json::to_string_pretty(&stats)?);
                    } else {
                        if let Some(dir) = cache.directory() {
                            println!("Directory:  {}", dir.display());
                        }
                        println!("Entries:    {} ({} fresh)", stats.entries, stats.fresh_entries);
                        println!("Materials:  {}", stats.indexed_materials);
                        println!("TTL:        {}s", stats.ttl_seconds);
                    }
                }
                CacheCommands::Evict => {
                    let removed = cache.evict_expired().await;
                    println!("Evicted {} expired entries", removed);
                }
                CacheCommands::Clear => {
                    cache.clear().await?;
                    println!("Cache cleared");
                }
            }
        }

        Commands::Config { command } => match command {
            ConfigCommands::Init { path, force } => {
                let path = path.unwrap_or_else(default_config_path);
                if path.exists() && !force {
                    anyhow::bail!(
                        "{} already exists (use --force to overwrite)",
                        path.display()
                    );
                }
                Config::default().save(&path)?;
                println!("Wrote {}", path.display());
            }
            ConfigCommands::Show => {
                print!("{}", config.to_toml()?);
            }
        },
    }

    Ok(())
}

fn init_tracing(cli: &Cli, config: &Config) {
    let level = if cli.quiet {
        "error".to_string()
    } else {
        match cli.verbose {
            0 => config.logging.level.clone(),
            1 => "debug".to_string(),
            _ => "trace".to_string(),
        }
    };

    let json = match cli.log_format {
        Some(format) => format == LogFormat::Json,
        None => config.logging.format.as_deref() == Some("json"),
    };

    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| format!("materials_master={}", level)),
    );

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
        }))
        .with((!json).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
        .init();
}

fn property_range(min: Option<f64>, max: Option<f64>) -> Result<Option<PropertyRange>, QueryError> {
    if min.is_none() && max.is_none() {
        return Ok(None);
    }
    PropertyRange::new(min, max).map(Some)
}

fn resolve_format(format: OutputFormat) -> OutputFormat {
    if format == OutputFormat::Auto {
        if std::io::stdout().is_terminal() {
            OutputFormat::Table
        } else {
            OutputFormat::Json
        }
    } else {
        format
    }
}

fn number(value: Option<f64>) -> String {
    value.map(|v| format!("{:.3}", v)).unwrap_or_default()
}

fn output_materials(materials: &[Material], format: OutputFormat) {
    match format {
        OutputFormat::Json | OutputFormat::Auto => match serde_json::to_string_pretty(materials) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Failed to render results: {}", e),
        },
        OutputFormat::Plain => {
            for material in materials {
                println!(
                    "{} {} ({})",
                    material.id,
                    material.formula,
                    material.sources.join(", ")
                );
                if let Some(space_group) = material.space_group_symbol() {
                    println!("  Space group: {}", space_group);
                }
                if let Some(gap) = material.band_gap.as_ref().and_then(|v| v.as_f64()) {
                    println!("  Band gap:    {:.3} eV", gap);
                }
                for (key, value) in &material.extra_properties {
                    println!("  {}: {}", key, value.value);
                }
                println!();
            }
        }
        OutputFormat::Table => {
            use comfy_table::Table;
            let mut table = Table::new();
            table.load_preset(comfy_table::presets::UTF8_FULL);
            table.set_header(vec![
                "ID",
                "Formula",
                "Space group",
                "Band gap (eV)",
                "E_form (eV/atom)",
                "E_hull (eV/atom)",
                "Sources",
            ]);

            for material in materials {
                table.add_row(vec![
                    material.id.clone(),
                    material.formula.clone(),
                    material.space_group_symbol().unwrap_or_default().to_string(),
                    number(material.band_gap.as_ref().and_then(|v| v.as_f64())),
                    number(material.formation_energy.as_ref().and_then(|v| v.as_f64())),
                    number(material.energy_above_hull.as_ref().and_then(|v| v.as_f64())),
                    material.sources.join(", "),
                ]);
            }
            println!("{table}");
        }
    }
}

fn print_summary(result: &SearchResult) {
    eprintln!(
        "{} of {} materials{} in {:.0}ms",
        result.materials().len(),
        result.total_count(),
        if result.cached() { " (cached)" } else { "" },
        result.search_time_ms()
    );
    for log in result.provider_logs() {
        eprintln!(
            "  {:<12} {:<12} {:>4} results {:>7.0}ms",
            log.provider_id, log.status, log.result_count, log.latency_ms
        );
    }
    for warning in result.warnings() {
        eprintln!("warning: {}", warning);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_verbose_flag() {
        let cli = Cli::parse_from(["materials-master", "-vv", "providers"]);
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_cli_search_elements() {
        let cli = Cli::parse_from(["materials-master", "search", "--elements", "Fe,O"]);
        match &cli.command {
            Commands::Search {
                elements, limit, json, ..
            } => {
                assert_eq!(elements, &vec!["Fe".to_string(), "O".to_string()]);
                assert_eq!(*limit, 100);
                assert!(!*json);
            }
            _ => panic!("Expected Search command"),
        }
    }

    #[test]
    fn test_cli_search_ranges() {
        let cli = Cli::parse_from([
            "materials-master",
            "search",
            "-e",
            "Li",
            "--formation-energy-max",
            "-0.5",
            "--band-gap-min",
            "1",
            "--providers",
            "mp,oqmd",
            "--json",
        ]);
        match &cli.command {
            Commands::Search {
                formation_energy_max,
                band_gap_min,
                providers,
                json,
                ..
            } => {
                assert_eq!(*formation_energy_max, Some(-0.5));
                assert_eq!(*band_gap_min, Some(1.0));
                assert_eq!(providers.len(), 2);
                assert!(*json);
            }
            _ => panic!("Expected Search command"),
        }
    }

    #[test]
    fn test_cli_health_reset() {
        let cli = Cli::parse_from(["materials-master", "health", "--reset", "mp"]);
        match &cli.command {
            Commands::Health { reset, provider } => {
                assert!(*reset);
                assert_eq!(provider.as_deref(), Some("mp"));
            }
            _ => panic!("Expected Health command"),
        }
    }

    #[test]
    fn test_cli_cache_and_config() {
        let cli = Cli::parse_from(["materials-master", "cache", "clear"]);
        assert!(matches!(
            cli.command,
            Commands::Cache {
                command: CacheCommands::Clear
            }
        ));

        let cli = Cli::parse_from(["materials-master", "config", "init", "--force"]);
        assert!(matches!(
            cli.command,
            Commands::Config {
                command: ConfigCommands::Init { force: true, .. }
            }
        ));
    }

    #[test]
    fn test_property_range_helper() {
        assert!(property_range(None, None).unwrap().is_none());
        assert!(property_range(Some(1.0), None).unwrap().is_some());
        assert!(property_range(Some(2.0), Some(1.0)).is_err());
    }
}
