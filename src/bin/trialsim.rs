// trialsim CLI
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::PathBuf;

use trialsim::design::optimize_design;
use trialsim::extract::RuleBasedExtractor;
use trialsim::generate::{write_cohort_csv, GenerationMode, PatientGenerator};
use trialsim::protocol::{parse_protocol, ParsedProtocol, ParserConfig};
use trialsim::schema::AttributeSchema;
use trialsim::simulate::{CancelFlag, TrialConfig, TrialSimulator};

#[derive(Parser)]
#[command(name = "trialsim")]
#[command(version = "0.1.0")]
#[command(about = "Clinical trial protocol parsing, synthetic cohorts, and simulation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a protocol text file into eligibility criteria
    Parse {
        /// Protocol text file
        #[arg(value_name = "PROTOCOL")]
        input: PathBuf,

        /// Attribute schema JSON file
        #[arg(short, long, value_name = "SCHEMA")]
        schema: PathBuf,

        /// Output JSON file (defaults to stdout)
        #[arg(short, long, value_name = "OUTPUT")]
        output: Option<PathBuf>,
    },

    /// Generate a synthetic patient cohort as CSV
    Generate {
        /// Attribute schema JSON file
        #[arg(short, long, value_name = "SCHEMA")]
        schema: PathBuf,

        /// Number of patients
        #[arg(short = 'n', long, default_value = "50")]
        count: usize,

        /// Random seed
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Generation mode (unconstrained, satisfying, violating)
        #[arg(short, long, default_value = "unconstrained")]
        mode: String,

        /// Protocol text file supplying the constraint (for constrained modes)
        #[arg(short, long, value_name = "PROTOCOL")]
        protocol: Option<PathBuf>,

        /// Output CSV file
        #[arg(short, long, value_name = "OUTPUT", default_value = "cohort.csv")]
        output: PathBuf,
    },

    /// Simulate a trial under a protocol and trial configuration
    Simulate {
        /// Protocol text file
        #[arg(value_name = "PROTOCOL")]
        input: PathBuf,

        /// Attribute schema JSON file
        #[arg(short, long, value_name = "SCHEMA")]
        schema: PathBuf,

        /// Trial configuration JSON file
        #[arg(short, long, value_name = "CONFIG")]
        config: PathBuf,

        /// Output JSON file (defaults to <protocol>.run.json)
        #[arg(short, long, value_name = "OUTPUT")]
        output: Option<PathBuf>,
    },

    /// Score alternative trial designs for a protocol
    Designs {
        /// Protocol text file
        #[arg(value_name = "PROTOCOL")]
        input: PathBuf,

        /// Candidate pool size
        #[arg(long, default_value = "12")]
        pool_size: usize,

        /// Number of designs to report
        #[arg(long, default_value = "3")]
        pick: usize,

        /// Random seed
        #[arg(long, default_value = "42")]
        seed: u64,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Parse { input, schema, output } => cmd_parse(&input, &schema, output.as_deref()),
        Commands::Generate {
            schema,
            count,
            seed,
            mode,
            protocol,
            output,
        } => cmd_generate(&schema, count, seed, &mode, protocol.as_deref(), &output),
        Commands::Simulate {
            input,
            schema,
            config,
            output,
        } => cmd_simulate(&input, &schema, &config, output),
        Commands::Designs {
            input,
            pool_size,
            pick,
            seed,
        } => cmd_designs(&input, pool_size, pick, seed),
    }
}

fn load_parsed(protocol_path: &std::path::Path, schema: &AttributeSchema) -> Result<ParsedProtocol> {
    let text = fs::read_to_string(protocol_path)
        .with_context(|| format!("Failed to read protocol file: {}", protocol_path.display()))?;
    let extractor = RuleBasedExtractor::new();
    let parsed = parse_protocol(&text, &extractor, schema, &ParserConfig::default())
        .context("Protocol parse failed")?;

    for diag in &parsed.diagnostics {
        eprintln!("  dropped clause ({:?}): {} -- {}", diag.kind, diag.text, diag.reason);
    }
    Ok(parsed)
}

fn cmd_parse(
    input: &std::path::Path,
    schema_path: &std::path::Path,
    output: Option<&std::path::Path>,
) -> Result<()> {
    let schema = AttributeSchema::from_json_file(schema_path)?;
    let parsed = load_parsed(input, &schema)?;

    println!("Protocol: {}", parsed.summary.title);
    if let Some(n) = parsed.summary.sample_size {
        println!("  Sample size: {}", n);
    }
    if let Some(endpoint) = &parsed.summary.primary_endpoint {
        println!("  Primary endpoint: {}", endpoint);
    }
    println!("  Criteria nodes: {}", parsed.criteria.node_count());
    println!("  Dropped clauses: {}", parsed.diagnostics.len());

    let json = serde_json::to_string_pretty(&parsed)?;
    match output {
        Some(path) => {
            fs::write(path, json)
                .with_context(|| format!("Failed to write output file: {}", path.display()))?;
            println!("Parse result saved to: {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}

fn cmd_generate(
    schema_path: &std::path::Path,
    count: usize,
    seed: u64,
    mode: &str,
    protocol: Option<&std::path::Path>,
    output: &std::path::Path,
) -> Result<()> {
    let schema = AttributeSchema::from_json_file(schema_path)?;

    let mode = match mode {
        "unconstrained" => GenerationMode::Unconstrained,
        "satisfying" => GenerationMode::Satisfying,
        "violating" => GenerationMode::Violating,
        other => bail!("Unknown generation mode: {}", other),
    };

    let parsed = match protocol {
        Some(path) => Some(load_parsed(path, &schema)?),
        None => None,
    };
    if parsed.is_none() && mode != GenerationMode::Unconstrained {
        bail!("Constrained generation requires --protocol");
    }

    let generator = PatientGenerator::new(&schema);
    let cohort = generator.generate(count, parsed.as_ref().map(|p| &p.criteria), mode, seed)?;

    write_cohort_csv(
        output.to_str().context("Output path is not valid UTF-8")?,
        &cohort,
        &schema,
    )
    .with_context(|| format!("Failed to write cohort CSV: {}", output.display()))?;

    println!("Generated {} patients -> {}", cohort.len(), output.display());
    Ok(())
}

fn cmd_simulate(
    input: &std::path::Path,
    schema_path: &std::path::Path,
    config_path: &std::path::Path,
    output: Option<PathBuf>,
) -> Result<()> {
    let schema = AttributeSchema::from_json_file(schema_path)?;
    let parsed = load_parsed(input, &schema)?;

    let config_text = fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read trial config: {}", config_path.display()))?;
    let config: TrialConfig = serde_json::from_str(&config_text)
        .with_context(|| format!("Failed to parse trial config: {}", config_path.display()))?;

    let simulator = TrialSimulator::new(&schema, &parsed.criteria, config);
    let run = simulator.run(&parsed.summary.title, &CancelFlag::new())?;

    println!("Trial: {}", run.protocol);
    println!(
        "  Screened {} candidates, enrolled {}",
        run.summary.screened, run.summary.enrolled
    );
    println!(
        "  Response rate: {:.1}% ({}/{})",
        run.summary.response_rate * 100.0,
        run.summary.responders,
        run.summary.enrolled
    );
    println!("  Mean effect: {:+.3}", run.summary.mean_effect);
    println!(
        "  Adverse events: {} (dropouts: {})",
        run.summary.adverse_events, run.summary.dropouts
    );

    let output = output.unwrap_or_else(|| input.with_extension("run.json"));
    fs::write(&output, serde_json::to_string_pretty(&run)?)
        .with_context(|| format!("Failed to write run file: {}", output.display()))?;
    println!("Run saved to: {}", output.display());
    Ok(())
}

fn cmd_designs(input: &std::path::Path, pool_size: usize, pick: usize, seed: u64) -> Result<()> {
    let text = fs::read_to_string(input)
        .with_context(|| format!("Failed to read protocol file: {}", input.display()))?;
    let summary = trialsim::protocol::ProtocolSummary::from_text(&text);

    let candidates = optimize_design(&summary, pool_size, pick, seed);
    println!("Design candidates for: {}", summary.title);
    for (i, c) in candidates.iter().enumerate() {
        println!(
            "  {}. n={} looseness={} ratio={:.1} score={:.3}",
            i + 1,
            c.sample_size,
            c.looseness,
            c.randomization_ratio,
            c.score
        );
    }
    Ok(())
}
