use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use splitmig_core::{
    ApplyOptions, ArtifactKind, Config, Context, EntryState, Migrator, Registry, RollbackOptions,
};
use tracing_subscriber::EnvFilter;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
#[command(name = "splitmig")]
#[command(about = "Apply, roll back and inspect blueprint migrations and seeds", long_about = None)]
struct Cli {
    /// Disable ANSI colors in progress output
    #[arg(long, global = true)]
    no_color: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage schema migrations
    Migrations {
        #[command(subcommand)]
        action: Action,
    },
    /// Manage seed data
    Seeds {
        #[command(subcommand)]
        action: Action,
    },
}

impl Commands {
    fn split(self) -> (ArtifactKind, Action) {
        match self {
            Self::Migrations { action } => (ArtifactKind::Migration, action),
            Self::Seeds { action } => (ArtifactKind::Seed, action),
        }
    }
}

#[derive(Args, Debug, Clone, Default)]
struct Target {
    #[arg(short, long)]
    database: Option<String>,
    /// Project root holding `migrations/`, `seeds/` and `modules/`
    #[arg(long)]
    root: Option<PathBuf>,
    /// Restrict to files of one module
    #[arg(short, long)]
    module: Option<String>,
}

#[derive(Subcommand)]
enum Action {
    /// Apply pending files in timestamp order
    Apply {
        #[command(flatten)]
        target: Target,
        /// Stop after this many files
        #[arg(short, long)]
        limit: Option<usize>,
        /// Print pending files and their SQL without executing
        #[arg(long)]
        dry_run: bool,
    },
    /// Revert applied files, newest first
    Rollback {
        #[command(flatten)]
        target: Target,
        #[arg(short, long)]
        limit: Option<usize>,
        /// Skip confirmation prompts
        #[arg(long)]
        yes: bool,
    },
    /// List applied and pending files
    Status {
        #[command(flatten)]
        target: Target,
    },
    /// Create a new timestamped file from a template
    Create {
        /// Name of the file (e.g. create_users)
        name: String,
        #[arg(long)]
        root: Option<PathBuf>,
        #[arg(short, long)]
        module: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing();
    if let Err(err) = run_cli(cli).await {
        println!("{} {}", "[ERROR]".red().bold(), err.to_string().red());
        return Err(err);
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn run_cli(cli: Cli) -> Result<(), BoxError> {
    if cli.no_color {
        colored::control::set_override(false);
    }

    let (kind, action) = cli.command.split();
    tracing::debug!(operation = "cli_command", kind = kind.label(), "splitmig cli");
    match action {
        Action::Create { name, root, module } => {
            let config = load_config(&Target {
                root,
                ..Target::default()
            })?;
            let dir = artifact_dir(&config.root, kind, module.as_deref());
            let file_path = create_artifact_file(kind, &name, &dir)?;
            println!(
                "{} Created {}: {}",
                "[OK]".green(),
                kind.label(),
                file_path.to_string_lossy()
            );
        }
        Action::Apply {
            target,
            limit,
            dry_run,
        } => {
            let options = ApplyOptions {
                limit,
                module: target.module.clone(),
                dry_run,
            };
            run_apply(kind, load_config(&target)?, &options).await?;
        }
        Action::Rollback { target, limit, yes } => {
            let config = load_config(&target)?;
            if !yes && !confirm_action(&format!("Proceed with {} rollback?", kind.label()))? {
                println!("{} Rollback cancelled.", "[INFO]".dimmed());
                return Ok(());
            }
            let options = RollbackOptions {
                limit,
                module: target.module.clone(),
            };
            run_rollback(kind, config, &options).await?;
        }
        Action::Status { target } => {
            run_status(kind, load_config(&target)?, target.module.as_deref()).await?;
        }
    }

    Ok(())
}

/// Environment settings with command-line overrides. A relative cache path
/// is resolved against the project root.
fn load_config(target: &Target) -> Result<Config, BoxError> {
    let config = Config::from_env()?;
    Ok(apply_overrides(config, target))
}

fn apply_overrides(mut config: Config, target: &Target) -> Config {
    if let Some(database) = &target.database {
        config.database_url = database.clone();
    }
    if let Some(root) = &target.root {
        config.root = root.clone();
    }
    if config.cache_path.is_relative() {
        config.cache_path = config.root.join(&config.cache_path);
    }
    config
}

fn confirm_action(prompt: &str) -> Result<bool, BoxError> {
    print!("{} [y/N]: ", prompt);
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let value = input.trim().to_ascii_lowercase();
    Ok(matches!(value.as_str(), "y" | "yes"))
}

async fn connect(config: Config) -> Result<Context, BoxError> {
    println!("{} Connecting to {}...", ">>".cyan(), config.database_url);
    Ok(Context::connect(config).await?)
}

/// Connects and discovers the files of `kind` under the configured root.
async fn connect_with_registry(
    kind: ArtifactKind,
    config: Config,
) -> Result<(Context, Registry), BoxError> {
    let ctx = connect(config).await?;
    let registry = Registry::discover(kind, &ctx.config().root)?;
    Ok((ctx, registry))
}

fn migrator_for(kind: ArtifactKind, ctx: &Context) -> Migrator {
    Migrator::new(kind, ctx.dialect())
}

async fn run_apply(
    kind: ArtifactKind,
    config: Config,
    options: &ApplyOptions,
) -> Result<(), BoxError> {
    let (mut ctx, registry) = connect_with_registry(kind, config).await?;
    if registry.is_empty() {
        println!("{} No {} files found.", "[INFO]".dimmed(), kind.label());
        return Ok(());
    }

    let migrator = migrator_for(kind, &ctx);
    let report = migrator.apply(&mut ctx, &registry, options).await?;

    if options.dry_run {
        if report.planned.is_empty() {
            println!("{} Nothing to apply.", "[INFO]".dimmed());
        }
        for planned in &report.planned {
            println!("{} {}", ">>".cyan(), planned.name.bold());
            if planned.up.is_empty() {
                println!("   (no changes)");
            } else {
                println!("{}", planned.up);
            }
        }
        println!("{} Dry run complete.", "[OK]".green());
        return Ok(());
    }

    for name in &report.applied {
        println!("{} Applied {}", "[OK]".green(), name);
    }
    if report.applied.is_empty() {
        println!("{} Everything is up to date.", "[INFO]".dimmed());
    } else {
        println!(
            "{} {} {} file(s) applied, {} already applied.",
            "[OK]".green(),
            report.applied.len(),
            kind.label(),
            report.skipped.len()
        );
    }
    Ok(())
}

async fn run_rollback(
    kind: ArtifactKind,
    config: Config,
    options: &RollbackOptions,
) -> Result<(), BoxError> {
    let mut ctx = connect(config).await?;
    if ctx.dialect() == splitmig_core::Dialect::Sqlite {
        println!(
            "{} SQLite only runs down scripts it can parse; MySQL-only DDL will fail.",
            "[WARN]".yellow()
        );
    }

    let migrator = migrator_for(kind, &ctx);
    let report = migrator.rollback(&mut ctx, options).await?;
    if report.rolled_back.is_empty() {
        println!("{} No {} files to roll back.", "[INFO]".dimmed(), kind.label());
        return Ok(());
    }
    for name in &report.rolled_back {
        println!("{} Reverted {}", "[OK]".green(), name);
    }
    println!(
        "{} {} file(s) reverted, {} operation(s) undone.",
        "[OK]".green(),
        report.rolled_back.len(),
        report.operations
    );
    Ok(())
}

async fn run_status(
    kind: ArtifactKind,
    config: Config,
    module: Option<&str>,
) -> Result<(), BoxError> {
    let (ctx, registry) = connect_with_registry(kind, config).await?;
    let migrator = migrator_for(kind, &ctx);
    let report = migrator.status(&ctx, &registry, module).await?;

    for item in &report.items {
        let state = match item.state {
            EntryState::Applied => "applied".green(),
            EntryState::Pending => "pending".yellow(),
        };
        match &item.module {
            Some(module) => println!("  [{}] {} ({})", state, item.file_path, module.dimmed()),
            None => println!("  [{}] {}", state, item.file_path),
        }
    }
    println!(
        "{} {} applied, {} pending.",
        "[INFO]".dimmed(),
        report.applied,
        report.pending
    );
    Ok(())
}

fn artifact_dir(root: &Path, kind: ArtifactKind, module: Option<&str>) -> PathBuf {
    match module {
        Some(module) => root.join("modules").join(module).join(kind.directory()),
        None => root.join(kind.directory()),
    }
}

fn create_artifact_file(
    kind: ArtifactKind,
    name: &str,
    dir_path: &Path,
) -> Result<PathBuf, BoxError> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
        return Err(format!("'{}' must contain only letters, digits and underscores", name).into());
    }
    if !dir_path.exists() {
        fs::create_dir_all(dir_path)?;
        println!(
            "{} Created '{}' directory.",
            ">>".cyan(),
            dir_path.to_string_lossy()
        );
    }

    let now = Utc::now();
    let filename = format!(
        "{:010}_{}.{}",
        now.timestamp(),
        name,
        splitmig_core::registry::FILE_EXTENSION
    );
    let file_path = dir_path.join(&filename);
    if file_path.exists() {
        return Err(format!("{} already exists", file_path.to_string_lossy()).into());
    }

    let table = name.strip_prefix("create_").unwrap_or(name);
    let body = match kind {
        ArtifactKind::Migration => format!(
            "[[table]]\nname = \"{table}\"\n\n[[table.column]]\nname = \"id\"\ntype = \"bigint\"\nunsigned = true\nauto_increment = true\nprimary = true\n\n# [[table.column]]\n# name = \"title\"\n# type = \"string\"\n# length = 255\n"
        ),
        ArtifactKind::Seed => format!(
            "[[seed]]\ntable = \"{table}\"\nbatch_size = 100\n# Leave empty to seed every environment.\nenvironments = []\nrows = [\n  # {{ title = \"example\" }},\n]\n"
        ),
    };
    let content = format!(
        "# {}: {}\n# Created at: {}\n\n{}",
        kind.label(),
        name,
        now,
        body
    );

    let mut file = fs::File::create(&file_path)?;
    file.write_all(content.as_bytes())?;
    Ok(file_path)
}
