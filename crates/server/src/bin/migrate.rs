use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use db::{
    DBService, Migrator,
    migrator::{MigrationState, MigrationStatus},
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Manage feedback-hub database migrations", long_about = None)]
struct Args {
    /// Database URL (default: DATABASE_URL or sqlite://feedback-hub.db)
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://feedback-hub.db")]
    database_url: String,

    /// Migrations directory (default: MIGRATIONS_DIR or the bundled migrations)
    #[arg(long, env = "MIGRATIONS_DIR")]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply every pending migration
    Up,
    /// Show executed, pending and missing migrations
    Status,
    /// Revert the most recent migrations
    Down {
        #[arg(long, default_value_t = 1)]
        steps: usize,
    },
    /// Create an empty up/down migration pair
    Create { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    let dir = args.dir.unwrap_or_else(db::default_migrations_dir);

    if let Command::Create { name } = &args.command {
        let path = Migrator::create(&dir, name)
            .with_context(|| format!("failed to create migration in {}", dir.display()))?;
        println!("Created {}", path.display());
        return Ok(());
    }

    let migrator = Migrator::load(&dir)
        .with_context(|| format!("failed to load migrations from {}", dir.display()))?;
    let db = DBService::new(&args.database_url)
        .await
        .with_context(|| format!("failed to open {}", args.database_url))?;

    match args.command {
        Command::Up => {
            let applied = migrator.run(&db.pool).await?;
            if applied.is_empty() {
                println!("Database is up to date");
            }
            for name in applied {
                println!("Applied {name}");
            }
        }
        Command::Status => {
            let statuses = migrator.status(&db.pool).await?;
            print!("{}", render_status(&statuses));
        }
        Command::Down { steps } => {
            let reverted = migrator.rollback(&db.pool, steps).await?;
            if reverted.is_empty() {
                println!("Nothing to revert");
            }
            for name in reverted {
                println!("Reverted {name}");
            }
        }
        Command::Create { .. } => {}
    }

    Ok(())
}

fn render_status(statuses: &[MigrationStatus]) -> String {
    let rows: Vec<(String, String, String)> = statuses
        .iter()
        .map(|status| match &status.state {
            MigrationState::Executed {
                executed_at,
                execution_time_ms,
            } => (
                status.name.clone(),
                "executed".to_string(),
                format!(
                    "{} ({} ms)",
                    executed_at.format("%Y-%m-%d %H:%M:%S"),
                    execution_time_ms
                ),
            ),
            MigrationState::Pending => (status.name.clone(), "pending".to_string(), String::new()),
            MigrationState::Missing => (
                status.name.clone(),
                "missing".to_string(),
                "file not found".to_string(),
            ),
        })
        .collect();

    let name_width = rows
        .iter()
        .map(|(name, _, _)| name.len())
        .chain(std::iter::once("MIGRATION".len()))
        .max()
        .unwrap_or_default();

    let mut out = format!("{:<name_width$}  {:<8}  {}\n", "MIGRATION", "STATE", "DETAIL");
    for (name, state, detail) in rows {
        out.push_str(format!("{name:<name_width$}  {state:<8}  {detail}").trim_end());
        out.push('\n');
    }
    out
}
