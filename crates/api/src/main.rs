//! `gatehouse` - serve the security endpoints and run security maintenance.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use secrecy::SecretString;
use tracing::{info, warn};

use gatehouse_auth::{Menu, SecurityConfig};
use gatehouse_infra::converge::ConvergeMapping;
use gatehouse_infra::store::{
    EncryptedColumnStore, InMemorySecurityStore, PostgresSecurityStore, SecurityStore,
};
use gatehouse_infra::{InMemorySessionStore, SecurityManager};
use gatehouse_observability::{LogConfig, LogFormat};

#[derive(Parser)]
#[command(name = "gatehouse", about = "Role and permission security service")]
struct Args {
    /// Security configuration (TOML)
    #[arg(long, env = "GATEHOUSE_CONFIG")]
    config: PathBuf,

    /// PostgreSQL URL; an in-memory store is used when absent
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Default log filter, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    log_level: String,

    #[arg(long, value_enum, default_value_t = LogFormatArg::Json)]
    log_format: LogFormatArg,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormatArg {
    Json,
    Pretty,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP endpoints
    Serve {
        #[arg(long, default_value = "0.0.0.0:8080")]
        bind: SocketAddr,
    },
    /// Create the admin and public roles and register the security views
    Init,
    /// Create a user holding the admin role
    CreateAdmin {
        #[arg(long)]
        username: String,
        #[arg(long)]
        firstname: String,
        #[arg(long)]
        lastname: String,
        #[arg(long)]
        email: String,
        #[arg(long, env = "GATEHOUSE_ADMIN_PASSWORD")]
        password: String,
    },
    /// Set a user's password
    ResetPassword {
        #[arg(long)]
        username: String,
        #[arg(long, env = "GATEHOUSE_NEW_PASSWORD")]
        password: String,
    },
    /// Apply a permission migration mapping (JSON)
    Converge {
        #[arg(long)]
        mapping: PathBuf,
        /// Apply the mapping backwards (downgrade)
        #[arg(long)]
        reverse: bool,
        /// View names that must survive even when nothing references them
        #[arg(long = "keep-view")]
        keep_views: Vec<String>,
    },
    /// Re-encrypt every encrypted column from PREVIOUS_SECRET_KEY to SECRET_KEY
    ReEncryptSecrets,
}

struct Stores {
    security: Arc<dyn SecurityStore>,
    columns: Arc<dyn EncryptedColumnStore>,
}

async fn open_stores(database_url: Option<&str>) -> Result<Stores> {
    match database_url {
        Some(url) => {
            let store = Arc::new(
                PostgresSecurityStore::connect(url)
                    .await
                    .context("failed to connect to the database")?,
            );
            Ok(Stores {
                security: store.clone(),
                columns: store,
            })
        }
        None => {
            warn!("DATABASE_URL not set; using an in-memory store");
            let store = Arc::new(InMemorySecurityStore::new());
            Ok(Stores {
                security: store.clone(),
                columns: store,
            })
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    gatehouse_observability::init(&LogConfig {
        level: args.log_level.clone(),
        format: match args.log_format {
            LogFormatArg::Json => LogFormat::Json,
            LogFormatArg::Pretty => LogFormat::Pretty,
        },
    });

    let config = SecurityConfig::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    let stores = open_stores(args.database_url.as_deref()).await?;
    let security = Arc::new(
        SecurityManager::builder(config, stores.security.clone())
            .build()
            .context("invalid security configuration")?,
    );

    match args.cmd {
        Commands::Serve { bind } => serve(security, bind).await,
        Commands::Init => {
            init(&security)?;
            Ok(())
        }
        Commands::CreateAdmin {
            username,
            firstname,
            lastname,
            email,
            password,
        } => {
            let user = security.create_admin(
                &username,
                &firstname,
                &lastname,
                &email,
                &SecretString::from(password),
            )?;
            info!(username = %user.username, "admin user created");
            Ok(())
        }
        Commands::ResetPassword { username, password } => {
            let user = security
                .find_user(&username)?
                .with_context(|| format!("user '{username}' not found"))?;
            security.reset_password(user.id, &SecretString::from(password))?;
            Ok(())
        }
        Commands::Converge {
            mapping,
            reverse,
            keep_views,
        } => {
            let mut mapping = ConvergeMapping::load(&mapping)?;
            if reverse {
                mapping = mapping.reversed();
            }
            let (views, _) = security.security_views();
            let declared: BTreeSet<String> = views
                .into_iter()
                .map(|v| v.name)
                .chain(keep_views)
                .collect();
            let report = security.converge(&mapping, Some(&declared))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::ReEncryptSecrets => {
            let report = security.rotate_secrets(stores.columns.as_ref())?;
            info!(
                columns = report.columns.len(),
                migrated = report.migrated(),
                "secrets re-encrypted"
            );
            Ok(())
        }
    }
}

fn init(security: &SecurityManager) -> Result<()> {
    security.create_db()?;
    let report = security.register_views(&[], &Menu::new())?;
    info!(?report, "security views registered");
    Ok(())
}

async fn serve(security: Arc<SecurityManager>, bind: SocketAddr) -> Result<()> {
    init(&security)?;

    let app = gatehouse_api::app::build_app(security, Arc::new(InMemorySessionStore::new()));
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;

    info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
