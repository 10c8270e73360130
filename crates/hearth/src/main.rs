use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{LevelFilter, debug, info, warn};
use tokio::net::TcpListener;

use hearth::api::{self, AppState};
use hearth::auth::AuthConfig;
use hearth::db::Database;
use hearth::llm::ModelInvoker;
use hearth::settings::{self, APP_NAME, AppConfig};
use hearth::user::{LockoutPolicy, UserRepository, UserService};

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common)?;
    ctx.init_logging();
    debug!("config path: {}", ctx.config_path.display());

    match cli.command {
        Command::Serve(cmd) => run_async(handle_serve(&ctx, cmd)),
        Command::User { command } => run_async(handle_user(&ctx, command)),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Init(cmd) => handle_init(&ctx, cmd),
    }
}

fn run_async<F: std::future::Future<Output = Result<()>>>(future: F) -> Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?
        .block_on(future)
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Hearth - family chat server over hosted language models.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(short, long, value_name = "PATH", global = true, env = "HEARTH_CONFIG")]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP API server
    Serve(ServeCommand),
    /// Manage user accounts
    User {
        #[command(subcommand)]
        command: UserCommand,
    },
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Write a default config file with a fresh JWT secret
    Init(InitCommand),
}

#[derive(Debug, Args)]
struct ServeCommand {
    /// Address to bind (defaults to the configured host)
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on (defaults to the configured port)
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Debug, Subcommand)]
enum UserCommand {
    /// Create a user account
    Add {
        #[arg(long)]
        email: String,
        #[arg(long, env = "HEARTH_USER_PASSWORD")]
        password: String,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration as TOML
    Show,
    /// Print the config file path
    Path,
}

#[derive(Debug, Args)]
struct InitCommand {
    /// Overwrite an existing config file
    #[arg(long)]
    force: bool,
}

struct RuntimeContext {
    common: CommonOpts,
    config_path: PathBuf,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let config_path = match &common.config {
            Some(path) => path.clone(),
            None => settings::default_config_path()?,
        };
        let config = settings::load(&config_path)?;
        Ok(Self {
            common,
            config_path,
            config,
        })
    }

    fn init_logging(&self) {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{APP_NAME}={level},tower_http={level}")));

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .ok();
        } else {
            let disable_color =
                std::env::var_os("NO_COLOR").is_some() || !io::stderr().is_terminal();
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(!disable_color),
                )
                .try_init()
                .ok();
        }
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.quiet {
            LevelFilter::Error
        } else if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => self
                    .config
                    .logging
                    .level
                    .parse()
                    .unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }
}

async fn handle_serve(ctx: &RuntimeContext, cmd: ServeCommand) -> Result<()> {
    let config = &ctx.config;
    config
        .auth
        .validate()
        .context("invalid auth configuration")?;

    let db = Database::open(&config.database).await?;
    info!("Database ready at {}", config.database.path.display());

    let invoker = ModelInvoker::from_config(config).context("configuring model providers")?;
    let state = AppState::new(config, db.clone(), invoker)?;
    info!(
        "Serving {} model(s), default {}",
        state.registry.models().len(),
        state.registry.default_model().id
    );

    let app = api::create_router(state, config.server.max_body_mb);

    let host = cmd.host.unwrap_or_else(|| config.server.host.clone());
    let port = cmd.port.unwrap_or(config.server.port);
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .context("invalid address")?;

    let listener = TcpListener::bind(addr)
        .await
        .context("binding to address")?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running server")?;

    db.close().await;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, draining connections");
}

async fn handle_user(ctx: &RuntimeContext, command: UserCommand) -> Result<()> {
    match command {
        UserCommand::Add { email, password } => {
            let db = Database::open(&ctx.config.database).await?;
            let service = UserService::new(
                UserRepository::new(db.pool().clone()),
                LockoutPolicy {
                    threshold: ctx.config.auth.lockout_threshold,
                    window_minutes: ctx.config.auth.lockout_minutes,
                },
            );
            let user = service.register(&email, &password).await?;
            db.close().await;
            println!("Created user {} ({})", user.email, user.id);
            Ok(())
        }
    }
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            let mut shown = ctx.config.clone();
            if shown.auth.jwt_secret.is_some() {
                shown.auth.jwt_secret = Some("<redacted>".to_string());
            }
            for provider in shown.providers.values_mut() {
                if provider.api_key.is_some() {
                    provider.api_key = Some("<redacted>".to_string());
                }
            }
            let text = toml::to_string_pretty(&shown).context("serializing config")?;
            print!("{text}");
        }
        ConfigCommand::Path => println!("{}", ctx.config_path.display()),
    }
    Ok(())
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    if ctx.config_path.exists() && !cmd.force {
        anyhow::bail!(
            "config file already exists at {} (use --force to overwrite)",
            ctx.config_path.display()
        );
    }

    let mut config = AppConfig::default();
    config.auth.jwt_secret = Some(AuthConfig::generate_jwt_secret());
    settings::write_default(&ctx.config_path, &config)?;
    println!("Wrote {}", ctx.config_path.display());
    Ok(())
}
