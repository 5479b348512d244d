//! HarajPlus CLI - command-line client for the HarajPlus marketplace
//!
//! Sign in once; every later command reuses and silently renews the session.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use harajplus_cli::api::{self, ClientOptions};
use harajplus_cli::auth::{self, LoginMethod};
use harajplus_cli::config::Config;
use harajplus_cli::models::NewAccount;

#[derive(Parser)]
#[command(name = "harajplus-cli")]
#[command(about = "Command-line client for the HarajPlus marketplace", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// API base URL (overrides the config file)
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Keep tokens in memory only; nothing is read from or written to disk
    #[arg(long, global = true)]
    ephemeral: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in with email and password, or with a provider identity token
    Login {
        /// Account email
        #[arg(short, long, required_unless_present = "provider")]
        email: Option<String>,

        /// Password (prompted for when omitted)
        #[arg(short, long, conflicts_with = "provider")]
        password: Option<String>,

        /// External identity provider, e.g. google or apple
        #[arg(long, conflicts_with = "email", requires = "id_token")]
        provider: Option<String>,

        /// Identity token issued by the provider
        #[arg(long, requires = "provider")]
        id_token: Option<String>,
    },

    /// Create an account and sign in
    Register {
        /// Display name
        #[arg(short, long)]
        name: String,

        /// Account email
        #[arg(short, long)]
        email: String,

        /// Mobile number
        #[arg(long)]
        phone: Option<String>,

        /// Password (prompted for when omitted)
        #[arg(short, long)]
        password: Option<String>,
    },

    /// Log out and clear cached credentials
    Logout,

    /// Show current authentication status
    Status,

    /// Show current user info (verify auth works)
    Whoami,

    /// Send an authenticated request and print the response
    Request {
        /// HTTP method (GET, POST, PUT, PATCH, DELETE)
        method: String,

        /// Path relative to the API base URL, e.g. /ads
        path: String,

        /// JSON request body
        #[arg(short, long)]
        data: Option<String>,

        /// Query parameter as key=value (repeatable)
        #[arg(short, long)]
        query: Vec<String>,
    },

    /// Show or change the configuration
    Config {
        /// Persist a new API base URL
        #[arg(long)]
        set_api_url: Option<String>,
    },
}

// One thread: requests parked behind a refresh resume in arrival order
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let options = ClientOptions {
        api_url: cli.api_url,
        ephemeral: cli.ephemeral,
    };

    match cli.command {
        Commands::Login {
            email,
            password,
            provider,
            id_token,
        } => {
            let method = LoginMethod::from_args(email, password, provider, id_token)?;
            auth::login(&options, method).await?;
        }
        Commands::Register {
            name,
            email,
            phone,
            password,
        } => {
            let account = NewAccount {
                name,
                email,
                password: password.unwrap_or_default(),
                phone,
            };
            auth::register(&options, account).await?;
        }
        Commands::Logout => {
            tracing::info!("Logging out...");
            auth::logout(&options).await?;
        }
        Commands::Status => {
            auth::status(&options).await?;
        }
        Commands::Whoami => {
            api::whoami(&options).await?;
        }
        Commands::Request {
            method,
            path,
            data,
            query,
        } => {
            api::request(&options, &method, &path, data.as_deref(), &query).await?;
        }
        Commands::Config { set_api_url } => {
            let mut config = Config::load()?;
            if let Some(url) = set_api_url {
                config.api_base_url = url;
                config.base_url()?;
                config.save()?;
                tracing::info!("Saved configuration");
            }
            println!("Config file:      {}", Config::config_path()?.display());
            println!("API base URL:     {}", config.api_base_url);
            println!("Request timeout:  {}s", config.request_timeout_secs);
            println!("Refresh timeout:  {}s", config.refresh_timeout_secs);
        }
    }

    Ok(())
}
