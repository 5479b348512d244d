//! Login, registration, logout and status commands

use std::io::{self, BufRead, Write};

use anyhow::{bail, Context, Result};
use chrono::Utc;

use super::AuthService;
use crate::api::client::{ClientOptions, HarajClient};
use crate::models::NewAccount;

/// How the user proves who they are at login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginMethod {
    Password {
        email: String,
        password: Option<String>,
    },
    Social {
        provider: String,
        id_token: String,
    },
}

impl LoginMethod {
    /// Pick the login method from the command-line flags.
    pub fn from_args(
        email: Option<String>,
        password: Option<String>,
        provider: Option<String>,
        id_token: Option<String>,
    ) -> Result<Self> {
        match (email, provider, id_token) {
            (None, Some(provider), Some(id_token)) if password.is_none() => {
                Ok(Self::Social { provider, id_token })
            }
            (Some(email), None, None) => Ok(Self::Password { email, password }),
            (None, Some(_), None) => bail!("--provider needs an --id-token"),
            _ => bail!("Use either --email or --provider with --id-token"),
        }
    }
}

/// Sign in and greet the user
pub async fn login(options: &ClientOptions, method: LoginMethod) -> Result<()> {
    let client = HarajClient::connect(options)?;
    sign_in(&client, method).await?;
    greet(&client).await;
    Ok(())
}

async fn sign_in(client: &HarajClient, method: LoginMethod) -> Result<()> {
    match method {
        LoginMethod::Password { email, password } => {
            let password = match password {
                Some(p) => p,
                None => prompt("Password: ")?,
            };
            client
                .auth()
                .login(&email, &password)
                .await
                .context("Login failed")?;
        }
        LoginMethod::Social { provider, id_token } => {
            client
                .auth()
                .social_login(&provider, &id_token)
                .await
                .with_context(|| format!("{} login failed", provider))?;
        }
    }
    Ok(())
}

/// Create an account and sign in
pub async fn register(options: &ClientOptions, mut account: NewAccount) -> Result<()> {
    let client = HarajClient::connect(options)?;
    if account.password.is_empty() {
        account.password = prompt("Choose a password: ")?;
    }

    client
        .auth()
        .register(&account)
        .await
        .context("Registration failed")?;

    greet(&client).await;
    Ok(())
}

/// Clear stored credentials
pub async fn logout(options: &ClientOptions) -> Result<()> {
    let client = HarajClient::connect(options)?;
    client.auth().logout().await;
    println!("Logged out.");
    Ok(())
}

/// Display current auth status
pub async fn status(options: &ClientOptions) -> Result<()> {
    let client = HarajClient::connect(options)?;
    let tokens = client.tokens();

    println!("API:         {}", client.config().api_base_url);

    match (tokens.access_token(), tokens.expires_at()) {
        (Some(_), Some(exp)) if exp <= Utc::now() => {
            println!("Access tok:  expired (renewed on next request)");
        }
        (Some(_), Some(exp)) => {
            println!("Access tok:  valid");
            println!("  expires_at: {}", exp.to_rfc3339());
        }
        (Some(_), None) => println!("Access tok:  present"),
        (None, _) => println!("Access tok:  none"),
    }

    match tokens.refresh_token() {
        Some(_) => println!("Refresh tok: present"),
        None => println!("Refresh tok: none"),
    }

    if !tokens.has_session() {
        println!("\nRun 'harajplus-cli login' to authenticate.");
    }

    Ok(())
}

async fn greet(client: &HarajClient) {
    match client.me().await {
        Ok(me) => println!(
            "Logged in as {}.",
            me.name.as_deref().or(me.email.as_deref()).unwrap_or(&me.id)
        ),
        Err(e) => {
            tracing::warn!("Could not load profile: {}", e);
            println!("Login successful.");
        }
    }
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;

    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read from stdin")?;
    Ok(line.trim_end_matches(&['\r', '\n'][..]).to_string())
}
