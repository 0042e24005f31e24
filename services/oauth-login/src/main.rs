//! OAuth login CLI
//!
//! Host binary for the session engine:
//! 1. Loads client registration and storage settings
//! 2. Opens the system browser for login and receives the redirect on a
//!    loopback listener
//! 3. Keeps the session encrypted on disk between runs
//! 4. Makes bearer-authenticated calls against the authorization server
//!
//! Usage:
//!   oauth-login [--config <path>] login
//!   oauth-login [--config <path>] logout
//!   oauth-login [--config <path>] status
//!   oauth-login [--config <path>] whoami
//!   oauth-login [--config <path>] call <METHOD> <endpoint> [json-body]

mod browser;
mod callback;
mod config;

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use oauth_client::{FileKeyProvider, KeyProvider, TokenStore};
use oauth_session::SessionFacade;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::browser::SystemBrowser;
use crate::config::Config;

const USAGE: &str = "usage: oauth-login [--config <path>] <login|logout|status|whoami|call <METHOD> <endpoint> [json-body]>";

/// Parsed command line
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Login,
    Logout,
    Status,
    Whoami,
    Call {
        method: String,
        endpoint: String,
        body: Option<String>,
    },
}

/// Split `--config <path>` from the command and its arguments.
fn parse_args(args: &[String]) -> Result<(Option<String>, Command)> {
    let mut config_path = None;
    let mut rest = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            let path = iter.next().context("--config requires a path")?;
            config_path = Some(path.clone());
        } else {
            rest.push(arg.as_str());
        }
    }

    let command = match rest.as_slice() {
        ["login"] => Command::Login,
        ["logout"] => Command::Logout,
        ["status"] => Command::Status,
        ["whoami"] => Command::Whoami,
        ["call", method, endpoint] => Command::Call {
            method: method.to_string(),
            endpoint: endpoint.to_string(),
            body: None,
        },
        ["call", method, endpoint, body] => Command::Call {
            method: method.to_string(),
            endpoint: endpoint.to_string(),
            body: Some(body.to_string()),
        },
        _ => bail!(USAGE),
    };
    Ok((config_path, command))
}

fn key_provider(config: &Config) -> Result<Arc<dyn KeyProvider>> {
    if config.storage.use_keyring {
        #[cfg(feature = "keyring")]
        {
            return Ok(Arc::new(oauth_client::KeyringKeyProvider::new(
                "oauth-login",
                config.client.oauth.client_id.clone(),
            )));
        }
        #[cfg(not(feature = "keyring"))]
        bail!("storage.use_keyring is set but oauth-login was built without the keyring feature");
    }
    Ok(Arc::new(FileKeyProvider::new(config.key_file())))
}

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs on stderr so command output on stdout stays clean
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (cli_config_path, command) = parse_args(&args)?;

    let config_path = Config::resolve_path(cli_config_path.as_deref());
    info!(path = %config_path.display(), "loading configuration");
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        server_url = %config.client.oauth.server_url,
        client_id = %config.client.oauth.client_id,
        store_dir = %config.storage.dir.display(),
        "configuration loaded"
    );

    let keys = key_provider(&config)?;
    let store = TokenStore::new(&config.storage.dir, keys);
    let facade = SessionFacade::new(
        config.client.oauth.clone(),
        store,
        Arc::new(SystemBrowser::from_env()),
    )
    .context("failed to initialize session")?;

    match command {
        Command::Login => login(&facade, &config).await,
        Command::Logout => {
            facade.logout().await.context("logout failed")?;
            println!("Logged out.");
            Ok(())
        }
        Command::Status => {
            if facade.ensure_authenticated().await {
                match facade.current_user().await {
                    Some(user) => println!("Authenticated as {} <{}>", user.id, user.email),
                    None => println!("Authenticated"),
                }
            } else {
                println!("Not authenticated.");
            }
            Ok(())
        }
        Command::Whoami => {
            if !facade.ensure_authenticated().await {
                bail!("not authenticated; run `oauth-login login` first");
            }
            let user = facade
                .refresh_profile()
                .await
                .context("failed to fetch user profile")?;
            println!("{}", serde_json::to_string_pretty(&user)?);
            Ok(())
        }
        Command::Call {
            method,
            endpoint,
            body,
        } => {
            let body = body
                .map(|b| serde_json::from_str::<serde_json::Value>(&b))
                .transpose()
                .context("request body is not valid JSON")?;
            let response = facade
                .call(&endpoint, &method, body.as_ref(), None)
                .await
                .with_context(|| format!("{method} {endpoint} failed"))?;
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
    }
}

/// Serve the redirect receiver, run the browser flow, stop on Ctrl-C.
async fn login(facade: &SessionFacade, config: &Config) -> Result<()> {
    let addr = config.callback.listen_addr;
    if !config.client.oauth.redirect_uri.contains(&config.callback.path) {
        warn!(
            redirect_uri = %config.client.oauth.redirect_uri,
            callback_path = %config.callback.path,
            "redirect_uri does not point at the callback path"
        );
    }

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind callback listener on {addr}"))?;
    info!(%addr, path = %config.callback.path, "callback receiver listening");

    let app = callback::router(facade.clone(), &config.callback.path);
    let server = tokio::spawn(async move { axum::serve(listener, app).await });

    let result = tokio::select! {
        result = facade.login() => result.context("login failed"),
        _ = tokio::signal::ctrl_c() => {
            facade.cancel_login();
            Err(anyhow::anyhow!("login cancelled"))
        }
    };
    server.abort();

    let user = result?;
    match &user.nickname {
        Some(nickname) => println!("Logged in as {nickname} <{}>", user.email),
        None => println!("Logged in as {} <{}>", user.id, user.email),
    }
    Ok(())
}
