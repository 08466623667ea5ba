//! m365-broker - command line front end.
//!
//! Runs the self-test, fetches Graph resources and manages delegated sign-in
//! against the configured app registration. Results are printed as JSON.

#![deny(clippy::all)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use m365_broker::auth::oauth::{parse_callback_url, PkceChallenge};
use m365_broker::auth::{FileTokenStore, MemoryTokenStore, TokenBroker, TokenStore};
use m365_broker::config::StoreKind;
use m365_broker::diagnostics::DiagnosticRunner;
use m365_broker::graph::{GraphClient, GraphRequest};
use m365_broker::rest::{RestService, Route};
use m365_broker::{Capabilities, Config, Principal, RequestContext};

#[derive(Parser)]
#[command(name = "m365-broker", version, about = "Microsoft 365 token broker and Graph client")]
struct Cli {
    /// Configuration file; the embedded defaults are used when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Object id of the signed-in user to act for.
    #[arg(long, global = true)]
    user: Option<String>,

    /// User principal name, used in messages only.
    #[arg(long, global = true)]
    upn: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the configuration self-test.
    Diagnose,
    /// Call a fixed Graph route.
    Get {
        #[arg(value_enum)]
        route: RouteArg,
        /// User id or UPN for the `user` route.
        #[arg(long)]
        id: Option<String>,
    },
    /// Send an allowlisted request to Graph.
    Fetch {
        endpoint: String,
        /// JSON body; the request is sent as POST when present.
        #[arg(long)]
        body: Option<String>,
        /// Extra header as `Name: value`.
        #[arg(long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,
        /// Prefer an application-only token.
        #[arg(long)]
        application: bool,
        /// Return the response body base64 encoded.
        #[arg(long)]
        binary: bool,
        #[arg(long)]
        scope: Option<String>,
    },
    /// Print an access token.
    Token {
        #[arg(long)]
        scope: Option<String>,
        /// Use the client credentials grant instead of the user's session.
        #[arg(long)]
        application: bool,
    },
    /// Print a sign-in URL with the PKCE verifier and state needed to redeem it.
    SignInUrl,
    /// Redeem the URL the identity provider redirected to after sign-in.
    ///
    /// The session is kept in the token store; with `token.store = "memory"` it
    /// is lost when the command exits.
    Redeem {
        callback_url: String,
        #[arg(long)]
        verifier: String,
        #[arg(long)]
        state: String,
    },
    /// Evict the cached tokens of the user.
    SignOut,
}

#[derive(Clone, Copy, ValueEnum)]
enum RouteArg {
    User,
    Users,
    Myorganization,
    Me,
    Groups,
    Drives,
    Sites,
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected 'Name: value', got '{raw}'"))?;
    Ok((name.trim().to_string(), value.trim().to_string()))
}

fn main() -> ExitCode {
    // Load .env file (if present) before anything else
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path),
        None => Config::load(),
    };
    let config = match config {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config.logging.level);
    info!("Starting m365-broker v{}", env!("CARGO_PKG_VERSION"));

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create Tokio runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli, config)) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Initialize tracing/logging. Logs go to stderr; stdout carries the JSON output.
fn init_logging(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

fn open_store(config: &Config) -> Result<Arc<dyn TokenStore>> {
    Ok(match config.token.store {
        StoreKind::Memory => Arc::new(MemoryTokenStore::new()),
        StoreKind::File => {
            let path = match &config.token.store_path {
                Some(path) => path.clone(),
                None => FileTokenStore::default_path().context("No cache directory available")?,
            };
            info!("Using token store {}", path.display());
            Arc::new(FileTokenStore::new(path))
        }
    })
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Execute the command. Returns false when the command ran but reported a failure.
async fn run(cli: Cli, config: Config) -> Result<bool> {
    let config = Arc::new(config);
    let capabilities = Capabilities::from_names(&config.features.enabled);
    let store = open_store(&config)?;
    let broker = Arc::new(
        TokenBroker::new(Arc::clone(&config), store).context("Failed to create token broker")?,
    );
    let graph = Arc::new(
        GraphClient::new(Arc::clone(&config), Arc::clone(&broker), capabilities.clone())
            .context("Failed to create Graph client")?,
    );

    let principal = cli.user.map(|id| Principal {
        upn: cli.upn.unwrap_or_else(|| id.clone()),
        id,
    });
    let ctx = match principal {
        Some(principal) => RequestContext::for_principal(principal),
        None => RequestContext::anonymous(),
    };

    match cli.command {
        Command::Diagnose => {
            let runner = DiagnosticRunner::new(config, broker, graph, capabilities);
            let results = runner.run(&ctx, true).await;
            print_json(&serde_json::to_value(&results)?)?;
            Ok(results.iter().all(|r| r.passed))
        }
        Command::Get { route, id } => {
            let route = match route {
                RouteArg::User => Route::User(id.context("--id is required for the user route")?),
                RouteArg::Users => Route::Users,
                RouteArg::Myorganization => Route::MyOrganization,
                RouteArg::Me => Route::Me,
                RouteArg::Groups => Route::Groups,
                RouteArg::Drives => Route::Drives,
                RouteArg::Sites => Route::Sites,
            };
            let rest = RestService::new(graph, broker, capabilities);
            let response = rest.dispatch(&ctx, route).await;
            print_json(&response.body)?;
            Ok(response.status < 400)
        }
        Command::Fetch {
            endpoint,
            body,
            headers,
            application,
            binary,
            scope,
        } => {
            let mut request = match body {
                Some(body) => {
                    let body: Value =
                        serde_json::from_str(&body).context("--body must be valid JSON")?;
                    GraphRequest::post(endpoint, body)
                }
                None => GraphRequest::get(endpoint),
            };
            for (name, value) in headers {
                request = request.with_header(name, value);
            }
            if application {
                request = request.application();
            }
            if binary {
                request = request.binary();
            }
            if let Some(scope) = scope {
                request = request.with_scope(scope);
            }

            let response = graph.fetch(&ctx, &request).await?;
            print_json(&json!({
                "status": response.status_code,
                "payload": response.payload,
            }))?;
            Ok(true)
        }
        Command::Token { scope, application } => {
            let token = if application {
                let scope = scope.unwrap_or_else(|| config.graph_default_scope());
                broker.get_app_only_access_token(&scope, None).await?
            } else {
                let scope = scope.unwrap_or_else(|| broker.resource_scope());
                broker.get_access_token(&ctx, &scope).await?
            };
            print_json(&json!({
                "access_token": token.bearer(),
                "kind": token.kind,
                "scope": token.scope,
                "expires_on": token.expiry.to_rfc3339(),
            }))?;
            Ok(true)
        }
        Command::SignInUrl => {
            let pkce = PkceChallenge::new();
            let (url, state) = broker.sign_in_url(&pkce)?;
            print_json(&json!({
                "url": url.as_str(),
                "state": state,
                "verifier": pkce.verifier,
            }))?;
            Ok(true)
        }
        Command::Redeem {
            callback_url,
            verifier,
            state,
        } => {
            let (code, returned_state) = parse_callback_url(&callback_url)?;
            if returned_state != state {
                anyhow::bail!("State mismatch - possible CSRF attack");
            }
            let token = broker.complete_sign_in(&ctx, &code, &verifier).await?;
            print_json(&json!({
                "scope": token.scope,
                "scopes": token.scopes(),
                "expires_on": token.expiry.to_rfc3339(),
            }))?;
            Ok(true)
        }
        Command::SignOut => {
            let principal = ctx
                .principal
                .as_ref()
                .context("--user is required to sign out")?;
            let removed = broker.sign_out(principal)?;
            print_json(&json!({ "removed": removed }))?;
            Ok(true)
        }
    }
}
