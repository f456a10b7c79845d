mod cli;
mod commands;
mod config;
mod credentials;
mod observability;
mod output;
mod presenter;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use colored::Colorize;
use octofhir_smart_client::{FhirClient, FhirServer};
use url::Url;

use cli::{Cli, Commands, OutputFormat};
use config::ProfileConfig;
use output::print_error;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    observability::init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        print_error(&format!("{e:#}"));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let profile = &cli.profile;
    let cfg = config::load_profile(profile)?;
    let format = match cli.format {
        Some(format) => format,
        None => configured_format(&cfg)?,
    };

    match &cli.command {
        Commands::Config(args) => match &args.command {
            cli::ConfigCommands::Show => show_config(profile, &cfg),
            cli::ConfigCommands::Set(set_args) => {
                let mut cfg = cfg;
                cfg.set(&set_args.key, &set_args.value)?;
                config::save_profile(profile, &cfg)?;
                output::print_success(&format!("Set {} = {}", set_args.key, set_args.value));
            }
        },
        Commands::Authorize(args) => {
            let server = connect(&cli, &cfg)?;
            commands::auth::authorize(&server, &cfg, args, profile).await?;
        }
        Commands::Logout => {
            let server = connect(&cli, &cfg)?;
            commands::auth::logout(&server, &cfg, profile).await?;
        }
        Commands::Whoami => {
            let server = connect(&cli, &cfg)?;
            commands::auth::whoami(&server, &cfg, profile).await?;
        }
        Commands::Metadata => {
            let server = connect(&cli, &cfg)?;
            commands::server::metadata(&server, format).await?;
        }
        Commands::Get(args) => {
            let server = connect(&cli, &cfg)?;
            let client = make_client(&server, &cfg, profile).await?;
            commands::read::get(&client, &args.reference, format).await?;
        }
        Commands::Search(args) => {
            let server = connect(&cli, &cfg)?;
            let client = make_client(&server, &cfg, profile).await?;
            commands::search::search(
                &client,
                &args.resource_type,
                &args.params,
                args.count,
                format,
            )
            .await?;
        }
    }

    Ok(())
}

fn configured_format(cfg: &ProfileConfig) -> Result<OutputFormat> {
    match cfg.format.as_deref() {
        None => Ok(OutputFormat::default()),
        Some(name) => OutputFormat::from_str(name, true).map_err(|_| {
            anyhow::anyhow!("Invalid format in config: {name} (expected json or table)")
        }),
    }
}

fn connect(cli: &Cli, cfg: &ProfileConfig) -> Result<FhirServer> {
    let server = config::resolve_server(&cli.server, cfg)?;
    let base_url = Url::parse(&server).with_context(|| format!("Invalid server URL: {server}"))?;
    Ok(FhirServer::connect(base_url, cfg.auth.request_timeout)?)
}

/// Client signed with the stored token when there is one.
async fn make_client(
    server: &FhirServer,
    cfg: &ProfileConfig,
    profile: &str,
) -> Result<FhirClient> {
    let tokens = credentials::open_token_store(server.http(), &cfg.auth, profile)?;
    let Some(tokens) = tokens else {
        return Ok(FhirClient::new(server.base_url().clone(), server.http(), None));
    };

    let Some(token) = tokens.current().await else {
        return Ok(FhirClient::new(server.base_url().clone(), server.http(), None));
    };

    if token.is_expired(cfg.auth.token_expiry_leeway) && token.can_refresh() {
        tracing::debug!("Stored token has expired; resolving the token endpoint for refresh");
        tokens.set_token_endpoint(server.token_url().await?).await;
    }
    Ok(FhirClient::new(server.base_url().clone(), server.http(), Some(tokens)))
}

fn show_config(profile: &str, cfg: &ProfileConfig) {
    let auth = &cfg.auth;
    let or_unset = |value: &str| {
        if value.is_empty() {
            "(not set)".to_string()
        } else {
            value.to_string()
        }
    };

    println!("{}: {}", "Profile".cyan(), profile);
    println!("{}: {}", "Server".cyan(), cfg.server.as_deref().unwrap_or("(not set)"));
    println!("{}: {}", "Format".cyan(), cfg.format.as_deref().unwrap_or("json"));
    println!("{}: {}", "Client ID".cyan(), or_unset(&auth.client_id));
    println!(
        "{}: {}",
        "Client secret".cyan(),
        if auth.client_secret.is_some() { "(set)" } else { "(not set)" }
    );
    println!("{}: {}", "Scope".cyan(), or_unset(&auth.scope));
    println!("{}: {}", "Redirect URI".cyan(), or_unset(&auth.redirect_uri));
    println!("{}: {}", "Grant".cyan(), auth.grant);
    println!("{}: {}", "PKCE".cyan(), auth.use_pkce);
    if let Some(audience) = &auth.audience {
        println!("{}: {}", "Audience".cyan(), audience);
    }
    println!("{}: {}", "Context field".cyan(), auth.context_field);
}
