use std::sync::Arc;

use anyhow::{Context, Result};
use colored::Colorize;
use octofhir_smart_client::{
    AuthorizationOutcome, AuthorizationSession, ConformanceResolver, FhirServer,
    PresentationMode, SmartClientConfig, TokenPersistence,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use url::Url;

use crate::cli::{AuthorizeArgs, Grant};
use crate::config::{ProfileConfig, save_profile};
use crate::credentials::{self, FileTokenPersistence};
use crate::output::{print_error, print_success, print_token_summary};
use crate::presenter::TerminalPresenter;

/// Profile auth settings with command-line overrides applied.
fn auth_settings(base: &SmartClientConfig, args: &AuthorizeArgs) -> SmartClientConfig {
    let mut settings = base.clone();
    if let Some(client_id) = &args.client_id {
        settings.client_id = client_id.clone();
    }
    if let Some(redirect_uri) = &args.redirect_uri {
        settings.redirect_uri = redirect_uri.clone();
    }
    if let Some(scope) = &args.scope {
        settings.scope = scope.clone();
    }
    if let Some(grant) = args.grant {
        settings.grant = match grant {
            Grant::Code => "authorization_code",
            Grant::Implicit => "implicit",
        }
        .to_string();
    }
    settings.use_pkce |= args.pkce;
    settings
}

/// The profile to save after authorizing, if the token was stored under a
/// client id other than the profile's.
///
/// Later commands look the token up by the profile's `auth.client_id`.
fn profile_for_client(
    config: &ProfileConfig,
    settings: &SmartClientConfig,
) -> Option<ProfileConfig> {
    if config.auth.client_id == settings.client_id {
        return None;
    }
    Some(ProfileConfig {
        auth: settings.clone(),
        ..config.clone()
    })
}

pub async fn authorize(
    server: &FhirServer,
    config: &ProfileConfig,
    args: &AuthorizeArgs,
    profile: &str,
) -> Result<()> {
    let settings = auth_settings(&config.auth, args);
    let persistence: Arc<dyn TokenPersistence> =
        Arc::new(FileTokenPersistence::for_profile(profile)?);
    let presenter = Arc::new(TerminalPresenter);

    let session = if args.well_known {
        let endpoints = ConformanceResolver::new(server.http())
            .resolve_well_known(server.base_url())
            .await
            .context("Failed to read .well-known/smart-configuration")?;
        AuthorizationSession::from_config(&settings, server.http(), presenter)?
            .endpoints(Some(endpoints))
            .persistence(persistence)
            .build()?
    } else {
        server
            .authorization_session(&settings, presenter, Some(persistence))
            .await
            .context("Failed to resolve the server's SMART endpoints")?
    };

    if !session.is_configured().await {
        anyhow::bail!(
            "{} does not advertise SMART OAuth endpoints; no authorization is needed",
            server.base_url()
        );
    }

    let ticket = session.start(PresentationMode::External).await;

    eprint!("Paste the redirect URL (empty to cancel): ");
    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("Failed to read from stdin")?;

    let line = line.trim();
    if line.is_empty() {
        session.abort().await;
    } else {
        let redirect = Url::parse(line).with_context(|| format!("Invalid redirect URL: {line}"))?;
        if !session.handle_redirect(&redirect).await {
            session.abort().await;
        }
    }

    match ticket.outcome().await {
        AuthorizationOutcome::Authorized { context_id, scope } => {
            print_success(&format!("Authorized with {}", server.base_url().as_str().cyan()));
            if let Some(updated) = profile_for_client(config, &settings) {
                save_profile(profile, &updated)?;
                println!(
                    "{}: auth settings for client \"{}\" saved to profile \"{}\"",
                    "Profile".cyan(),
                    settings.client_id,
                    profile
                );
            }
            if let Some(context_id) = context_id {
                println!("{}: {}", "Patient".cyan(), context_id);
            }
            if let Some(scope) = scope {
                println!("{}: {}", "Scope".cyan(), scope);
            }
            Ok(())
        }
        AuthorizationOutcome::Cancelled(reason) => {
            anyhow::bail!("Authorization cancelled ({reason:?})")
        }
        AuthorizationOutcome::Failed(e) => {
            Err(anyhow::Error::new(e).context(format!("Authorization failed ({})", settings.grant)))
        }
    }
}

pub async fn logout(server: &FhirServer, config: &ProfileConfig, profile: &str) -> Result<()> {
    let Some(tokens) = credentials::open_token_store(server.http(), &config.auth, profile)? else {
        println!("No auth.client_id configured for profile \"{profile}\"");
        return Ok(());
    };

    if tokens.current().await.is_some() {
        tokens.clear().await;
        print_success("Logged out (token removed)");
    } else {
        println!("No token stored for profile \"{profile}\"");
    }
    Ok(())
}

pub async fn whoami(server: &FhirServer, config: &ProfileConfig, profile: &str) -> Result<()> {
    let tokens = credentials::open_token_store(server.http(), &config.auth, profile)?;
    let token = match &tokens {
        Some(tokens) => tokens.current().await,
        None => None,
    };

    let Some(token) = token else {
        print_error(&format!("Not authorized (profile: \"{profile}\")"));
        return Ok(());
    };

    println!("{}: {}", "Profile".cyan(), profile);
    println!("{}: {}", "Server".cyan(), server.base_url().as_str().cyan());
    println!("{}: {}", "Client".cyan(), config.auth.client_id);
    print_token_summary(&token, config.auth.token_expiry_leeway);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> AuthorizeArgs {
        AuthorizeArgs {
            client_id: None,
            redirect_uri: None,
            scope: None,
            grant: None,
            pkce: false,
            well_known: false,
        }
    }

    #[test]
    fn test_auth_settings_keep_profile_values() {
        let base = SmartClientConfig {
            client_id: "from_profile".to_string(),
            use_pkce: true,
            ..SmartClientConfig::default()
        };

        let settings = auth_settings(&base, &args());
        assert_eq!(settings.client_id, "from_profile");
        assert!(settings.use_pkce);
    }

    #[test]
    fn test_auth_settings_overrides() {
        let base = SmartClientConfig::default();
        let args = AuthorizeArgs {
            client_id: Some("cli_app".to_string()),
            redirect_uri: Some("http://localhost:8765/cb".to_string()),
            grant: Some(Grant::Implicit),
            pkce: true,
            ..args()
        };

        let settings = auth_settings(&base, &args);
        assert_eq!(settings.client_id, "cli_app");
        assert_eq!(settings.grant, "implicit");
        // Validation drops PKCE for the implicit grant
        let grant = settings.grant_configuration().unwrap();
        assert!(!grant.use_pkce);
    }

    #[test]
    fn test_profile_follows_client_override() {
        let config = ProfileConfig {
            server: Some("https://ex.org/fhir".to_string()),
            auth: SmartClientConfig {
                client_id: "from_profile".to_string(),
                ..SmartClientConfig::default()
            },
            ..ProfileConfig::default()
        };

        let same = auth_settings(&config.auth, &AuthorizeArgs { pkce: true, ..args() });
        assert!(profile_for_client(&config, &same).is_none());

        let other = auth_settings(
            &config.auth,
            &AuthorizeArgs {
                client_id: Some("cli_app".to_string()),
                ..args()
            },
        );
        let updated = profile_for_client(&config, &other).unwrap();
        assert_eq!(updated.auth.client_id, "cli_app");
        assert_eq!(updated.server.as_deref(), Some("https://ex.org/fhir"));
    }
}
