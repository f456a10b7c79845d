use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "octofhir")]
#[command(about = "OctoFHIR CLI: authorize against and query SMART on FHIR servers")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Server base URL (overrides config and OCTOFHIR_URL env var)
    #[arg(short, long, global = true, env = "OCTOFHIR_URL")]
    pub server: Option<String>,

    /// Config profile name
    #[arg(short, long, global = true, env = "OCTOFHIR_PROFILE", default_value = "default")]
    pub profile: String,

    /// Output format
    #[arg(short, long, global = true)]
    pub format: Option<OutputFormat>,

    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Json,
    Table,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Authorize with the server's SMART OAuth endpoints
    Authorize(AuthorizeArgs),
    /// Forget the stored token
    Logout,
    /// Show the stored token's context and expiry
    Whoami,
    /// Read a resource by reference (e.g. Patient/123)
    Get(GetArgs),
    /// Search for resources
    Search(SearchArgs),
    /// Get server CapabilityStatement and SMART endpoints
    Metadata,
    /// Manage CLI configuration
    Config(ConfigArgs),
}

#[derive(Clone, Copy, ValueEnum, Default)]
pub enum Grant {
    /// Authorization code, exchanged at the token endpoint
    #[default]
    Code,
    /// Implicit; the token is returned in the redirect fragment
    Implicit,
}

#[derive(clap::Args)]
pub struct AuthorizeArgs {
    /// OAuth client ID (overrides the profile's auth.client_id)
    #[arg(long)]
    pub client_id: Option<String>,
    /// Redirect URI registered for the client
    #[arg(long)]
    pub redirect_uri: Option<String>,
    /// Space-separated scopes to request
    #[arg(long)]
    pub scope: Option<String>,
    /// Grant type
    #[arg(long)]
    pub grant: Option<Grant>,
    /// Send a PKCE challenge
    #[arg(long)]
    pub pkce: bool,
    /// Use the .well-known/smart-configuration document instead of /metadata
    #[arg(long)]
    pub well_known: bool,
}

#[derive(clap::Args)]
pub struct GetArgs {
    /// Resource reference (e.g. Patient/123)
    pub reference: String,
}

#[derive(clap::Args)]
pub struct SearchArgs {
    /// Resource type (e.g. Patient)
    pub resource_type: String,
    /// Search parameters as key=value pairs (e.g. name=Smith birthdate=gt1990-01-01)
    pub params: Vec<String>,
    /// Number of results per page
    #[arg(long)]
    pub count: Option<u32>,
}

#[derive(clap::Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current config
    Show,
    /// Set config value
    Set(ConfigSetArgs),
}

#[derive(clap::Args)]
pub struct ConfigSetArgs {
    /// Key to set (server, format, client_id, scope, redirect_uri, grant, ...)
    pub key: String,
    /// Value
    pub value: String,
}
