use colored::Colorize;
use octofhir_smart_client::{AuthorizationPresenter, SmartError};
use url::Url;

/// Shows the authorization URL on the terminal.
///
/// There is no embedded web view in a terminal, so both presentation modes
/// print the URL; the user completes the login in a browser and pastes the
/// redirect back.
pub struct TerminalPresenter;

impl AuthorizationPresenter for TerminalPresenter {
    fn present_embedded(&self, url: &Url) -> Result<(), SmartError> {
        self.open_externally(url)
    }

    fn open_externally(&self, url: &Url) -> Result<(), SmartError> {
        eprintln!("{}", "Open this URL in your browser to authorize:".cyan());
        eprintln!();
        eprintln!("  {url}");
        eprintln!();
        Ok(())
    }
}
