use crate::cli::OutputFormat;
use colored::Colorize;
use octofhir_smart_client::{EndpointSet, Token};
use serde_json::Value;
use tabled::builder::Builder;
use tabled::settings::Style;
use tabled::{Table, Tabled};
use time::OffsetDateTime;

pub fn print_value(value: &Value, format: OutputFormat) {
    match format {
        OutputFormat::Json => println!("{}", pretty(value)),
        OutputFormat::Table => print_as_table(value),
    }
}

pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

pub fn print_endpoints(endpoints: Option<&EndpointSet>) {
    let Some(endpoints) = endpoints else {
        println!("{}: none (open server)", "SMART endpoints".cyan());
        return;
    };

    let mut builder = Builder::default();
    builder.push_record(["Endpoint", "URL"]);
    builder.push_record(["authorize", endpoints.authorization_url.as_str()]);
    for (name, url) in [
        ("token", &endpoints.token_url),
        ("register", &endpoints.registration_url),
    ] {
        builder.push_record([name, url.as_ref().map_or("-", |u| u.as_str())]);
    }
    println!("{}", builder.build().with(Style::rounded()));
}

/// Describes a token without revealing it.
pub fn print_token_summary(token: &Token, leeway: std::time::Duration) {
    println!("{}: {}", "Token type".cyan(), token.token_type);
    println!(
        "{}: {}",
        "Context".cyan(),
        token.context_id.as_deref().unwrap_or("(none)")
    );
    println!(
        "{}: {}",
        "Scope".cyan(),
        token.scope.as_deref().unwrap_or("(not reported)")
    );

    let expiry = match token.expires_at {
        None => "never".to_string(),
        Some(at) if token.is_expired(leeway) => format!("{} ({})", at, "expired".red()),
        Some(at) => {
            let remaining = at - OffsetDateTime::now_utc();
            format!("{} (in {} min)", at, remaining.whole_minutes())
        }
    };
    println!("{}: {}", "Expires".cyan(), expiry);
    println!(
        "{}: {}",
        "Refreshable".cyan(),
        if token.can_refresh() { "yes" } else { "no" }
    );
}

#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Type")]
    resource_type: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Summary")]
    summary: String,
}

impl ResourceRow {
    fn from_resource(resource: &Value) -> Self {
        let field = |name: &str| resource.get(name).and_then(Value::as_str);
        Self {
            resource_type: field("resourceType").unwrap_or("-").to_string(),
            id: field("id").unwrap_or("-").to_string(),
            summary: summarize(resource),
        }
    }
}

/// Short human-readable label: a patient's name, a coded concept's text, or
/// the resource status.
fn summarize(resource: &Value) -> String {
    let name = resource
        .get("name")
        .and_then(Value::as_array)
        .and_then(|names| names.first())
        .map(|name| {
            let given = name
                .get("given")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(Value::as_str);
            given
                .chain(name.get("family").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .filter(|n| !n.is_empty());

    name.or_else(|| {
        resource
            .get("code")
            .and_then(|c| c.get("text"))
            .and_then(Value::as_str)
            .map(str::to_string)
    })
    .or_else(|| resource.get("status").and_then(Value::as_str).map(str::to_string))
    .unwrap_or_else(|| "-".to_string())
}

fn print_as_table(value: &Value) {
    if value.get("resourceType").and_then(Value::as_str) != Some("Bundle") {
        let row = ResourceRow::from_resource(value);
        println!("{} {}/{}", "Resource:".cyan(), row.resource_type.cyan(), row.id.cyan());
        println!("{}", pretty(value));
        return;
    }

    let rows: Vec<ResourceRow> = value
        .get("entry")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.get("resource"))
        .map(ResourceRow::from_resource)
        .collect();

    if rows.is_empty() {
        println!("No resources found.");
    } else {
        println!("{}", Table::new(rows).with(Style::rounded()));
    }
    if let Some(total) = value.get("total").and_then(Value::as_u64) {
        println!("Total: {total}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_summarize() {
        let patient = json!({
            "resourceType": "Patient",
            "name": [{"family": "Smith", "given": ["Jane", "Q"]}]
        });
        assert_eq!(summarize(&patient), "Jane Q Smith");

        let obs = json!({
            "resourceType": "Observation",
            "code": {"text": "Height"},
            "status": "final"
        });
        assert_eq!(summarize(&obs), "Height");

        let enc = json!({"resourceType": "Encounter", "status": "finished"});
        assert_eq!(summarize(&enc), "finished");
        assert_eq!(summarize(&json!({"resourceType": "Basic"})), "-");
    }
}
