use anyhow::Result;
use colored::Colorize;
use octofhir_smart_client::FhirServer;

use crate::cli::OutputFormat;
use crate::output::{print_endpoints, print_value};

pub async fn metadata(server: &FhirServer, format: OutputFormat) -> Result<()> {
    let metadata = server.metadata().await?;
    let cs = &metadata.document;

    if !matches!(format, OutputFormat::Table) {
        print_value(cs, format);
        return Ok(());
    }

    let software_name = cs
        .get("software")
        .and_then(|s| s.get("name"))
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");
    let software_version = cs
        .get("software")
        .and_then(|s| s.get("version"))
        .and_then(|v| v.as_str())
        .unwrap_or("");

    println!("{}: {} {}", "Server".cyan(), software_name, software_version);
    println!(
        "{}: {}",
        "FHIR Version".cyan(),
        metadata.fhir_version().unwrap_or("unknown")
    );

    let resource_types: Vec<&str> = cs
        .get("rest")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
        .filter_map(|r| r.get("resource").and_then(|v| v.as_array()))
        .flatten()
        .filter_map(|r| r.get("type").and_then(|v| v.as_str()))
        .collect();
    println!("{}: {} resource types", "Resources".cyan(), resource_types.len());
    if !resource_types.is_empty() {
        println!("  {}", resource_types.join(", "));
    }

    print_endpoints(metadata.endpoints.as_ref());
    Ok(())
}
