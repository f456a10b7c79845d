use anyhow::Result;
use octofhir_smart_client::FhirClient;

use crate::cli::OutputFormat;
use crate::output::print_value;

fn parse_reference(reference: &str) -> Result<(&str, &str)> {
    match reference.split_once('/') {
        Some((rt, id)) if !rt.is_empty() && !id.is_empty() => Ok((rt, id)),
        _ => anyhow::bail!("Invalid reference \"{reference}\". Expected format: ResourceType/id"),
    }
}

pub async fn get(client: &FhirClient, reference: &str, format: OutputFormat) -> Result<()> {
    let (rt, id) = parse_reference(reference)?;
    let resource = client.read(rt, id).await?;
    print_value(&resource, format);
    Ok(())
}
