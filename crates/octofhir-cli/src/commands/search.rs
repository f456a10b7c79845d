use anyhow::Result;
use octofhir_smart_client::FhirClient;

use crate::cli::OutputFormat;
use crate::output::print_value;

fn parse_params(raw_params: &[String], count: Option<u32>) -> Vec<(String, String)> {
    let mut params: Vec<(String, String)> = raw_params
        .iter()
        .map(|p| match p.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (p.clone(), String::new()),
        })
        .collect();

    if let Some(c) = count {
        params.push(("_count".to_string(), c.to_string()));
    }
    params
}

pub async fn search(
    client: &FhirClient,
    resource_type: &str,
    raw_params: &[String],
    count: Option<u32>,
    format: OutputFormat,
) -> Result<()> {
    let params = parse_params(raw_params, count);
    let bundle = client.search(resource_type, &params).await?;
    print_value(&bundle, format);
    Ok(())
}
