//! Fetch the list-query filter for the calling identity.

use anyhow::Result;
use clap::Args;

use tenantguard_core::api::{FilterRequest, FilterResponse};

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct FilterArgs {
    /// Resource type to list (invoice, customer, job, ...)
    resource_type: String,
}

pub async fn execute(args: FilterArgs, client: &ApiClient, format: OutputFormat) -> Result<()> {
    let response: FilterResponse = client
        .post(
            "/v1/filters",
            &FilterRequest {
                resource_type: args.resource_type,
            },
        )
        .await?;

    match format {
        OutputFormat::Table => {
            output::print_header(&format!("Read filter for {}", response.resource_type));
            println!("  WHERE {}", response.sql.clause);
            for (i, param) in response.sql.params.iter().enumerate() {
                output::print_detail(&format!("${}", i + 1), param);
            }
            if response.predicate.is_false() {
                output::print_info("No rows of this type are visible to the caller");
            }
            Ok(())
        }
        _ => output::print_item(&response, format),
    }
}
