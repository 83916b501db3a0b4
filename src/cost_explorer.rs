//! Spend for a date range from AWS Cost Explorer.

use aws_sdk_costexplorer as costexplorer;
use costexplorer::operation::get_cost_and_usage::GetCostAndUsageOutput;
use costexplorer::types::{
    DateInterval, GroupDefinition, GroupDefinitionType, Granularity, ResultByTime,
};
use rust_decimal::Decimal;

use crate::error::Error;
use crate::period::DateRange;

/// Cost Explorer only has an endpoint in this region.
const COST_EXPLORER_REGION: &str = "us-east-1";
const AMORTIZED_COST: &str = "AmortizedCost";
const SERVICE_DIMENSION: &str = "SERVICE";

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ServiceCost {
    pub(crate) name: String,
    pub(crate) amount: Decimal,
}

/// Spend for one date range, in USD.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BillingReport {
    pub(crate) total: Decimal,
    pub(crate) services: Vec<ServiceCost>,
}

pub(crate) trait BillingFetcher {
    fn fetch(
        &self,
        range: &DateRange,
    ) -> impl std::future::Future<Output = Result<BillingReport, Error>> + Send;
}

pub(crate) struct CostExplorerFetcher {
    client: costexplorer::Client,
}

impl CostExplorerFetcher {
    /// Credentials come from the default provider chain (the Lambda role when deployed).
    pub(crate) async fn from_env() -> Self {
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(COST_EXPLORER_REGION))
            .load()
            .await;

        Self {
            client: costexplorer::Client::new(&config),
        }
    }

    async fn get_cost_and_usage(
        &self,
        range: &DateRange,
        group_by: Option<GroupDefinition>,
        next_page_token: Option<String>,
    ) -> Result<GetCostAndUsageOutput, Error> {
        let time_period = DateInterval::builder()
            .start(range.start_param())
            .end(range.end_param())
            .build()
            .map_err(|e| Error::Fetch(e.to_string()))?;

        self.client
            .get_cost_and_usage()
            .time_period(time_period)
            .granularity(Granularity::Monthly)
            .metrics(AMORTIZED_COST)
            .set_group_by(group_by.map(|group| vec![group]))
            .set_next_page_token(next_page_token)
            .send()
            .await
            .map_err(|e| Error::Fetch(costexplorer::error::DisplayErrorContext(e).to_string()))
    }
}

impl BillingFetcher for CostExplorerFetcher {
    async fn fetch(&self, range: &DateRange) -> Result<BillingReport, Error> {
        // Grouped responses leave `Total` empty, so the total needs its own query.
        let output = self.get_cost_and_usage(range, None, None).await?;
        let total = total_from_output(&output)?;
        tracing::info!(total = %total, "Got total cost");

        let service_group = GroupDefinition::builder()
            .r#type(GroupDefinitionType::Dimension)
            .key(SERVICE_DIMENSION)
            .build();
        let services = collect_service_pages(move |next_page_token| {
            self.get_cost_and_usage(range, Some(service_group.clone()), next_page_token)
        })
        .await?;
        tracing::info!(num_services = services.len(), "Got cost per service");

        Ok(BillingReport { total, services })
    }
}

/// Follows `NextPageToken` until the last page of grouped results.
async fn collect_service_pages<F, Fut>(mut get_page: F) -> Result<Vec<ServiceCost>, Error>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: std::future::Future<Output = Result<GetCostAndUsageOutput, Error>>,
{
    let mut services = Vec::new();
    let mut next_page_token = None;

    loop {
        let output = get_page(next_page_token).await?;
        services.extend(services_from_output(&output)?);

        next_page_token = output.next_page_token().map(str::to_string);
        if next_page_token.is_none() {
            return Ok(services);
        }
        tracing::info!(num_services = services.len(), "Fetching next page of services");
    }
}

fn first_result(output: &GetCostAndUsageOutput) -> Result<&ResultByTime, Error> {
    output
        .results_by_time()
        .first()
        .ok_or_else(|| Error::Fetch("no results for the requested period".to_string()))
}

pub(crate) fn total_from_output(output: &GetCostAndUsageOutput) -> Result<Decimal, Error> {
    let amount = first_result(output)?
        .total()
        .and_then(|total| total.get(AMORTIZED_COST))
        .and_then(|metric| metric.amount())
        .ok_or_else(|| Error::Fetch(format!("{AMORTIZED_COST} total is missing")))?;

    parse_amount(amount)
}

pub(crate) fn services_from_output(output: &GetCostAndUsageOutput) -> Result<Vec<ServiceCost>, Error> {
    first_result(output)?
        .groups()
        .iter()
        .map(|group| {
            let name = group
                .keys()
                .first()
                .ok_or_else(|| Error::Fetch("cost group without a service key".to_string()))?;
            let amount = group
                .metrics()
                .and_then(|metrics| metrics.get(AMORTIZED_COST))
                .and_then(|metric| metric.amount())
                .ok_or_else(|| Error::Fetch(format!("{AMORTIZED_COST} missing for {name}")))?;

            Ok(ServiceCost {
                name: name.clone(),
                amount: parse_amount(amount)?,
            })
        })
        .collect()
}

/// Amounts are decimal strings, tiny ones occasionally in scientific notation.
fn parse_amount(amount: &str) -> Result<Decimal, Error> {
    amount
        .parse::<Decimal>()
        .or_else(|_| Decimal::from_scientific(amount))
        .map_err(|e| Error::Fetch(format!("invalid amount {amount:?}: {e}")))
}
