use tracing_subscriber::util::SubscriberInitExt;

pub(crate) mod config;
pub(crate) mod cost_explorer;
pub(crate) mod error;
pub(crate) mod exchange_rate;
pub(crate) mod period;
pub(crate) mod slack;

use cost_explorer::BillingFetcher;
use slack::Notifier;

pub(crate) static CLIENT: std::sync::LazyLock<reqwest::Client> =
    std::sync::LazyLock::new(reqwest::Client::new);

#[derive(Debug, Clone, clap::Parser)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "false")]
    #[arg(help = "Send one notification and exit instead of serving the Lambda runtime")]
    local: bool,

    #[arg(short, long, default_value = "false", requires = "local")]
    #[arg(help = "Print the Slack payload instead of posting it (SLACK_WEBHOOK_URL is still validated)")]
    dry_run: bool,

    #[arg(short = 'c', long, default_value = "false")]
    #[arg(help = "Log to console when running locally")]
    log_to_console: bool,
}

/// Fetches the bill for the configured period and posts it. Nothing is sent
/// unless the fetch succeeded.
pub(crate) async fn bill_notify<F, N>(
    config: &config::Config,
    fetcher: &F,
    notifier: &N,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<(), error::Error>
where
    F: BillingFetcher + Sync,
    N: Notifier + Sync,
{
    let range = config.period.range_for(now.date_naive())?;
    tracing::info!(
        period = %config.period,
        start = %range.start(),
        end = %range.end(),
        "Fetching billing data"
    );

    let report = fetcher.fetch(&range).await?;
    tracing::info!(
        total = %report.total,
        num_services = report.services.len(),
        "Fetched billing data"
    );

    let jpy_rate = if config.show_jpy {
        let rate = exchange_rate::get_usd_jpy_rate().await?;
        tracing::info!(rate = %rate, "Got USD/JPY rate");
        Some(rate)
    } else {
        None
    };

    let today = now.with_timezone(&config.timezone).date_naive();
    let payload = slack::create_payload(&report, today, &config.slack, jpy_rate);

    notifier.send(&payload).await?;
    tracing::info!(
        channel = %payload.channel,
        num_attachments = payload.attachments.len(),
        "Sent bill notification"
    );

    Ok(())
}

async fn run_lambda(config: config::Config) -> Result<(), lambda_runtime::Error> {
    let fetcher = cost_explorer::CostExplorerFetcher::from_env().await;
    let notifier = slack::SlackWebhook::new(config.slack.webhook_url.clone());
    let state = std::sync::Arc::new((config, fetcher, notifier));

    lambda_runtime::run(lambda_runtime::service_fn(
        move |event: lambda_runtime::LambdaEvent<serde_json::Value>| {
            let state = state.clone();
            async move {
                tracing::info!(
                    request_id = %event.context.request_id,
                    "Received scheduled invocation"
                );
                let (config, fetcher, notifier) = &*state;
                if let Err(e) = bill_notify(config, fetcher, notifier, chrono::Utc::now()).await {
                    tracing::error!(error = %e, "Bill notification failed");
                    return Err(e.into());
                }
                Ok::<(), lambda_runtime::Error>(())
            }
        },
    ))
    .await
}

async fn run_once(config: config::Config, dry_run: bool) -> anyhow::Result<()> {
    let fetcher = cost_explorer::CostExplorerFetcher::from_env().await;
    let now = chrono::Utc::now();

    if dry_run {
        bill_notify(&config, &fetcher, &slack::StdoutNotifier, now).await?;
    } else {
        let notifier = slack::SlackWebhook::new(config.slack.webhook_url.clone());
        bill_notify(&config, &fetcher, &notifier, now).await?;
    }

    Ok(())
}

/// Lambda ships stdout to CloudWatch Logs, so it only gets JSON on stdout.
/// Local runs keep a rolling JSON log file and optionally a console layer.
fn init_tracing(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::Layer;
    use tracing_subscriber::layer::SubscriberExt;

    if !args.local {
        let stdout_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stdout)
            .with_filter(tracing::level_filters::LevelFilter::INFO);
        tracing_subscriber::registry().with(stdout_layer).init();
        return None;
    }

    let file_appender = tracing_appender::rolling::daily("./log", "bill_notify.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .json()
        .with_filter(tracing::level_filters::LevelFilter::INFO)
        .boxed();

    let pretty_layer = tracing_subscriber::fmt::layer()
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stdout)
        .with_filter(tracing::level_filters::LevelFilter::INFO)
        .boxed();

    let registry = tracing_subscriber::registry().with(file_layer);

    if args.log_to_console {
        registry.with(pretty_layer).init();
    } else {
        registry.init();
    };

    Some(guard)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;
    let args = Args::parse();

    if args.local {
        // A missing .env is fine, the environment may already be set.
        let _ = dotenvy::dotenv();
    }

    let _guard = init_tracing(&args);

    // Dry runs validate the same configuration as the deployed function,
    // including the webhook URL they never post to.
    let config = match config::Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            return Err(e.into());
        }
    };

    tracing::info!(config =? config, args =? args, "Starting bill notifier");

    if !args.local {
        return run_lambda(config).await.map_err(|e| anyhow::anyhow!(e));
    }

    // Same limit as the deployed function.
    const TIMEOUT: u64 = 5 * 60;
    tokio::select! {
        res = run_once(config, args.dry_run) => match res {
            Ok(_) => tracing::info!("Bill notifier finished"),
            Err(e) => {
                tracing::error!(error =? e, "Error when sending bill notification");
                return Err(e);
            }
        },
        _ = tokio::time::sleep(std::time::Duration::from_secs(TIMEOUT)) => {
            tracing::error!(timeout = TIMEOUT, "Timeout when sending bill notification");
            anyhow::bail!("timed out after {TIMEOUT} seconds");
        }
    }

    Ok(())
}
