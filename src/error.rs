/// Every way a notification run can fail. None of them are retried here, the
/// scheduler decides whether to invoke again.
#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to fetch billing data: {0}")]
    Fetch(String),

    #[error("Failed to deliver notification: {0}")]
    Delivery(String),
}
