use crate::error::Error;
use crate::period::ReportPeriod;

const DEFAULT_CHANNEL: &str = "#aws-bill";
const DEFAULT_TIMEZONE: chrono_tz::Tz = chrono_tz::Asia::Tokyo;

#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub(crate) slack: SlackConfig,

    /// Timezone of the date printed in the message.
    pub(crate) timezone: chrono_tz::Tz,
    pub(crate) period: ReportPeriod,
    pub(crate) show_jpy: bool,
}

#[derive(Clone)]
pub(crate) struct SlackConfig {
    pub(crate) webhook_url: String,
    pub(crate) channel: String,
    pub(crate) username: Option<String>,
    pub(crate) icon_emoji: Option<String>,
}

// The webhook URL is a credential, keep it out of the logs.
impl std::fmt::Debug for SlackConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlackConfig")
            .field("webhook_url", &"<redacted>")
            .field("channel", &self.channel)
            .field("username", &self.username)
            .field("icon_emoji", &self.icon_emoji)
            .finish()
    }
}

impl Config {
    pub(crate) fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup. Empty values count as unset.
    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let webhook_url = get("SLACK_WEBHOOK_URL")
            .ok_or_else(|| Error::Config("SLACK_WEBHOOK_URL not set".to_string()))?;
        validate_webhook_url(&webhook_url)?;

        let timezone = match get("NOTIFY_TIMEZONE") {
            Some(tz) => tz
                .parse::<chrono_tz::Tz>()
                .map_err(|_| Error::Config(format!("invalid timezone: {tz}")))?,
            None => DEFAULT_TIMEZONE,
        };

        let period = match get("BILLING_PERIOD") {
            Some(period) => period.parse()?,
            None => ReportPeriod::default(),
        };

        let show_jpy = match get("SHOW_JPY") {
            Some(flag) => flag
                .trim()
                .parse::<bool>()
                .map_err(|_| Error::Config(format!("SHOW_JPY must be true or false, got {flag}")))?,
            None => false,
        };

        Ok(Self {
            slack: SlackConfig {
                webhook_url,
                channel: get("SLACK_CHANNEL").unwrap_or_else(|| DEFAULT_CHANNEL.to_string()),
                username: get("SLACK_USERNAME"),
                icon_emoji: get("SLACK_ICON_EMOJI"),
            },
            timezone,
            period,
            show_jpy,
        })
    }
}

fn validate_webhook_url(url: &str) -> Result<(), Error> {
    if !url.starts_with("https://") {
        return Err(Error::Config(
            "SLACK_WEBHOOK_URL must use https".to_string(),
        ));
    }
    Ok(())
}
