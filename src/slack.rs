use chrono::NaiveDate;
use rust_decimal::Decimal;

use crate::config::SlackConfig;
use crate::cost_explorer::BillingReport;
use crate::error::Error;

const SERVICE_COLOR: &str = "#f0f8ff";

/// Anything below a hundredth of a cent is not worth a line.
fn is_negligible(amount: Decimal) -> bool {
    amount.abs() < Decimal::new(1, 4)
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub(crate) struct SlackAttachmentField {
    pub(crate) title: String,
    pub(crate) value: String,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub(crate) struct SlackAttachment {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) fields: Option<Vec<SlackAttachmentField>>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub(crate) struct SlackWebhookPayload {
    pub(crate) text: String,
    pub(crate) channel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) icon_emoji: Option<String>,
    pub(crate) attachments: Vec<SlackAttachment>,
}

pub(crate) trait Notifier {
    fn send(
        &self,
        payload: &SlackWebhookPayload,
    ) -> impl std::future::Future<Output = Result<(), Error>> + Send;
}

/// Builds the message for `report`. `today` is the local date the message is sent on.
pub(crate) fn create_payload(
    report: &BillingReport,
    today: NaiveDate,
    slack: &SlackConfig,
    jpy_rate: Option<Decimal>,
) -> SlackWebhookPayload {
    let mut attachments = vec![SlackAttachment {
        text: Some(format!("Total Cost: {}", format_usd(report.total, jpy_rate))),
        color: None,
        fields: None,
    }];

    attachments.extend(
        report
            .services
            .iter()
            .filter(|service| !is_negligible(service.amount))
            .map(|service| SlackAttachment {
                text: None,
                color: Some(SERVICE_COLOR.to_string()),
                fields: Some(vec![SlackAttachmentField {
                    title: service.name.clone(),
                    value: format_usd(service.amount, jpy_rate),
                }]),
            }),
    );

    SlackWebhookPayload {
        text: format!("{}時点の金額は下記の通りです。", today.format("%Y-%m-%d")),
        channel: slack.channel.clone(),
        username: slack.username.clone(),
        icon_emoji: slack.icon_emoji.clone(),
        attachments,
    }
}

fn format_usd(usd: Decimal, jpy_rate: Option<Decimal>) -> String {
    match jpy_rate {
        Some(rate) => format!(
            "{}$ (¥{})",
            usd,
            crate::exchange_rate::convert_usd_to_jpy(usd, rate)
        ),
        None => format!("{}$", usd),
    }
}

/// Posts to a Slack incoming webhook.
pub(crate) struct SlackWebhook {
    url: String,
}

impl SlackWebhook {
    pub(crate) fn new(url: String) -> Self {
        Self { url }
    }
}

impl Notifier for SlackWebhook {
    async fn send(&self, payload: &SlackWebhookPayload) -> Result<(), Error> {
        let response = crate::CLIENT
            .post(&self.url)
            .json(payload)
            .send()
            .await
            .map_err(|e| Error::Delivery(e.to_string()))?;

        // Slack explains rejections in the body, keep it for the logs.
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Slack rejected the message");
            return Err(Error::Delivery(format!("status {status}: {body}")));
        }

        Ok(())
    }
}

/// Prints the payload instead of posting it.
pub(crate) struct StdoutNotifier;

impl Notifier for StdoutNotifier {
    async fn send(&self, payload: &SlackWebhookPayload) -> Result<(), Error> {
        let json = serde_json::to_string_pretty(payload)
            .map_err(|e| Error::Delivery(e.to_string()))?;
        println!("{json}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost_explorer::ServiceCost;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn slack_config() -> SlackConfig {
        SlackConfig {
            webhook_url: "https://hooks.slack.com/services/T/B/X".to_string(),
            channel: "#aws-bill".to_string(),
            username: None,
            icon_emoji: None,
        }
    }

    fn report(total: &str, services: &[(&str, &str)]) -> BillingReport {
        BillingReport {
            total: total.parse().unwrap(),
            services: services
                .iter()
                .map(|(name, amount)| ServiceCost {
                    name: name.to_string(),
                    amount: amount.parse().unwrap(),
                })
                .collect(),
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 17).unwrap()
    }

    #[test]
    fn test_create_payload() {
        let payload = create_payload(
            &report("150.00", &[("EC2", "100.00"), ("RDS", "50.00")]),
            today(),
            &slack_config(),
            None,
        );

        assert_eq!(payload.text, "2024-05-17時点の金額は下記の通りです。");
        assert_eq!(payload.channel, "#aws-bill");
        assert_eq!(
            serde_json::to_value(&payload.attachments).unwrap(),
            serde_json::json!([
                {"text": "Total Cost: 150.00$"},
                {"color": "#f0f8ff", "fields": [{"title": "EC2", "value": "100.00$"}]},
                {"color": "#f0f8ff", "fields": [{"title": "RDS", "value": "50.00$"}]}
            ])
        );
    }

    #[test]
    fn test_zero_services_are_dropped() {
        let payload = create_payload(
            &report("5.00", &[("EC2", "5.00"), ("S3", "0")]),
            today(),
            &slack_config(),
            None,
        );

        assert_eq!(payload.attachments.len(), 2);
        assert_eq!(
            payload.attachments[1].fields.as_ref().unwrap()[0].title,
            "EC2"
        );
    }

    #[test]
    fn test_negligible_amounts_count_as_zero() {
        let payload = create_payload(
            &report(
                "3.0001",
                &[
                    ("AWS Key Management Service", "0.0000321"),
                    ("Amazon Route 53", "3.0001"),
                    ("Tax", "0.0001"),
                    ("Credits", "-1.50"),
                ],
            ),
            today(),
            &slack_config(),
            None,
        );

        let titles: Vec<_> = payload.attachments[1..]
            .iter()
            .map(|a| a.fields.as_ref().unwrap()[0].title.as_str())
            .collect();
        assert_eq!(titles, vec!["Amazon Route 53", "Tax", "Credits"]);
    }

    #[test]
    fn test_total_line_without_services() {
        let payload = create_payload(&report("0", &[]), today(), &slack_config(), None);
        assert_eq!(
            payload.attachments,
            vec![SlackAttachment {
                text: Some("Total Cost: 0$".to_string()),
                color: None,
                fields: None,
            }]
        );
    }

    #[test]
    fn test_payload_with_jpy() {
        let payload = create_payload(
            &report("10.00", &[("EC2", "10.00")]),
            today(),
            &slack_config(),
            Some(Decimal::new(1555, 1)),
        );

        assert_eq!(
            payload.attachments[0].text.as_deref(),
            Some("Total Cost: 10.00$ (¥1555)")
        );
        assert_eq!(
            payload.attachments[1].fields.as_ref().unwrap()[0].value,
            "10.00$ (¥1555)"
        );
    }

    #[test]
    fn test_payload_serialization_skips_unset_identity() {
        let payload = create_payload(&report("1.00", &[]), today(), &slack_config(), None);
        let json = serde_json::to_value(&payload).unwrap();
        assert!(json.get("username").is_none());
        assert!(json.get("icon_emoji").is_none());

        let mut slack = slack_config();
        slack.username = Some("AWS Bill Notification".to_string());
        slack.icon_emoji = Some(":ghost:".to_string());
        let payload = create_payload(&report("1.00", &[]), today(), &slack, None);
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["username"], "AWS Bill Notification");
        assert_eq!(json["icon_emoji"], ":ghost:");
    }

    /// Accepts one connection, answers it with `status` and `body`, and
    /// returns the raw request it received.
    async fn serve_once(
        status: &'static str,
        body: &'static str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/services/T/B/X", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = read_request(&mut stream).await;

            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
            request
        });

        (url, handle)
    }

    async fn read_request(stream: &mut tokio::net::TcpStream) -> String {
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);

            if let Some(header_end) = request.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&request[..header_end]).to_lowercase();
                let content_length = head
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .and_then(|value| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if request.len() >= header_end + 4 + content_length {
                    break;
                }
            }
        }
        String::from_utf8(request).unwrap()
    }

    #[tokio::test]
    async fn test_webhook_posts_json_payload() {
        let (url, server) = serve_once("200 OK", "ok").await;
        let payload = create_payload(&report("1.00", &[]), today(), &slack_config(), None);

        SlackWebhook::new(url).send(&payload).await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /services/T/B/X HTTP/1.1"));
        assert!(request.to_lowercase().contains("content-type: application/json"));
        assert!(request.contains(r##""channel":"#aws-bill""##));
        assert!(request.contains(r#""text":"Total Cost: 1.00$""#));
    }

    #[tokio::test]
    async fn test_webhook_rejection_is_delivery_error() {
        let (url, server) = serve_once("400 Bad Request", "invalid_payload").await;
        let payload = create_payload(&report("1.00", &[]), today(), &slack_config(), None);

        let res = SlackWebhook::new(url).send(&payload).await;

        server.await.unwrap();
        assert!(
            matches!(&res, Err(Error::Delivery(msg)) if msg.contains("400") && msg.contains("invalid_payload")),
            "{res:?}"
        );
    }

    #[tokio::test]
    async fn test_webhook_server_error_is_delivery_error() {
        let (url, server) = serve_once("500 Internal Server Error", "rollup_error").await;
        let payload = create_payload(&report("1.00", &[]), today(), &slack_config(), None);

        let res = SlackWebhook::new(url).send(&payload).await;

        server.await.unwrap();
        assert!(
            matches!(&res, Err(Error::Delivery(msg)) if msg.contains("500") && msg.contains("rollup_error")),
            "{res:?}"
        );
    }

    #[tokio::test]
    async fn test_webhook_unreachable_is_delivery_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        drop(listener);

        let payload = create_payload(&report("1.00", &[]), today(), &slack_config(), None);
        let res = SlackWebhook::new(url).send(&payload).await;

        assert!(matches!(res, Err(Error::Delivery(_))), "{res:?}");
    }
}
