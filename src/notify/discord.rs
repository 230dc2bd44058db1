//! Discord webhook notifications for DLQ alerts.

use serde::Serialize;
use tracing::{error, info};

use crate::config::model::DiscordConfig;
use crate::error::NotificationError;
use crate::health::{Alert, AlertSeverity};

/// Sends alert notifications to Discord via webhook.
pub struct DiscordNotifier {
    webhook_url: String,
    /// Optional user or role mention prepended when a critical alert fires.
    mention_on_critical: Option<String>,
    client: reqwest::Client,
}

impl DiscordNotifier {
    pub fn new(config: &DiscordConfig) -> Self {
        Self {
            webhook_url: config.webhook_url.clone(),
            mention_on_critical: config.mention_on_critical.clone(),
            client: reqwest::Client::new(),
        }
    }

    /// Posts one message with an embed per alert. Does nothing for an empty slice.
    pub async fn notify_alerts(&self, alerts: &[Alert]) -> Result<(), NotificationError> {
        if alerts.is_empty() {
            return Ok(());
        }

        let any_critical = alerts
            .iter()
            .any(|a| a.severity == AlertSeverity::Critical);
        let content = if any_critical {
            self.mention_on_critical.clone()
        } else {
            None
        };

        // Discord caps a message at 10 embeds.
        let embeds = alerts.iter().take(10).map(alert_embed).collect();

        self.send(DiscordPayload { content, embeds }).await
    }

    async fn send(&self, payload: DiscordPayload) -> Result<(), NotificationError> {
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            error!(status = %status, body = %text, "Discord webhook failed");
            return Err(NotificationError::DiscordFailed(format!(
                "HTTP {}: {}",
                status, text
            )));
        }

        info!(embeds = payload.embeds.len(), "Discord notification sent");
        Ok(())
    }
}

fn alert_embed(alert: &Alert) -> DiscordEmbed {
    let color = match alert.severity {
        AlertSeverity::Critical => 0xFF0000, // Red
        AlertSeverity::Warning => 0xFFA500,  // Orange
    };

    DiscordEmbed {
        title: alert.title.clone(),
        description: truncate(&alert.message, 2048),
        color,
        fields: vec![
            EmbedField {
                name: "Severity".to_string(),
                value: format!("{:?}", alert.severity),
                inline: true,
            },
            EmbedField {
                name: "Threshold".to_string(),
                value: format_value(alert.metadata.threshold),
                inline: true,
            },
            EmbedField {
                name: "Current".to_string(),
                value: format_value(alert.metadata.current_value),
                inline: true,
            },
        ],
    }
}

/// Discord webhook payload.
#[derive(Serialize)]
struct DiscordPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    embeds: Vec<DiscordEmbed>,
}

#[derive(Serialize)]
struct DiscordEmbed {
    title: String,
    description: String,
    color: u32,
    fields: Vec<EmbedField>,
}

#[derive(Serialize)]
struct EmbedField {
    name: String,
    value: String,
    inline: bool,
}

/// Whole numbers print without decimals, ratios with two.
fn format_value(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{:.0}", value)
    } else {
        format!("{:.2}", value)
    }
}

/// Truncates a string to at most `max_len` bytes on a char boundary.
fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len.saturating_sub(3);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::AlertMetadata;

    #[test]
    fn test_embed_colour_follows_severity() {
        let alert = Alert {
            severity: AlertSeverity::Critical,
            title: "System errors in DLQ".to_string(),
            message: "2 entries failed with system errors".to_string(),
            metadata: AlertMetadata {
                threshold: 0.0,
                current_value: 2.0,
            },
        };

        let embed = alert_embed(&alert);
        assert_eq!(embed.color, 0xFF0000);
        assert_eq!(embed.fields[2].value, "2");
    }

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(100.0), "100");
        assert_eq!(format_value(0.5), "0.50");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghij", 8), "abcde...");
        let s = "ééééé";
        let t = truncate(s, 6);
        assert!(t.ends_with("..."));
        assert!(t.len() <= 6);
    }
}
