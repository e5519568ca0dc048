use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use mulerank_core::Deactivation;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::report::{NewAgent, RunReport};

/// How many agents a notification names before summarizing the rest.
pub const MAX_LISTED_AGENTS: usize = 10;

const SITE_URL: &str = "https://mulerun.com";

#[async_trait]
pub trait RunNotifier: Send + Sync {
    async fn notify(&self, report: &RunReport) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct NoopNotifier;

#[async_trait]
impl RunNotifier for NoopNotifier {
    async fn notify(&self, _report: &RunReport) -> Result<()> {
        Ok(())
    }
}

fn display_author(author: &Option<String>) -> &str {
    author.as_deref().unwrap_or("unknown")
}

fn bulleted<T>(items: &[T], line: impl Fn(&T) -> String) -> String {
    let mut lines = items.iter().take(MAX_LISTED_AGENTS).map(line).collect::<Vec<_>>();
    if items.len() > MAX_LISTED_AGENTS {
        lines.push(format!("... and {} more", items.len() - MAX_LISTED_AGENTS));
    }
    lines.join("\n")
}

pub fn summary_message(report: &RunReport, interval_hours: u64) -> String {
    let summary = &report.summary;
    format!(
        "MuleRun crawl finished\n\n\
         Active agents: {}\n\
         Delisted agents: {}\n\
         Total crawls: {}\n\
         New this run: {}\n\
         Crawl time: {}\n\n\
         Next run in {} hours",
        report.stats.active_agents,
        report.stats.inactive_agents,
        report.stats.total_crawls,
        summary.new_count,
        summary.crawl_time.format("%Y-%m-%d %H:%M:%S UTC"),
        interval_hours,
    )
}

pub fn delisted_message(removed: &[Deactivation]) -> Option<String> {
    match removed {
        [] => None,
        [agent] => Some(format!(
            "Agent delisted\n\nName: {}\nLink: {SITE_URL}{}\nAuthor: {}\n\nThe agent is no longer listed on MuleRun",
            agent.name,
            agent.link,
            display_author(&agent.author),
        )),
        many => Some(format!(
            "{} agents delisted\n\n{}\n\nDetails: {SITE_URL}",
            many.len(),
            bulleted(many, |a| format!("- {} ({})", a.name, display_author(&a.author))),
        )),
    }
}

pub fn new_agents_message(created: &[NewAgent]) -> Option<String> {
    match created {
        [] => None,
        [agent] => Some(format!(
            "New agent listed\n\nName: {}\nLink: {SITE_URL}{}\nAuthor: {}\nRank: #{}",
            agent.name,
            agent.link,
            display_author(&agent.author),
            agent.rank,
        )),
        many => Some(format!(
            "{} new agents listed\n\n{}\n\nDetails: {SITE_URL}",
            many.len(),
            bulleted(many, |a| format!("- #{} {} ({})", a.rank, a.name, display_author(&a.author))),
        )),
    }
}

/// Posts text messages (`{"msg_type":"text","content":{"text":...}}`) to a
/// chat webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    interval_hours: u64,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, interval_hours: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("building webhook client")?;
        Ok(Self {
            client,
            url: url.into(),
            interval_hours,
        })
    }

    pub async fn send_text(&self, text: &str) -> Result<()> {
        let payload = json!({
            "msg_type": "text",
            "content": { "text": text },
        });
        let resp = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .context("posting webhook message")?
            .error_for_status()
            .context("webhook rejected message")?;

        // Chat webhooks answer 200 with an application-level status code.
        let body = resp.json::<serde_json::Value>().await.unwrap_or_default();
        match body.get("code").and_then(|c| c.as_i64()) {
            Some(code) if code != 0 => {
                let msg = body.get("msg").and_then(|m| m.as_str()).unwrap_or("unknown error");
                bail!("webhook returned code {code}: {msg}");
            }
            _ => {
                debug!("webhook message delivered");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl RunNotifier for WebhookNotifier {
    /// Sends every message even when an earlier one fails; the error names
    /// the messages that were not delivered.
    async fn notify(&self, report: &RunReport) -> Result<()> {
        let run_id = report.summary.run_id;
        let messages = [
            delisted_message(&report.deactivated).map(|text| ("delisted", text)),
            new_agents_message(&report.created).map(|text| ("new_agents", text)),
            Some(("summary", summary_message(report, self.interval_hours))),
        ];

        let mut failed = Vec::new();
        for (kind, text) in messages.into_iter().flatten() {
            if let Err(err) = self.send_text(&text).await {
                warn!(%run_id, kind, error = %format!("{err:#}"), "webhook message not delivered");
                failed.push(kind);
            }
        }
        if !failed.is_empty() {
            bail!("webhook messages not delivered: {}", failed.join(", "));
        }
        info!(%run_id, "run notifications sent");
        Ok(())
    }
}
