use anyhow::{anyhow, Context, Result};
use dockvault_core::config::Notify;
use dockvault_core::report::{Notifier, RunSummary};
use std::fs;
use std::io::Write;
use std::process::{Command, Stdio};
use time::format_description::well_known::Rfc2822;
use time::OffsetDateTime;
use tracing::info;

/// Hands the run summary to the local MTA with `sendmail -t`.
pub struct SendmailNotifier {
    recipient: String,
    sender: String,
    sendmail: String,
}

impl SendmailNotifier {
    pub fn new(settings: &Notify) -> Self {
        Self {
            recipient: settings.recipient.clone(),
            sender: settings.sender.clone(),
            sendmail: settings.sendmail.clone(),
        }
    }

    fn compose(&self, summary: &RunSummary, host: &str, date: OffsetDateTime) -> String {
        let date = date.format(&Rfc2822).unwrap_or_default();
        format!(
            "To: {}\nFrom: {}\nDate: {date}\nSubject: {}\nContent-Type: text/plain; charset=utf-8\n\n{}",
            self.recipient,
            self.sender,
            summary.subject(host),
            summary.body()
        )
    }
}

fn hostname() -> String {
    fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|name| name.trim().to_string())
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

impl Notifier for SendmailNotifier {
    fn deliver(&self, summary: &RunSummary) -> Result<()> {
        let message = self.compose(summary, &hostname(), OffsetDateTime::now_utc());
        let mut child = Command::new(&self.sendmail)
            .arg("-t")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to run {}", self.sendmail))?;
        child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("sendmail stdin was not captured"))?
            .write_all(message.as_bytes())
            .context("failed to write message to sendmail")?;
        let output = child.wait_with_output().context("failed to wait for sendmail")?;
        if !output.status.success() {
            return Err(anyhow!(
                "sendmail failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        info!(recipient = %self.recipient, "run summary sent");
        Ok(())
    }
}
