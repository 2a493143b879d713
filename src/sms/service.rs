use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::config::SmsConfig;
use crate::db::Db;
use crate::models::command::OutboxCommand;
use crate::sms::GatewayStats;
use crate::sms::pool::ModemPool;
use crate::infra::shutdown::Shutdown;

/// Command lifecycle driver: the outbox drain, the inbox matcher, and the
/// cleanup sweep.
///
/// ```text
/// outbox -(send)-> sent -(reply)-> successful (sent row removed)
///   |                |
///   |                +-(no reply past timeout)-> history no_reply
///   +-(stuck past timeout)-> history failed
/// ```
pub struct SmsService {
    pub db: Arc<Db>,
    pub pool: Arc<ModemPool>,
    pub config: SmsConfig,
    pub stats: Arc<GatewayStats>,
}

impl SmsService {
    pub fn new(db: Arc<Db>, config: SmsConfig) -> Self {
        Self {
            pool: Arc::new(ModemPool::new(db.clone())),
            db,
            config,
            stats: Arc::new(GatewayStats::default()),
        }
    }

    /// Main loop: outbox every poll interval, inbox every second cycle,
    /// cleanup on its own timer. Runs the cleanup once at startup so rows
    /// stranded by a crash resolve immediately.
    pub async fn run(self: Arc<Self>, mut shutdown: Shutdown) {
        self.cleanup_pass().await;
        let poll = Duration::from_secs(self.config.outbox_poll_secs);
        let cleanup_every = (self.config.cleanup_interval_secs / self.config.outbox_poll_secs.max(1)).max(1);
        let mut cycle: u64 = 0;
        loop {
            if shutdown.sleep(poll).await {
                tracing::info!("sms service stopping");
                return;
            }
            cycle += 1;
            self.drain_outbox().await;
            if cycle % 2 == 0 {
                self.poll_inboxes().await;
            }
            if cycle % cleanup_every == 0 {
                self.cleanup_pass().await;
            }
            if cycle % 60 == 0 {
                if let Err(e) = self.pool.probe_unhealthy().await {
                    tracing::debug!("modem probe pass failed: {e:#}");
                }
            }
        }
    }

    async fn drain_outbox(&self) {
        let commands = match self.db.poll_outbox(self.config.outbox_batch).await {
            Ok(c) => c,
            Err(e) => {
                tracing::error!("outbox poll failed: {e:#}");
                return;
            }
        };
        for command in commands {
            self.stats.commands_processed.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = self.send_command(&command).await {
                tracing::error!("command {} failed: {e:#}", command.id);
            }
        }
    }

    async fn send_command(&self, command: &OutboxCommand) -> anyhow::Result<()> {
        let modem_config = match self.pool.select_best_modem("commands", command.imei).await? {
            Some(m) => m,
            None => {
                tracing::warn!("no modem available for command {}", command.id);
                return Ok(());
            }
        };
        let modem = self.pool.client_for(&modem_config).await?;
        let result = modem.send_sms(&command.sim_no, &command.command_text).await;

        if result.success {
            self.pool.record_send_success(&modem_config).await;
            self.db.increment_modem_quota(modem_config.id, result.sms_used.max(1)).await?;
            self.db.move_outbox_to_sent(command, modem_config.id, &modem_config.name).await?;
            self.stats.commands_sent.fetch_add(1, Ordering::Relaxed);
            tracing::info!(
                "SMS sent: id={} imei={:?} modem={} parts={}",
                command.id,
                command.imei,
                modem_config.name,
                result.sms_used
            );
        } else {
            self.pool.record_send_failure(&modem_config).await;
            let error = result.error.unwrap_or_else(|| "send failed".to_string());
            let retries = command.retry_count + 1;
            if retries >= self.config.max_retries {
                self.db.fail_outbox_command(command, &error).await?;
                self.stats.commands_failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("command {} failed after {} retries", command.id, self.config.max_retries);
            } else {
                self.db.bump_outbox_retry(command.id, retries).await?;
                tracing::info!("command {} retry {}/{}", command.id, retries, self.config.max_retries);
            }
        }
        Ok(())
    }

    async fn poll_inboxes(&self) {
        let modems = match self.db.inbox_modem_configs().await {
            Ok(m) => m,
            Err(e) => {
                tracing::error!("inbox modem query failed: {e:#}");
                return;
            }
        };
        for config in modems {
            let modem = match self.pool.client_for(&config).await {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!("client for modem {} failed: {e:#}", config.name);
                    continue;
                }
            };
            let messages = match modem.get_inbox().await {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!("inbox fetch failed for {}: {e:#}", config.name);
                    self.pool.record_send_failure(&config).await;
                    continue;
                }
            };
            for message in messages {
                match self.process_incoming(&message.sender, &message.text).await {
                    Ok(matched) => {
                        if matched {
                            self.stats.responses_matched.fetch_add(1, Ordering::Relaxed);
                        }
                        if let Err(e) = modem.delete_message(&message.message_id).await {
                            tracing::warn!("inbox delete failed on {}: {e:#}", config.name);
                        }
                    }
                    Err(e) => tracing::warn!("incoming SMS processing failed: {e:#}"),
                }
            }
        }
    }

    /// Record an incoming SMS and try to close the matching sent command.
    async fn process_incoming(&self, sender: &str, text: &str) -> anyhow::Result<bool> {
        if self.db.is_duplicate_incoming(sender, text).await? {
            self.stats.duplicates_skipped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("skipping duplicate SMS from {sender}");
            return Ok(false);
        }
        let imei = self.db.imei_for_sim(sender).await?;
        self.db.insert_inbox(sender, imei, text).await?;

        match self.db.match_recent_sent(sender, self.config.reply_timeout_mins).await? {
            Some(sent) => {
                self.db.complete_sent_command(&sent, sender, text, imei).await?;
                tracing::info!("reply matched: {sender} -> successful (command_sent {})", sent.id);
                Ok(true)
            }
            None => {
                self.db.insert_unmatched_incoming(imei, sender, text).await?;
                tracing::debug!("unmatched SMS from {sender}");
                Ok(false)
            }
        }
    }

    async fn cleanup_pass(&self) {
        match self.db.timeout_old_outbox(self.config.outbox_timeout_mins).await {
            Ok(0) => {}
            Ok(n) => {
                self.stats.commands_timed_out.fetch_add(n, Ordering::Relaxed);
                tracing::info!("{n} outbox commands timed out as failed");
            }
            Err(e) => tracing::warn!("outbox timeout sweep failed: {e:#}"),
        }
        match self.db.timeout_old_sent(self.config.reply_timeout_mins).await {
            Ok(0) => {}
            Ok(n) => {
                self.stats.no_reply.fetch_add(n, Ordering::Relaxed);
                tracing::info!("{n} sent commands closed as no_reply");
            }
            Err(e) => tracing::warn!("sent timeout sweep failed: {e:#}"),
        }
    }
}
