use crate::db::Db;
use crate::infra::crypto;
use crate::models::command::{ModemConfig, ModemHealth, OutboxCommand, SentCommand};

fn modem_from_row(row: &tokio_postgres::Row) -> ModemConfig {
    ModemConfig {
        id: row.get(0),
        name: row.get(1),
        host: row.get(2),
        username: row.get(3),
        password: crypto::decrypt(row.get::<_, String>(4).as_str()),
        sim_slot: row.get(5),
        health: ModemHealth::parse(row.get::<_, String>(6).as_str()),
        sms_sent_count: row.get(7),
        sms_limit: row.get(8),
    }
}

const MODEM_COLS: &str =
    "id, name, host, username, password_encrypted, modem_id, health_status, sms_sent_count, sms_limit";

/// SMS gateway queries: outbox/sent/inbox/history lifecycle and the modem
/// pool. Health ordering is healthy > unknown > degraded; unhealthy and
/// quota-exhausted modems never leave the selector.
impl Db {
    pub async fn poll_outbox(&self, limit: i64) -> anyhow::Result<Vec<OutboxCommand>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT id, imei, sim_no, command_text, config_id, user_id, retry_count, created_at \
                 FROM command_outbox WHERE send_method = 'sms' ORDER BY created_at ASC LIMIT $1",
                &[&limit],
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| OutboxCommand {
                id: r.get(0),
                imei: r.get(1),
                sim_no: r.get(2),
                command_text: r.get(3),
                config_id: r.get(4),
                user_id: r.get(5),
                retry_count: r.get(6),
                created_at: r.get(7),
            })
            .collect())
    }

    /// Sent successfully: record in `command_sent` and history, drop from
    /// the outbox, all in one transaction.
    pub async fn move_outbox_to_sent(
        &self,
        command: &OutboxCommand,
        modem_id: i64,
        modem_name: &str,
    ) -> anyhow::Result<()> {
        let mut client = self.client().await?;
        let tx = client.transaction().await?;
        tx.execute(
            "INSERT INTO command_sent (imei, sim_no, command_text, config_id, user_id, send_method, \
             status, modem_id, modem_name, created_at, sent_at) \
             VALUES ($1, $2, $3, $4, $5, 'sms', 'sent', $6, $7, $8, NOW())",
            &[
                &command.imei,
                &command.sim_no,
                &command.command_text,
                &command.config_id,
                &command.user_id,
                &modem_id,
                &modem_name,
                &command.created_at,
            ],
        )
        .await?;
        tx.execute(
            "INSERT INTO command_history (imei, sim_no, direction, command_text, config_id, status, \
             send_method, user_id, modem_id, modem_name, created_at, sent_at) \
             VALUES ($1, $2, 'outgoing', $3, $4, 'sent', 'sms', $5, $6, $7, $8, NOW())",
            &[
                &command.imei,
                &command.sim_no,
                &command.command_text,
                &command.config_id,
                &command.user_id,
                &modem_id,
                &modem_name,
                &command.created_at,
            ],
        )
        .await?;
        tx.execute("DELETE FROM command_outbox WHERE id = $1", &[&command.id]).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Out of retries: record a failed send and drop the outbox row.
    pub async fn fail_outbox_command(&self, command: &OutboxCommand, error: &str) -> anyhow::Result<()> {
        let mut client = self.client().await?;
        let tx = client.transaction().await?;
        tx.execute(
            "INSERT INTO command_sent (imei, sim_no, command_text, config_id, user_id, send_method, \
             status, error_message, created_at, sent_at) \
             VALUES ($1, $2, $3, $4, $5, 'sms', 'failed', $6, $7, NOW())",
            &[
                &command.imei,
                &command.sim_no,
                &command.command_text,
                &command.config_id,
                &command.user_id,
                &error,
                &command.created_at,
            ],
        )
        .await?;
        tx.execute(
            "INSERT INTO command_history (imei, sim_no, direction, command_text, config_id, status, \
             send_method, user_id, created_at) \
             VALUES ($1, $2, 'outgoing', $3, $4, 'failed', 'sms', $5, NOW())",
            &[
                &command.imei,
                &command.sim_no,
                &command.command_text,
                &command.config_id,
                &command.user_id,
            ],
        )
        .await?;
        tx.execute("DELETE FROM command_outbox WHERE id = $1", &[&command.id]).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn bump_outbox_retry(&self, id: i64, retry_count: i32) -> anyhow::Result<()> {
        let client = self.client().await?;
        client
            .execute("UPDATE command_outbox SET retry_count = $1 WHERE id = $2", &[&retry_count, &id])
            .await?;
        Ok(())
    }

    // ── Modem pool ──

    pub async fn device_modem_id(&self, imei: i64) -> anyhow::Result<Option<i64>> {
        let client = self.client().await?;
        let row = client.query_opt("SELECT modem_id FROM unit WHERE imei = $1", &[&imei]).await?;
        Ok(row.and_then(|r| r.get(0)))
    }

    /// Device-pinned modem, only when usable.
    pub async fn modem_if_available(&self, modem_id: i64) -> anyhow::Result<Option<ModemConfig>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                format!(
                    "SELECT {MODEM_COLS} FROM alarms_sms_modems \
                     WHERE id = $1 AND enabled = TRUE \
                       AND health_status NOT IN ('unhealthy', 'quota_exhausted') \
                       AND sms_sent_count < sms_limit"
                ).as_str(),
                &[&modem_id],
            )
            .await?;
        Ok(row.as_ref().map(modem_from_row))
    }

    /// Best modem in a service pool: health rank, then remaining quota, then
    /// operator priority.
    pub async fn select_service_modem(&self, service: &str) -> anyhow::Result<Option<ModemConfig>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                format!(
                    "SELECT {MODEM_COLS} FROM alarms_sms_modems \
                     WHERE enabled = TRUE \
                       AND health_status NOT IN ('unhealthy', 'quota_exhausted') \
                       AND sms_sent_count < sms_limit \
                       AND $1 = ANY(COALESCE(allowed_services, ARRAY['alarms', 'commands'])) \
                     ORDER BY CASE health_status WHEN 'healthy' THEN 0 WHEN 'unknown' THEN 1 ELSE 2 END, \
                              (sms_limit - sms_sent_count) DESC, priority DESC \
                     LIMIT 1"
                ).as_str(),
                &[&service],
            )
            .await?;
        Ok(row.as_ref().map(modem_from_row))
    }

    /// Last resort: any usable modem regardless of service class.
    pub async fn select_any_modem(&self) -> anyhow::Result<Option<ModemConfig>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                format!(
                    "SELECT {MODEM_COLS} FROM alarms_sms_modems \
                     WHERE enabled = TRUE \
                       AND health_status NOT IN ('unhealthy', 'quota_exhausted') \
                       AND sms_sent_count < sms_limit \
                     ORDER BY CASE health_status WHEN 'healthy' THEN 0 WHEN 'unknown' THEN 1 ELSE 2 END, \
                              (sms_limit - sms_sent_count) DESC, priority DESC \
                     LIMIT 1"
                ).as_str(),
                &[],
            )
            .await?;
        Ok(row.as_ref().map(modem_from_row))
    }

    /// Count consumed parts against the modem and its per-day usage row.
    pub async fn increment_modem_quota(&self, modem_id: i64, sms_used: i32) -> anyhow::Result<()> {
        let mut client = self.client().await?;
        let tx = client.transaction().await?;
        tx.execute(
            "UPDATE alarms_sms_modems SET sms_sent_count = sms_sent_count + $1 WHERE id = $2",
            &[&sms_used, &modem_id],
        )
        .await?;
        tx.execute(
            "INSERT INTO alarms_sms_modem_usage (modem_id, usage_date, sms_count) \
             VALUES ($1, CURRENT_DATE, $2) \
             ON CONFLICT (modem_id, usage_date) DO UPDATE SET \
               sms_count = alarms_sms_modem_usage.sms_count + EXCLUDED.sms_count",
            &[&modem_id, &sms_used],
        )
        .await?;
        tx.execute(
            "UPDATE alarms_sms_modems SET health_status = 'quota_exhausted' \
             WHERE id = $1 AND sms_sent_count >= sms_limit \
               AND health_status NOT IN ('unhealthy')",
            &[&modem_id],
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn set_modem_health(&self, modem_id: i64, health: ModemHealth) -> anyhow::Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "UPDATE alarms_sms_modems SET health_status = $1 WHERE id = $2",
                &[&health.as_str(), &modem_id],
            )
            .await?;
        Ok(())
    }

    pub async fn inbox_modem_configs(&self) -> anyhow::Result<Vec<ModemConfig>> {
        let client = self.client().await?;
        let rows = client
            .query(
                format!(
                    "SELECT {MODEM_COLS} FROM alarms_sms_modems \
                     WHERE enabled = TRUE AND health_status IN ('healthy', 'unknown')"
                ).as_str(),
                &[],
            )
            .await?;
        Ok(rows.iter().map(modem_from_row).collect())
    }

    pub async fn modem_health_snapshot(&self) -> anyhow::Result<Vec<(String, String, i32, i32)>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT name, health_status, sms_sent_count, sms_limit \
                 FROM alarms_sms_modems WHERE enabled = TRUE ORDER BY name",
                &[],
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get(0), r.get(1), r.get(2), r.get(3)))
            .collect())
    }

    // ── Inbox matching ──

    /// The same SMS arriving twice within a minute is a modem-side retry.
    pub async fn is_duplicate_incoming(&self, sim_no: &str, text: &str) -> anyhow::Result<bool> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT 1 FROM command_history \
                 WHERE sim_no = $1 AND command_text = $2 AND direction = 'incoming' \
                   AND created_at > NOW() - INTERVAL '1 minute' LIMIT 1",
                &[&sim_no, &text],
            )
            .await?;
        Ok(row.is_some())
    }

    pub async fn imei_for_sim(&self, sim_no: &str) -> anyhow::Result<Option<i64>> {
        let client = self.client().await?;
        let row = client
            .query_opt("SELECT imei FROM unit WHERE sim_no = $1 LIMIT 1", &[&sim_no])
            .await?;
        Ok(row.map(|r| r.get(0)))
    }

    pub async fn insert_inbox(&self, sim_no: &str, imei: Option<i64>, text: &str) -> anyhow::Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO command_inbox (sim_no, imei, message_text) VALUES ($1, $2, $3)",
                &[&sim_no, &imei, &text],
            )
            .await?;
        Ok(())
    }

    /// Most recent unanswered command to this SIM inside the reply window.
    pub async fn match_recent_sent(
        &self,
        sim_no: &str,
        reply_timeout_mins: i64,
    ) -> anyhow::Result<Option<SentCommand>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                format!(
                    "SELECT id, imei, command_text, config_id, user_id, sent_at FROM command_sent \
                     WHERE sim_no = $1 AND send_method = 'sms' AND status = 'sent' \
                       AND sent_at > NOW() - INTERVAL '{reply_timeout_mins} minutes' \
                     ORDER BY sent_at DESC LIMIT 1"
                ).as_str(),
                &[&sim_no],
            )
            .await?;
        Ok(row.map(|r| SentCommand {
            id: r.get(0),
            imei: r.get(1),
            command_text: r.get(2),
            config_id: r.get(3),
            user_id: r.get(4),
            sent_at: r.get(5),
        }))
    }

    /// A reply matched: close the lifecycle. Updates the outgoing history row
    /// to successful, appends the incoming row, and removes the sent row.
    pub async fn complete_sent_command(
        &self,
        sent: &SentCommand,
        sim_no: &str,
        response_text: &str,
        fallback_imei: Option<i64>,
    ) -> anyhow::Result<()> {
        let mut client = self.client().await?;
        let tx = client.transaction().await?;
        tx.execute(
            "UPDATE command_sent SET status = 'successful', response_text = $1 WHERE id = $2",
            &[&response_text, &sent.id],
        )
        .await?;
        tx.execute(
            "UPDATE command_history SET status = 'successful' \
             WHERE sim_no = $1 AND direction = 'outgoing' AND status = 'sent' AND sent_at = $2",
            &[&sim_no, &sent.sent_at],
        )
        .await?;
        let imei = sent.imei.or(fallback_imei);
        tx.execute(
            "INSERT INTO command_history (imei, sim_no, direction, command_text, config_id, status, \
             send_method, user_id) VALUES ($1, $2, 'incoming', $3, $4, 'received', 'sms', $5)",
            &[&imei, &sim_no, &response_text, &sent.config_id, &sent.user_id],
        )
        .await?;
        tx.execute("DELETE FROM command_sent WHERE id = $1", &[&sent.id]).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn insert_unmatched_incoming(
        &self,
        imei: Option<i64>,
        sim_no: &str,
        text: &str,
    ) -> anyhow::Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO command_history (imei, sim_no, direction, command_text, status) \
                 VALUES ($1, $2, 'incoming', $3, 'received')",
                &[&imei, &sim_no, &text],
            )
            .await?;
        Ok(())
    }

    // ── Cleanup sweeps ──

    /// Outbox rows stuck past the timeout (no modem was ever available):
    /// history `failed`, row removed.
    pub async fn timeout_old_outbox(&self, outbox_timeout_mins: i64) -> anyhow::Result<u64> {
        let mut client = self.client().await?;
        let tx = client.transaction().await?;
        let moved = tx
            .execute(
                format!(
                    "INSERT INTO command_history (imei, sim_no, direction, command_text, config_id, \
                     status, send_method, user_id, created_at) \
                     SELECT imei, sim_no, 'outgoing', command_text, config_id, 'failed', 'sms', \
                            user_id, created_at \
                     FROM command_outbox \
                     WHERE send_method = 'sms' AND created_at < NOW() - INTERVAL '{outbox_timeout_mins} minutes'"
                ).as_str(),
                &[],
            )
            .await?;
        tx.execute(
            format!(
                "DELETE FROM command_outbox \
                 WHERE send_method = 'sms' AND created_at < NOW() - INTERVAL '{outbox_timeout_mins} minutes'"
            ).as_str(),
            &[],
        )
        .await?;
        tx.commit().await?;
        Ok(moved)
    }

    /// Sent rows with no reply inside the window: history `no_reply`, sent
    /// row removed.
    pub async fn timeout_old_sent(&self, reply_timeout_mins: i64) -> anyhow::Result<u64> {
        let mut client = self.client().await?;
        let tx = client.transaction().await?;
        let expired = tx
            .execute(
                format!(
                    "UPDATE command_history h SET status = 'no_reply' \
                     FROM command_sent s \
                     WHERE s.status = 'sent' AND s.sent_at < NOW() - INTERVAL '{reply_timeout_mins} minutes' \
                       AND h.sim_no = s.sim_no AND h.direction = 'outgoing' \
                       AND h.status = 'sent' AND h.sent_at = s.sent_at"
                ).as_str(),
                &[],
            )
            .await?;
        tx.execute(
            format!(
                "DELETE FROM command_sent \
                 WHERE status = 'sent' AND sent_at < NOW() - INTERVAL '{reply_timeout_mins} minutes'"
            ).as_str(),
            &[],
        )
        .await?;
        tx.commit().await?;
        Ok(expired)
    }
}
