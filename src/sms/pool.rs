use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::db::Db;
use crate::models::command::{ModemConfig, ModemHealth};
use crate::sms::modem::ModemClient;

/// The modem pool: cached REST clients plus the three-tier selector.
///
/// Selection order: the device's pinned modem when usable, then the best
/// modem in the requested service pool, then any usable modem at all.
pub struct ModemPool {
    db: Arc<Db>,
    clients: Mutex<HashMap<i64, Arc<ModemClient>>>,
}

impl ModemPool {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db, clients: Mutex::new(HashMap::new()) }
    }

    pub async fn select_best_modem(
        &self,
        service: &str,
        imei: Option<i64>,
    ) -> anyhow::Result<Option<ModemConfig>> {
        if let Some(imei) = imei {
            if let Some(pinned) = self.db.device_modem_id(imei).await? {
                if let Some(config) = self.db.modem_if_available(pinned).await? {
                    tracing::debug!("using device-pinned modem {} for imei={imei}", config.name);
                    return Ok(Some(config));
                }
                tracing::debug!("pinned modem {pinned} unavailable for imei={imei}; using pool");
            }
        }
        if let Some(config) = self.db.select_service_modem(service).await? {
            return Ok(Some(config));
        }
        tracing::warn!("service pool ({service}) exhausted, trying fallback");
        if let Some(config) = self.db.select_any_modem().await? {
            tracing::info!("using fallback modem {} for {service}", config.name);
            return Ok(Some(config));
        }
        Ok(None)
    }

    /// Cached client for a modem; recreated when host/credentials changed.
    pub async fn client_for(&self, config: &ModemConfig) -> anyhow::Result<Arc<ModemClient>> {
        let mut clients = self.clients.lock().await;
        if let Some(existing) = clients.get(&config.id) {
            if existing.config.host == config.host
                && existing.config.username == config.username
                && existing.config.password == config.password
            {
                return Ok(existing.clone());
            }
        }
        let client = Arc::new(ModemClient::new(config.clone())?);
        clients.insert(config.id, client.clone());
        Ok(client)
    }

    /// A failed login or send degrades the modem; two strikes in a row on
    /// the same call path mark it unhealthy.
    pub async fn record_send_failure(&self, config: &ModemConfig) {
        let next = match config.health {
            ModemHealth::Healthy | ModemHealth::Unknown => ModemHealth::Degraded,
            _ => ModemHealth::Unhealthy,
        };
        if let Err(e) = self.db.set_modem_health(config.id, next).await {
            tracing::warn!("health update failed for modem {}: {e:#}", config.id);
        }
    }

    pub async fn record_send_success(&self, config: &ModemConfig) {
        if config.health != ModemHealth::Healthy {
            if let Err(e) = self.db.set_modem_health(config.id, ModemHealth::Healthy).await {
                tracing::warn!("health update failed for modem {}: {e:#}", config.id);
            }
        }
    }

    /// Probe every degraded/unhealthy modem; a passing probe moves it back
    /// toward healthy.
    pub async fn probe_unhealthy(&self) -> anyhow::Result<()> {
        let client = self.db.client().await?;
        let rows = client
            .query(
                "SELECT id, name, host, username, password_encrypted, modem_id, health_status, \
                        sms_sent_count, sms_limit \
                 FROM alarms_sms_modems \
                 WHERE enabled = TRUE AND health_status IN ('degraded', 'unhealthy')",
                &[],
            )
            .await?;
        drop(client);
        for row in &rows {
            let config = ModemConfig {
                id: row.get(0),
                name: row.get(1),
                host: row.get(2),
                username: row.get(3),
                password: crate::infra::crypto::decrypt(row.get::<_, String>(4).as_str()),
                sim_slot: row.get(5),
                health: ModemHealth::parse(row.get::<_, String>(6).as_str()),
                sms_sent_count: row.get(7),
                sms_limit: row.get(8),
            };
            let modem = match self.client_for(&config).await {
                Ok(m) => m,
                Err(_) => continue,
            };
            if modem.health_check().await {
                let next = match config.health {
                    ModemHealth::Unhealthy => ModemHealth::Degraded,
                    _ => ModemHealth::Healthy,
                };
                tracing::info!("modem {} probe ok; {} -> {}", config.name, config.health.as_str(), next.as_str());
                let _ = self.db.set_modem_health(config.id, next).await;
            }
        }
        Ok(())
    }
}
