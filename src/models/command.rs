use chrono::NaiveDateTime;

pub const SEND_METHOD_SMS: &str = "sms";

pub const SENT_STATUS_SENT: &str = "sent";
pub const SENT_STATUS_SUCCESSFUL: &str = "successful";
pub const SENT_STATUS_FAILED: &str = "failed";

pub const HISTORY_STATUS_SENT: &str = "sent";
pub const HISTORY_STATUS_SUCCESSFUL: &str = "successful";
pub const HISTORY_STATUS_NO_REPLY: &str = "no_reply";
pub const HISTORY_STATUS_FAILED: &str = "failed";
pub const HISTORY_STATUS_RECEIVED: &str = "received";

pub const DIRECTION_OUTGOING: &str = "outgoing";
pub const DIRECTION_INCOMING: &str = "incoming";

/// A pending command from `command_outbox`.
#[derive(Debug, Clone)]
pub struct OutboxCommand {
    pub id: i64,
    pub imei: Option<i64>,
    pub sim_no: String,
    pub command_text: String,
    pub config_id: Option<i64>,
    pub user_id: Option<i64>,
    pub retry_count: i32,
    pub created_at: NaiveDateTime,
}

/// A `command_sent` row awaiting a reply.
#[derive(Debug, Clone)]
pub struct SentCommand {
    pub id: i64,
    pub imei: Option<i64>,
    pub command_text: String,
    pub config_id: Option<i64>,
    pub user_id: Option<i64>,
    pub sent_at: NaiveDateTime,
}

/// Modem health ladder. The selector excludes `Unhealthy` and
/// `QuotaExhausted`; `Degraded` is still tried last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModemHealth {
    Healthy,
    Unknown,
    Degraded,
    Unhealthy,
    QuotaExhausted,
}

impl ModemHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModemHealth::Healthy => "healthy",
            ModemHealth::Unknown => "unknown",
            ModemHealth::Degraded => "degraded",
            ModemHealth::Unhealthy => "unhealthy",
            ModemHealth::QuotaExhausted => "quota_exhausted",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "healthy" => ModemHealth::Healthy,
            "degraded" => ModemHealth::Degraded,
            "unhealthy" => ModemHealth::Unhealthy,
            "quota_exhausted" => ModemHealth::QuotaExhausted,
            _ => ModemHealth::Unknown,
        }
    }
}

/// One row of `alarms_sms_modems` with the password already decrypted.
#[derive(Debug, Clone)]
pub struct ModemConfig {
    pub id: i64,
    pub name: String,
    pub host: String,
    pub username: String,
    pub password: String,
    pub sim_slot: String,
    pub health: ModemHealth,
    pub sms_sent_count: i32,
    pub sms_limit: i32,
}

/// An SMS fetched from a modem inbox.
#[derive(Debug, Clone)]
pub struct InboxMessage {
    pub message_id: String,
    pub sender: String,
    pub text: String,
}
