use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::Mutex;

use crate::models::command::{InboxMessage, ModemConfig};

const LOGIN_TIMEOUT: Duration = Duration::from_secs(10);
const SEND_TIMEOUT: Duration = Duration::from_secs(30);
const INBOX_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct SendResult {
    pub success: bool,
    pub sms_used: i32,
    pub error: Option<String>,
}

/// REST client for one cellular modem (Teltonika RUT-series API shape).
/// Bearer token cached; a 401 triggers exactly one re-login retry.
pub struct ModemClient {
    pub config: ModemConfig,
    http: reqwest::Client,
    token: Mutex<Option<String>>,
}

impl ModemClient {
    pub fn new(config: ModemConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self { config, http, token: Mutex::new(None) })
    }

    fn api_url(&self, path: &str) -> String {
        format!("https://{}/api{path}", self.config.host)
    }

    async fn login(&self) -> anyhow::Result<String> {
        let response = self
            .http
            .post(self.api_url("/login"))
            .timeout(LOGIN_TIMEOUT)
            .json(&json!({ "username": self.config.username, "password": self.config.password }))
            .send()
            .await?;
        anyhow::ensure!(
            response.status().is_success(),
            "login failed for {}: {}",
            self.config.name,
            response.status()
        );
        let body: Value = response.json().await?;
        let token = body
            .get("data")
            .and_then(|d| d.get("token"))
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("login response missing token for {}", self.config.name))?
            .to_string();
        tracing::debug!("login successful for modem {}", self.config.name);
        Ok(token)
    }

    async fn ensure_token(&self) -> anyhow::Result<String> {
        let mut token = self.token.lock().await;
        if let Some(t) = token.as_ref() {
            return Ok(t.clone());
        }
        let fresh = self.login().await?;
        *token = Some(fresh.clone());
        Ok(fresh)
    }

    async fn clear_token(&self) {
        *self.token.lock().await = None;
    }

    /// Send one SMS; returns the number of parts consumed.
    pub async fn send_sms(&self, phone_number: &str, message: &str) -> SendResult {
        match self.send_sms_inner(phone_number, message, true).await {
            Ok(sms_used) => SendResult { success: true, sms_used, error: None },
            Err(e) => SendResult { success: false, sms_used: 0, error: Some(format!("{e:#}")) },
        }
    }

    async fn send_sms_inner(
        &self,
        phone_number: &str,
        message: &str,
        retry_on_401: bool,
    ) -> anyhow::Result<i32> {
        let token = self.ensure_token().await?;
        let response = self
            .http
            .post(self.api_url("/messages/actions/send"))
            .bearer_auth(&token)
            .json(&json!({
                "data": {
                    "number": phone_number,
                    "message": message,
                    "modem": self.config.sim_slot,
                }
            }))
            .send()
            .await?;
        if response.status().as_u16() == 401 && retry_on_401 {
            self.clear_token().await;
            return Box::pin(self.send_sms_inner(phone_number, message, false)).await;
        }
        anyhow::ensure!(response.status().is_success(), "sms send failed: {}", response.status());
        let body: Value = response.json().await?;
        if body.get("success").and_then(Value::as_bool) != Some(true) {
            let error = body
                .get("errors")
                .and_then(Value::as_array)
                .and_then(|a| a.first())
                .and_then(|e| e.get("error"))
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            anyhow::bail!("sms send rejected: {error}");
        }
        Ok(body
            .get("data")
            .and_then(|d| d.get("sms_used"))
            .and_then(Value::as_i64)
            .unwrap_or(1) as i32)
    }

    /// Fetch all inbox messages.
    pub async fn get_inbox(&self) -> anyhow::Result<Vec<InboxMessage>> {
        let token = self.ensure_token().await?;
        let response = self
            .http
            .get(self.api_url("/messages/status"))
            .timeout(INBOX_TIMEOUT)
            .bearer_auth(&token)
            .send()
            .await?;
        if response.status().as_u16() == 401 {
            self.clear_token().await;
            let token = self.ensure_token().await?;
            let retry = self
                .http
                .get(self.api_url("/messages/status"))
                .timeout(INBOX_TIMEOUT)
                .bearer_auth(&token)
                .send()
                .await?;
            return parse_inbox(retry.json().await?);
        }
        parse_inbox(response.json().await?)
    }

    pub async fn delete_message(&self, message_id: &str) -> anyhow::Result<()> {
        let token = self.ensure_token().await?;
        let response = self
            .http
            .post(self.api_url("/messages/actions/remove_messages"))
            .timeout(INBOX_TIMEOUT)
            .bearer_auth(&token)
            .json(&json!({
                "data": { "modem_id": self.config.sim_slot, "sms_id": [message_id] }
            }))
            .send()
            .await?;
        anyhow::ensure!(response.status().is_success(), "delete failed: {}", response.status());
        Ok(())
    }

    /// Lightweight authenticated probe; a pass moves health back up.
    pub async fn health_check(&self) -> bool {
        let token = match self.ensure_token().await {
            Ok(t) => t,
            Err(_) => return false,
        };
        let response = self
            .http
            .get(self.api_url("/session/status"))
            .timeout(Duration::from_secs(5))
            .bearer_auth(&token)
            .send()
            .await;
        match response {
            Ok(r) if r.status().is_success() => true,
            Ok(r) if r.status().as_u16() == 401 => {
                self.clear_token().await;
                self.login().await.is_ok()
            }
            _ => false,
        }
    }
}

fn parse_inbox(body: Value) -> anyhow::Result<Vec<InboxMessage>> {
    // success=false with no errors just means an empty inbox.
    if body.get("success").and_then(Value::as_bool) != Some(true) {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for msg in body.get("data").and_then(Value::as_array).unwrap_or(&Vec::new()) {
        let id = msg
            .get("id")
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_default();
        let sender = msg.get("sender").and_then(Value::as_str).unwrap_or("").to_string();
        let text = msg.get("message").and_then(Value::as_str).unwrap_or("").to_string();
        if id.is_empty() || sender.is_empty() {
            continue;
        }
        out.push(InboxMessage { message_id: id, sender, text });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn inbox_parses_and_skips_malformed() {
        let body = json!({
            "success": true,
            "data": [
                {"id": "1", "sender": "+923001234567", "message": "OK", "status": "unread"},
                {"id": 2, "sender": "+923001234568", "message": "DONE"},
                {"sender": "+92300", "message": "no id"},
            ]
        });
        let msgs = parse_inbox(body).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].message_id, "1");
        assert_eq!(msgs[1].message_id, "2");
    }

    #[test]
    fn empty_inbox_is_not_an_error() {
        let msgs = parse_inbox(json!({"success": false, "errors": []})).unwrap();
        assert!(msgs.is_empty());
    }
}
