use std::collections::HashMap;

use chrono::NaiveDateTime;

use crate::models::record::TrackRecord;

/// Deduplicate a batch by `(imei, gps_time)`, keeping the **last** occurrence
/// (a retransmit carries the freshest column values). Order of the surviving
/// rows is preserved; a multi-row upsert would otherwise fail with "cannot
/// affect row a second time".
pub fn dedup_last_wins<T>(rows: Vec<(TrackRecord, T)>) -> Vec<(TrackRecord, T)> {
    let mut last_index: HashMap<(i64, NaiveDateTime), usize> = HashMap::new();
    for (i, (record, _)) in rows.iter().enumerate() {
        last_index.insert((record.imei, record.gps_time), i);
    }
    rows.into_iter()
        .enumerate()
        .filter(|(i, (record, _))| last_index[&(record.imei, record.gps_time)] == *i)
        .map(|(_, pair)| pair)
        .collect()
}

/// Derive a message id: broker property, else payload field, else a digest
/// of the raw body.
pub fn derive_message_id(
    broker_message_id: Option<&str>,
    payload: &serde_json::Value,
    body: &[u8],
) -> String {
    if let Some(id) = broker_message_id.filter(|s| !s.is_empty()) {
        return id.to_string();
    }
    if let Some(id) = payload.get("message_id").and_then(|v| v.as_str()).filter(|s| !s.is_empty()) {
        return id.to_string();
    }
    use md5::{Digest, Md5};
    let mut hasher = Md5::new();
    hasher.update(body);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(imei: i64, secs: u32, speed: i32) -> TrackRecord {
        let mut r = TrackRecord::from_payload(&json!({
            "imei": imei, "latitude": 1.0, "longitude": 1.0
        }))
        .unwrap();
        r.gps_time = chrono::NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(10, 0, secs)
            .unwrap();
        r.speed = speed;
        r
    }

    #[test]
    fn last_occurrence_wins() {
        let rows = vec![
            (rec(100, 0, 10), "a"),
            (rec(100, 5, 20), "b"),
            (rec(100, 0, 30), "c"),
        ];
        let deduped = dedup_last_wins(rows);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].1, "b");
        assert_eq!(deduped[1].1, "c");
        assert_eq!(deduped[1].0.speed, 30);
    }

    #[test]
    fn all_duplicates_collapse_to_one() {
        let rows = vec![
            (rec(100, 0, 1), 1),
            (rec(100, 0, 2), 2),
            (rec(100, 0, 3), 3),
        ];
        let deduped = dedup_last_wins(rows);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].0.speed, 3);
    }

    #[test]
    fn message_id_preference_order() {
        let payload = json!({"message_id": "payload-id"});
        assert_eq!(derive_message_id(Some("broker-id"), &payload, b"x"), "broker-id");
        assert_eq!(derive_message_id(None, &payload, b"x"), "payload-id");
        assert_eq!(derive_message_id(Some(""), &payload, b"x"), "payload-id");

        let id = derive_message_id(None, &json!({}), b"same-body");
        assert_eq!(id, derive_message_id(None, &json!({}), b"same-body"));
        assert_eq!(id.len(), 32);
    }
}
