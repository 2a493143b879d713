use std::time::Duration;

use chrono::{FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::db::Db;
use crate::infra::crypto;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const PAGE_SIZE: i64 = 100;
const TRACK_PAGE_SIZE: i64 = 500;
const MAX_TRACK_PAGES: i64 = 50;
const MAX_ALARM_PAGES: i64 = 10;

/// One row of `cms_servers`, password decrypted.
#[derive(Debug, Clone)]
pub struct CmsServer {
    pub id: i64,
    pub name: String,
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub tz_offset: FixedOffset,
    pub download_port: Option<i32>,
}

impl Db {
    pub async fn cms_servers(&self) -> anyhow::Result<Vec<CmsServer>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT id, name, base_url, username, password_encrypted, timezone, download_port \
                 FROM cms_servers WHERE enabled = TRUE",
                &[],
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| CmsServer {
                id: r.get(0),
                name: r.get(1),
                base_url: r.get(2),
                username: r.get(3),
                password: crypto::decrypt(r.get::<_, String>(4).as_str()),
                tz_offset: parse_tz_offset(r.get::<_, String>(5).as_str()),
                download_port: r.get(6),
            })
            .collect())
    }
}

/// Parse `+05:00` / `-03:30` style offsets; UTC on anything else.
pub fn parse_tz_offset(s: &str) -> FixedOffset {
    let fallback = FixedOffset::east_opt(0).expect("zero offset");
    let s = s.trim();
    let (sign, rest) = match s.split_at_checked(1) {
        Some(("+", rest)) => (1, rest),
        Some(("-", rest)) => (-1, rest),
        _ => return fallback,
    };
    let (h, m) = match rest.split_once(':') {
        Some((h, m)) => (h, m),
        None => (rest, "0"),
    };
    match (h.parse::<i32>(), m.parse::<i32>()) {
        (Ok(h), Ok(m)) => {
            FixedOffset::east_opt(sign * (h * 3600 + m * 60)).unwrap_or(fallback)
        }
        _ => fallback,
    }
}

/// CMS coordinates arrive either as raw micro-degrees or as decimals.
pub fn convert_coordinate(value: f64) -> f64 {
    if value.abs() > 1000.0 { value / 1_000_000.0 } else { value }
}

#[derive(Debug, Clone)]
pub struct CmsDevice {
    pub device_id: String,
    pub plate_number: String,
    pub online: bool,
    pub latitude: f64,
    pub longitude: f64,
    pub speed: i32,
    pub heading: i32,
    pub altitude: i32,
    pub satellites: i32,
    pub gps_time: Option<NaiveDateTime>,
}

#[derive(Debug, Clone)]
pub struct CmsAlarm {
    pub guid: String,
    pub device_id: String,
    pub alarm_type: i64,
    pub alarm_name: String,
    pub channel: i64,
    pub file_time: String,
    pub gps_time: NaiveDateTime,
    pub latitude: f64,
    pub longitude: f64,
    pub speed: i32,
    pub photo_url: Option<String>,
    pub video_url: Option<String>,
}

impl CmsAlarm {
    pub fn has_video(&self) -> bool {
        self.video_url.as_deref().is_some_and(|u| !u.is_empty())
    }
}

/// The alarm-type code groups the safety poll restricts to when filtering is
/// enabled (overspeed, collision, fatigue/phone/smoking/distraction,
/// eyes-close/lost-face/seatbelt, backward collision).
pub const FILTERED_ALARM_TYPE_GROUPS: &[&str] = &[
    "11,428",
    "600,601,512,513,840,841,1207",
    "618,619,620,621,622,623,624,625,1200,1201,1202,1203,525,541,702,703",
    "628,629,630,631,706,707,708,709,1205,1434,1435",
    "633,749,1234,1235",
];

pub fn alarm_type_name(code: i64) -> &'static str {
    match code {
        11 | 428 => "Overspeeding",
        600 | 601 | 512 | 513 | 840 | 841 | 1207 => "Forward Collision",
        618 | 619 | 1200 => "Fatigue",
        620 | 621 | 525 | 541 | 1203 => "PhoneCalling",
        622 | 623 | 1202 => "Smoking",
        624 | 625 | 702 | 703 | 1201 => "Distraction",
        628 | 629 | 1434 => "Eyes Close",
        630 | 631 | 708 | 709 | 1435 => "Lost Face",
        706 | 707 | 1205 => "SeatBelt",
        633 | 749 | 1234 | 1235 => "Backward Collision",
        _ => "Camera Alarm",
    }
}

/// Session-authenticated client for one vendor CMS server.
pub struct CmsClient {
    pub server: CmsServer,
    http: reqwest::Client,
    session: Mutex<Option<String>>,
}

impl CmsClient {
    pub fn new(server: CmsServer) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self { server, http, session: Mutex::new(None) })
    }

    /// The CMS speaks its configured local timezone; we convert on egress…
    pub fn utc_to_cms_local(&self, utc: NaiveDateTime) -> String {
        let local = self.server.tz_offset.from_utc_datetime(&utc);
        local.format("%Y-%m-%d %H:%M:%S").to_string()
    }

    /// …and back to naive UTC on ingress.
    pub fn cms_local_to_utc(&self, s: &str) -> Option<NaiveDateTime> {
        let naive = NaiveDateTime::parse_from_str(s.trim(), "%Y-%m-%d %H:%M:%S").ok()?;
        let local = self.server.tz_offset.from_local_datetime(&naive).single()?;
        Some(local.with_timezone(&Utc).naive_utc())
    }

    async fn login(&self) -> anyhow::Result<String> {
        let url = format!("{}/StandardApiAction_login.action", self.server.base_url);
        let data: Value = self
            .http
            .get(&url)
            .query(&[("account", self.server.username.as_str()), ("password", self.server.password.as_str())])
            .send()
            .await?
            .json()
            .await?;
        if data.get("result").and_then(Value::as_i64) != Some(0) {
            anyhow::bail!("CMS login failed for {}: result={:?}", self.server.name, data.get("result"));
        }
        let jsession = data
            .get("jsession")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("CMS login response missing jsession"))?
            .to_string();
        tracing::info!("logged into CMS server {}", self.server.name);
        Ok(jsession)
    }

    async fn ensure_session(&self) -> anyhow::Result<String> {
        let mut session = self.session.lock().await;
        if let Some(s) = session.as_ref() {
            return Ok(s.clone());
        }
        let fresh = self.login().await?;
        *session = Some(fresh.clone());
        Ok(fresh)
    }

    /// GET with the session parameter; one re-login retry when the server
    /// reports a non-zero result (expired session).
    async fn request(&self, endpoint: &str, params: &[(&str, String)]) -> anyhow::Result<Value> {
        let jsession = self.ensure_session().await?;
        let url = format!("{}/{endpoint}", self.server.base_url);
        let mut query: Vec<(&str, String)> = vec![("jsession", jsession)];
        query.extend(params.iter().cloned());
        let data: Value = self.http.get(&url).query(&query).send().await?.json().await?;
        if data.get("result").and_then(Value::as_i64) == Some(0) {
            return Ok(data);
        }
        // Session may have expired; refresh once.
        {
            let mut session = self.session.lock().await;
            *session = None;
        }
        let jsession = self.ensure_session().await?;
        let mut query: Vec<(&str, String)> = vec![("jsession", jsession)];
        query.extend(params.iter().cloned());
        let data: Value = self.http.get(&url).query(&query).send().await?.json().await?;
        Ok(data)
    }

    pub async fn all_devices(&self) -> anyhow::Result<Vec<CmsDevice>> {
        let data = self.request("StandardApiAction_queryUserVehicle.action", &[]).await?;
        anyhow::ensure!(
            data.get("result").and_then(Value::as_i64) == Some(0),
            "device list failed: result={:?}",
            data.get("result")
        );
        let mut devices = Vec::new();
        for vehicle in data.get("vehicles").and_then(Value::as_array).unwrap_or(&Vec::new()) {
            let plate = vehicle.get("nm").and_then(Value::as_str).unwrap_or("").to_string();
            let device_list = vehicle.get("dl").and_then(Value::as_array);
            match device_list {
                Some(list) if !list.is_empty() => {
                    for dev in list {
                        if let Some(id) = dev.get("id").and_then(Value::as_str) {
                            devices.push(CmsDevice {
                                device_id: id.to_string(),
                                plate_number: plate.clone(),
                                online: false,
                                latitude: 0.0,
                                longitude: 0.0,
                                speed: 0,
                                heading: 0,
                                altitude: 0,
                                satellites: 0,
                                gps_time: None,
                            });
                        }
                    }
                }
                _ => {
                    if let Some(id) = vehicle.get("id").and_then(Value::as_str) {
                        devices.push(CmsDevice {
                            device_id: id.to_string(),
                            plate_number: plate,
                            online: false,
                            latitude: 0.0,
                            longitude: 0.0,
                            speed: 0,
                            heading: 0,
                            altitude: 0,
                            satellites: 0,
                            gps_time: None,
                        });
                    }
                }
            }
        }
        if !devices.is_empty() {
            let ids: Vec<String> = devices.iter().map(|d| d.device_id.clone()).collect();
            let online = self.online_status(&ids).await.unwrap_or_default();
            for device in &mut devices {
                device.online = online
                    .iter()
                    .any(|(id, on)| *on && id == &device.device_id);
            }
        }
        Ok(devices)
    }

    async fn online_status(&self, device_ids: &[String]) -> anyhow::Result<Vec<(String, bool)>> {
        let data = self
            .request(
                "StandardApiAction_getDeviceOlStatus.action",
                &[("devIdno", device_ids.join(","))],
            )
            .await?;
        let mut out = Vec::new();
        for entry in data.get("onlines").and_then(Value::as_array).unwrap_or(&Vec::new()) {
            let id = entry.get("did").or_else(|| entry.get("vid")).and_then(Value::as_str);
            let online = entry.get("online").and_then(Value::as_i64).unwrap_or(0) == 1;
            if let Some(id) = id {
                out.push((id.to_string(), online));
            }
        }
        Ok(out)
    }

    /// Detailed status for one online device.
    pub async fn device_status(&self, device_id: &str) -> anyhow::Result<Option<CmsDevice>> {
        let data = self
            .request(
                "StandardApiAction_getDeviceStatus.action",
                &[("devIdno", device_id.to_string()), ("toMap", "1".to_string())],
            )
            .await?;
        let Some(status) = data
            .get("status")
            .and_then(Value::as_array)
            .and_then(|a| a.first())
        else {
            return Ok(None);
        };
        Ok(Some(CmsDevice {
            device_id: device_id.to_string(),
            plate_number: status.get("vid").and_then(Value::as_str).unwrap_or("").to_string(),
            online: status.get("ol").and_then(Value::as_i64).unwrap_or(0) == 1,
            latitude: convert_coordinate(json_f64(status, &["mlat", "lat"]).unwrap_or(0.0)),
            longitude: convert_coordinate(json_f64(status, &["mlng", "lng"]).unwrap_or(0.0)),
            // CMS reports speed in 0.1 km/h units.
            speed: (json_f64(status, &["sp"]).unwrap_or(0.0) / 10.0) as i32,
            heading: json_f64(status, &["hx"]).unwrap_or(0.0) as i32,
            altitude: json_f64(status, &["gd"]).unwrap_or(0.0) as i32,
            satellites: json_f64(status, &["gs"]).unwrap_or(0.0) as i32,
            gps_time: status
                .get("gt")
                .and_then(Value::as_str)
                .and_then(|s| self.cms_local_to_utc(s)),
        }))
    }

    /// GPS history for one device over a UTC window, paged.
    pub async fn gps_track(
        &self,
        device_id: &str,
        start_utc: NaiveDateTime,
        end_utc: NaiveDateTime,
    ) -> anyhow::Result<Vec<CmsDevice>> {
        let begin = self.utc_to_cms_local(start_utc);
        let end = self.utc_to_cms_local(end_utc);
        let mut points = Vec::new();
        let mut page = 1i64;
        let mut total_pages = 1i64;
        while page <= total_pages && page <= MAX_TRACK_PAGES {
            let data = self
                .request(
                    "StandardApiAction_queryTrackDetail.action",
                    &[
                        ("devIdno", device_id.to_string()),
                        ("begintime", begin.clone()),
                        ("endtime", end.clone()),
                        ("toMap", "1".to_string()),
                        ("currentPage", page.to_string()),
                        ("pageRecords", TRACK_PAGE_SIZE.to_string()),
                    ],
                )
                .await?;
            if data.get("result").and_then(Value::as_i64) != Some(0) {
                anyhow::ensure!(page > 1, "track query failed: result={:?}", data.get("result"));
                break;
            }
            total_pages = data
                .get("pagination")
                .and_then(|p| p.get("totalPages"))
                .or_else(|| data.get("totalPages"))
                .and_then(Value::as_i64)
                .unwrap_or(1);
            for track in data.get("tracks").and_then(Value::as_array).unwrap_or(&Vec::new()) {
                let Some(gps_time) = track
                    .get("gt")
                    .and_then(Value::as_str)
                    .and_then(|s| self.cms_local_to_utc(s))
                else {
                    continue;
                };
                points.push(CmsDevice {
                    device_id: device_id.to_string(),
                    plate_number: String::new(),
                    online: true,
                    latitude: convert_coordinate(json_f64(track, &["mlat", "lat"]).unwrap_or(0.0)),
                    longitude: convert_coordinate(json_f64(track, &["mlng", "lng"]).unwrap_or(0.0)),
                    speed: (json_f64(track, &["sp"]).unwrap_or(0.0) / 10.0) as i32,
                    heading: json_f64(track, &["hx"]).unwrap_or(0.0) as i32,
                    altitude: json_f64(track, &["gd"]).unwrap_or(0.0) as i32,
                    satellites: json_f64(track, &["gs"]).unwrap_or(0.0) as i32,
                    gps_time: Some(gps_time),
                });
            }
            page += 1;
        }
        Ok(points)
    }

    /// Safety alarms over a UTC window. The vendor reports every alarm twice
    /// (photo pass and video pass); records sharing
    /// `(device, file_time, alarm_type, channel)` are merged, carrying
    /// whichever media URLs are populated.
    pub async fn safety_alarms(
        &self,
        start_utc: NaiveDateTime,
        end_utc: NaiveDateTime,
        filter_types: bool,
    ) -> anyhow::Result<Vec<CmsAlarm>> {
        let begin = self.utc_to_cms_local(start_utc);
        let end = self.utc_to_cms_local(end_utc);
        let type_groups: Vec<String> = if filter_types {
            FILTERED_ALARM_TYPE_GROUPS.iter().map(|s| s.to_string()).collect()
        } else {
            vec![String::new()]
        };

        let mut raw: Vec<CmsAlarm> = Vec::new();
        for group in &type_groups {
            for media_type in [0i64, 1] {
                for page in 1..=MAX_ALARM_PAGES {
                    let mut params = vec![
                        ("begintime", begin.clone()),
                        ("endtime", end.clone()),
                        ("mediaType", media_type.to_string()),
                        ("toMap", "1".to_string()),
                        ("currentPage", page.to_string()),
                        ("pageRecords", PAGE_SIZE.to_string()),
                    ];
                    if !group.is_empty() {
                        params.push(("alarmType", group.clone()));
                    }
                    let data = self
                        .request("StandardApiAction_performanceReportPhotoListSafe.action", &params)
                        .await?;
                    if data.get("result").and_then(Value::as_i64) != Some(0) {
                        break;
                    }
                    let infos = data.get("infos").and_then(Value::as_array).cloned().unwrap_or_default();
                    if infos.is_empty() {
                        break;
                    }
                    let count = infos.len() as i64;
                    for info in &infos {
                        if let Some(alarm) = self.parse_alarm(info) {
                            raw.push(alarm);
                        }
                    }
                    if count < PAGE_SIZE {
                        break;
                    }
                }
            }
        }
        Ok(merge_alarms(raw))
    }

    /// The vendor's "currently active" alarms.
    pub async fn realtime_alarms(&self, filter_types: bool) -> anyhow::Result<Vec<CmsAlarm>> {
        let mut params = vec![
            ("toMap", "1".to_string()),
            ("currentPage", "1".to_string()),
            ("pageRecords", PAGE_SIZE.to_string()),
        ];
        if filter_types {
            params.push(("alarmType", FILTERED_ALARM_TYPE_GROUPS.join(",")));
        }
        let data = self.request("StandardApiAction_vehicleAlarm.action", &params).await?;
        anyhow::ensure!(
            data.get("result").and_then(Value::as_i64) == Some(0),
            "realtime alarm query failed: result={:?}",
            data.get("result")
        );
        let mut alarms = Vec::new();
        for info in data.get("alarms").and_then(Value::as_array).unwrap_or(&Vec::new()) {
            if let Some(alarm) = self.parse_alarm(info) {
                alarms.push(alarm);
            }
        }
        Ok(alarms)
    }

    fn parse_alarm(&self, info: &Value) -> Option<CmsAlarm> {
        let device_id = info
            .get("devIdno")
            .or_else(|| info.get("did"))
            .and_then(Value::as_str)?
            .to_string();
        let file_time = info
            .get("fileTimeStr")
            .or_else(|| info.get("tm"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let gps_time = self.cms_local_to_utc(&file_time)?;
        let alarm_type = info
            .get("alarmType")
            .or_else(|| info.get("atp"))
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let channel = info.get("chnMask").or_else(|| info.get("chn")).and_then(Value::as_i64).unwrap_or(0);
        let guid = info
            .get("guid")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| format!("{device_id}:{file_time}:{alarm_type}:{channel}"));
        Some(CmsAlarm {
            guid,
            device_id,
            alarm_type,
            alarm_name: alarm_type_name(alarm_type).to_string(),
            channel,
            file_time,
            gps_time,
            latitude: convert_coordinate(json_f64(info, &["mlat", "lat"]).unwrap_or(0.0)),
            longitude: convert_coordinate(json_f64(info, &["mlng", "lng"]).unwrap_or(0.0)),
            speed: (json_f64(info, &["sp"]).unwrap_or(0.0) / 10.0) as i32,
            photo_url: info
                .get("downloadUrl")
                .or_else(|| info.get("photoUrl"))
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(String::from),
            video_url: info
                .get("videoUrl")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(String::from),
        })
    }
}

/// Merge photo and video passes of the same alarm event.
pub fn merge_alarms(raw: Vec<CmsAlarm>) -> Vec<CmsAlarm> {
    let mut merged: Vec<CmsAlarm> = Vec::new();
    let mut index: std::collections::HashMap<(String, String, i64, i64), usize> = Default::default();
    for alarm in raw {
        let key = (
            alarm.device_id.clone(),
            alarm.file_time.clone(),
            alarm.alarm_type,
            alarm.channel,
        );
        match index.get(&key) {
            Some(&i) => {
                let existing = &mut merged[i];
                if alarm.video_url.is_some() {
                    existing.video_url = alarm.video_url;
                }
                if existing.photo_url.is_none() && alarm.photo_url.is_some() {
                    existing.photo_url = alarm.photo_url;
                }
            }
            None => {
                index.insert(key, merged.len());
                merged.push(alarm);
            }
        }
    }
    merged
}

fn json_f64(v: &Value, keys: &[&str]) -> Option<f64> {
    for key in keys {
        if let Some(found) = v.get(key) {
            if let Some(f) = found.as_f64() {
                return Some(f);
            }
            if let Some(s) = found.as_str() {
                if let Ok(f) = s.trim().parse() {
                    return Some(f);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alarm(device: &str, file_time: &str, atype: i64, channel: i64, photo: Option<&str>, video: Option<&str>) -> CmsAlarm {
        CmsAlarm {
            guid: format!("{device}:{file_time}:{atype}:{channel}"),
            device_id: device.to_string(),
            alarm_type: atype,
            alarm_name: alarm_type_name(atype).to_string(),
            channel,
            file_time: file_time.to_string(),
            gps_time: chrono::NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(10, 0, 0).unwrap(),
            latitude: 31.5,
            longitude: 74.3,
            speed: 40,
            photo_url: photo.map(String::from),
            video_url: video.map(String::from),
        }
    }

    #[test]
    fn photo_and_video_passes_merge_into_one() {
        let merged = merge_alarms(vec![
            alarm("D1", "2024-03-01 15:00:00", 618, 1, Some("http://p/1.jpg"), None),
            alarm("D1", "2024-03-01 15:00:00", 618, 1, None, Some("http://v/1.mp4")),
            alarm("D1", "2024-03-01 15:05:00", 618, 1, Some("http://p/2.jpg"), None),
        ]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].photo_url.as_deref(), Some("http://p/1.jpg"));
        assert_eq!(merged[0].video_url.as_deref(), Some("http://v/1.mp4"));
        assert!(merged[1].video_url.is_none());
    }

    #[test]
    fn coordinates_normalise_from_microdegrees() {
        assert_eq!(convert_coordinate(113_827_278.0), 113.827278);
        assert_eq!(convert_coordinate(74.3587), 74.3587);
        assert_eq!(convert_coordinate(0.0), 0.0);
    }

    #[test]
    fn timezone_offsets_parse() {
        assert_eq!(parse_tz_offset("+05:00").local_minus_utc(), 5 * 3600);
        assert_eq!(parse_tz_offset("-03:30").local_minus_utc(), -(3 * 3600 + 30 * 60));
        assert_eq!(parse_tz_offset("garbage").local_minus_utc(), 0);
    }

    #[test]
    fn cms_local_round_trips_to_utc() {
        let server = CmsServer {
            id: 1,
            name: "test".into(),
            base_url: "http://cms".into(),
            username: "u".into(),
            password: "p".into(),
            tz_offset: parse_tz_offset("+05:00"),
            download_port: None,
        };
        let client = CmsClient::new(server).unwrap();
        let utc = chrono::NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(10, 0, 0).unwrap();
        let local = client.utc_to_cms_local(utc);
        assert_eq!(local, "2024-03-01 15:00:00");
        assert_eq!(client.cms_local_to_utc(&local), Some(utc));
    }

    #[test]
    fn alarm_codes_map_to_names() {
        assert_eq!(alarm_type_name(11), "Overspeeding");
        assert_eq!(alarm_type_name(1205), "SeatBelt");
        assert_eq!(alarm_type_name(9999), "Camera Alarm");
    }
}
