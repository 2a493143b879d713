use std::io::Write;
use std::path::PathBuf;

use chrono::Utc;
use serde_json::Value;

/// Standalone-mode sink: one CSV per record type per day instead of the
/// broker. Used for cold-site deployments and for replaying captures.
pub struct CsvSink {
    dir: PathBuf,
}

const HEADER: &str = "imei,gps_time,latitude,longitude,speed,status,photo_url,video_url,payload\n";

impl CsvSink {
    pub fn new(dir: &str) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self { dir: PathBuf::from(dir) })
    }

    pub fn save(&self, record_type: &str, body: &Value) -> anyhow::Result<()> {
        let day = Utc::now().format("%Y%m%d");
        let path = self.dir.join(format!("{record_type}_{day}.csv"));
        let new_file = !path.exists();
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
        if new_file {
            file.write_all(HEADER.as_bytes())?;
        }
        let data = body.get("data").unwrap_or(body);
        let field = |key: &str| -> String {
            data.get(key)
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default()
        };
        let payload = serde_json::to_string(body)?.replace('"', "\"\"");
        let line = format!(
            "{},{},{},{},{},{},{},{},\"{}\"\n",
            field("imei"),
            field("gps_time"),
            field("latitude"),
            field("longitude"),
            field("speed"),
            field("status").replace(',', ";"),
            field("photo_url"),
            field("video_url"),
            payload,
        );
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn writes_header_once_and_appends_rows() {
        let dir = std::env::temp_dir().join(format!("csv_sink_test_{}", std::process::id()));
        let sink = CsvSink::new(dir.to_str().unwrap()).unwrap();
        let body = json!({
            "record_type": "trackdata",
            "data": {"imei": "100", "gps_time": "2024-03-01T10:00:00Z", "latitude": 31.5,
                     "longitude": 74.3, "speed": 40, "status": "Normal"}
        });
        sink.save("trackdata", &body).unwrap();
        sink.save("trackdata", &body).unwrap();

        let day = Utc::now().format("%Y%m%d");
        let contents = std::fs::read_to_string(dir.join(format!("trackdata_{day}.csv"))).unwrap();
        assert_eq!(contents.matches("imei,gps_time").count(), 1);
        assert_eq!(contents.lines().count(), 3);
        std::fs::remove_dir_all(&dir).ok();
    }
}
