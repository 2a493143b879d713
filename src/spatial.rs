use crate::db::Db;

/// Road match for the speed-violation calculator.
#[derive(Debug, Clone)]
pub struct RoadInfo {
    pub road_type: String,
    pub speed_limit: Option<i32>,
}

/// PostGIS lookups. All of these degrade to `Ok(None)`/`Ok(false)` style
/// results on missing data; callers fall back to config-derived limits.
impl Db {
    /// Nearest road within 25m of the point, closest first.
    pub async fn road_speed_limit(&self, lat: f64, lon: f64) -> anyhow::Result<Option<RoadInfo>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT road_type, speed_limit FROM road \
                 WHERE ST_DWithin(geom::geography, ST_SetSRID(ST_MakePoint($1, $2), 4326)::geography, 25) \
                 ORDER BY ST_Distance(geom::geography, ST_SetSRID(ST_MakePoint($1, $2), 4326)::geography) \
                 LIMIT 1",
                &[&lon, &lat],
            )
            .await?;
        Ok(row.map(|r| RoadInfo { road_type: r.get(0), speed_limit: r.get(1) }))
    }

    /// Containment with hysteresis: a device previously inside stays inside
    /// while within `buffer_m` metres of the boundary.
    pub async fn point_in_fence(
        &self,
        fence_id: i64,
        lat: f64,
        lon: f64,
        buffer_m: i32,
        was_inside: bool,
    ) -> anyhow::Result<bool> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT ST_Contains(polygon, ST_SetSRID(ST_MakePoint($1, $2), 4326)) AS inside, \
                        ($4 AND ST_DWithin(ST_SetSRID(ST_MakePoint($1, $2), 4326)::geography, \
                                           polygon::geography, $3)) AS in_buffer \
                 FROM fence WHERE fence_id = $5 AND polygon IS NOT NULL",
                &[&lon, &lat, &(buffer_m as f64), &was_inside, &fence_id],
            )
            .await?;
        Ok(match row {
            Some(r) => {
                let inside: Option<bool> = r.get(0);
                let in_buffer: Option<bool> = r.get(1);
                inside.unwrap_or(false) || in_buffer.unwrap_or(false)
            }
            None => false,
        })
    }

    /// Plain containment, no hysteresis. Used for trip origin/destination
    /// fences where the boundary wobble does not matter.
    pub async fn point_in_fence_simple(&self, fence_id: i64, lat: f64, lon: f64) -> anyhow::Result<bool> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT ST_Contains(polygon, ST_SetSRID(ST_MakePoint($1, $2), 4326)) \
                 FROM fence WHERE fence_id = $3 AND polygon IS NOT NULL",
                &[&lon, &lat, &fence_id],
            )
            .await?;
        Ok(row.and_then(|r| r.get::<_, Option<bool>>(0)).unwrap_or(false))
    }

    /// Whether the point lies within `threshold_m` metres of the route polyline.
    pub async fn point_on_route(
        &self,
        route_id: i64,
        lat: f64,
        lon: f64,
        threshold_m: f64,
    ) -> anyhow::Result<bool> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT ST_DWithin(polyline::geography, \
                        ST_SetSRID(ST_MakePoint($1, $2), 4326)::geography, $3) \
                 FROM route WHERE route_id = $4 AND polyline IS NOT NULL",
                &[&lon, &lat, &threshold_m, &route_id],
            )
            .await?;
        Ok(row.and_then(|r| r.get::<_, Option<bool>>(0)).unwrap_or(false))
    }
}
