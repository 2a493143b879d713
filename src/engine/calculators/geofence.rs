use async_trait::async_trait;
use std::collections::BTreeSet;

use super::{Calculator, Category};
use crate::engine::context::{CalcContext, CalcOutcome};
use crate::models::laststatus::{Patch, StateDelta};
use crate::models::metric_event::{CATEGORY_FENCE, EVENT_FENCE_ENTER, EVENT_FENCE_EXIT, MetricEvent};

/// Fence entry/exit with boundary hysteresis: a fence the device was inside
/// stays "inside" while the point is within the fence's buffer distance of
/// the boundary, so jittery fixes at the edge do not flap enter/exit pairs.
pub struct FenceCalc;

#[async_trait]
impl Calculator for FenceCalc {
    fn name(&self) -> &'static str {
        "fence"
    }

    fn category(&self) -> Category {
        Category::Geofence
    }

    async fn calculate(&self, ctx: &CalcContext<'_>) -> anyhow::Result<CalcOutcome> {
        let Some(db) = ctx.db else {
            return Ok(CalcOutcome::default());
        };
        let fences = db.fences_for_imei(ctx.imei).await.unwrap_or_default();
        if fences.is_empty() {
            return Ok(CalcOutcome::default());
        }
        let prev_set: BTreeSet<i64> = ctx.prev.engine.current_fence_ids.iter().copied().collect();
        let lat = ctx.record.latitude;
        let lon = ctx.record.longitude;

        let mut inside_now: BTreeSet<i64> = BTreeSet::new();
        for fence in &fences {
            let was_inside = prev_set.contains(&fence.fence_id);
            match db
                .point_in_fence(fence.fence_id, lat, lon, fence.buffer_distance_m, was_inside)
                .await
            {
                Ok(true) => {
                    inside_now.insert(fence.fence_id);
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::debug!("fence containment check failed for {}: {e:#}", fence.fence_id);
                    // Keep the previous verdict rather than emitting a phantom exit.
                    if was_inside {
                        inside_now.insert(fence.fence_id);
                    }
                }
            }
        }

        let mut events = Vec::new();
        for fid in inside_now.difference(&prev_set) {
            let mut ev = MetricEvent::new(ctx.imei, ctx.gps_time, CATEGORY_FENCE, EVENT_FENCE_ENTER)
                .at(Some(lat), Some(lon));
            ev.fence_id = Some(*fid);
            events.push(ev);
        }
        for fid in prev_set.difference(&inside_now) {
            let mut ev = MetricEvent::new(ctx.imei, ctx.gps_time, CATEGORY_FENCE, EVENT_FENCE_EXIT)
                .at(Some(lat), Some(lon));
            ev.fence_id = Some(*fid);
            events.push(ev);
        }

        let delta = StateDelta {
            current_fence_ids: if inside_now.is_empty() {
                Patch::Clear
            } else {
                Patch::Set(inside_now.into_iter().collect())
            },
            ..Default::default()
        };
        Ok(CalcOutcome { delta, events, ..Default::default() })
    }
}
