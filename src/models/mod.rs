pub mod command;
pub mod laststatus;
pub mod metric_event;
pub mod record;
pub mod trip;

pub use laststatus::{EngineState, Patch, PriorState, StateDelta, TripAction, VehicleState};
pub use metric_event::MetricEvent;
pub use record::{AlarmExtras, EventExtras, TrackRecord};
