pub mod clock;
pub mod hub;
pub mod router;
pub mod server;
pub mod sync;

pub use clock::{Clock, FixedClock, OffsetClock};
pub use hub::{BindOutcome, Connection, Hub, HubEvent};
pub use router::{MessageRouter, RouterError};
pub use server::{app, AppState};
pub use sync::{RuleSync, SweepOutcome};
