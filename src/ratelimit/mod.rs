//! Rate limiting logic and state management.

mod backend;
mod clock;
mod counter;
mod limiter;
mod matcher;
mod object;
mod period;
mod registry;
mod rules;
mod sweeper;

pub use backend::AdmissionControl;
pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::{CounterStore, NetworkKey, NetworkState};
pub use limiter::{Admission, CleanupReport, EditOptions, LimitMode, Limiter};
pub use matcher::{AddressCache, MatchError, Matched, NetworkMatcher, ADDRESS_CACHE_CAPACITY};
pub use object::{ObjectInfo, ObjectType};
pub use period::{PeriodKey, TimeUnit};
pub use registry::Registry;
pub use rules::{NetworkPattern, Rate, RateSpec, RuleItem, RuleSet};
pub use sweeper::spawn_cleanup_task;
