pub mod reflection;
pub mod registry;
pub mod silence;

pub use reflection::{ReflectionEngine, ReflectionTrigger, Reflector};
pub use registry::{validate_cron, ScheduleExecutor, ScheduleRegistry};
pub use silence::SilenceTimers;
