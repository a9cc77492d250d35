pub mod schema;

pub use schema::{
    AgentConfig, Config, PipelineConfig, RoutingConfig, SchedulerConfig, SyncConfig, SyncMode,
    TelegramConfig,
};
