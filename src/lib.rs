#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::items_after_statements,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::needless_pass_by_value,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

pub mod agent;
pub mod channels;
pub mod config;
pub mod daemon;
pub mod health;
pub mod pipeline;
pub mod router;
pub mod scheduler;
pub mod storage;
pub mod sync;
pub mod util;

pub use config::Config;
