pub mod delivery;
pub mod formats;
pub mod progress;
pub mod registry;
pub mod resolver;
pub mod source;
pub mod supervisor;
pub mod task;
pub mod ytdlp_errors;
