pub mod ask;
pub mod cache;
pub mod config;
pub mod credits;
pub mod datastore;
pub mod errors;
pub mod insights;
pub mod jobs;
pub mod maintenance;
pub mod model;
pub mod prompt;
pub mod providers;
pub mod ratelimit;
pub mod sqlguard;
pub mod storage;
