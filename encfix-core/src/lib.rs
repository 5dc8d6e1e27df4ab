pub mod config;
pub mod format;
pub mod localize;
pub mod merkle;
pub mod oracle;
pub mod path_safety;
pub mod progress;
pub mod repair;
pub mod report;
pub mod run;
pub mod scan;
pub mod store;
pub mod txn;
pub mod users;
pub mod walk;
