pub mod logging;
pub mod paths;
pub mod run_id;
