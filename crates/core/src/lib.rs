pub mod alerts;
pub mod error;
pub mod geo;
pub mod geofence;
pub mod model;
pub mod quality;
