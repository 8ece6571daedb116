pub mod pending;
pub mod serve;
pub mod status;
