pub mod host_update;
pub mod pool_clean;
pub mod pool_update;
