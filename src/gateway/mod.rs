pub mod manager;
pub mod proxy;
