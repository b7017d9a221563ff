// src/lib.rs
pub mod ports {
    pub mod sim_exchange;
}
pub mod agent;
pub mod config;
pub mod exchange;
pub mod orchestrator;
pub mod retry;
pub mod worker;
