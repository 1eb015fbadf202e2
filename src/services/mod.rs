pub mod cmcd;
pub mod delay_engine;
pub mod delay_store;
pub mod i_delay_store;
pub mod telemetry;
