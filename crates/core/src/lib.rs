pub mod abi;
pub mod config;
pub mod contract;
pub mod display;
pub mod price;
pub mod restrict;
pub mod state;
