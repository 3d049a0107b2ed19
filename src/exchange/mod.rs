pub mod adapter;
pub mod router;
pub mod simulated;
