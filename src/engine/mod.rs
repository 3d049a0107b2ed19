pub mod dispatcher;
pub mod retry;
pub mod state_machine;
