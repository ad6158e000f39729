pub mod context;
pub mod health;
pub mod tasks;
