pub mod admin;
pub mod divination;
pub mod health;
