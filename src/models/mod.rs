pub mod chat;
pub mod divination;
pub mod identity;
pub mod policy;
pub mod provider;
pub mod usage;
