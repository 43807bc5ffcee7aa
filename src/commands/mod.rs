pub mod associate;
pub mod inventory;
pub mod merge;
pub mod segment;
pub mod status;
