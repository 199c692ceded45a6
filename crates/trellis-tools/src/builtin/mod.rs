pub mod data;
pub mod time;
