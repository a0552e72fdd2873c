pub mod alignment;
pub mod returns;
