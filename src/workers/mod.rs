pub mod args;
pub mod demo;
pub mod history;
