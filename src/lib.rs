pub mod core;
pub mod cli;
pub mod broadcast;
pub mod upstream;
pub mod relay;
pub mod feed;
