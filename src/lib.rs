pub mod chat;
pub mod config;
pub mod console;
pub mod constants;
pub mod dialogue;
pub mod model;
pub mod predictor;
pub mod render;
pub mod session;
pub mod transcript;
pub mod web_server;
