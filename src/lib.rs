pub mod app;
pub mod auth;
pub mod calendar;
pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod mail;
pub mod memory;
pub mod registrations;
pub mod state;
