//! Keeps the desktop wallpaper in sync with Bing's picture of the day.

pub mod bing;
pub mod command;
pub mod config;
pub mod desktop;
pub mod manager;
pub mod session;
pub mod wallpaper;
