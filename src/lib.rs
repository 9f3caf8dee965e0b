pub mod app;
pub mod cache;
pub mod checksum;
pub mod config;
pub mod domain;
pub mod download;
pub mod error;
pub mod fetcher;
pub mod fs_util;
pub mod output;
pub mod patch;
pub mod profile;
pub mod webdriver;
