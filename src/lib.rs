pub mod api;
pub mod auth;
pub mod config;
pub mod control;
pub mod db;
pub mod export;
pub mod local_store;
pub mod notify;
pub mod remote;
pub mod repository;
pub mod sensors;
