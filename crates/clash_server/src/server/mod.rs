#![forbid(unsafe_code)]

pub mod auth;
pub mod bus;
pub mod connection;
pub mod dispatcher;
pub mod game_channel;
pub mod health;
pub mod redis_bus;
pub mod redis_store;
pub mod registry;
pub mod rooms;
pub mod router;
pub mod session_db;
pub mod session_hub;
pub mod sessions;
pub mod store;

#[cfg(test)]
mod testkit;


#[cfg(test)]
mod store_tests;





#[cfg(test)]
mod dispatcher_tests;

#[cfg(test)]
mod ws_smoke_tests;

#[cfg(test)]
mod redis_tests;
