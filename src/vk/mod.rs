pub mod api;
pub mod longpoll;
pub mod update;
