//! Wire types shared by the machine controller and its clients.

pub mod catalog;
pub mod domain;
pub mod error;
pub mod protocol;
