#![allow(clippy::upper_case_acronyms)]

pub mod attrs;
pub mod cli;
pub mod commands;
pub mod locale;
pub mod negotiate;
pub mod ops;
pub mod proto;
pub mod request;
pub mod session;
pub mod transfer;
pub mod transport;
pub mod wire;
