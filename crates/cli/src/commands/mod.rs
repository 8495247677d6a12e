//! CLI Commands

pub mod api_key;
pub mod serve;
