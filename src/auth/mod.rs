//! Credential handling for SmartRent user accounts

pub mod password;

pub use password::PasswordEncoder;
