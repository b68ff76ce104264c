//! Protocol adapters

pub mod imap;
