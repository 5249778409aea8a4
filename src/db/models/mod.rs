//! Document models. Each account row carries its ledgers and inbox as
//! embedded JSON arrays; donation requests are top-level documents.

pub mod account;
pub mod donation;
pub mod donation_request;
pub mod notification;
pub mod status;

pub use self::account::*;
pub use self::donation::*;
pub use self::donation_request::*;
pub use self::notification::*;
pub use self::status::*;
