pub mod account;
pub mod donation_request;

pub use account::AccountRepository;
pub use donation_request::DonationRequestRepository;
