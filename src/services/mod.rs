pub mod active_donors;
pub mod init;
pub mod ledger;
pub mod lifecycle;
pub mod notifications;
pub mod reconciliation;
pub mod requests;
