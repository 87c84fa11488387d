pub mod candidate;
pub mod ledger;
pub mod mongodb;
pub mod store;
pub mod voter;
