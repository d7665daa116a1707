pub mod admin;
pub mod auth;
pub mod checkout;
pub mod gate;
pub mod reset;
pub mod shipment;
pub mod token;
pub mod user;
