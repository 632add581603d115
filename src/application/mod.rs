//! Application layer orchestrating the domain over the storage ports.
//!
//! `LedgerService` owns the transaction workflow and unit credit,
//! `BillingEngine` generates monthly statements on top of it, and
//! `ReservationService` runs the booking lifecycle and posts rental income
//! through the ledger.

pub mod billing;
pub mod ledger;
pub mod reservations;
