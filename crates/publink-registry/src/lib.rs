//! publink-registry — Registry adapters normalizing ClinicalTrials.gov,
//! the EU Clinical Trials Register, and DRKS into one Registration record.

pub mod ctgov;
pub mod drks;
pub mod euctr;
pub mod fetch;
pub mod registration;

pub use fetch::RegistryHub;
pub use registration::{Reference, Registration};
